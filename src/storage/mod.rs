// hommss-backup/src/storage/mod.rs
pub mod filesystem;
pub mod s3;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::backup::artifact::{self, Artifact};
use crate::config::{AppConfig, RemoteDriver};
use crate::errors::{BackupError, Result};

pub use crate::backup::artifact::remote_key_for;
pub use filesystem::FilesystemStore;
pub use s3::S3Store;

/// Key prefix every backup object lives under.
pub const BACKUP_ROOT: &str = "backups";
/// Key probed by `check_connection`. It does not need to exist.
pub const CONNECTION_SENTINEL: &str = "test-connection";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Object storage holding off-site copies of backup artifacts.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Stores the file at `local` under `key` and returns the key.
    async fn upload(&self, local: &Path, key: &str) -> Result<String>;
    /// Downloads `key` into `dest_dir`, named after the key's last segment.
    async fn download(&self, key: &str, dest_dir: &Path) -> Result<PathBuf>;
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn put_bytes(&self, key: &str, data: Vec<u8>) -> Result<()>;
    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>>;

    /// Succeeds when the store answers an existence check.
    async fn check_connection(&self) -> Result<()> {
        self.exists(CONNECTION_SENTINEL).await.map(|_| ())
    }

    /// Human-readable location, e.g. `s3://bucket`.
    fn describe(&self) -> String;
}

/// Builds the configured remote store, validating credentials first.
pub async fn open_store(config: &AppConfig) -> Result<Box<dyn RemoteStore>> {
    match config.remote.driver {
        RemoteDriver::S3 => {
            let settings = config.remote.validate_s3()?;
            Ok(Box::new(S3Store::connect(&settings).await))
        }
        RemoteDriver::Filesystem => {
            let root = config.remote.root.clone().ok_or_else(|| {
                BackupError::Configuration("remote.root must be set for the filesystem driver".to_string())
            })?;
            Ok(Box::new(FilesystemStore::new(root)))
        }
    }
}

/// Remote backup artifacts, newest first.
pub async fn list_artifacts(store: &dyn RemoteStore) -> Result<Vec<Artifact>> {
    let objects = store.list(&format!("{}/", BACKUP_ROOT)).await?;
    let mut artifacts: Vec<Artifact> = objects
        .into_iter()
        .filter(|o| artifact::is_backup_file(&o.key))
        .map(|o| Artifact::from_remote(&o.key, o.size, o.last_modified))
        .collect();
    artifact::sort_newest_first(&mut artifacts);
    Ok(artifacts)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeStep {
    pub name: &'static str,
    pub detail: String,
}

/// Exercises the store end to end: existence check, write, read-back,
/// delete and list. Stops at the first failing step.
pub async fn probe(store: &dyn RemoteStore) -> Result<Vec<ProbeStep>> {
    let mut steps = Vec::new();
    let key = format!("{}/.probe-{}", BACKUP_ROOT, uuid::Uuid::new_v4());
    let payload = format!("hommss-backup connectivity probe {}", Utc::now().to_rfc3339()).into_bytes();

    let fail = |step: &str, err: BackupError| {
        BackupError::Transport(format!("remote probe failed at {step}: {err}"))
    };

    store.check_connection().await.map_err(|e| fail("connection", e))?;
    steps.push(ProbeStep { name: "connection", detail: store.describe() });

    store.put_bytes(&key, payload.clone()).await.map_err(|e| fail("write", e))?;
    steps.push(ProbeStep { name: "write", detail: key.clone() });

    let read_back = store.get_bytes(&key).await.map_err(|e| fail("read", e))?;
    if read_back != payload {
        let _ = store.delete(&key).await;
        return Err(BackupError::Transport(format!(
            "remote probe failed at read: {} returned {} bytes, expected {}",
            key,
            read_back.len(),
            payload.len()
        )));
    }
    steps.push(ProbeStep { name: "read", detail: format!("{} bytes verified", read_back.len()) });

    store.delete(&key).await.map_err(|e| fail("delete", e))?;
    steps.push(ProbeStep { name: "delete", detail: key.clone() });

    let listed = list_artifacts(store).await.map_err(|e| fail("list", e))?;
    steps.push(ProbeStep { name: "list", detail: format!("{} backups", listed.len()) });

    Ok(steps)
}
