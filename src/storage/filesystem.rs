// hommss-backup/src/storage/filesystem.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use super::{ObjectInfo, RemoteStore};
use crate::errors::{BackupError, Result};

/// Remote store backed by a directory, e.g. a mounted network share.
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn new(root: PathBuf) -> Self {
        FilesystemStore { root }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty() || relative.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(BackupError::InvalidInput(format!("invalid object key: {key}")));
        }
        Ok(self.root.join(relative))
    }
}

fn transport(action: &str, key: &str, err: std::io::Error) -> BackupError {
    BackupError::Transport(format!("{action} {key} failed: {err}"))
}

#[async_trait]
impl RemoteStore for FilesystemStore {
    async fn upload(&self, local: &Path, key: &str) -> Result<String> {
        let target = self.path_for(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| transport("upload", key, e))?;
        }
        tokio::fs::copy(local, &target).await.map_err(|e| transport("upload", key, e))?;
        Ok(key.to_string())
    }

    async fn download(&self, key: &str, dest_dir: &Path) -> Result<PathBuf> {
        let source = self.path_for(key)?;
        let name = source
            .file_name()
            .ok_or_else(|| BackupError::InvalidInput(format!("invalid object key: {key}")))?;
        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(name);
        tokio::fs::copy(&source, &dest).await.map_err(|e| transport("download", key, e))?;
        Ok(dest)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut objects = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|e| BackupError::Transport(format!("list failed: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !key.starts_with(prefix) {
                continue;
            }
            let metadata = entry
                .metadata()
                .map_err(|e| BackupError::Transport(format!("list failed: {e}")))?;
            let last_modified: DateTime<Utc> = metadata.modified()?.into();
            objects.push(ObjectInfo { key, size: metadata.len(), last_modified });
        }
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        tokio::fs::remove_file(&path).await.map_err(|e| transport("delete", key, e))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        // A root that was never written to holds nothing.
        if !self.root.exists() {
            return Ok(false);
        }
        if !self.root.is_dir() {
            return Err(BackupError::Transport(format!(
                "remote root {} is not a directory",
                self.root.display()
            )));
        }
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn put_bytes(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let target = self.path_for(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| transport("write", key, e))?;
        }
        tokio::fs::write(&target, data).await.map_err(|e| transport("write", key, e))
    }

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path).await.map_err(|e| transport("read", key, e))
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_download_delete() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FilesystemStore::new(dir.path().join("remote"));
        let local = dir.path().join("a.sql");
        std::fs::write(&local, "SELECT 1;")?;

        let key = "backups/2024/01/15/a.sql";
        store.upload(&local, key).await?;
        assert!(store.exists(key).await?);

        let fetched = store.download(key, &dir.path().join("scratch")).await?;
        assert_eq!(fetched, dir.path().join("scratch/a.sql"));
        assert_eq!(std::fs::read_to_string(&fetched)?, "SELECT 1;");

        let listed = store.list("backups/").await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, key);
        assert_eq!(listed[0].size, 9);

        store.delete(key).await?;
        assert!(!store.exists(key).await?);
        assert!(matches!(store.delete(key).await, Err(BackupError::Transport(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_fresh_root_holds_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FilesystemStore::new(dir.path().join("never-created"));
        assert!(!store.exists("backups/2024/01/15/a.sql").await?);

        std::fs::write(dir.path().join("plain-file"), "")?;
        let broken = FilesystemStore::new(dir.path().join("plain-file"));
        assert!(matches!(broken.exists("a.sql").await, Err(BackupError::Transport(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_keys_cannot_escape_root() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FilesystemStore::new(dir.path().to_path_buf());
        assert!(matches!(store.get_bytes("../etc/passwd").await, Err(BackupError::InvalidInput(_))));
        assert!(matches!(store.get_bytes("/etc/passwd").await, Err(BackupError::InvalidInput(_))));
        Ok(())
    }
}
