// hommss-backup/src/backup/logic.rs
use chrono::{Local, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use super::archive::ArchiveBuilder;
use super::artifact::{self, Artifact, BackupType};
use super::db_dump::DumpProducer;
use super::encryption;
use crate::config::{AppConfig, DumpMode};
use crate::errors::{BackupError, Result};
use crate::notify::{self, Notification};
use crate::retention::{BACKUP_STAGING_PREFIX, STALE_SCRATCH_AGE, reclaim_stale_scratch};
use crate::storage::{RemoteStore, remote_key_for};
use crate::utils::format_bytes;

/// Inner entry names of a full backup container.
pub const FULL_DATABASE_ENTRY: &str = "database.zip";
pub const FULL_FILES_ENTRY: &str = "files.zip";
/// Dump entry inside `database.zip`.
pub const DATABASE_DUMP_ENTRY: &str = "database.sql";

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub backup_type: BackupType,
    pub filename: Option<String>,
    pub encrypt: bool,
    pub upload_remote: bool,
    pub notify: bool,
    pub dump_mode: Option<DumpMode>,
}

impl BackupRequest {
    pub fn new(backup_type: BackupType) -> Self {
        BackupRequest {
            backup_type,
            filename: None,
            encrypt: false,
            upload_remote: false,
            notify: false,
            dump_mode: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupReport {
    pub artifact: Artifact,
    pub remote_key: Option<String>,
    pub duration: Duration,
}

/// Everything a backup run needs, resolved up front.
pub struct BackupContext<'a> {
    pub config: &'a AppConfig,
    pub producer: &'a dyn DumpProducer,
    pub store: Option<&'a dyn RemoteStore>,
    /// Symmetric password when the artifact is to be encrypted.
    pub encryption_password: Option<&'a str>,
}

/// Resolves the artifact base name: the operator's `--filename` with any
/// backup extension removed, or a generated timestamped name.
pub fn resolve_name(config: &AppConfig, request: &BackupRequest) -> Result<String> {
    match request.filename.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        Some(custom) => {
            let stem = artifact::strip_backup_extensions(custom);
            if stem.is_empty() || stem.contains(['/', '\\']) || stem.starts_with('.') {
                return Err(BackupError::InvalidInput(format!("invalid backup filename: {custom}")));
            }
            Ok(stem.to_string())
        }
        None => Ok(artifact::generate_name(&config.filename_prefix, request.backup_type, Local::now())),
    }
}

impl BackupType {
    /// Builds the unencrypted artifact for this backup type in `out_dir`.
    /// Intermediate files go to `staging`, which must not be `out_dir`.
    pub async fn produce(&self, ctx: &BackupContext<'_>, name: &str, staging: &Path, out_dir: &Path) -> Result<PathBuf> {
        let config = ctx.config;
        let archive_password = config.encryption.archive_password.as_deref();

        match self {
            BackupType::Database => {
                let dump = staging.join(format!("{name}.sql"));
                ctx.producer.dump(&config.database, &dump).await?;
                match archive_password {
                    Some(password) => {
                        let dest = out_dir.join(format!("{name}.zip"));
                        let mut zip = ArchiveBuilder::create(&dest, Some(password))?;
                        zip.add_file(&dump, &format!("{name}.sql"))?;
                        zip.finish()
                    }
                    None => {
                        let dest = out_dir.join(format!("{name}.sql"));
                        move_file(&dump, &dest)?;
                        Ok(dest)
                    }
                }
            }
            BackupType::Files => {
                let dest = out_dir.join(format!("{name}.zip"));
                build_files_archive(config, &dest, archive_password)?;
                Ok(dest)
            }
            BackupType::Full => {
                let dump = staging.join(DATABASE_DUMP_ENTRY);
                ctx.producer.dump(&config.database, &dump).await?;

                let database_zip = staging.join(FULL_DATABASE_ENTRY);
                let mut zip = ArchiveBuilder::create(&database_zip, None)?;
                zip.add_file(&dump, DATABASE_DUMP_ENTRY)?;
                zip.finish()?;

                let files_zip = staging.join(FULL_FILES_ENTRY);
                build_files_archive(config, &files_zip, None)?;

                let dest = out_dir.join(format!("{name}.zip"));
                let mut outer = ArchiveBuilder::create(&dest, archive_password)?;
                outer.add_file(&database_zip, FULL_DATABASE_ENTRY)?;
                outer.add_file(&files_zip, FULL_FILES_ENTRY)?;
                outer.finish()
            }
        }
    }
}

fn build_files_archive(config: &AppConfig, dest: &Path, password: Option<&str>) -> Result<()> {
    let mut zip = ArchiveBuilder::create(dest, password)?;
    for tree in &config.files.include {
        if !tree.path.is_dir() {
            tracing::warn!("Skipping missing directory {} ({})", tree.path.display(), tree.name);
            continue;
        }
        let added = zip.add_dir(&tree.path, &tree.name)?;
        tracing::info!("Added {} files from {}", added, tree.path.display());
    }
    if zip.entries() == 0 {
        drop(zip);
        let _ = fs::remove_file(dest);
        return Err(BackupError::Archive(
            "none of the configured file trees contain any files".to_string(),
        ));
    }
    zip.finish()?;
    Ok(())
}

/// Renames within a filesystem, copies across. A failed copy leaves nothing
/// at `to`.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    if let Err(e) = fs::copy(from, to) {
        let _ = fs::remove_file(to);
        return Err(e.into());
    }
    fs::remove_file(from)?;
    Ok(())
}

/// Produce, encrypt and upload, in that order. The artifact is built in a
/// staging directory and only moved into `backup_dir` once complete.
pub async fn perform_backup_orchestration(ctx: &BackupContext<'_>, request: &BackupRequest) -> Result<BackupReport> {
    let started = Instant::now();
    let config = ctx.config;
    let name = resolve_name(config, request)?;
    tracing::info!("🚀 Starting {} backup: {}", request.backup_type.tag(), name);

    fs::create_dir_all(&config.backup_dir)?;
    fs::create_dir_all(&config.scratch_root)?;
    match reclaim_stale_scratch(&config.scratch_root, STALE_SCRATCH_AGE, SystemTime::now()) {
        Ok(0) => {}
        Ok(n) => tracing::info!("Reclaimed {} stale scratch directories", n),
        Err(e) => tracing::warn!("Could not reclaim stale scratch directories: {}", e),
    }
    let staging = tempfile::Builder::new()
        .prefix(BACKUP_STAGING_PREFIX)
        .tempdir_in(&config.scratch_root)?;
    let out_dir = staging.path().join("out");
    fs::create_dir_all(&out_dir)?;

    let mut built = request
        .backup_type
        .produce(ctx, &name, staging.path(), &out_dir)
        .await?;
    if let Some(password) = ctx.encryption_password {
        built = encryption::encrypt_file(&built, password)?;
    }

    let file_name = built
        .file_name()
        .ok_or_else(|| BackupError::Archive(format!("artifact has no file name: {}", built.display())))?;
    let path = config.backup_dir.join(file_name);
    move_file(&built, &path)?;
    drop(staging);

    let artifact = Artifact::from_local(&path)?;
    tracing::info!("✅ Backup written to {} ({})", path.display(), format_bytes(artifact.size));

    let remote_key = match ctx.store {
        Some(store) => {
            let key = remote_key_for(&artifact.name, Utc::now());
            // The local artifact stays in place when the upload fails.
            store.upload(&path, &key).await?;
            Some(key)
        }
        None => None,
    };

    Ok(BackupReport { artifact, remote_key, duration: started.elapsed() })
}

/// Sends the success or failure notification for a finished run when
/// requested. Returns whether one was sent.
pub fn notify_outcome(
    config: &AppConfig,
    request: &BackupRequest,
    result: &Result<BackupReport>,
    elapsed: Duration,
) -> bool {
    if !(request.notify || config.notifications.enabled) {
        return false;
    }
    let note = match result {
        Ok(report) => Notification::BackupSucceeded {
            backup_type: request.backup_type.tag().to_string(),
            artifact: report.artifact.name.clone(),
            duration: report.duration,
        },
        Err(e) => Notification::BackupFailed {
            backup_type: request.backup_type.tag().to_string(),
            error: e.to_string(),
            duration: elapsed,
        },
    };
    notify::send(&config.notifications, &note)
}
