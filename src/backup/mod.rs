pub mod archive;
pub mod artifact;
pub mod db_dump;
pub mod encryption;
pub mod logic;
pub mod status;

use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::AppConfig;
use crate::errors::{BackupError, Result};
use crate::storage;
use crate::utils::setting::{check_db_connection, ensure_free_space};
use artifact::BackupType;
use logic::{BackupContext, BackupReport, BackupRequest};

/// `backup create`: pre-flight checks, then the backup pipeline. A failure
/// at any point, pre-flight included, is reported to the administrator.
pub async fn run_backup_flow(config: &AppConfig, request: &BackupRequest) -> Result<BackupReport> {
    let started = Instant::now();
    let result = checked_backup(config, request).await;
    logic::notify_outcome(config, request, &result, started.elapsed());
    result
}

async fn checked_backup(config: &AppConfig, request: &BackupRequest) -> Result<BackupReport> {
    // Credentials first, so a misconfigured run fails before any dump.
    let encryption_password = if request.encrypt || config.encryption.enabled {
        Some(config.encryption.require_password(None)?)
    } else {
        None
    };
    let store = if request.upload_remote || config.remote.enabled {
        Some(storage::open_store(config).await?)
    } else {
        None
    };

    ensure_free_space(&config.backup_dir, config.min_free_disk_mb)?;

    if request.backup_type != BackupType::Files && !check_db_connection(&config.database).await {
        return Err(BackupError::Dump {
            message: "Cannot proceed with backup - database connection failed".to_string(),
            stderr: String::new(),
        });
    }

    let producer = db_dump::producer_for(request.dump_mode.unwrap_or(config.database.dump_mode));
    let ctx = BackupContext {
        config,
        producer: producer.as_ref(),
        store: store.as_deref(),
        encryption_password,
    };
    logic::perform_backup_orchestration(&ctx, request).await
}

/// `backup decrypt`: turns an encrypted artifact back into its plaintext
/// container or dump.
pub fn run_decrypt(config: &AppConfig, file: &Path, password: Option<&str>, output: Option<&Path>) -> Result<PathBuf> {
    if !file.is_file() {
        return Err(BackupError::InvalidInput(format!("{} does not exist", file.display())));
    }
    let password = config.encryption.require_password(password)?;
    encryption::decrypt_file(file, password, output)
}
