// Pre-flight checks run before anything destructive
use sqlx::{Connection, MySqlConnection};
use std::path::Path;

use crate::config::DatabaseConfig;
use crate::errors::{BackupError, Result};

pub async fn check_db_connection(db: &DatabaseConfig) -> bool {
    match MySqlConnection::connect_with(&db.connect_options()).await {
        Ok(conn) => {
            let _ = conn.close().await;
            tracing::info!("✅ Successfully connected to {}", db.redacted_url());
            true
        }
        Err(e) => {
            tracing::error!("❌ Failed to connect to {}: {}", db.redacted_url(), e);
            false
        }
    }
}

/// Fails with `InsufficientResources` when the filesystem holding `dir` has
/// less than `min_free_mb` available. Returns the free space in MB.
pub fn ensure_free_space(dir: &Path, min_free_mb: u64) -> Result<u64> {
    std::fs::create_dir_all(dir)?;
    let free_mb = fs2::available_space(dir)? / 1024 / 1024;
    if free_mb < min_free_mb {
        return Err(BackupError::InsufficientResources(format!(
            "Insufficient disk space: {free_mb}MB available in {}, {min_free_mb}MB required",
            dir.display()
        )));
    }
    tracing::info!("Available disk space: {}MB", free_mb);
    Ok(free_mb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_space_check_passes_with_zero_minimum() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        ensure_free_space(&dir.path().join("nested"), 0)?;
        assert!(dir.path().join("nested").is_dir());
        Ok(())
    }

    #[test]
    fn test_free_space_check_fails_with_impossible_minimum() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let err = ensure_free_space(dir.path(), u64::MAX / 1024).unwrap_err();
        assert!(matches!(err, BackupError::InsufficientResources(_)));
        Ok(())
    }
}
