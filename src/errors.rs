use thiserror::Error;

/// Why an encrypted artifact could not be turned back into plaintext.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("wrong encryption password")]
    WrongPassword,

    #[error("encrypted data is corrupted: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database dump failed: {message}\nStderr: {stderr}")]
    Dump { message: String, stderr: String },

    #[error("SQL restore failed: {message}\nOutput: {output}")]
    RestoreExec { message: String, output: String },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(#[from] DecryptionError),

    #[error("Remote storage error: {0}")]
    Transport(String),

    #[error("No SQL dump found in {0}")]
    NoDumpFound(String),

    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("{operation} timed out after {seconds} seconds")]
    Timeout { operation: String, seconds: u64 },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Restore failed at {stage}: {source}")]
    Stage {
        stage: crate::restore::RestoreStage,
        #[source]
        source: Box<BackupError>,
    },
}

impl BackupError {
    /// Remediation text printed under the error, when there is something
    /// useful to tell the operator.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            BackupError::Stage { source, .. } => source.hint(),
            BackupError::Configuration(_) => {
                Some("Check config.json and the .env file for the missing value.")
            }
            BackupError::Decryption(DecryptionError::WrongPassword) => {
                Some("Check encryption password (BACKUP_ARCHIVE_PASSWORD or --password).")
            }
            BackupError::Decryption(DecryptionError::Corrupt(_)) => {
                Some("The artifact may be truncated; download it again or pick another backup.")
            }
            BackupError::Dump { .. } => {
                Some("Verify the database credentials and that mysqldump is installed (MYSQL_DUMP_BINARY_PATH).")
            }
            BackupError::RestoreExec { .. } => {
                Some("Verify the mysql client is installed and the target database is reachable.")
            }
            BackupError::Transport(_) => {
                Some("Check AWS credentials, bucket name, region and network connectivity.")
            }
            BackupError::NoDumpFound(_) => {
                Some("The selected artifact does not contain a database dump; choose a db or full backup.")
            }
            BackupError::InsufficientResources(_) => {
                Some("Free up disk space or run `backup cleanup` before retrying.")
            }
            BackupError::Timeout { .. } => {
                Some("Raise timeout_secs in config.json if the operation legitimately needs longer.")
            }
            _ => None,
        }
    }

    /// Process exit code for this failure category.
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::Stage { source, .. } => source.exit_code(),
            BackupError::Configuration(_) | BackupError::InvalidInput(_) => 2,
            BackupError::Dump { .. } | BackupError::RestoreExec { .. } | BackupError::Database(_) => 3,
            BackupError::Archive(_) => 4,
            BackupError::Encryption(_) | BackupError::Decryption(_) => 5,
            BackupError::Transport(_) => 6,
            BackupError::NoDumpFound(_) => 7,
            BackupError::InsufficientResources(_) => 8,
            BackupError::Timeout { .. } => 9,
            BackupError::Cancelled(_) => 10,
            BackupError::Io(_) => 1,
        }
    }
}

impl From<zip::result::ZipError> for BackupError {
    fn from(err: zip::result::ZipError) -> Self {
        BackupError::Archive(err.to_string())
    }
}

impl BackupError {
    /// The underlying failure with any stage context peeled off.
    pub fn root(&self) -> &BackupError {
        match self {
            BackupError::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_password_has_password_hint() {
        let err = BackupError::from(DecryptionError::WrongPassword);
        assert!(err.hint().unwrap().contains("encryption password"));
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn stage_context_keeps_hint_and_code() {
        let err = BackupError::Stage {
            stage: crate::restore::RestoreStage::Decrypt,
            source: Box::new(DecryptionError::WrongPassword.into()),
        };
        assert_eq!(err.exit_code(), 5);
        assert!(err.hint().is_some());
        assert!(matches!(err.root(), BackupError::Decryption(DecryptionError::WrongPassword)));
        assert!(err.to_string().starts_with("Restore failed at DECRYPT"));
    }

    #[test]
    fn exit_codes_are_non_zero() {
        let errors = vec![
            BackupError::Configuration("x".into()),
            BackupError::Archive("x".into()),
            BackupError::Transport("x".into()),
            BackupError::NoDumpFound("x".into()),
            BackupError::Cancelled("x".into()),
            BackupError::Timeout { operation: "mysqldump".into(), seconds: 5 },
        ];
        for err in errors {
            assert_ne!(err.exit_code(), 0, "{err}");
        }
    }
}
