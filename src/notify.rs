// hommss-backup/src/notify.rs
//! Operator notifications. Delivery is a structured `audit` event carrying
//! the admin address; the JSON log layer picks it up for the mail relay.

use std::time::Duration;

use crate::config::NotificationConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    BackupSucceeded { backup_type: String, artifact: String, duration: Duration },
    BackupFailed { backup_type: String, error: String, duration: Duration },
    RestoreSucceeded { artifact: String, statements: usize },
    /// `artifact` is unset when selection itself failed.
    RestoreFailed { artifact: Option<String>, error: String },
}

impl Notification {
    pub fn subject(&self) -> String {
        match self {
            Notification::BackupSucceeded { backup_type, .. } => format!("✅ HOMMSS {backup_type} backup completed"),
            Notification::BackupFailed { backup_type, .. } => format!("❌ HOMMSS {backup_type} backup failed"),
            Notification::RestoreSucceeded { .. } => "✅ HOMMSS restore completed".to_string(),
            Notification::RestoreFailed { .. } => "❌ HOMMSS restore failed".to_string(),
        }
    }
}

/// Emits `notification` for the configured admin. Returns whether anything
/// was sent; a missing address only warns.
pub fn send(config: &NotificationConfig, notification: &Notification) -> bool {
    let Some(email) = config.email.as_deref() else {
        tracing::warn!("⚠️  ADMIN_EMAIL not configured - skipping notification");
        return false;
    };

    tracing::info!("📧 Sending notification to {}...", email);
    match notification {
        Notification::BackupSucceeded { backup_type, artifact, duration } => tracing::info!(
            target: "audit",
            admin_email = email,
            backup_type = backup_type.as_str(),
            artifact = artifact.as_str(),
            duration_secs = duration.as_secs(),
            subject = notification.subject().as_str(),
            "Backup completed successfully"
        ),
        Notification::BackupFailed { backup_type, error, duration } => tracing::error!(
            target: "audit",
            admin_email = email,
            backup_type = backup_type.as_str(),
            error = error.as_str(),
            duration_secs = duration.as_secs(),
            subject = notification.subject().as_str(),
            "Backup failure notification"
        ),
        Notification::RestoreSucceeded { artifact, statements } => tracing::info!(
            target: "audit",
            admin_email = email,
            artifact = artifact.as_str(),
            statements = *statements,
            subject = notification.subject().as_str(),
            "Restore completed successfully"
        ),
        Notification::RestoreFailed { artifact, error } => tracing::error!(
            target: "audit",
            admin_email = email,
            artifact = artifact.as_deref().unwrap_or("-"),
            error = error.as_str(),
            subject = notification.subject().as_str(),
            "Restore failure notification"
        ),
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_address_skips() {
        let config = NotificationConfig { enabled: true, email: None };
        let sent = send(
            &config,
            &Notification::BackupFailed {
                backup_type: "db".into(),
                error: "boom".into(),
                duration: Duration::from_secs(3),
            },
        );
        assert!(!sent);
    }

    #[test]
    fn test_sends_to_configured_admin() {
        let config = NotificationConfig { enabled: true, email: Some("admin@hommss.test".into()) };
        let note = Notification::BackupSucceeded {
            backup_type: "full".into(),
            artifact: "hommss-full-2024-01-15-02-00-00.zip".into(),
            duration: Duration::from_secs(42),
        };
        assert!(send(&config, &note));
        assert_eq!(note.subject(), "✅ HOMMSS full backup completed");
    }

    #[test]
    fn test_restore_failure_without_artifact() {
        let config = NotificationConfig { enabled: true, email: Some("admin@hommss.test".into()) };
        let note = Notification::RestoreFailed { artifact: None, error: "no backups found".into() };
        assert!(send(&config, &note));
        assert_eq!(note.subject(), "❌ HOMMSS restore failed");
    }
}
