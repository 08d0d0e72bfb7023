use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset. Notifications log under the `audit`
/// target, which must stay visible at `info`.
pub fn default_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    EnvFilter::new(format!("hommss_backup={level},audit=info,warn"))
}

/// Console output on stderr plus, when `log_file` is set, a JSON audit log
/// appended to that file.
pub fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(verbose));

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .compact();

    let audit = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create log directory: {}", parent.display())
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            Some(fmt::layer().json().with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(audit)
        .try_init()
        .context("Failed to initialise logging")?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::Captured;
    use crate::config::NotificationConfig;
    use crate::notify::{self, Notification};
    use std::time::Duration;

    #[test]
    fn test_default_filter_keeps_success_notifications() {
        let captured = Captured::default();
        let config = NotificationConfig { enabled: true, email: Some("admin@hommss.test".into()) };
        {
            let _guard = captured.install();
            notify::send(
                &config,
                &Notification::BackupSucceeded {
                    backup_type: "db".into(),
                    artifact: "hommss-db-2024-01-15-02-00-00.sql".into(),
                    duration: Duration::from_secs(5),
                },
            );
            notify::send(&config, &Notification::RestoreSucceeded { artifact: "x.sql".into(), statements: 3 });
        }

        let log = captured.text();
        assert!(log.contains("Backup completed successfully"), "{log}");
        assert!(log.contains("Restore completed successfully"), "{log}");
        assert!(log.contains("\"target\":\"audit\""), "{log}");
    }

    #[test]
    fn test_default_filter_drops_foreign_info() {
        let captured = Captured::default();
        {
            let _guard = captured.install();
            tracing::info!(target: "aws_smithy_runtime", "chatty dependency");
            tracing::warn!(target: "aws_smithy_runtime", "dependency warning");
        }

        let log = captured.text();
        assert!(!log.contains("chatty dependency"));
        assert!(log.contains("dependency warning"));
    }
}
