pub mod db_restore;
pub mod hooks;
pub mod logic;
pub mod selection;

pub use logic::{RestoreOutcome, RestoreRequest, RestoreStage};

use std::path::Path;

use crate::backup::archive;
use crate::backup::artifact::{self, Artifact, ArtifactLocation, BackupType};
use crate::backup::logic::FULL_DATABASE_ENTRY;
use crate::config::AppConfig;
use crate::errors::{BackupError, Result};
use crate::notify::{self, Notification};
use crate::storage::{self, RemoteStore};
use crate::utils::format_bytes;
use crate::utils::prompt::{Prompter, confirm_destructive};
use crate::utils::setting::{check_db_connection, ensure_free_space};
use logic::RestoreContext;

/// `restore run`: select, confirm, pre-flight, then the restore pipeline.
/// The administrator hears about every outcome except an operator cancel.
pub async fn run_restore_flow(
    config: &AppConfig,
    request: &RestoreRequest,
    prompter: &mut dyn Prompter,
) -> Result<RestoreOutcome> {
    let mut selected = None;
    let result = checked_restore(config, request, prompter, &mut selected).await;

    if config.notifications.enabled {
        let note = match &result {
            Ok(outcome) => Some(Notification::RestoreSucceeded {
                artifact: outcome.artifact.name.clone(),
                statements: outcome.statements.unwrap_or(0),
            }),
            Err(BackupError::Cancelled(_)) => None,
            Err(e) => Some(Notification::RestoreFailed { artifact: selected, error: e.to_string() }),
        };
        if let Some(note) = note {
            notify::send(&config.notifications, &note);
        }
    }
    result
}

async fn checked_restore(
    config: &AppConfig,
    request: &RestoreRequest,
    prompter: &mut dyn Prompter,
    selected: &mut Option<String>,
) -> Result<RestoreOutcome> {
    let store = if request.from_remote {
        Some(storage::open_store(config).await?)
    } else {
        None
    };

    let artifact = select_artifact(config, store.as_deref(), request, prompter).await?;
    tracing::info!(stage = %RestoreStage::Select, "Selected {} ({})", artifact.name, format_bytes(artifact.size));
    *selected = Some(artifact.name.clone());

    let needs_password = artifact.name.ends_with(".enc") || request.decrypt;
    let encryption_password = if needs_password {
        Some(config.encryption.require_password(request.password.as_deref())?)
    } else {
        None
    };
    ensure_free_space(&config.scratch_root, config.min_free_disk_mb)?;

    let touches_database = touches_database(&artifact);
    let target = if touches_database {
        format!("database '{}'", config.database.database)
    } else {
        format!("files under {}", config.files.restore_root.display())
    };
    confirm_destructive(
        prompter,
        request.force,
        &format!("⚠️  This will overwrite the {} with {}. Continue?", target, artifact.name),
    )?;

    if touches_database && !check_db_connection(&config.database).await {
        return Err(BackupError::RestoreExec {
            message: "Cannot proceed with restore - database connection failed".to_string(),
            output: String::new(),
        });
    }

    let strategy = request.strategy.unwrap_or(config.restore.strategy);
    let applier = db_restore::applier_for(strategy);
    let ctx = RestoreContext {
        config,
        applier: applier.as_ref(),
        store: store.as_deref(),
        encryption_password,
    };
    logic::perform_restore_orchestration(&ctx, &artifact, request).await
}

/// Whether restoring `artifact` overwrites the database. Custom names carry
/// no type, so a local unencrypted zip is judged by its entries. Anything
/// that cannot be inspected is assumed to hold a dump.
fn touches_database(artifact: &Artifact) -> bool {
    if let Some(backup_type) = artifact.backup_type {
        return backup_type != BackupType::Files;
    }
    match &artifact.location {
        ArtifactLocation::Local(path) if artifact.name.ends_with(".zip") => zip_holds_dump(path),
        _ => true,
    }
}

fn zip_holds_dump(path: &Path) -> bool {
    match archive::list_entries(path) {
        Ok(entries) => entries.iter().any(|e| e == FULL_DATABASE_ENTRY || e.ends_with(".sql")),
        Err(e) => {
            tracing::warn!("Could not inspect {}: {}", path.display(), e);
            true
        }
    }
}

async fn select_artifact(
    config: &AppConfig,
    store: Option<&dyn RemoteStore>,
    request: &RestoreRequest,
    prompter: &mut dyn Prompter,
) -> Result<Artifact> {
    let listing = match store {
        Some(store) => storage::list_artifacts(store).await,
        None => artifact::list_local(&config.backup_dir),
    };
    let selected = listing.and_then(|listing| selection::select(&listing, &request.selection, prompter));
    selected.map_err(|e| BackupError::Stage { stage: RestoreStage::Select, source: Box::new(e) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::ArchiveBuilder;
    use crate::utils::logging::testing::Captured;
    use crate::utils::prompt::testing::ScriptedPrompter;
    use selection::Selection;

    fn notifying_config(root: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::for_tests(root);
        config.notifications.enabled = true;
        config.notifications.email = Some("admin@hommss.test".into());
        config
    }

    /// A files-only zip under a custom name, so the name says nothing about
    /// its type.
    fn custom_files_zip(config: &AppConfig) -> anyhow::Result<std::path::PathBuf> {
        std::fs::create_dir_all(&config.backup_dir)?;
        let source = config.backup_dir.join("User.php");
        std::fs::write(&source, "<?php class User {}")?;
        let path = config.backup_dir.join("site-snapshot.zip");
        let mut zip = ArchiveBuilder::create(&path, None)?;
        zip.add_file(&source, "app/Models/User.php")?;
        zip.finish()?;
        std::fs::remove_file(source)?;
        Ok(path)
    }

    #[tokio::test]
    async fn test_refuses_without_terminal_or_force() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = AppConfig::for_tests(dir.path());
        std::fs::create_dir_all(&config.backup_dir)?;
        std::fs::write(config.backup_dir.join("hommss-db-2024-01-15-02-00-00.sql"), "SELECT 1;\n")?;

        let mut prompter = ScriptedPrompter::non_interactive();
        let err = run_restore_flow(&config, &RestoreRequest::new(Selection::Latest), &mut prompter)
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::Cancelled(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_encrypted_selection_requires_password() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = AppConfig::for_tests(dir.path());
        config.encryption.password = None;
        std::fs::create_dir_all(&config.backup_dir)?;
        std::fs::write(config.backup_dir.join("hommss-db-2024-01-15-02-00-00.sql.enc"), "x")?;

        let mut prompter = ScriptedPrompter::new(&["y"]);
        let err = run_restore_flow(&config, &RestoreRequest::new(Selection::Latest), &mut prompter)
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::Configuration(_)));
        assert!(prompter.questions.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_backup_fails_at_select() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = AppConfig::for_tests(dir.path());
        let mut prompter = ScriptedPrompter::non_interactive();
        let request = RestoreRequest::new(Selection::Named("nothing".into()));

        let err = run_restore_flow(&config, &request, &mut prompter).await.unwrap_err();
        assert!(matches!(err, BackupError::Stage { stage: RestoreStage::Select, .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_custom_named_files_backup_skips_database() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = notifying_config(dir.path());
        custom_files_zip(&config)?;

        let mut prompter = ScriptedPrompter::new(&["y"]);
        let captured = Captured::default();
        let outcome = {
            let _guard = captured.install();
            run_restore_flow(&config, &RestoreRequest::new(Selection::Named("site-snapshot".into())), &mut prompter)
                .await?
        };

        assert!(!outcome.database_restored);
        assert_eq!(outcome.files_restored, 1);
        assert_eq!(prompter.questions.len(), 1);
        assert!(prompter.questions[0].contains("files under"), "{}", prompter.questions[0]);
        assert!(config.files.restore_root.join("app/Models/User.php").is_file());
        assert!(captured.text().contains("Restore completed successfully"));
        Ok(())
    }

    #[test]
    fn test_touches_database_inspects_custom_names() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = AppConfig::for_tests(dir.path());
        let files = custom_files_zip(&config)?;
        assert!(!touches_database(&Artifact::from_local(&files)?));

        let dump = config.backup_dir.join("manual.sql");
        std::fs::write(&dump, "SELECT 1;")?;
        let with_dump = config.backup_dir.join("manual.zip");
        let mut zip = ArchiveBuilder::create(&with_dump, None)?;
        zip.add_file(&dump, "manual.sql")?;
        zip.finish()?;
        assert!(touches_database(&Artifact::from_local(&with_dump)?));
        assert!(touches_database(&Artifact::from_local(&dump)?));

        let typed = config.backup_dir.join("hommss-files-2024-01-15-02-00-00.zip");
        std::fs::copy(&with_dump, &typed)?;
        assert!(!touches_database(&Artifact::from_local(&typed)?));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_restore_is_notified() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = notifying_config(dir.path());
        let mut prompter = ScriptedPrompter::non_interactive();

        let captured = Captured::default();
        {
            let _guard = captured.install();
            let request = RestoreRequest::new(Selection::Named("nothing".into()));
            run_restore_flow(&config, &request, &mut prompter).await.unwrap_err();
        }

        let log = captured.text();
        assert!(log.contains("Restore failure notification"), "{log}");
        assert!(log.contains("SELECT"));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_restore_is_not_notified() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = notifying_config(dir.path());
        custom_files_zip(&config)?;
        let mut prompter = ScriptedPrompter::new(&["n"]);

        let captured = Captured::default();
        let err = {
            let _guard = captured.install();
            run_restore_flow(&config, &RestoreRequest::new(Selection::Latest), &mut prompter).await.unwrap_err()
        };

        assert!(matches!(err, BackupError::Cancelled(_)));
        assert!(!captured.text().contains("notification"));
        Ok(())
    }
}
