// hommss-backup/src/retention/mod.rs
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use crate::backup::artifact::{self, Artifact, ArtifactLocation};
use crate::config::AppConfig;
use crate::errors::{BackupError, Result};
use crate::storage::{self, RemoteStore};
use crate::utils::format_bytes;
use crate::utils::prompt::{Prompter, confirm_destructive};

/// Scratch directories older than this are left over from interrupted runs.
pub const STALE_SCRATCH_AGE: std::time::Duration = std::time::Duration::from_secs(6 * 60 * 60);
pub const RESTORE_SCRATCH_PREFIX: &str = "restore-";
pub const BACKUP_STAGING_PREFIX: &str = "backup-";
const SCRATCH_PREFIXES: [&str; 2] = [RESTORE_SCRATCH_PREFIX, BACKUP_STAGING_PREFIX];

/// Artifacts last modified strictly before `now - max_age`, in input order.
pub fn find_expired(artifacts: &[Artifact], max_age: Duration, now: DateTime<Utc>) -> Vec<Artifact> {
    let cutoff = now - max_age;
    artifacts.iter().filter(|a| a.modified < cutoff).cloned().collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub deleted_count: usize,
    pub freed_bytes: u64,
    /// `(artifact name, error)` for every artifact that could not be removed.
    pub errors: Vec<(String, String)>,
    pub dry_run: bool,
}

impl PurgeReport {
    /// The error a partly failed purge ends with, if any item failed.
    pub fn failure(&self) -> Option<BackupError> {
        if self.errors.is_empty() {
            return None;
        }
        let names: Vec<&str> = self.errors.iter().map(|(name, _)| name.as_str()).collect();
        Some(BackupError::Transport(format!(
            "{} backups could not be deleted: {}",
            self.errors.len(),
            names.join(", ")
        )))
    }
}

/// Deletes one artifact from wherever it lives.
#[async_trait]
pub trait ArtifactRemover: Send + Sync {
    async fn remove(&self, artifact: &Artifact) -> Result<()>;
}

pub struct LocalRemover;

#[async_trait]
impl ArtifactRemover for LocalRemover {
    async fn remove(&self, artifact: &Artifact) -> Result<()> {
        match &artifact.location {
            ArtifactLocation::Local(path) => Ok(tokio::fs::remove_file(path).await?),
            ArtifactLocation::Remote(key) => Err(BackupError::InvalidInput(format!(
                "{key} is a remote artifact"
            ))),
        }
    }
}

pub struct RemoteRemover<'a> {
    pub store: &'a dyn RemoteStore,
}

#[async_trait]
impl ArtifactRemover for RemoteRemover<'_> {
    async fn remove(&self, artifact: &Artifact) -> Result<()> {
        match &artifact.location {
            ArtifactLocation::Remote(key) => self.store.delete(key).await,
            ArtifactLocation::Local(path) => Err(BackupError::InvalidInput(format!(
                "{} is a local artifact",
                path.display()
            ))),
        }
    }
}

/// Removes `expired`, continuing past individual failures. A dry run
/// reports the same totals without touching anything.
pub async fn purge(remover: &dyn ArtifactRemover, expired: &[Artifact], dry_run: bool) -> PurgeReport {
    let mut report = PurgeReport { dry_run, ..PurgeReport::default() };

    for artifact in expired {
        if dry_run {
            tracing::info!(
                "Would delete {} ({}, {})",
                artifact.name,
                format_bytes(artifact.size),
                artifact.modified.format("%Y-%m-%d %H:%M:%S")
            );
        } else if let Err(e) = remover.remove(artifact).await {
            tracing::error!("❌ Failed to delete {}: {}", artifact.name, e);
            report.errors.push((artifact.name.clone(), e.to_string()));
            continue;
        } else {
            tracing::info!("🗑 Deleted {} ({})", artifact.name, format_bytes(artifact.size));
        }
        report.deleted_count += 1;
        report.freed_bytes += artifact.size;
    }
    report
}

/// Deletes `restore-*` and `backup-*` directories under `scratch_root` older
/// than `max_age`. Returns how many were removed.
pub fn reclaim_stale_scratch(scratch_root: &Path, max_age: std::time::Duration, now: SystemTime) -> Result<usize> {
    if !scratch_root.is_dir() {
        return Ok(0);
    }
    let mut reclaimed = 0;
    for entry in fs::read_dir(scratch_root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !entry.file_type()?.is_dir() || !SCRATCH_PREFIXES.iter().any(|p| name.starts_with(p)) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age <= max_age {
            continue;
        }
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => {
                tracing::info!("🧹 Removed stale scratch directory {}", entry.path().display());
                reclaimed += 1;
            }
            Err(e) => tracing::warn!("Could not remove stale scratch directory {}: {}", entry.path().display(), e),
        }
    }
    Ok(reclaimed)
}

#[derive(Debug, Clone, Default)]
pub struct CleanupRequest {
    pub older_than_days: Option<u32>,
    pub dry_run: bool,
    pub remote: bool,
    pub force: bool,
}

/// `backup cleanup`: lists local or remote artifacts, selects the expired
/// ones and purges them after confirmation.
pub async fn run_cleanup(
    config: &AppConfig,
    request: &CleanupRequest,
    prompter: &mut dyn Prompter,
) -> Result<PurgeReport> {
    let now = Utc::now();
    if request.remote {
        let store = storage::open_store(config).await?;
        let listing = storage::list_artifacts(store.as_ref()).await?;
        let days = request.older_than_days.unwrap_or(config.retention.remote_days);
        let remover = RemoteRemover { store: store.as_ref() };
        cleanup(&listing, &remover, days, request, prompter, now).await
    } else {
        if !request.dry_run {
            reclaim_stale_scratch(&config.scratch_root, STALE_SCRATCH_AGE, SystemTime::now())?;
        }
        let listing = artifact::list_local(&config.backup_dir)?;
        let days = request.older_than_days.unwrap_or(config.retention.local_days);
        cleanup(&listing, &LocalRemover, days, request, prompter, now).await
    }
}

async fn cleanup(
    listing: &[Artifact],
    remover: &dyn ArtifactRemover,
    days: u32,
    request: &CleanupRequest,
    prompter: &mut dyn Prompter,
    now: DateTime<Utc>,
) -> Result<PurgeReport> {
    let expired = find_expired(listing, Duration::days(i64::from(days)), now);
    tracing::info!(
        "Found {} of {} backups older than {} days",
        expired.len(),
        listing.len(),
        days
    );
    if expired.is_empty() {
        return Ok(PurgeReport { dry_run: request.dry_run, ..PurgeReport::default() });
    }

    if !request.dry_run {
        let total: u64 = expired.iter().map(|a| a.size).sum();
        confirm_destructive(
            prompter,
            request.force,
            &format!("Delete {} backups ({})?", expired.len(), format_bytes(total)),
        )?;
    }
    Ok(purge(remover, &expired, request.dry_run).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::artifact::testing::artifact;
    use crate::utils::prompt::testing::ScriptedPrompter;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn local_artifact(dir: &Path, name: &str, modified: DateTime<Utc>, size: usize) -> anyhow::Result<Artifact> {
        let path = dir.join(name);
        fs::write(&path, vec![b'x'; size])?;
        Ok(Artifact {
            location: ArtifactLocation::Local(path),
            ..artifact(name, modified, size as u64)
        })
    }

    struct FailingRemover(&'static str);

    #[async_trait]
    impl ArtifactRemover for FailingRemover {
        async fn remove(&self, artifact: &Artifact) -> Result<()> {
            if artifact.name == self.0 {
                Err(BackupError::Transport("access denied".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_forty_day_old_backup_against_both_cutoffs() {
        let listing = vec![artifact("hommss-db-2024-01-15-02-00-00.sql", day(1), 10)];
        let now = day(41);

        let expired = find_expired(&listing, Duration::days(30), now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].name, "hommss-db-2024-01-15-02-00-00.sql");

        assert!(find_expired(&listing, Duration::days(45), now).is_empty());
    }

    #[test]
    fn test_cutoff_is_strict() {
        let listing = vec![artifact("a.sql", day(10), 1)];
        assert!(find_expired(&listing, Duration::days(30), day(40)).is_empty());
        assert_eq!(find_expired(&listing, Duration::days(30), day(40) + Duration::seconds(1)).len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_matches_live_run_and_keeps_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let listing = vec![
            local_artifact(dir.path(), "hommss-db-2024-01-02-02-00-00.sql", day(1), 100)?,
            local_artifact(dir.path(), "hommss-files-2024-01-03-02-00-00.zip", day(2), 250)?,
            local_artifact(dir.path(), "hommss-db-2024-02-20-02-00-00.sql", day(50), 70)?,
        ];
        let expired = find_expired(&listing, Duration::days(30), day(55));

        let dry = purge(&LocalRemover, &expired, true).await;
        assert_eq!((dry.deleted_count, dry.freed_bytes), (2, 350));
        assert!(listing.iter().all(|a| matches!(&a.location, ArtifactLocation::Local(p) if p.exists())));

        let live = purge(&LocalRemover, &expired, false).await;
        assert_eq!((live.deleted_count, live.freed_bytes), (dry.deleted_count, dry.freed_bytes));
        assert!(live.errors.is_empty());
        assert_eq!(artifact::list_local(dir.path())?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_failures_are_collected_and_batch_continues() {
        let expired = vec![artifact("a.sql", day(1), 5), artifact("b.sql", day(1), 7), artifact("c.sql", day(1), 11)];
        let report = purge(&FailingRemover("b.sql"), &expired, false).await;

        assert_eq!(report.deleted_count, 2);
        assert_eq!(report.freed_bytes, 16);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, "b.sql");

        let failure = report.failure().expect("one item failed");
        assert!(matches!(failure, BackupError::Transport(_)));
        assert_eq!(failure.exit_code(), 6);
        assert!(failure.to_string().contains("b.sql"));
        assert!(PurgeReport::default().failure().is_none());
    }

    #[tokio::test]
    async fn test_live_cleanup_requires_confirmation() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let listing = vec![local_artifact(dir.path(), "old.sql", day(1), 3)?];
        let request = CleanupRequest { dry_run: false, ..CleanupRequest::default() };

        let mut prompter = ScriptedPrompter::non_interactive();
        let err = cleanup(&listing, &LocalRemover, 7, &request, &mut prompter, day(30)).await.unwrap_err();
        assert!(matches!(err, BackupError::Cancelled(_)));
        assert!(dir.path().join("old.sql").exists());

        let forced = CleanupRequest { force: true, ..request };
        let report = cleanup(&listing, &LocalRemover, 7, &forced, &mut prompter, day(30)).await?;
        assert_eq!(report.deleted_count, 1);
        assert!(!dir.path().join("old.sql").exists());
        Ok(())
    }

    #[test]
    fn test_reclaims_only_old_scratch_directories() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        fs::create_dir_all(root.path().join("restore-abc/extract"))?;
        fs::create_dir_all(root.path().join("backup-xyz"))?;
        fs::write(root.path().join("backup-xyz/database.sql"), "CREATE TABLE users (id int);")?;
        fs::create_dir_all(root.path().join("keep-me"))?;
        fs::write(root.path().join("backup-notes.txt"), "")?;

        let later = SystemTime::now() + std::time::Duration::from_secs(7 * 60 * 60);
        assert_eq!(reclaim_stale_scratch(root.path(), STALE_SCRATCH_AGE, SystemTime::now())?, 0);
        assert_eq!(reclaim_stale_scratch(root.path(), STALE_SCRATCH_AGE, later)?, 2);
        assert!(!root.path().join("restore-abc").exists());
        assert!(!root.path().join("backup-xyz").exists());
        assert!(root.path().join("keep-me").exists());
        assert!(root.path().join("backup-notes.txt").exists());
        assert_eq!(reclaim_stale_scratch(&PathBuf::from("/nonexistent/scratch"), STALE_SCRATCH_AGE, later)?, 0);
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_find_expired_is_idempotent(
            ages in proptest::collection::vec(0i64..100, 0..30),
            cutoff in 0i64..100,
        ) {
            let listing: Vec<Artifact> = ages
                .iter()
                .enumerate()
                .map(|(i, age)| artifact(&format!("{i}.sql"), day(100 - age), 1))
                .collect();
            let once = find_expired(&listing, Duration::days(cutoff), day(100));
            let twice = find_expired(&once, Duration::days(cutoff), day(100));
            prop_assert_eq!(&once, &twice);
            prop_assert!(once.iter().all(|a| a.modified < day(100 - cutoff)));
        }
    }
}
