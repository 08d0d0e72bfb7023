// hommss-backup/src/restore/logic.rs
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use walkdir::WalkDir;

use super::db_restore::SqlApplier;
use super::hooks::{self, HookResult};
use super::selection::Selection;
use crate::backup::archive;
use crate::backup::artifact::{Artifact, ArtifactLocation};
use crate::backup::encryption;
use crate::backup::logic::{DATABASE_DUMP_ENTRY, FULL_DATABASE_ENTRY, FULL_FILES_ENTRY};
use crate::config::{AppConfig, RestoreStrategy};
use crate::errors::{BackupError, Result};
use crate::retention::{RESTORE_SCRATCH_PREFIX, STALE_SCRATCH_AGE, reclaim_stale_scratch};
use crate::storage::RemoteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStage {
    Select,
    FetchRemote,
    Decrypt,
    Extract,
    LocateSql,
    ApplySql,
    Cleanup,
    PostHooks,
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestoreStage::Select => "SELECT",
            RestoreStage::FetchRemote => "FETCH_REMOTE",
            RestoreStage::Decrypt => "DECRYPT",
            RestoreStage::Extract => "EXTRACT",
            RestoreStage::LocateSql => "LOCATE_SQL",
            RestoreStage::ApplySql => "APPLY_SQL",
            RestoreStage::Cleanup => "CLEANUP",
            RestoreStage::PostHooks => "POST_HOOKS",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub selection: Selection,
    pub from_remote: bool,
    /// Decrypt even when the name does not end in `.enc`.
    pub decrypt: bool,
    pub force: bool,
    pub password: Option<String>,
    pub strategy: Option<RestoreStrategy>,
    pub skip_hooks: bool,
}

impl RestoreRequest {
    pub fn new(selection: Selection) -> Self {
        RestoreRequest {
            selection,
            from_remote: false,
            decrypt: false,
            force: false,
            password: None,
            strategy: None,
            skip_hooks: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub artifact: Artifact,
    pub database_restored: bool,
    /// Statement count when the strategy reports one.
    pub statements: Option<usize>,
    pub files_restored: usize,
    pub hooks: Vec<HookResult>,
    pub duration: Duration,
}

impl RestoreOutcome {
    pub fn hook_warnings(&self) -> impl Iterator<Item = &HookResult> {
        self.hooks.iter().filter(|h| !h.success)
    }
}

/// Resolved collaborators of one restore run.
pub struct RestoreContext<'a> {
    pub config: &'a AppConfig,
    pub applier: &'a dyn SqlApplier,
    pub store: Option<&'a dyn RemoteStore>,
    /// Symmetric password for `.enc` artifacts.
    pub encryption_password: Option<&'a str>,
}

#[derive(Debug, Default)]
struct Restored {
    database_restored: bool,
    statements: Option<usize>,
    files_restored: usize,
}

/// Tags a stage failure and logs it.
fn at<T>(stage: RestoreStage, result: Result<T>) -> Result<T> {
    result.map_err(|e| {
        tracing::error!(stage = %stage, "❌ {}", e);
        BackupError::Stage { stage, source: Box::new(e) }
    })
}

/// Runs every stage after selection for `artifact`. The scratch directory is
/// removed whether or not the restore succeeds.
pub async fn perform_restore_orchestration(
    ctx: &RestoreContext<'_>,
    artifact: &Artifact,
    request: &RestoreRequest,
) -> Result<RestoreOutcome> {
    let started = Instant::now();
    let config = ctx.config;

    fs::create_dir_all(&config.scratch_root)?;
    match reclaim_stale_scratch(&config.scratch_root, STALE_SCRATCH_AGE, SystemTime::now()) {
        Ok(0) => {}
        Ok(n) => tracing::info!("Reclaimed {} stale scratch directories", n),
        Err(e) => tracing::warn!("Could not reclaim stale scratch directories: {}", e),
    }
    let scratch = tempfile::Builder::new()
        .prefix(RESTORE_SCRATCH_PREFIX)
        .tempdir_in(&config.scratch_root)?;
    tracing::debug!("Scratch directory: {}", scratch.path().display());

    let result = restore_in_scratch(ctx, artifact, request, scratch.path()).await;

    tracing::info!(stage = %RestoreStage::Cleanup, "🧹 Cleaning up temporary files...");
    let scratch_path = scratch.path().to_path_buf();
    if let Err(e) = scratch.close() {
        tracing::warn!("Could not remove {}: {}", scratch_path.display(), e);
    }
    let restored = result?;

    let hooks = if request.skip_hooks || config.restore.post_hooks.is_empty() {
        Vec::new()
    } else {
        tracing::info!(stage = %RestoreStage::PostHooks, "🔧 Running post-restore tasks...");
        let workdir = config.restore.hooks_workdir.as_deref();
        hooks::run_post_hooks(&config.restore.post_hooks, workdir, config.database.timeout).await
    };

    Ok(RestoreOutcome {
        artifact: artifact.clone(),
        database_restored: restored.database_restored,
        statements: restored.statements,
        files_restored: restored.files_restored,
        hooks,
        duration: started.elapsed(),
    })
}

async fn restore_in_scratch(
    ctx: &RestoreContext<'_>,
    artifact: &Artifact,
    request: &RestoreRequest,
    scratch: &Path,
) -> Result<Restored> {
    let mut path = match &artifact.location {
        ArtifactLocation::Local(p) => p.clone(),
        ArtifactLocation::Remote(key) => {
            tracing::info!(stage = %RestoreStage::FetchRemote, "📥 Downloading {}...", key);
            let store = ctx.store.ok_or_else(|| {
                BackupError::Configuration("remote artifact selected but no remote store is configured".to_string())
            });
            let store = at(RestoreStage::FetchRemote, store)?;
            at(RestoreStage::FetchRemote, store.download(key, scratch).await)?
        }
    };

    if artifact.name.ends_with(".enc") || request.decrypt {
        tracing::info!(stage = %RestoreStage::Decrypt, "🔓 Decrypting {}...", artifact.name);
        path = at(RestoreStage::Decrypt, decrypt_into(ctx, &path, &artifact.name, scratch))?;
    }

    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    if name.ends_with(".sql") {
        let statements = apply_sql(ctx, &path).await?;
        return Ok(Restored { database_restored: true, statements, ..Restored::default() });
    }
    if !name.ends_with(".zip") {
        let unsupported = Err(BackupError::InvalidInput(format!("unsupported backup format: {name}")));
        return at(RestoreStage::Extract, unsupported);
    }

    let archive_password = ctx.config.encryption.archive_password.as_deref();
    let entries = at(RestoreStage::Extract, archive::list_entries(&path))?;
    let is_full = entries.iter().any(|e| e == FULL_DATABASE_ENTRY || e == FULL_FILES_ENTRY);

    if is_full {
        tracing::info!(stage = %RestoreStage::Extract, "📦 Extracting full backup {}...", name);
        let outer = scratch.join("full");
        at(RestoreStage::Extract, archive::extract(&path, &outer, archive_password))?;
        let mut restored = Restored::default();

        let database_zip = outer.join(FULL_DATABASE_ENTRY);
        if database_zip.is_file() {
            tracing::info!("🗄️  Restoring database...");
            let dir = scratch.join("database");
            at(RestoreStage::Extract, archive::extract(&database_zip, &dir, archive_password))?;
            let dump_stem = DATABASE_DUMP_ENTRY.trim_end_matches(".sql");
            let sql = at(RestoreStage::LocateSql, locate_sql(&dir, dump_stem))?;
            restored.statements = apply_sql(ctx, &sql).await?;
            restored.database_restored = true;
        }

        let files_zip = outer.join(FULL_FILES_ENTRY);
        if files_zip.is_file() {
            restored.files_restored = restore_files(ctx, &files_zip)?;
        }
        return Ok(restored);
    }

    if entries.iter().any(|e| e.ends_with(".sql")) {
        tracing::info!(stage = %RestoreStage::Extract, "📦 Extracting {}...", name);
        let dir = scratch.join("database");
        at(RestoreStage::Extract, archive::extract(&path, &dir, archive_password))?;
        let sql = at(RestoreStage::LocateSql, locate_sql(&dir, artifact.stem()))?;
        let statements = apply_sql(ctx, &sql).await?;
        return Ok(Restored { database_restored: true, statements, ..Restored::default() });
    }

    let files_restored = restore_files(ctx, &path)?;
    Ok(Restored { files_restored, ..Restored::default() })
}

fn decrypt_into(ctx: &RestoreContext<'_>, path: &Path, name: &str, scratch: &Path) -> Result<PathBuf> {
    let password = ctx.encryption_password.ok_or_else(|| {
        BackupError::Configuration("encrypted backup selected but no encryption password is set".to_string())
    })?;
    let plain_name = name.strip_suffix(".enc").unwrap_or(name);
    let dir = scratch.join("decrypted");
    fs::create_dir_all(&dir)?;
    encryption::decrypt_file(path, password, Some(&dir.join(plain_name)))
}

fn restore_files(ctx: &RestoreContext<'_>, archive_path: &Path) -> Result<usize> {
    let root = &ctx.config.files.restore_root;
    tracing::info!(stage = %RestoreStage::Extract, "📁 Restoring files into {}...", root.display());
    let password = ctx.config.encryption.archive_password.as_deref();
    let extracted = at(RestoreStage::Extract, archive::extract(archive_path, root, password))?;
    tracing::info!("✅ Restored {} files", extracted.len());
    Ok(extracted.len())
}

async fn apply_sql(ctx: &RestoreContext<'_>, sql: &Path) -> Result<Option<usize>> {
    tracing::info!(stage = %RestoreStage::ApplySql, "🔄 Restoring database from {}...", sql.display());
    let statements = at(RestoreStage::ApplySql, ctx.applier.apply(&ctx.config.database, sql).await)?;
    tracing::info!("✅ Database restored");
    Ok(statements)
}

/// `<stem>.sql` anywhere under `dir`, else the first `.sql` file by path.
pub fn locate_sql(dir: &Path, stem: &str) -> Result<PathBuf> {
    let expected = format!("{stem}.sql");
    let mut candidates: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "sql"))
        .collect();
    candidates.sort();

    if let Some(exact) = candidates.iter().find(|p| p.file_name().is_some_and(|n| n == expected.as_str())) {
        return Ok(exact.clone());
    }
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| BackupError::NoDumpFound(dir.display().to_string()))
}
