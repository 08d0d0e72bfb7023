// hommss-backup/src/backup/status.rs
use chrono::{DateTime, Duration, Utc};

use super::artifact::{self, Artifact, BackupType};
use crate::config::AppConfig;
use crate::errors::Result;
use crate::storage;
use crate::utils::format_bytes;

/// A backup older than this fails the recency check.
pub const MAX_BACKUP_AGE_HOURS: i64 = 25;
/// Total backup storage above this fails the size check.
pub const STORAGE_WARNING_BYTES: u64 = 5 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupStats {
    pub total: usize,
    pub total_bytes: u64,
    pub database: usize,
    pub files: usize,
    pub full: usize,
    pub newest: Option<DateTime<Utc>>,
    pub oldest: Option<DateTime<Utc>>,
}

pub fn summarize(artifacts: &[Artifact]) -> BackupStats {
    let mut stats = BackupStats::default();
    for a in artifacts {
        stats.total += 1;
        stats.total_bytes += a.size;
        match a.backup_type {
            Some(BackupType::Database) => stats.database += 1,
            Some(BackupType::Files) => stats.files += 1,
            Some(BackupType::Full) => stats.full += 1,
            None => {}
        }
        stats.newest = stats.newest.max(Some(a.modified));
        stats.oldest = Some(stats.oldest.map_or(a.modified, |o| o.min(a.modified)));
    }
    stats
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub ok: bool,
    pub message: String,
}

pub fn health_checks(stats: &BackupStats, now: DateTime<Utc>) -> Vec<HealthCheck> {
    let recent = match stats.newest {
        Some(newest) if now - newest <= Duration::hours(MAX_BACKUP_AGE_HOURS) => HealthCheck {
            ok: true,
            message: "Recent backup found".to_string(),
        },
        Some(_) => HealthCheck { ok: false, message: "Last backup is more than 24 hours old".to_string() },
        None => HealthCheck { ok: false, message: "No backups found".to_string() },
    };
    let storage = if stats.total_bytes > STORAGE_WARNING_BYTES {
        HealthCheck { ok: false, message: "Backup storage is getting large (>5GB)".to_string() }
    } else {
        HealthCheck { ok: true, message: "Storage usage is reasonable".to_string() }
    };
    vec![recent, storage]
}

/// "3 hours ago" style age.
pub fn format_age(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age = now - then;
    let (n, unit) = if age.num_days() > 0 {
        (age.num_days(), "day")
    } else if age.num_hours() > 0 {
        (age.num_hours(), "hour")
    } else if age.num_minutes() > 0 {
        (age.num_minutes(), "minute")
    } else {
        return "just now".to_string();
    };
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}

pub fn print_listing(title: &str, artifacts: &[Artifact]) {
    println!("📋 {title}");
    if artifacts.is_empty() {
        println!("No backups found.");
        return;
    }
    let width = artifacts.iter().map(|a| a.name.len()).max().unwrap_or(8).max(8);
    println!("{:<width$}  {:>10}  {:<19}  {}", "Filename", "Size", "Modified", "Location", width = width);
    for a in artifacts {
        println!(
            "{:<width$}  {:>10}  {:<19}  {}",
            a.name,
            format_bytes(a.size),
            a.modified.format("%Y-%m-%d %H:%M:%S"),
            a.display_location(),
            width = width
        );
    }
    let stats = summarize(artifacts);
    println!("📊 Total backups: {}", stats.total);
    println!("💾 Total size: {}", format_bytes(stats.total_bytes));
}

/// `backup list [--remote]`.
pub async fn run_list(config: &AppConfig, remote: bool) -> Result<Vec<Artifact>> {
    let listing = if remote {
        let store = storage::open_store(config).await?;
        storage::list_artifacts(store.as_ref()).await?
    } else {
        artifact::list_local(&config.backup_dir)?
    };
    let title = if remote { "Remote backups" } else { "Local backups" };
    print_listing(title, &listing);
    Ok(listing)
}

fn print_stats(label: &str, stats: &BackupStats, now: DateTime<Utc>) {
    println!();
    println!("{label}");
    println!("  Total Backups:    {}", stats.total);
    println!("  Total Size:       {}", format_bytes(stats.total_bytes));
    println!("  Database Backups: {}", stats.database);
    println!("  Files Backups:    {}", stats.files);
    println!("  Full Backups:     {}", stats.full);
    let fmt = |d: Option<DateTime<Utc>>| d.map_or("N/A".to_string(), |d| d.format("%Y-%m-%d %H:%M:%S").to_string());
    println!("  Newest Backup:    {}", fmt(stats.newest));
    println!("  Oldest Backup:    {}", fmt(stats.oldest));
    println!("  Last Backup Age:  {}", stats.newest.map_or("N/A".to_string(), |n| format_age(n, now)));
    println!("🏥 Health Check:");
    for check in health_checks(stats, now) {
        println!("  {} {}", if check.ok { "✅" } else { "⚠️ " }, check.message);
    }
}

/// `backup status`: local and remote statistics, health checks and the
/// state of encryption and disk space.
pub async fn run_status(config: &AppConfig) -> Result<()> {
    let now = Utc::now();
    println!("📊 Backup Status Report");
    println!("  Backup directory: {}", config.backup_dir.display());
    println!(
        "  Encryption:       {}",
        if config.encryption.enabled { config.encryption.algorithm.as_str() } else { "disabled" }
    );
    if config.backup_dir.exists() {
        let free = fs2::available_space(&config.backup_dir)?;
        println!("  Free disk space:  {}", format_bytes(free));
    }

    let local = artifact::list_local(&config.backup_dir)?;
    print_stats("💽 Local backups", &summarize(&local), now);

    if config.remote.enabled {
        println!();
        println!("🔗 Testing remote connection...");
        let store = storage::open_store(config).await?;
        store.check_connection().await?;
        println!("✅ Remote connection: OK ({})", store.describe());
        let remote = storage::list_artifacts(store.as_ref()).await?;
        print_stats("☁️  Remote backups", &summarize(&remote), now);
    } else {
        println!();
        println!("☁️  Remote storage: disabled (BACKUP_S3_ENABLED)");
    }
    Ok(())
}
