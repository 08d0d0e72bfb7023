// hommss-backup/src/backup/artifact.rs
use chrono::{DateTime, Datelike, Local, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::errors::Result;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";
pub const ENCRYPTED_EXTENSION: &str = "enc";
const BACKUP_EXTENSIONS: [&str; 3] = ["sql", "zip", "enc"];

/// What a backup contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum BackupType {
    #[value(name = "db", alias = "database")]
    Database,
    #[value(name = "files")]
    Files,
    #[value(name = "full")]
    Full,
}

impl BackupType {
    pub fn tag(&self) -> &'static str {
        match self {
            BackupType::Database => "db",
            BackupType::Files => "files",
            BackupType::Full => "full",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "db" | "database" => Some(BackupType::Database),
            "files" => Some(BackupType::Files),
            "full" => Some(BackupType::Full),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLocation {
    Local(PathBuf),
    Remote(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionState {
    Plain,
    ArchivePassword,
    Symmetric,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub location: ArtifactLocation,
    pub encryption: EncryptionState,
    pub backup_type: Option<BackupType>,
}

impl Artifact {
    pub fn from_local(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let modified: DateTime<Utc> = metadata.modified()?.into();
        let encryption = if name.ends_with(".enc") {
            EncryptionState::Symmetric
        } else if name.ends_with(".zip") && crate::backup::archive::is_password_protected(path) {
            EncryptionState::ArchivePassword
        } else {
            EncryptionState::Plain
        };

        Ok(Artifact {
            backup_type: parse_name(&name).map(|p| p.backup_type),
            name,
            size: metadata.len(),
            modified,
            location: ArtifactLocation::Local(path.to_path_buf()),
            encryption,
        })
    }

    pub fn from_remote(key: &str, size: u64, modified: DateTime<Utc>) -> Self {
        let name = key.rsplit('/').next().unwrap_or(key).to_string();
        let encryption = if name.ends_with(".enc") {
            EncryptionState::Symmetric
        } else {
            EncryptionState::Plain
        };
        Artifact {
            backup_type: parse_name(&name).map(|p| p.backup_type),
            name,
            size,
            modified,
            location: ArtifactLocation::Remote(key.to_string()),
            encryption,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.location, ArtifactLocation::Remote(_))
    }

    /// Name without the encryption and container extensions:
    /// `hommss-db-...-00.zip.enc` -> `hommss-db-...-00`.
    pub fn stem(&self) -> &str {
        strip_backup_extensions(&self.name)
    }

    pub fn display_location(&self) -> String {
        match &self.location {
            ArtifactLocation::Local(path) => path.display().to_string(),
            ArtifactLocation::Remote(key) => key.clone(),
        }
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.modified).num_days()
    }
}

pub fn strip_backup_extensions(name: &str) -> &str {
    let mut stem = name;
    if let Some(s) = stem.strip_suffix(".enc") {
        stem = s;
    }
    for ext in [".zip", ".sql"] {
        if let Some(s) = stem.strip_suffix(ext) {
            return s;
        }
    }
    stem
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub prefix: String,
    pub backup_type: BackupType,
    pub timestamp: NaiveDateTime,
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<prefix>[A-Za-z0-9_]+(?:-[A-Za-z0-9_]+)*?)-(?P<kind>db|files|full)-(?P<ts>\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2})(?:\.|$)")
            .expect("artifact name pattern is valid")
    })
}

/// Parses `<prefix>-<type>-<timestamp>[.<ext>...]`. Custom names return `None`.
pub fn parse_name(name: &str) -> Option<ParsedName> {
    let caps = name_pattern().captures(name)?;
    let backup_type = BackupType::from_tag(&caps["kind"])?;
    let timestamp = NaiveDateTime::parse_from_str(&caps["ts"], TIMESTAMP_FORMAT).ok()?;
    Some(ParsedName {
        prefix: caps["prefix"].to_string(),
        backup_type,
        timestamp,
    })
}

/// `<prefix>-<type>-YYYY-MM-DD-HH-mm-ss`, without extension.
pub fn generate_name(prefix: &str, backup_type: BackupType, now: DateTime<Local>) -> String {
    format!("{}-{}-{}", prefix, backup_type.tag(), now.format(TIMESTAMP_FORMAT))
}

pub fn is_backup_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| BACKUP_EXTENSIONS.contains(&ext))
}

/// Newest first; equal timestamps ordered by name so the order is total.
pub fn newest_first(a: &Artifact, b: &Artifact) -> Ordering {
    b.modified.cmp(&a.modified).then_with(|| a.name.cmp(&b.name))
}

pub fn sort_newest_first(artifacts: &mut [Artifact]) {
    artifacts.sort_by(newest_first);
}

/// Lists backup files directly inside `dir`. A missing or empty directory
/// yields an empty listing.
pub fn list_local(dir: &Path) -> Result<Vec<Artifact>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut artifacts = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_backup_file(&name) {
            continue;
        }
        artifacts.push(Artifact::from_local(&entry.path())?);
    }
    sort_newest_first(&mut artifacts);
    Ok(artifacts)
}

/// Remote object key for an artifact: `backups/{yyyy}/{mm}/{dd}/{filename}`.
/// The date comes from the name's timestamp when it has one.
pub fn remote_key_for(filename: &str, fallback: DateTime<Utc>) -> String {
    let date = parse_name(filename)
        .map(|p| p.timestamp.date())
        .unwrap_or_else(|| fallback.date_naive());
    format!(
        "{}/{:04}/{:02}/{:02}/{}",
        crate::storage::BACKUP_ROOT,
        date.year(),
        date.month(),
        date.day(),
        filename
    )
}

/// Interprets a name's local timestamp as a UTC instant, for artifacts whose
/// filesystem metadata is unavailable.
pub fn timestamp_as_utc(ts: NaiveDateTime) -> DateTime<Utc> {
    match Local.from_local_datetime(&ts).earliest() {
        Some(local) => local.with_timezone(&Utc),
        None => Utc.from_utc_datetime(&ts),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::artifact;
    use super::*;
    use chrono::{Duration, NaiveDate};
    use proptest::prelude::*;

    #[test]
    fn test_parse_generated_name() {
        let now = Local.with_ymd_and_hms(2024, 1, 15, 2, 0, 0).unwrap();
        let name = generate_name("hommss", BackupType::Database, now);
        assert_eq!(name, "hommss-db-2024-01-15-02-00-00");

        let parsed = parse_name(&format!("{name}.zip.enc")).unwrap();
        assert_eq!(parsed.prefix, "hommss");
        assert_eq!(parsed.backup_type, BackupType::Database);
        assert_eq!(
            parsed.timestamp,
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap().and_hms_opt(2, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_hyphenated_prefix_and_custom_names() {
        let parsed = parse_name("my-shop-full-2023-12-31-23-59-59.zip").unwrap();
        assert_eq!(parsed.prefix, "my-shop");
        assert_eq!(parsed.backup_type, BackupType::Full);

        assert!(parse_name("my-backup.sql").is_none());
        assert!(parse_name("hommss-db-2024-13-45-99-00-00.sql").is_none());
    }

    #[test]
    fn test_stem_strips_container_and_encryption() {
        let a = artifact("hommss-db-2024-01-15-02-00-00.zip.enc", Utc::now(), 0);
        assert_eq!(a.stem(), "hommss-db-2024-01-15-02-00-00");
        assert_eq!(strip_backup_extensions("database.sql"), "database");
        assert_eq!(strip_backup_extensions("custom"), "custom");
    }

    #[test]
    fn test_is_backup_file() {
        assert!(is_backup_file("a.sql"));
        assert!(is_backup_file("a.zip"));
        assert!(is_backup_file("a.zip.enc"));
        assert!(!is_backup_file("a.txt"));
        assert!(!is_backup_file(".gitignore"));
    }

    #[test]
    fn test_remote_key_uses_name_date() {
        let fallback = Utc.with_ymd_and_hms(2030, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(
            remote_key_for("hommss-full-2024-01-05-03-00-00.zip.enc", fallback),
            "backups/2024/01/05/hommss-full-2024-01-05-03-00-00.zip.enc"
        );
        assert_eq!(remote_key_for("custom.sql", fallback), "backups/2030/06/01/custom.sql");
    }

    #[test]
    fn test_from_remote_takes_basename() {
        let a = Artifact::from_remote("backups/2024/01/15/hommss-db-2024-01-15-02-00-00.sql.enc", 10, Utc::now());
        assert_eq!(a.name, "hommss-db-2024-01-15-02-00-00.sql.enc");
        assert_eq!(a.encryption, EncryptionState::Symmetric);
        assert_eq!(a.backup_type, Some(BackupType::Database));
        assert!(a.is_remote());
    }

    #[test]
    fn test_empty_directory_lists_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(list_local(dir.path())?.is_empty());
        assert!(list_local(&dir.path().join("missing"))?.is_empty());
        Ok(())
    }

    #[test]
    fn test_list_local_filters_and_reports_zero_bytes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("hommss-db-2024-01-15-02-00-00.sql"), b"")?;
        fs::write(dir.path().join("notes.txt"), b"ignore me")?;
        fs::create_dir(dir.path().join("nested.sql"))?;

        let listing = list_local(dir.path())?;
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].size, 0);
        assert_eq!(crate::utils::format_bytes(listing[0].size), "0 B");
        Ok(())
    }

    #[test]
    fn test_ties_broken_by_name() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut listing = vec![
            artifact("b.sql", t, 1),
            artifact("c.sql", t + Duration::hours(1), 1),
            artifact("a.sql", t, 1),
        ];
        sort_newest_first(&mut listing);
        let names: Vec<_> = listing.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["c.sql", "a.sql", "b.sql"]);
    }

    proptest! {
        #[test]
        fn prop_newest_first_is_total_and_order_independent(
            entries in proptest::collection::vec((0i64..5, 0u8..6), 0..20)
        ) {
            let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let listing: Vec<Artifact> = entries
                .iter()
                .map(|(hours, n)| artifact(&format!("{n}.sql"), base + Duration::hours(*hours), 1))
                .collect();

            let mut forward = listing.clone();
            sort_newest_first(&mut forward);
            let mut reversed: Vec<Artifact> = listing.into_iter().rev().collect();
            sort_newest_first(&mut reversed);

            prop_assert_eq!(&forward, &reversed);
            for pair in forward.windows(2) {
                prop_assert!(newest_first(&pair[0], &pair[1]) != Ordering::Greater);
                prop_assert!(pair[0].modified >= pair[1].modified);
            }
        }
    }
}
