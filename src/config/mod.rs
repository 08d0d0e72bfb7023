// hommss-backup/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::mysql::MySqlConnectOptions;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::errors::BackupError;

const DEFAULT_BACKUP_DIR: &str = "storage/app/backups";
const DEFAULT_SCRATCH_ROOT: &str = "storage/app/backup-temp";
const DEFAULT_PREFIX: &str = "hommss";
const DEFAULT_MIN_FREE_DISK_MB: u64 = 100;
const DEFAULT_SUBPROCESS_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 300;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonDatabaseConfig {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub dump_binary_path: Option<PathBuf>,
    pub client_binary: Option<String>,
    pub dump_mode: Option<DumpMode>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonEncryptionConfig {
    pub enabled: Option<bool>,
    pub password: Option<String>,
    pub algorithm: Option<String>,
    pub archive_password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRemoteConfig {
    pub enabled: Option<bool>,
    pub driver: Option<RemoteDriver>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub path_style: Option<bool>,
    pub root: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRetentionConfig {
    pub local_days: Option<u32>,
    pub remote_days: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonNotificationConfig {
    pub enabled: Option<bool>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonFileTree {
    pub path: PathBuf,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonFilesConfig {
    pub include: Option<Vec<JsonFileTree>>,
    pub restore_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRestoreConfig {
    pub strategy: Option<RestoreStrategy>,
    pub post_hooks: Option<Vec<Vec<String>>>,
    pub hooks_workdir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub backup_dir: Option<PathBuf>,
    pub scratch_root: Option<PathBuf>,
    pub filename_prefix: Option<String>,
    pub min_free_disk_mb: Option<u64>,
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub database: JsonDatabaseConfig,
    #[serde(default)]
    pub encryption: JsonEncryptionConfig,
    #[serde(default)]
    pub remote: JsonRemoteConfig,
    #[serde(default)]
    pub retention: JsonRetentionConfig,
    #[serde(default)]
    pub notifications: JsonNotificationConfig,
    #[serde(default)]
    pub files: JsonFilesConfig,
    #[serde(default)]
    pub restore: JsonRestoreConfig,
}

/// How the database dump is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DumpMode {
    /// Shell out to mysqldump.
    External,
    /// Stream tables through the driver without an external binary.
    InProcess,
}

/// How a located SQL dump is replayed against the live database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStrategy {
    /// Feed the dump to the mysql client.
    Client,
    /// Split the dump and run every statement in one transaction.
    Statements,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteDriver {
    S3,
    Filesystem,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub dump_binary_path: Option<PathBuf>,
    pub client_binary: String,
    pub dump_mode: DumpMode,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub password: Option<String>,
    pub algorithm: String,
    pub archive_password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub driver: RemoteDriver,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub path_style: bool,
    pub root: Option<PathBuf>,
    pub timeout: Duration,
}

/// S3 settings after every required credential has been checked.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint_url: Option<String>,
    pub path_style: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub local_days: u32,
    pub remote_days: u32,
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FileTree {
    pub path: PathBuf,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct FilesConfig {
    pub include: Vec<FileTree>,
    pub restore_root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub strategy: RestoreStrategy,
    pub post_hooks: Vec<Vec<String>>,
    pub hooks_workdir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backup_dir: PathBuf,
    pub scratch_root: PathBuf,
    pub filename_prefix: String,
    pub min_free_disk_mb: u64,
    pub log_file: Option<PathBuf>,
    pub database: DatabaseConfig,
    pub encryption: EncryptionConfig,
    pub remote: RemoteConfig,
    pub retention: RetentionConfig,
    pub notifications: NotificationConfig,
    pub files: FilesConfig,
    pub restore: RestoreConfig,
}

impl AppConfig {
    /// Reads `config_path` (when it exists), layers the process environment
    /// on top and builds the immutable run configuration.
    pub fn load(config_path: &Path) -> Result<Self> {
        let mut raw = if config_path.exists() {
            let config_content = fs::read_to_string(config_path).with_context(|| {
                format!("Failed to read config file at {}", config_path.display())
            })?;
            serde_json::from_str::<RawJsonConfig>(&config_content).with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?
        } else {
            tracing::warn!(
                path = %config_path.display(),
                "config file not found, using defaults and environment only"
            );
            RawJsonConfig::default()
        };

        apply_env_overrides(&mut raw, |key| std::env::var(key).ok());
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let database = build_database_config(&raw.database)?;

        let prefix = raw
            .filename_prefix
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PREFIX.to_string());
        if prefix.contains(|c: char| !c.is_ascii_alphanumeric() && c != '_' && c != '-') {
            anyhow::bail!("filename_prefix may only contain letters, digits, '-' and '_': {prefix}");
        }

        let remote_raw = raw.remote;
        let remote = RemoteConfig {
            enabled: remote_raw.enabled.unwrap_or(false),
            driver: remote_raw.driver.unwrap_or(RemoteDriver::S3),
            bucket: non_empty(remote_raw.bucket),
            region: non_empty(remote_raw.region),
            access_key_id: non_empty(remote_raw.access_key_id),
            secret_access_key: non_empty(remote_raw.secret_access_key),
            endpoint_url: non_empty(remote_raw.endpoint_url),
            path_style: remote_raw.path_style.unwrap_or(false),
            root: remote_raw.root,
            timeout: Duration::from_secs(
                remote_raw.timeout_secs.unwrap_or(DEFAULT_REMOTE_TIMEOUT_SECS),
            ),
        };

        let include = match raw.files.include {
            Some(trees) => trees
                .into_iter()
                .map(|t| FileTree { path: t.path, name: t.name })
                .collect(),
            None => ["app", "config", "resources", "public"]
                .iter()
                .map(|dir| FileTree { path: PathBuf::from(dir), name: dir.to_string() })
                .collect(),
        };

        let post_hooks = raw.restore.post_hooks.unwrap_or_else(default_post_hooks);
        if post_hooks.iter().any(|hook| hook.is_empty()) {
            anyhow::bail!("restore.post_hooks entries must name a program to run");
        }

        Ok(AppConfig {
            backup_dir: raw.backup_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_BACKUP_DIR)),
            scratch_root: raw
                .scratch_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SCRATCH_ROOT)),
            filename_prefix: prefix,
            min_free_disk_mb: raw.min_free_disk_mb.unwrap_or(DEFAULT_MIN_FREE_DISK_MB),
            log_file: raw.log_file,
            database,
            encryption: EncryptionConfig {
                enabled: raw.encryption.enabled.unwrap_or(false),
                password: non_empty(raw.encryption.password),
                algorithm: raw
                    .encryption
                    .algorithm
                    .unwrap_or_else(|| "AES-256-CBC".to_string()),
                archive_password: non_empty(raw.encryption.archive_password),
            },
            remote,
            retention: RetentionConfig {
                local_days: raw.retention.local_days.unwrap_or(7),
                remote_days: raw.retention.remote_days.unwrap_or(30),
            },
            notifications: NotificationConfig {
                enabled: raw.notifications.enabled.unwrap_or(false),
                email: non_empty(raw.notifications.email),
            },
            files: FilesConfig {
                include,
                restore_root: raw.files.restore_root.unwrap_or_else(|| PathBuf::from(".")),
            },
            restore: RestoreConfig {
                strategy: raw.restore.strategy.unwrap_or(RestoreStrategy::Client),
                post_hooks,
                hooks_workdir: raw.restore.hooks_workdir,
            },
        })
    }
}

impl EncryptionConfig {
    /// The symmetric-encryption password, or a configuration error when it
    /// is needed but missing.
    pub fn require_password<'a>(&'a self, cli_override: Option<&'a str>) -> crate::errors::Result<&'a str> {
        cli_override
            .filter(|p| !p.is_empty())
            .or(self.password.as_deref())
            .ok_or_else(|| {
                BackupError::Configuration(
                    "encryption password is not set (BACKUP_ARCHIVE_PASSWORD)".to_string(),
                )
            })
    }
}

impl RemoteConfig {
    /// Fails fast naming the first missing S3 credential.
    pub fn validate_s3(&self) -> crate::errors::Result<S3Settings> {
        let required = [
            ("AWS_ACCESS_KEY_ID", &self.access_key_id),
            ("AWS_SECRET_ACCESS_KEY", &self.secret_access_key),
            ("AWS_DEFAULT_REGION", &self.region),
            ("AWS_BUCKET", &self.bucket),
        ];
        for (name, value) in required {
            if value.is_none() {
                return Err(BackupError::Configuration(format!(
                    "Missing required environment variable: {name}"
                )));
            }
        }
        Ok(S3Settings {
            bucket: self.bucket.clone().unwrap_or_default(),
            region: self.region.clone().unwrap_or_default(),
            access_key_id: self.access_key_id.clone().unwrap_or_default(),
            secret_access_key: self.secret_access_key.clone().unwrap_or_default(),
            endpoint_url: self.endpoint_url.clone(),
            path_style: self.path_style,
            timeout: self.timeout,
        })
    }
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
            .database(&self.database)
    }

    /// Connection URL with the password masked, for log lines.
    pub fn redacted_url(&self) -> String {
        let mut url = match Url::parse(&format!("mysql://{}:{}", self.host, self.port)) {
            Ok(url) => url,
            Err(_) => return format!("mysql://{}/{}", self.host, self.database),
        };
        let _ = url.set_username(&self.username);
        if !self.password.is_empty() {
            let _ = url.set_password(Some("***"));
        }
        url.set_path(&self.database);
        url.to_string()
    }
}

fn build_database_config(raw: &JsonDatabaseConfig) -> Result<DatabaseConfig> {
    let mut host = raw.host.clone();
    let mut port = raw.port;
    let mut database = raw.database.clone();
    let mut username = raw.username.clone();
    let mut password = raw.password.clone();

    // Discrete fields win over the URL so DB_* variables can patch a shared DSN.
    if let Some(url_str) = raw.url.as_deref().filter(|u| !u.is_empty()) {
        let parsed = Url::parse(url_str)
            .context("Invalid database URL format in database.url")?;
        if parsed.scheme() != "mysql" {
            anyhow::bail!("database.url must use the mysql:// scheme");
        }
        host = host.or_else(|| parsed.host_str().map(str::to_string));
        port = port.or(parsed.port());
        let path = parsed.path().trim_start_matches('/');
        if !path.is_empty() {
            database = database.or_else(|| Some(path.to_string()));
        }
        if !parsed.username().is_empty() {
            username = username.or_else(|| Some(parsed.username().to_string()));
        }
        password = password.or_else(|| parsed.password().map(str::to_string));
    }

    let database = database
        .filter(|d| !d.is_empty())
        .context("database.database (DB_DATABASE) must be set")?;
    if database.contains(|c: char| !c.is_alphanumeric() && c != '_' && c != '-' && c != '$') {
        anyhow::bail!("Invalid character in database name: {database}");
    }

    Ok(DatabaseConfig {
        host: host.unwrap_or_else(|| "127.0.0.1".to_string()),
        port: port.unwrap_or(3306),
        database,
        username: username.unwrap_or_else(|| "root".to_string()),
        password: password.unwrap_or_default(),
        dump_binary_path: raw.dump_binary_path.clone(),
        client_binary: raw.client_binary.clone().unwrap_or_else(|| "mysql".to_string()),
        dump_mode: raw.dump_mode.unwrap_or(DumpMode::External),
        timeout: Duration::from_secs(raw.timeout_secs.unwrap_or(DEFAULT_SUBPROCESS_TIMEOUT_SECS)),
    })
}

/// Layers environment values over the parsed file. `lookup` is injected so
/// tests can supply a fixed environment.
pub fn apply_env_overrides<F>(raw: &mut RawJsonConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

    if let Some(v) = get("DATABASE_URL") {
        raw.database.url = Some(v);
    }
    if let Some(v) = get("DB_HOST") {
        raw.database.host = Some(v);
    }
    if let Some(v) = get("DB_PORT").and_then(|p| p.parse().ok()) {
        raw.database.port = Some(v);
    }
    if let Some(v) = get("DB_DATABASE") {
        raw.database.database = Some(v);
    }
    if let Some(v) = get("DB_USERNAME") {
        raw.database.username = Some(v);
    }
    if let Some(v) = get("DB_PASSWORD") {
        raw.database.password = Some(v);
    }
    if let Some(v) = get("MYSQL_DUMP_BINARY_PATH") {
        raw.database.dump_binary_path = Some(PathBuf::from(v));
    }
    if let Some(v) = get("BACKUP_ENCRYPTION_ENABLED") {
        raw.encryption.enabled = Some(parse_bool(&v));
    }
    if let Some(v) = get("BACKUP_ARCHIVE_PASSWORD") {
        raw.encryption.password = Some(v);
    }
    if let Some(v) = get("BACKUP_S3_ENABLED") {
        raw.remote.enabled = Some(parse_bool(&v));
    }
    if let Some(v) = get("AWS_ACCESS_KEY_ID") {
        raw.remote.access_key_id = Some(v);
    }
    if let Some(v) = get("AWS_SECRET_ACCESS_KEY") {
        raw.remote.secret_access_key = Some(v);
    }
    if let Some(v) = get("AWS_DEFAULT_REGION") {
        raw.remote.region = Some(v);
    }
    if let Some(v) = get("AWS_BUCKET") {
        raw.remote.bucket = Some(v);
    }
    if let Some(v) = get("AWS_ENDPOINT") {
        raw.remote.endpoint_url = Some(v);
    }
    if let Some(v) = get("ADMIN_EMAIL") {
        raw.notifications.email = Some(v);
    }
    if let Some(v) = get("BACKUP_LOCAL_DIR") {
        raw.backup_dir = Some(PathBuf::from(v));
    }
}

fn default_post_hooks() -> Vec<Vec<String>> {
    [
        vec!["php", "artisan", "config:clear"],
        vec!["php", "artisan", "cache:clear"],
        vec!["php", "artisan", "migrate", "--force"],
    ]
    .into_iter()
    .map(|hook| hook.into_iter().map(str::to_string).collect())
    .collect()
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
impl AppConfig {
    /// Defaults rooted at `root`: backups in `root/backups`, scratch in
    /// `root/scratch`, remote disabled.
    pub(crate) fn for_tests(root: &Path) -> Self {
        let mut raw = RawJsonConfig::default();
        raw.database.database = Some("hommss_test".to_string());
        raw.backup_dir = Some(root.join("backups"));
        raw.scratch_root = Some(root.join("scratch"));
        let mut config = AppConfig::from_raw(raw).expect("test config is valid");
        config.files.restore_root = root.join("restored");
        config.restore.post_hooks = Vec::new();
        config.min_free_disk_mb = 0;
        config
    }
}
