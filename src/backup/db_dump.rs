// hommss-backup/src/backup/db_dump.rs
use async_trait::async_trait;
use chrono::Local;
use sqlx::mysql::MySqlRow;
use sqlx::{Column, Connection, Executor, MySqlConnection, Row, TypeInfo};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::config::{DatabaseConfig, DumpMode};
use crate::errors::{BackupError, Result};
use crate::utils::find_executable;
use crate::utils::process::run_with_timeout;

/// Rows per multi-row INSERT statement.
pub const INSERT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpSummary {
    pub path: PathBuf,
    pub bytes: u64,
    /// Table and row counts are only known for in-process dumps.
    pub tables: Option<usize>,
    pub rows: Option<u64>,
}

/// Writes a complete SQL dump of `db` to `output`.
#[async_trait]
pub trait DumpProducer: Send + Sync {
    async fn dump(&self, db: &DatabaseConfig, output: &Path) -> Result<DumpSummary>;
}

pub fn producer_for(mode: DumpMode) -> Box<dyn DumpProducer> {
    match mode {
        DumpMode::External => Box::new(MysqldumpProducer),
        DumpMode::InProcess => Box::new(InProcessProducer),
    }
}

/// Runs the `mysqldump` client.
pub struct MysqldumpProducer;

#[async_trait]
impl DumpProducer for MysqldumpProducer {
    async fn dump(&self, db: &DatabaseConfig, output: &Path) -> Result<DumpSummary> {
        let mysqldump = find_executable("mysqldump", db.dump_binary_path.as_deref())?;
        tracing::info!("Found mysqldump executable at: {}", mysqldump.display());

        let mut command = Command::new(&mysqldump);
        command
            .arg("--single-transaction")
            .arg("--routines")
            .arg("--triggers")
            .arg("--add-drop-table")
            .arg(format!("--result-file={}", output.display()))
            .arg("-h")
            .arg(&db.host)
            .arg("-P")
            .arg(db.port.to_string())
            .arg("-u")
            .arg(&db.username)
            .arg(&db.database)
            // Keeps the password off the process list.
            .env("MYSQL_PWD", &db.password);

        tracing::info!("Dumping {} with mysqldump to {}", db.redacted_url(), output.display());
        let result = run_with_timeout(command, None, db.timeout, "mysqldump").await?;

        if !result.status.success() {
            return Err(BackupError::Dump {
                message: format!("mysqldump for database {} failed with status: {}", db.database, result.status),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        let bytes = std::fs::metadata(output)?.len();
        tracing::info!("✓ Database {} dumped successfully via mysqldump.", db.database);
        Ok(DumpSummary { path: output.to_path_buf(), bytes, tables: None, rows: None })
    }
}

/// Dumps through a sqlx connection, for hosts without the MySQL client tools.
pub struct InProcessProducer;

#[async_trait]
impl DumpProducer for InProcessProducer {
    async fn dump(&self, db: &DatabaseConfig, output: &Path) -> Result<DumpSummary> {
        let mut conn = MySqlConnection::connect_with(&db.connect_options()).await?;
        // One snapshot for every table, so paging sees no concurrent writes.
        conn.execute("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ").await?;
        conn.execute("START TRANSACTION WITH CONSISTENT SNAPSHOT").await?;
        let mut source = MySqlTableSource { conn, order_by: HashMap::new() };

        let file = File::create(output)?;
        let mut writer = BufWriter::new(file);
        let (tables, rows) = write_dump(&mut source, &mut writer, &db.database).await?;
        writer.flush()?;
        drop(writer);

        source.conn.execute("COMMIT").await?;
        let _ = source.conn.close().await;
        let bytes = std::fs::metadata(output)?.len();
        tracing::info!("✓ Dumped {} tables ({} rows) from {}", tables, rows, db.database);
        Ok(DumpSummary { path: output.to_path_buf(), bytes, tables: Some(tables), rows: Some(rows) })
    }
}

/// A decoded column value, rendered as a MySQL literal.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Decimal(String),
    Bytes(Vec<u8>),
    Text(String),
}

impl SqlValue {
    pub fn render(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Int(v) => v.to_string(),
            SqlValue::UInt(v) => v.to_string(),
            SqlValue::Float(v) if v.is_finite() => v.to_string(),
            SqlValue::Float(_) => "NULL".to_string(),
            SqlValue::Decimal(v) => v.clone(),
            SqlValue::Bytes(v) if v.is_empty() => "''".to_string(),
            SqlValue::Bytes(v) => format!("0x{}", hex::encode(v)),
            SqlValue::Text(v) => format!("'{}'", escape_string(v)),
        }
    }
}

/// Escapes a string the way `mysql_real_escape_string` does.
pub fn escape_string(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        match c {
            '\0' => escaped.push_str("\\0"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("\\'"),
            '"' => escaped.push_str("\\\""),
            '\x1a' => escaped.push_str("\\Z"),
            other => escaped.push(other),
        }
    }
    escaped
}

pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Where the in-process dump reads schema and rows from.
#[async_trait]
pub trait TableSource: Send {
    /// Base tables in dump order.
    async fn tables(&mut self) -> Result<Vec<String>>;
    async fn create_statement(&mut self, table: &str) -> Result<String>;
    /// Up to `limit` rows starting at `offset`, in a stable order.
    async fn rows(&mut self, table: &str, offset: usize, limit: usize) -> Result<Vec<Vec<SqlValue>>>;
}

/// Writes `DROP`/`CREATE` and batched `INSERT` statements for every table.
/// Returns the number of tables and rows written.
pub async fn write_dump<S, W>(source: &mut S, out: &mut W, database: &str) -> Result<(usize, u64)>
where
    S: TableSource + ?Sized,
    W: Write + Send,
{
    writeln!(out, "-- HOMMSS database backup")?;
    writeln!(out, "-- Database: {}", database)?;
    writeln!(out, "-- Backup time: {}", Local::now().format("%Y-%m-%d %H:%M:%S"))?;
    writeln!(out)?;
    writeln!(out, "SET NAMES utf8mb4;")?;
    writeln!(out, "SET FOREIGN_KEY_CHECKS=0;")?;

    let tables = source.tables().await?;
    let mut total_rows = 0u64;

    for table in &tables {
        let ident = quote_identifier(table);
        let create = source.create_statement(table).await?;

        writeln!(out)?;
        writeln!(out, "-- Table structure for table {}", ident)?;
        writeln!(out, "DROP TABLE IF EXISTS {};", ident)?;
        writeln!(out, "{};", create.trim_end().trim_end_matches(';'))?;

        let mut offset = 0;
        loop {
            let rows = source.rows(table, offset, INSERT_BATCH_SIZE).await?;
            if rows.is_empty() {
                break;
            }
            if offset == 0 {
                writeln!(out)?;
                writeln!(out, "-- Data for table {}", ident)?;
            }

            let tuples: Vec<String> = rows
                .iter()
                .map(|row| {
                    let values: Vec<String> = row.iter().map(SqlValue::render).collect();
                    format!("({})", values.join(","))
                })
                .collect();
            writeln!(out, "INSERT INTO {} VALUES {};", ident, tuples.join(","))?;

            total_rows += rows.len() as u64;
            offset += rows.len();
            if rows.len() < INSERT_BATCH_SIZE {
                break;
            }
        }
        tracing::debug!("dumped table {}", table);
    }

    writeln!(out)?;
    writeln!(out, "SET FOREIGN_KEY_CHECKS=1;")?;
    Ok((tables.len(), total_rows))
}

struct MySqlTableSource {
    conn: MySqlConnection,
    /// `ORDER BY` clause per table.
    order_by: HashMap<String, String>,
}

impl MySqlTableSource {
    async fn order_clause(&mut self, table: &str) -> Result<String> {
        if let Some(clause) = self.order_by.get(table) {
            return Ok(clause.clone());
        }
        let rows = sqlx::query(
            "SELECT COLUMN_NAME, COLUMN_KEY FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
        )
        .bind(table)
        .fetch_all(&mut self.conn)
        .await?;
        let columns = rows
            .iter()
            .map(|row| Ok((text_column(row, 0)?, text_column(row, 1)? == "PRI")))
            .collect::<Result<Vec<_>>>()?;
        let clause = order_by_clause(&columns);
        self.order_by.insert(table.to_string(), clause.clone());
        Ok(clause)
    }
}

/// Orders by the primary key, or by every column when there is none, so
/// that `LIMIT`/`OFFSET` pages neither overlap nor skip rows.
fn order_by_clause(columns: &[(String, bool)]) -> String {
    let primary: Vec<&str> = columns.iter().filter(|(_, pk)| *pk).map(|(name, _)| name.as_str()).collect();
    let keys = if primary.is_empty() {
        columns.iter().map(|(name, _)| name.as_str()).collect()
    } else {
        primary
    };
    if keys.is_empty() {
        return String::new();
    }
    let quoted: Vec<String> = keys.into_iter().map(quote_identifier).collect();
    format!(" ORDER BY {}", quoted.join(", "))
}

#[async_trait]
impl TableSource for MySqlTableSource {
    async fn tables(&mut self) -> Result<Vec<String>> {
        let rows = self
            .conn
            .fetch_all("SHOW FULL TABLES WHERE Table_type = 'BASE TABLE'")
            .await?;
        rows.iter().map(|row| text_column(row, 0)).collect()
    }

    async fn create_statement(&mut self, table: &str) -> Result<String> {
        let sql = format!("SHOW CREATE TABLE {}", quote_identifier(table));
        let row = self.conn.fetch_one(sql.as_str()).await?;
        text_column(&row, 1)
    }

    async fn rows(&mut self, table: &str, offset: usize, limit: usize) -> Result<Vec<Vec<SqlValue>>> {
        let order = self.order_clause(table).await?;
        let sql = format!("SELECT * FROM {}{} LIMIT {} OFFSET {}", quote_identifier(table), order, limit, offset);
        // Text protocol: temporal values arrive as the server renders them.
        let rows = self.conn.fetch_all(sql.as_str()).await?;
        rows.iter()
            .map(|row| {
                (0..row.columns().len())
                    .map(|i| decode_value(row, i))
                    .collect::<Result<Vec<_>>>()
            })
            .collect()
    }
}

fn text_column(row: &MySqlRow, index: usize) -> Result<String> {
    if let Ok(value) = row.try_get::<String, _>(index) {
        return Ok(value);
    }
    let bytes: Vec<u8> = row.try_get(index)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// How a column is read back, by declared MySQL type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decoding {
    Unsigned,
    Signed,
    Float,
    Decimal,
    /// Kept as the server's text, so zero dates and TIME values outside a
    /// day survive unchanged.
    Temporal,
    Json,
    Binary,
    Text,
}

fn decoding_for(type_name: &str) -> Decoding {
    let type_name = type_name.to_ascii_uppercase();
    match type_name.as_str() {
        t if t.ends_with("UNSIGNED") => Decoding::Unsigned,
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "BOOLEAN" => Decoding::Signed,
        "FLOAT" | "DOUBLE" => Decoding::Float,
        "DECIMAL" => Decoding::Decimal,
        "DATE" | "DATETIME" | "TIMESTAMP" | "TIME" | "YEAR" => Decoding::Temporal,
        "JSON" => Decoding::Json,
        t if t.contains("BINARY") || t.contains("BLOB") || t == "BIT" => Decoding::Binary,
        _ => Decoding::Text,
    }
}

/// Decodes one column of a text-protocol row.
fn decode_value(row: &MySqlRow, index: usize) -> Result<SqlValue> {
    let type_name = row.columns()[index].type_info().name();

    let decoded = match decoding_for(type_name) {
        Decoding::Unsigned => row.try_get::<Option<u64>, _>(index).map(|v| v.map(SqlValue::UInt)),
        Decoding::Signed => row.try_get::<Option<i64>, _>(index).map(|v| v.map(SqlValue::Int)),
        Decoding::Float => row
            .try_get::<Option<f64>, _>(index)
            .or_else(|_| row.try_get::<Option<f32>, _>(index).map(|v| v.map(f64::from)))
            .map(|v| v.map(SqlValue::Float)),
        Decoding::Decimal => row
            .try_get::<Option<sqlx::types::BigDecimal>, _>(index)
            .map(|v| v.map(|d| SqlValue::Decimal(d.to_string()))),
        Decoding::Temporal => row.try_get_unchecked::<Option<String>, _>(index).map(|v| v.map(SqlValue::Text)),
        Decoding::Json => row
            .try_get::<Option<serde_json::Value>, _>(index)
            .map(|v| v.map(|j| SqlValue::Text(j.to_string()))),
        Decoding::Text => row.try_get::<Option<String>, _>(index).map(|v| v.map(SqlValue::Text)),
        Decoding::Binary => row.try_get::<Option<Vec<u8>>, _>(index).map(|v| v.map(SqlValue::Bytes)),
    };

    // Anything without a typed decoding is dumped as raw bytes.
    match decoded.or_else(|_| row.try_get::<Option<Vec<u8>>, _>(index).map(|v| v.map(SqlValue::Bytes))) {
        Ok(val) => Ok(val.unwrap_or(SqlValue::Null)),
        Err(_) => Err(BackupError::Dump {
            message: format!("Unsupported data type {} for column {}", type_name, row.columns()[index].name()),
            stderr: String::new(),
        }),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::BTreeMap;

    /// In-memory tables for exercising the SQL writer.
    #[derive(Default)]
    pub struct MemoryTableSource {
        pub tables: BTreeMap<String, (String, Vec<Vec<SqlValue>>)>,
    }

    impl MemoryTableSource {
        pub fn with_table(mut self, name: &str, create: &str, rows: Vec<Vec<SqlValue>>) -> Self {
            self.tables.insert(name.to_string(), (create.to_string(), rows));
            self
        }
    }

    #[async_trait]
    impl TableSource for MemoryTableSource {
        async fn tables(&mut self) -> Result<Vec<String>> {
            Ok(self.tables.keys().cloned().collect())
        }

        async fn create_statement(&mut self, table: &str) -> Result<String> {
            Ok(self.tables[table].0.clone())
        }

        async fn rows(&mut self, table: &str, offset: usize, limit: usize) -> Result<Vec<Vec<SqlValue>>> {
            Ok(self.tables[table].1.iter().skip(offset).take(limit).cloned().collect())
        }
    }

    /// Fake producer writing a fixed dump, so backups can be built without a server.
    pub struct FixedDumpProducer(pub String);

    #[async_trait]
    impl DumpProducer for FixedDumpProducer {
        async fn dump(&self, _db: &DatabaseConfig, output: &Path) -> Result<DumpSummary> {
            std::fs::write(output, &self.0)?;
            Ok(DumpSummary {
                path: output.to_path_buf(),
                bytes: self.0.len() as u64,
                tables: None,
                rows: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryTableSource;
    use super::*;

    fn user_row(id: i64, name: &str) -> Vec<SqlValue> {
        vec![SqlValue::Int(id), SqlValue::Text(name.to_string()), SqlValue::Null]
    }

    #[tokio::test]
    async fn test_users_with_rows_and_empty_orders() -> anyhow::Result<()> {
        let mut source = MemoryTableSource::default()
            .with_table(
                "users",
                "CREATE TABLE `users` (`id` int, `name` varchar(50), `note` text)",
                vec![user_row(1, "Ana"), user_row(2, "Ben"), user_row(3, "O'Neil")],
            )
            .with_table("orders", "CREATE TABLE `orders` (`id` int)", vec![]);

        let mut out = Vec::new();
        let (tables, rows) = write_dump(&mut source, &mut out, "hommss").await?;
        let sql = String::from_utf8(out)?;

        assert_eq!((tables, rows), (2, 3));
        assert!(sql.contains("DROP TABLE IF EXISTS `users`;"));
        assert!(sql.contains("CREATE TABLE `users` (`id` int, `name` varchar(50), `note` text);"));
        assert!(sql.contains("INSERT INTO `users` VALUES (1,'Ana',NULL),(2,'Ben',NULL),(3,'O\\'Neil',NULL);"));
        assert!(sql.contains("CREATE TABLE `orders` (`id` int);"));
        assert!(!sql.contains("INSERT INTO `orders`"));
        assert!(sql.trim_end().ends_with("SET FOREIGN_KEY_CHECKS=1;"));
        Ok(())
    }

    #[tokio::test]
    async fn test_large_tables_are_batched() -> anyhow::Result<()> {
        let rows: Vec<Vec<SqlValue>> = (0..1200).map(|i| vec![SqlValue::Int(i)]).collect();
        let mut source = MemoryTableSource::default().with_table("logs", "CREATE TABLE `logs` (`id` int)", rows);

        let mut out = Vec::new();
        let (_, total) = write_dump(&mut source, &mut out, "hommss").await?;
        let sql = String::from_utf8(out)?;

        assert_eq!(total, 1200);
        assert_eq!(sql.matches("INSERT INTO `logs` VALUES").count(), 3);
        Ok(())
    }

    #[test]
    fn test_value_rendering() {
        assert_eq!(SqlValue::Null.render(), "NULL");
        assert_eq!(SqlValue::Int(-5).render(), "-5");
        assert_eq!(SqlValue::UInt(u64::MAX).render(), "18446744073709551615");
        assert_eq!(SqlValue::Float(1.5).render(), "1.5");
        assert_eq!(SqlValue::Float(f64::NAN).render(), "NULL");
        assert_eq!(SqlValue::Decimal("12.50".into()).render(), "12.50");
        assert_eq!(SqlValue::Bytes(vec![0x00, 0xff, 0x27]).render(), "0x00ff27");
        assert_eq!(SqlValue::Bytes(vec![]).render(), "''");
        assert_eq!(SqlValue::Text("2024-01-15 02:00:00".into()).render(), "'2024-01-15 02:00:00'");
    }

    #[test]
    fn test_escape_string_matches_mysql_rules() {
        assert_eq!(
            escape_string("a'b\"c\\d\ne\rf\0g\x1ah"),
            "a\\'b\\\"c\\\\d\\ne\\rf\\0g\\Zh"
        );
        assert_eq!(escape_string("plain ünïcode"), "plain ünïcode");
    }

    #[test]
    fn test_temporal_columns_keep_server_text() {
        for name in ["DATE", "DATETIME", "TIMESTAMP", "TIME", "YEAR", "time"] {
            assert_eq!(decoding_for(name), Decoding::Temporal, "{name}");
        }
        assert_eq!(decoding_for("INT UNSIGNED"), Decoding::Unsigned);
        assert_eq!(decoding_for("VARBINARY"), Decoding::Binary);
        assert_eq!(decoding_for("VARCHAR"), Decoding::Text);

        // Zero dates and long TIME values are written back verbatim.
        assert_eq!(SqlValue::Text("0000-00-00 00:00:00".into()).render(), "'0000-00-00 00:00:00'");
        assert_eq!(SqlValue::Text("-838:59:59".into()).render(), "'-838:59:59'");
    }

    #[test]
    fn test_paging_order_is_unique() {
        let columns = |cols: &[(&str, bool)]| -> Vec<(String, bool)> {
            cols.iter().map(|(n, pk)| (n.to_string(), *pk)).collect()
        };
        assert_eq!(
            order_by_clause(&columns(&[("tenant", true), ("name", false), ("id", true)])),
            " ORDER BY `tenant`, `id`"
        );
        // Without a primary key every column takes part.
        assert_eq!(
            order_by_clause(&columns(&[("status", false), ("note", false)])),
            " ORDER BY `status`, `note`"
        );
        assert_eq!(order_by_clause(&[]), "");
    }

    #[tokio::test]
    async fn test_duplicate_leading_values_are_dumped_once() -> anyhow::Result<()> {
        // Many rows share the first column, the case that broke paging.
        let rows: Vec<Vec<SqlValue>> = (0..1100)
            .map(|i| vec![SqlValue::Text("pending".into()), SqlValue::Int(i)])
            .collect();
        let mut source = MemoryTableSource::default().with_table(
            "jobs",
            "CREATE TABLE `jobs` (`status` varchar(10), `id` int)",
            rows,
        );

        let mut out = Vec::new();
        let (_, total) = write_dump(&mut source, &mut out, "hommss").await?;
        let sql = String::from_utf8(out)?;

        assert_eq!(total, 1100);
        for id in [0, 499, 500, 999, 1000, 1099] {
            assert_eq!(sql.matches(&format!("('pending',{id})")).count(), 1, "{id}");
        }
        Ok(())
    }

    #[test]
    fn test_quote_identifier_doubles_backticks() {
        assert_eq!(quote_identifier("odd`name"), "`odd``name`");
    }

    #[cfg(unix)]
    mod mysqldump {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        fn fake_binary(dir: &Path, script: &str) -> anyhow::Result<()> {
            let path = dir.join("mysqldump");
            std::fs::write(&path, script)?;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
            Ok(())
        }

        fn db_config(bin_dir: &Path) -> DatabaseConfig {
            DatabaseConfig {
                host: "127.0.0.1".into(),
                port: 3306,
                database: "hommss".into(),
                username: "backup".into(),
                password: "s3cret".into(),
                dump_binary_path: Some(bin_dir.to_path_buf()),
                client_binary: "mysql".into(),
                dump_mode: DumpMode::External,
                timeout: Duration::from_secs(30),
            }
        }

        #[tokio::test]
        async fn test_password_travels_in_environment() -> anyhow::Result<()> {
            let dir = tempfile::tempdir()?;
            fake_binary(
                dir.path(),
                "#!/bin/sh\nfor a in \"$@\"; do case \"$a\" in --result-file=*) out=\"${a#--result-file=}\";; esac; done\n\
                 echo \"-- pwd=$MYSQL_PWD\" > \"$out\"\necho \"-- args=$*\" >> \"$out\"\n",
            )?;

            let output = dir.path().join("dump.sql");
            let summary = MysqldumpProducer.dump(&db_config(dir.path()), &output).await?;
            let written = std::fs::read_to_string(&output)?;

            assert!(summary.bytes > 0);
            assert!(written.contains("-- pwd=s3cret"));
            let args_line = written.lines().find(|l| l.starts_with("-- args=")).unwrap_or_default();
            assert!(args_line.contains("--single-transaction"));
            assert!(args_line.contains("--add-drop-table"));
            assert!(!args_line.contains("s3cret"));
            Ok(())
        }

        #[tokio::test]
        async fn test_failure_carries_stderr() -> anyhow::Result<()> {
            let dir = tempfile::tempdir()?;
            fake_binary(dir.path(), "#!/bin/sh\necho \"Access denied for user\" 1>&2\nexit 2\n")?;

            let err = MysqldumpProducer
                .dump(&db_config(dir.path()), &dir.path().join("dump.sql"))
                .await
                .unwrap_err();
            match err {
                BackupError::Dump { stderr, .. } => assert_eq!(stderr, "Access denied for user"),
                other => panic!("unexpected error: {other}"),
            }
            Ok(())
        }
    }
}
