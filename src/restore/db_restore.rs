// hommss-backup/src/restore/db_restore.rs
use async_trait::async_trait;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, Transaction};
use std::path::Path;
use tokio::process::Command;

use crate::config::{DatabaseConfig, RestoreStrategy};
use crate::errors::{BackupError, Result};
use crate::utils::find_executable;
use crate::utils::process::{combined_output, run_with_timeout};

/// Replays a SQL dump against the live database.
#[async_trait]
pub trait SqlApplier: Send + Sync {
    /// Returns the number of statements executed when the strategy counts
    /// them.
    async fn apply(&self, db: &DatabaseConfig, sql_file: &Path) -> Result<Option<usize>>;
}

pub fn applier_for(strategy: RestoreStrategy) -> Box<dyn SqlApplier> {
    match strategy {
        RestoreStrategy::Client => Box::new(ClientApplier),
        RestoreStrategy::Statements => Box::new(StatementsApplier),
    }
}

/// Pipes the dump into the `mysql` command-line client.
pub struct ClientApplier;

#[async_trait]
impl SqlApplier for ClientApplier {
    async fn apply(&self, db: &DatabaseConfig, sql_file: &Path) -> Result<Option<usize>> {
        if !sql_file.is_file() {
            return Err(BackupError::NoDumpFound(sql_file.display().to_string()));
        }
        let client_dir = db.dump_binary_path.as_deref().map(|p| if p.is_file() { p.parent().unwrap_or(p) } else { p });
        let client = find_executable(&db.client_binary, client_dir)?;
        tracing::info!("Executing {} with {} on {}...", sql_file.display(), client.display(), db.redacted_url());

        let mut command = Command::new(&client);
        command
            .arg(format!("--host={}", db.host))
            .arg(format!("--port={}", db.port))
            .arg(format!("--user={}", db.username))
            .arg(&db.database)
            .env("MYSQL_PWD", &db.password);

        let output = run_with_timeout(command, Some(sql_file), db.timeout, &db.client_binary).await?;
        if !output.status.success() {
            return Err(BackupError::RestoreExec {
                message: format!("{} exited with {} for {}", db.client_binary, output.status, sql_file.display()),
                output: combined_output(&output),
            });
        }

        tracing::info!("✓ Successfully executed SQL file: {}", sql_file.display());
        Ok(None)
    }
}

/// Splits the dump and runs every statement inside a single transaction.
///
/// MySQL commits implicitly around DDL, so a rollback only undoes the data
/// statements executed since the last schema change.
pub struct StatementsApplier;

#[async_trait]
impl SqlApplier for StatementsApplier {
    async fn apply(&self, db: &DatabaseConfig, sql_file: &Path) -> Result<Option<usize>> {
        let sql = tokio::fs::read_to_string(sql_file).await?;
        let statements = split_statements(&sql);
        tracing::info!("Executing {} statements from {}", statements.len(), sql_file.display());

        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(db.timeout)
            .connect_with(db.connect_options())
            .await?;
        let mut session = MySqlSession { tx: Some(pool.begin().await?) };
        let result = tokio::time::timeout(db.timeout, apply_statements(&mut session, &statements)).await;
        drop(session);
        pool.close().await;

        match result {
            Ok(applied) => applied.map(Some),
            Err(_) => Err(BackupError::Timeout {
                operation: "statement restore".to_string(),
                seconds: db.timeout.as_secs(),
            }),
        }
    }
}

/// One transaction's worth of statement execution.
#[async_trait]
pub trait StatementSession: Send {
    async fn execute(&mut self, statement: &str) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
    async fn rollback(&mut self) -> Result<()>;
}

struct MySqlSession {
    tx: Option<Transaction<'static, MySql>>,
}

impl MySqlSession {
    fn tx(&mut self) -> Result<&mut Transaction<'static, MySql>> {
        self.tx
            .as_mut()
            .ok_or_else(|| BackupError::InvalidInput("transaction already finished".to_string()))
    }
}

#[async_trait]
impl StatementSession for MySqlSession {
    async fn execute(&mut self, statement: &str) -> Result<()> {
        let tx = self.tx()?;
        // A plain &str runs over the text protocol, which accepts statements
        // the prepared protocol rejects (LOCK TABLES, DELIMITER bodies).
        sqlx::Executor::execute(&mut **tx, statement).await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

/// Executes `statements` in order and commits. The first failure rolls the
/// session back and is reported with the offending statement.
pub async fn apply_statements(session: &mut dyn StatementSession, statements: &[String]) -> Result<usize> {
    for (i, statement) in statements.iter().enumerate() {
        if let Err(e) = session.execute(statement).await {
            if let Err(rollback_err) = session.rollback().await {
                tracing::error!("❌ Rollback failed: {}", rollback_err);
            }
            return Err(BackupError::RestoreExec {
                message: format!(
                    "statement {} of {} failed, transaction rolled back: {}",
                    i + 1,
                    statements.len(),
                    e
                ),
                output: preview(statement),
            });
        }
    }
    session.commit().await?;
    Ok(statements.len())
}

fn preview(statement: &str) -> String {
    const MAX: usize = 200;
    match statement.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}...", &statement[..cut]),
        None => statement.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    Quoted(char),
    LineComment,
    BlockComment { keep: bool },
}

/// Splits a MySQL dump into executable statements.
///
/// Quotes, backticks and backslash escapes are respected, `DELIMITER`
/// directives switch the terminator, comments and blank lines are dropped
/// except `/*! ... */` version comments which MySQL executes.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut delimiter = ";".to_string();
    let mut state = ScanState::Normal;
    let mut i = 0;

    while let Some(c) = sql[i..].chars().next() {
        let rest = &sql[i..];
        match state {
            ScanState::Normal => {
                if current.trim().is_empty() {
                    if let Some((new_delimiter, consumed)) = delimiter_directive(rest) {
                        if !new_delimiter.is_empty() {
                            delimiter = new_delimiter.to_string();
                        }
                        current.clear();
                        i += consumed;
                        continue;
                    }
                }
                if rest.starts_with(delimiter.as_str()) {
                    flush(&mut current, &mut statements);
                    i += delimiter.len();
                    continue;
                }
                if rest.starts_with("/*!") {
                    state = ScanState::BlockComment { keep: true };
                    current.push_str("/*!");
                    i += 3;
                    continue;
                }
                if rest.starts_with("/*") {
                    state = ScanState::BlockComment { keep: false };
                    i += 2;
                    continue;
                }
                if c == '#' || (rest.starts_with("--") && rest[2..].chars().next().is_none_or(char::is_whitespace)) {
                    state = ScanState::LineComment;
                    i += c.len_utf8();
                    continue;
                }
                if matches!(c, '\'' | '"' | '`') {
                    state = ScanState::Quoted(c);
                }
                current.push(c);
                i += c.len_utf8();
            }
            ScanState::Quoted(quote) => {
                current.push(c);
                i += c.len_utf8();
                if c == '\\' && quote != '`' {
                    if let Some(escaped) = sql[i..].chars().next() {
                        current.push(escaped);
                        i += escaped.len_utf8();
                    }
                } else if c == quote {
                    state = ScanState::Normal;
                }
            }
            ScanState::LineComment => {
                i += c.len_utf8();
                if c == '\n' {
                    state = ScanState::Normal;
                    current.push('\n');
                }
            }
            ScanState::BlockComment { keep } => {
                if rest.starts_with("*/") {
                    if keep {
                        current.push_str("*/");
                    } else {
                        current.push(' ');
                    }
                    state = ScanState::Normal;
                    i += 2;
                    continue;
                }
                if keep {
                    current.push(c);
                }
                i += c.len_utf8();
            }
        }
    }

    flush(&mut current, &mut statements);
    statements
}

/// Recognises `DELIMITER <token>` at the start of `rest`, returning the new
/// token and the bytes consumed including the line break.
fn delimiter_directive(rest: &str) -> Option<(&str, usize)> {
    const KEYWORD: &str = "DELIMITER";
    let head = rest.get(..KEYWORD.len())?;
    if !head.eq_ignore_ascii_case(KEYWORD) {
        return None;
    }
    let after = &rest[KEYWORD.len()..];
    if !after.starts_with([' ', '\t']) {
        return None;
    }
    let line_end = rest.find('\n').map_or(rest.len(), |n| n + 1);
    let token = rest[KEYWORD.len()..line_end].trim();
    Some((token, line_end))
}

fn flush(current: &mut String, statements: &mut Vec<String>) {
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    current.clear();
}
