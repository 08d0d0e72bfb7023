use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::errors::{BackupError, Result};

/// Runs `command` to completion, optionally feeding `stdin_file` to it, and
/// kills the child when `limit` expires.
///
/// A non-zero exit status is not an error here; callers decide which error
/// category a failed status maps to.
pub async fn run_with_timeout(
    mut command: Command,
    stdin_file: Option<&Path>,
    limit: Duration,
    operation: &str,
) -> Result<Output> {
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match stdin_file {
        Some(path) => {
            let file = std::fs::File::open(path)?;
            command.stdin(Stdio::from(file));
        }
        None => {
            command.stdin(Stdio::null());
        }
    }

    let child = command.spawn().map_err(|e| {
        BackupError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to start {operation}: {e}"),
        ))
    })?;

    // Dropping the wait future on expiry drops the child, and kill_on_drop
    // terminates it.
    match timeout(limit, child.wait_with_output()).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(BackupError::Timeout {
            operation: operation.to_string(),
            seconds: limit.as_secs(),
        }),
    }
}

/// Stdout and stderr of a finished process, for error payloads.
pub fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (true, true) => String::new(),
        (false, true) => stdout.trim().to_string(),
        (true, false) => stderr.trim().to_string(),
        (false, false) => format!("{}\n{}", stdout.trim(), stderr.trim()),
    }
}
