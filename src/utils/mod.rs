pub mod logging;
pub mod process;
pub mod prompt;
pub mod setting;

use std::path::{Path, PathBuf};
use which::which;

use crate::errors::{BackupError, Result};

/// Finds a client binary, looking in `preferred_dir` first and then in PATH.
pub fn find_executable(name: &str, preferred_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = preferred_dir {
        let candidate = if dir.file_name().is_some_and(|f| f == name) {
            dir.to_path_buf()
        } else {
            dir.join(name)
        };
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    which(name).map_err(|_| {
        BackupError::Configuration(format!(
            "{name} executable not found in PATH. Please ensure the MySQL client tools are installed \
             or set MYSQL_DUMP_BINARY_PATH."
        ))
    })
}

/// Human readable byte count using 1024 steps, two decimals at most.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut pow = 0usize;
    while pow < UNITS.len() - 1 && bytes >= 1u64 << (10 * (pow + 1)) {
        pow += 1;
    }
    let value = bytes as f64 / (1u64 << (10 * pow)) as f64;
    let rounded = format!("{value:.2}");
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, UNITS[pow])
}
