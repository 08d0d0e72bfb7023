// hommss-backup/src/restore/hooks.rs
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

use crate::utils::process::{combined_output, run_with_timeout};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookResult {
    pub command: String,
    pub success: bool,
    pub output: String,
}

/// Runs the post-restore commands in order. A failing hook is logged and
/// reported; the remaining hooks still run.
pub async fn run_post_hooks(hooks: &[Vec<String>], workdir: Option<&Path>, limit: Duration) -> Vec<HookResult> {
    let mut results = Vec::with_capacity(hooks.len());
    for hook in hooks {
        let Some((program, args)) = hook.split_first() else {
            continue;
        };
        let label = hook.join(" ");
        tracing::info!("🔧 Running post-restore hook: {}", label);

        let mut command = Command::new(program);
        command.args(args);
        if let Some(dir) = workdir {
            command.current_dir(dir);
        }

        let result = match run_with_timeout(command, None, limit, &label).await {
            Ok(output) if output.status.success() => {
                tracing::info!("✓ {}", label);
                HookResult { command: label, success: true, output: combined_output(&output) }
            }
            Ok(output) => {
                let text = combined_output(&output);
                tracing::warn!("⚠️  Hook '{}' exited with {}: {}", label, output.status, text);
                HookResult { command: label, success: false, output: text }
            }
            Err(e) => {
                tracing::warn!("⚠️  Hook '{}' failed: {}", label, e);
                HookResult { command: label, success: false, output: e.to_string() }
            }
        };
        results.push(result);
    }
    results
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn hook(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn test_failure_is_reported_and_later_hooks_run() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = vec![
            hook(&["sh", "-c", "echo cache cleared"]),
            hook(&["sh", "-c", "echo migration failed 1>&2; exit 1"]),
            hook(&["definitely-not-a-real-binary-hommss"]),
            hook(&["sh", "-c", "touch done"]),
        ];

        let results = run_post_hooks(&hooks, Some(dir.path()), Duration::from_secs(10)).await;

        assert_eq!(results.len(), 4);
        assert!(results[0].success);
        assert_eq!(results[0].output, "cache cleared");
        assert!(!results[1].success);
        assert_eq!(results[1].output, "migration failed");
        assert!(!results[2].success);
        assert!(results[3].success);
        assert!(dir.path().join("done").exists());
    }

    #[tokio::test]
    async fn test_empty_hooks_are_skipped() {
        let results = run_post_hooks(&[Vec::new()], None, Duration::from_secs(1)).await;
        assert!(results.is_empty());
    }
}
