// hommss-backup/src/restore/selection.rs
use crate::backup::artifact::Artifact;
use crate::errors::{BackupError, Result};
use crate::utils::format_bytes;
use crate::utils::prompt::Prompter;

/// How many of the newest backups the interactive picker offers.
pub const INTERACTIVE_CHOICES: usize = 10;

/// Which backup a restore should use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Exact filename, or the newest backup whose name contains it.
    Named(String),
    Latest,
    Interactive,
}

/// Picks one artifact from a newest-first `listing`.
pub fn select(listing: &[Artifact], selection: &Selection, prompter: &mut dyn Prompter) -> Result<Artifact> {
    if listing.is_empty() {
        return Err(BackupError::InvalidInput("No backups found".to_string()));
    }

    match selection {
        Selection::Named(needle) => listing
            .iter()
            .find(|a| a.name == *needle)
            .or_else(|| listing.iter().find(|a| a.name.contains(needle.as_str())))
            .cloned()
            .ok_or_else(|| BackupError::InvalidInput(format!("Backup not found: {needle}"))),
        Selection::Latest => Ok(listing[0].clone()),
        Selection::Interactive => choose_interactively(listing, prompter),
    }
}

fn choose_interactively(listing: &[Artifact], prompter: &mut dyn Prompter) -> Result<Artifact> {
    if !prompter.is_interactive() {
        return Err(BackupError::Cancelled(
            "interactive selection needs a terminal; use --backup NAME or --latest".to_string(),
        ));
    }

    let choices = &listing[..listing.len().min(INTERACTIVE_CHOICES)];
    println!("📋 Available backups:");
    for (i, a) in choices.iter().enumerate() {
        println!(
            "  {:>2}. {} ({}, {})",
            i + 1,
            a.name,
            format_bytes(a.size),
            a.modified.format("%Y-%m-%d %H:%M:%S")
        );
    }

    let answer = prompter.ask(&format!("Enter the number of the backup to restore (1-{})", choices.len()))?;
    answer
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| choices.get(i))
        .cloned()
        .ok_or_else(|| BackupError::InvalidInput(format!("Invalid selection: {answer}")))
}
