use std::io::{BufRead, IsTerminal, Write};

use crate::errors::{BackupError, Result};

/// Operator interaction, injected so destructive commands can be driven
/// from tests.
pub trait Prompter {
    /// Whether an operator is present to answer questions.
    fn is_interactive(&self) -> bool;
    fn confirm(&mut self, question: &str) -> Result<bool>;
    fn ask(&mut self, question: &str) -> Result<String>;
}

pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn is_interactive(&self) -> bool {
        std::io::stdin().is_terminal()
    }

    fn confirm(&mut self, question: &str) -> Result<bool> {
        let answer = self.ask(&format!("{question} [y/N]"))?;
        Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
    }

    fn ask(&mut self, question: &str) -> Result<String> {
        print!("{question}: ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        let read = std::io::stdin().lock().read_line(&mut input)?;
        if read == 0 {
            return Err(BackupError::Cancelled("no answer on stdin".to_string()));
        }
        Ok(input.trim().to_string())
    }
}

/// Destructive-operation gate: passes with `force`, otherwise requires an
/// explicit yes from an interactive operator.
pub fn confirm_destructive(prompter: &mut dyn Prompter, force: bool, question: &str) -> Result<()> {
    if force {
        tracing::warn!("confirmation skipped with --force");
        return Ok(());
    }
    if !prompter.is_interactive() {
        return Err(BackupError::Cancelled(
            "confirmation required but stdin is not a terminal; pass --force to proceed".to_string(),
        ));
    }
    if prompter.confirm(question)? {
        Ok(())
    } else {
        Err(BackupError::Cancelled("operator declined".to_string()))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedPrompter;
    use super::*;

    #[test]
    fn test_force_skips_question() -> anyhow::Result<()> {
        let mut prompter = ScriptedPrompter::non_interactive();
        confirm_destructive(&mut prompter, true, "Overwrite?")?;
        assert!(prompter.questions.is_empty());
        Ok(())
    }

    #[test]
    fn test_non_interactive_without_force_is_refused() {
        let mut prompter = ScriptedPrompter::non_interactive();
        let err = confirm_destructive(&mut prompter, false, "Overwrite?").unwrap_err();
        assert!(matches!(err, BackupError::Cancelled(_)));
    }

    #[test]
    fn test_declined_confirmation_cancels() {
        let mut prompter = ScriptedPrompter::new(&["n"]);
        let err = confirm_destructive(&mut prompter, false, "Overwrite?").unwrap_err();
        assert!(matches!(err, BackupError::Cancelled(_)));
        assert_eq!(prompter.questions, vec!["Overwrite?".to_string()]);
    }

    #[test]
    fn test_accepted_confirmation_passes() -> anyhow::Result<()> {
        let mut prompter = ScriptedPrompter::new(&["yes"]);
        confirm_destructive(&mut prompter, false, "Overwrite?")?;
        Ok(())
    }
}
