//! HOMMSS backup and restore tool
//!
//! Creates, lists, prunes and restores database and file backups, locally
//! and in S3-compatible object storage.

// hommss-backup/src/main.rs
mod backup;
mod config;
mod errors;
mod notify;
mod restore;
mod retention;
mod storage;
mod utils;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use backup::artifact::BackupType;
use backup::logic::BackupRequest;
use config::{AppConfig, DumpMode, RestoreStrategy};
use errors::BackupError;
use restore::RestoreRequest;
use restore::selection::Selection;
use retention::CleanupRequest;
use utils::format_bytes;
use utils::prompt::TerminalPrompter;

/// Backup and restore for the HOMMSS application
#[derive(Parser)]
#[command(name = "hommss-backup", version)]
#[command(about = "Backup and restore for the HOMMSS database and uploaded files")]
struct Cli {
    /// Path to config.json
    #[arg(long, env = "HOMMSS_BACKUP_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Enable debug output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create and manage backups
    #[command(subcommand)]
    Backup(BackupCommand),

    /// Restore from a backup
    #[command(subcommand)]
    Restore(RestoreCommand),
}

#[derive(Subcommand)]
enum BackupCommand {
    /// Create a new backup
    Create {
        /// What to back up
        #[arg(long = "type", value_enum, default_value = "full")]
        backup_type: BackupType,

        /// Custom artifact name
        #[arg(long)]
        filename: Option<String>,

        /// Encrypt the artifact with the configured password
        #[arg(long)]
        encrypt: bool,

        /// Copy the artifact to remote storage
        #[arg(long)]
        upload_remote: bool,

        /// Notify the administrator of the outcome
        #[arg(long)]
        notify: bool,

        /// Override how the database dump is produced
        #[arg(long, value_enum)]
        dump_mode: Option<DumpMode>,
    },

    /// List available backups
    List {
        /// List remote backups instead of local ones
        #[arg(long)]
        remote: bool,
    },

    /// Delete backups past the retention window
    Cleanup {
        /// Age threshold in days, defaults to the configured retention
        #[arg(long)]
        older_than: Option<u32>,

        /// Show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,

        /// Clean remote storage instead of the local directory
        #[arg(long)]
        remote: bool,

        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Show backup statistics and health
    Status,

    /// Check remote storage connectivity end to end
    TestRemote,

    /// Decrypt an encrypted artifact
    Decrypt {
        file: PathBuf,

        /// Password, defaults to BACKUP_ARCHIVE_PASSWORD
        #[arg(long)]
        password: Option<String>,

        /// Output path, defaults to the input without `.enc`
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum RestoreCommand {
    /// Restore the database and/or files from a backup
    Run(RestoreArgs),
}

#[derive(Args)]
struct RestoreArgs {
    /// Backup filename, or part of it
    #[arg(long, conflicts_with_all = ["latest", "interactive"])]
    backup: Option<String>,

    /// Restore the newest backup
    #[arg(long, conflicts_with = "interactive")]
    latest: bool,

    /// Choose from the newest backups
    #[arg(long)]
    interactive: bool,

    /// Select from remote storage
    #[arg(long)]
    from_remote: bool,

    /// Decrypt before extraction even without a `.enc` suffix
    #[arg(long)]
    decrypt: bool,

    /// Skip the confirmation prompt
    #[arg(long)]
    force: bool,

    /// Decryption password, defaults to BACKUP_ARCHIVE_PASSWORD
    #[arg(long)]
    password: Option<String>,

    /// How the SQL dump is applied
    #[arg(long, value_enum)]
    strategy: Option<RestoreStrategy>,

    /// Do not run the post-restore commands
    #[arg(long)]
    skip_hooks: bool,
}

impl RestoreArgs {
    fn into_request(self) -> RestoreRequest {
        let selection = match (self.backup, self.latest) {
            (Some(name), _) => Selection::Named(name),
            (None, true) => Selection::Latest,
            (None, false) => Selection::Interactive,
        };
        RestoreRequest {
            selection,
            from_remote: self.from_remote,
            decrypt: self.decrypt,
            force: self.force,
            password: self.password,
            strategy: self.strategy,
            skip_hooks: self.skip_hooks,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run_app(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("❌ Error: {:#}", e);
            match e.chain().find_map(|c| c.downcast_ref::<BackupError>()) {
                Some(err) => {
                    if let Some(hint) = err.hint() {
                        eprintln!("💡 {hint}");
                    }
                    ExitCode::from(err.exit_code())
                }
                None => ExitCode::FAILURE,
            }
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    dotenv::dotenv().ok();
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("Failed to load application configuration from {}", cli.config.display()))?;
    utils::logging::init_logging(cli.verbose, config.log_file.as_deref())?;

    match cli.command {
        Command::Backup(command) => run_backup_command(&config, command).await,
        Command::Restore(RestoreCommand::Run(args)) => {
            println!("🔄 Starting Restore Process...");
            let outcome = restore::run_restore_flow(&config, &args.into_request(), &mut TerminalPrompter)
                .await
                .context("Restore process failed")?;

            println!("✅ Restored from {}", outcome.artifact.name);
            if outcome.database_restored {
                match outcome.statements {
                    Some(n) => println!("  Database: {n} statements applied"),
                    None => println!("  Database: restored"),
                }
            }
            if outcome.files_restored > 0 {
                println!("  Files:    {} restored to {}", outcome.files_restored, config.files.restore_root.display());
            }
            for hook in outcome.hook_warnings() {
                println!("⚠️  Post-restore task failed: {} ({})", hook.command, hook.output);
            }
            println!("  Duration: {:.1}s", outcome.duration.as_secs_f64());
            Ok(())
        }
    }
}

async fn run_backup_command(config: &AppConfig, command: BackupCommand) -> Result<()> {
    match command {
        BackupCommand::Create { backup_type, filename, encrypt, upload_remote, notify, dump_mode } => {
            println!("🚀 Starting {} backup...", backup_type.tag());
            let request = BackupRequest { backup_type, filename, encrypt, upload_remote, notify, dump_mode };
            let report = backup::run_backup_flow(config, &request).await.context("Backup process failed")?;

            println!("✅ Backup completed: {}", report.artifact.name);
            println!("  Size:     {}", format_bytes(report.artifact.size));
            if let Some(key) = &report.remote_key {
                println!("  Remote:   {key}");
            }
            println!("  Duration: {:.1}s", report.duration.as_secs_f64());
        }
        BackupCommand::List { remote } => {
            backup::status::run_list(config, remote).await?;
        }
        BackupCommand::Cleanup { older_than, dry_run, remote, force } => {
            let request = CleanupRequest { older_than_days: older_than, dry_run, remote, force };
            let report = retention::run_cleanup(config, &request, &mut TerminalPrompter)
                .await
                .context("Cleanup failed")?;

            let verb = if report.dry_run { "Would delete" } else { "Deleted" };
            println!("🧹 {} {} backups, {} freed", verb, report.deleted_count, format_bytes(report.freed_bytes));
            for (name, error) in &report.errors {
                println!("❌ Failed to delete {name}: {error}");
            }
            if let Some(err) = report.failure() {
                return Err(err.into());
            }
        }
        BackupCommand::Status => backup::status::run_status(config).await?,
        BackupCommand::TestRemote => {
            println!("🔗 Testing remote storage...");
            let store = storage::open_store(config).await?;
            for step in storage::probe(store.as_ref()).await? {
                println!("✅ {:<10} {}", step.name, step.detail);
            }
            println!("✅ Remote storage is working");
        }
        BackupCommand::Decrypt { file, password, output } => {
            let out = backup::run_decrypt(config, &file, password.as_deref(), output.as_deref())?;
            println!("✅ Decrypted to {}", out.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_restore_selection_flags() {
        let cli = Cli::try_parse_from(["hommss-backup", "restore", "run", "--latest", "--force"]).unwrap();
        let Command::Restore(RestoreCommand::Run(args)) = cli.command else { panic!("restore expected") };
        let request = args.into_request();
        assert_eq!(request.selection, Selection::Latest);
        assert!(request.force);

        let cli = Cli::try_parse_from(["hommss-backup", "restore", "run"]).unwrap();
        let Command::Restore(RestoreCommand::Run(args)) = cli.command else { panic!("restore expected") };
        assert_eq!(args.into_request().selection, Selection::Interactive);

        assert!(Cli::try_parse_from(["hommss-backup", "restore", "run", "--latest", "--backup", "x"]).is_err());
    }

    #[test]
    fn test_backup_create_flags() {
        let cli = Cli::try_parse_from([
            "hommss-backup", "backup", "create", "--type", "db", "--encrypt", "--dump-mode", "in-process",
        ])
        .unwrap();
        let Command::Backup(BackupCommand::Create { backup_type, encrypt, dump_mode, .. }) = cli.command else {
            panic!("create expected")
        };
        assert_eq!(backup_type, BackupType::Database);
        assert!(encrypt);
        assert_eq!(dump_mode, Some(DumpMode::InProcess));
    }
}
