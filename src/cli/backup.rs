//! Backup CLI commands
//!
//! Implements CLI commands for backup management on top of the orchestrator.

use chrono::Utc;
use clap::Subcommand;
use tokio_util::sync::CancellationToken;

use crate::backup::{select_expired, BackupOrchestrator, CreateOptions, RestoreOptions};
use crate::config::Settings;
use crate::display::{format_backup_details, format_backup_list, format_size, format_stats};
use crate::error::BackupResult;
use crate::models::{BackupStatus, BackupType};
use crate::storage::RecordFilter;

/// Backup subcommands
#[derive(Subcommand)]
pub enum BackupCommands {
    /// Create a new backup
    Create {
        /// Free-form reason stored with the record
        #[arg(short, long)]
        reason: Option<String>,

        /// Branch the backup belongs to
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// List backups, newest first
    List {
        /// Show full ids, reasons and errors
        #[arg(short, long)]
        verbose: bool,

        /// Only show backups with this status
        #[arg(short, long)]
        status: Option<BackupStatus>,

        /// Only show backups of this type
        #[arg(short = 't', long = "type")]
        backup_type: Option<BackupType>,

        /// Maximum number of backups to show
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Verify a backup and restore it into the database
    Restore {
        /// Backup id, id prefix, or 'latest'
        backup: String,

        /// Restore into this database instead of the configured one
        target: Option<String>,

        /// Drop existing objects before recreating them
        #[arg(long)]
        drop_existing: bool,

        /// Only check integrity; nothing is restored
        #[arg(long)]
        verify_only: bool,
    },

    /// Check a backup's integrity without restoring it
    Verify {
        /// Backup id, id prefix, or 'latest'
        backup: String,
    },

    /// Show information about a specific backup
    Info {
        /// Backup id, id prefix, or 'latest'
        backup: String,
    },

    /// Show aggregate statistics
    Stats,

    /// Delete a backup and its artifact
    Delete {
        /// Backup id or id prefix
        backup: String,

        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },

    /// Delete completed backups older than the retention window
    Prune {
        /// Override the configured retention window
        #[arg(short, long)]
        days: Option<u32>,

        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

/// Handle a backup command
pub async fn handle_backup_command(
    orchestrator: &BackupOrchestrator,
    settings: &Settings,
    actor: &str,
    cancel: CancellationToken,
    cmd: BackupCommands,
) -> BackupResult<()> {
    match cmd {
        BackupCommands::Create { reason, branch } => {
            println!("Creating backup of '{}'...", settings.connection.database);

            let mut options = CreateOptions::new(BackupType::Manual)
                .with_reason(reason)
                .created_by(actor)
                .with_cancel(cancel);
            if let Some(branch) = branch {
                options = options.branch(branch);
            }

            let record = orchestrator.create_with(options).await?;
            println!("Backup created: {}", record.id);
            println!("Location: {}", record.path.display());
            println!("Size: {}", format_size(record.size));
            if let Some(checksum) = &record.checksum {
                println!("Checksum: {}", checksum);
            }
        }

        BackupCommands::List {
            verbose,
            status,
            backup_type,
            limit,
        } => {
            let mut filter = RecordFilter::all();
            if let Some(status) = status {
                filter = filter.with_status(status);
            }
            if let Some(backup_type) = backup_type {
                filter = filter.with_type(backup_type);
            }
            if let Some(limit) = limit {
                filter = filter.limit(limit);
            }

            let records = orchestrator.list(&filter).await?;
            println!("{}", format_backup_list(&records, verbose));
        }

        BackupCommands::Restore {
            backup,
            target,
            drop_existing,
            verify_only,
        } => {
            let id = orchestrator.resolve(&backup).await?;
            let record = orchestrator.get(id).await?;
            let target_database = target
                .clone()
                .unwrap_or_else(|| settings.connection.database.clone());

            if verify_only {
                println!("Verifying backup {}...", record.id);
            } else {
                println!(
                    "Restoring backup {} from {} into '{}'",
                    record.id,
                    record.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
                    target_database
                );
                println!("A safety backup of the current data is taken first.");
            }

            let outcome = orchestrator
                .restore_with(
                    id,
                    RestoreOptions {
                        target_database: target,
                        drop_existing,
                        verify_only,
                        requested_by: Some(actor.to_string()),
                        cancel,
                    },
                )
                .await?;

            if let Some(safety) = &outcome.safety_backup {
                println!("Pre-restore backup saved: {}", safety.id);
            }
            println!("{}", outcome.summary());
        }

        BackupCommands::Verify { backup } => {
            let id = orchestrator.resolve(&backup).await?;
            let outcome = orchestrator
                .restore_with(
                    id,
                    RestoreOptions {
                        requested_by: Some(actor.to_string()),
                        cancel,
                        ..RestoreOptions::verify_only()
                    },
                )
                .await?;
            println!("{}", outcome.summary());
        }

        BackupCommands::Info { backup } => {
            let id = orchestrator.resolve(&backup).await?;
            let record = orchestrator.get(id).await?;
            print!("{}", format_backup_details(&record));
        }

        BackupCommands::Stats => {
            let stats = orchestrator.stats().await?;
            print!("{}", format_stats(&stats));
        }

        BackupCommands::Delete { backup, force } => {
            let id = orchestrator.resolve(&backup).await?;
            let record = orchestrator.get(id).await?;

            if !force {
                print!("{}", format_backup_details(&record));
                println!();
                println!("WARNING: This permanently deletes the backup and its artifact!");
                println!("To proceed, run again with --force flag:");
                println!("  pos-backup backup delete {} --force", backup);
                return Ok(());
            }

            let deleted = orchestrator.delete_as(id, actor).await?;
            println!("Deleted backup {}.", deleted.id);
        }

        BackupCommands::Prune { days, force } => {
            let days = days.unwrap_or(settings.retention_days);
            let completed = orchestrator
                .list(&RecordFilter::all().with_status(BackupStatus::Completed))
                .await?;
            let expired = select_expired(&completed, days, Utc::now());

            if expired.is_empty() {
                println!("No backups to prune.");
                println!("Retention window: {} day(s)", days);
                println!("You have {} completed backup(s).", completed.len());
                return Ok(());
            }

            let reclaimed: u64 = expired.iter().map(|r| r.size).sum();
            println!("Prune Summary");
            println!("=============");
            println!("Retention window: {} day(s)", days);
            println!("Completed backups: {}", completed.len());
            println!(
                "To be deleted: {} ({} reclaimed)",
                expired.len(),
                format_size(reclaimed)
            );
            println!();

            if !force {
                println!("To delete old backups, run again with --force flag:");
                println!("  pos-backup backup prune --days {} --force", days);
                return Ok(());
            }

            let deleted = orchestrator.prune_older_than(days).await?;
            println!("Deleted {} backup(s).", deleted);
        }
    }

    Ok(())
}
