use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pos_backup::backup::BackupOrchestrator;
use pos_backup::cli::{handle_backup_command, BackupCommands};
use pos_backup::config::{EnginePaths, Settings};
use pos_backup::crypto::{EncryptionKey, KEY_SALT_ENV};
use pos_backup::logging::init_logging;
use pos_backup::scheduler::BackupScheduler;

#[derive(Parser)]
#[command(
    name = "pos-backup",
    author = "POS Platform Team",
    version,
    about = "Backup and restore engine for the point-of-sale database",
    long_about = "pos-backup dumps the point-of-sale database with the configured \
                  dump tool, encrypts and checksums every artifact, keeps a record \
                  of each attempt, and restores verified backups on request."
)]
struct Cli {
    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Name recorded as the actor in records and the audit log
    #[arg(long, global = true, env = "POS_BACKUP_ACTOR")]
    actor: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backup management commands
    #[command(subcommand)]
    Backup(BackupCommands),

    /// Run scheduled backups until interrupted
    Schedule {
        /// Take a single scheduled backup and exit
        #[arg(long)]
        once: bool,
    },

    /// Show current configuration and paths
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    // Initialize paths and settings
    let paths = EnginePaths::new()?;
    let mut settings = Settings::load_or_create(&paths)?;
    // a salt supplied for recovery must not be shadowed by a fresh one
    let salt_from_env = std::env::var_os(KEY_SALT_ENV).is_some();
    if !salt_from_env && settings.ensure_key_params() {
        debug!("Generated key derivation parameters");
        settings.save(&paths)?;
    }
    settings.apply_env()?;

    if let Commands::Config = cli.command {
        print_config(&paths, &settings);
        return Ok(());
    }

    let params = settings.encryption.key_params.clone().unwrap_or_default();
    let key = EncryptionKey::from_env(&params)?;
    let orchestrator = Arc::new(BackupOrchestrator::open(&paths, &settings, key).await?);

    let shutdown = CancellationToken::new();
    spawn_interrupt_handler(shutdown.clone());

    let actor = cli
        .actor
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "cli".to_string());

    match cli.command {
        Commands::Backup(cmd) => {
            handle_backup_command(&orchestrator, &settings, &actor, shutdown, cmd).await?;
        }
        Commands::Schedule { once } => {
            let scheduler = BackupScheduler::new(
                Arc::clone(&orchestrator),
                settings.schedule_interval(),
                settings.retention_days,
            );

            if once {
                let report = scheduler.run_once(&shutdown).await;
                match (report.backup_id, report.error) {
                    (Some(id), None) => {
                        println!("Scheduled backup created: {} ({} pruned)", id, report.pruned)
                    }
                    (Some(id), Some(e)) => {
                        println!("Scheduled backup created: {}", id);
                        anyhow::bail!("Retention pass failed: {}", e);
                    }
                    (None, Some(e)) => anyhow::bail!("Scheduled backup failed: {}", e),
                    (None, None) => {}
                }
            } else {
                println!(
                    "Scheduling backups every {}s; press Ctrl-C to stop.",
                    scheduler.interval().as_secs()
                );
                scheduler.run(shutdown).await;
            }
        }
        Commands::Config => {}
    }

    Ok(())
}

fn spawn_interrupt_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, cancelling");
                shutdown.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });
}

fn print_config(paths: &EnginePaths, settings: &Settings) {
    println!("pos-backup Configuration");
    println!("========================");
    println!("Base directory:   {}", paths.base_dir().display());
    println!("Backup directory: {}", paths.backup_dir().display());
    println!("Scratch dir:      {}", paths.scratch_dir().display());
    println!("Metadata file:    {}", paths.metadata_file().display());
    println!("Audit log:        {}", paths.audit_log().display());
    println!();
    println!("Connection:");
    println!("  Host:     {}:{}", settings.connection.host, settings.connection.port);
    println!("  User:     {}", settings.connection.username);
    println!(
        "  Database: {}",
        if settings.connection.database.is_empty() {
            "(not set)"
        } else {
            settings.connection.database.as_str()
        }
    );
    println!(
        "  Password: {}",
        if settings.connection.password.is_some() {
            "(from environment)"
        } else {
            "(not set)"
        }
    );
    println!();
    println!("Tools:");
    println!("  Dump:    {}", settings.tools.dump_program);
    println!("  Restore: {}", settings.tools.restore_program);
    println!();
    println!("Settings:");
    println!("  Retention:         {} day(s)", settings.retention_days);
    println!("  Schedule interval: {}s", settings.schedule_interval_secs);
    println!("  Max run time:      {}s (0 = unlimited)", settings.max_run_secs);
    println!("  Max artifact size: {} bytes", settings.max_artifact_bytes);
    println!();
    println!("Key derivation:");
    match &settings.encryption.key_params {
        Some(params) => {
            println!("  Salt:        {}", params.salt);
            println!(
                "  Argon2id:    memory {} KiB, time {}, parallelism {}",
                params.memory_cost, params.time_cost, params.parallelism
            );
            println!(
                "  Keep these with the encryption secret; without them no artifact can be decrypted."
            );
            println!("  To recover elsewhere, set {} to this salt.", KEY_SALT_ENV);
        }
        None => println!("  (not generated)"),
    }
}
