//! sitevault command line driver.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use sitevault::backup::BackupOptions;
use sitevault::catalog::{BackupType, Frequency, ScheduleDefinition};
use sitevault::config::AppConfig;
use sitevault::engine::{Engine, STALE_STAGING_AGE};
use sitevault::restore::RestoreOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sitevault", version, about = "Back up, restore and migrate a site")]
struct Cli {
    /// Path to config.json
    #[arg(long, short, global = true, env = "SITEVAULT_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Log filter, e.g. `info` or `sitevault=debug`. RUST_LOG wins when set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a backup and deliver it to the given destinations
    Backup {
        #[arg(long = "type", default_value = "full")]
        backup_type: BackupType,
        /// Destination names from the storage section
        #[arg(long = "destination", short = 'd', default_value = "local")]
        destinations: Vec<String>,
        #[arg(long)]
        exclude_table: Vec<String>,
        #[arg(long)]
        exclude_file: Vec<String>,
        #[arg(long)]
        compression_level: Option<u32>,
        /// Only files changed since the latest completed backup of this type
        #[arg(long)]
        incremental: bool,
        /// Explicit parent for an incremental backup
        #[arg(long)]
        parent: Option<u64>,
    },
    /// Restore a backup onto the configured site
    Restore {
        backup_id: u64,
        #[arg(long)]
        skip_database: bool,
        #[arg(long)]
        skip_files: bool,
        #[arg(long)]
        keep_urls: bool,
        /// Take a full local backup first
        #[arg(long)]
        restore_point: bool,
        #[arg(long)]
        table_prefix: Option<String>,
    },
    /// Delete a backup from every destination and the catalog
    Delete { backup_id: u64 },
    /// List backups, newest first
    List,
    /// Run every schedule that is due
    RunSchedules,
    /// Replace a string across the database, serialized values included
    SearchReplace {
        search: String,
        replace: String,
        #[arg(long = "table")]
        tables: Vec<String>,
    },
    /// Show progress of a running job (backup_<id> or restore_<uuid>)
    Progress { job_id: String },
    /// Check that a destination is reachable and writable
    TestStorage { destination: String },
    /// Manage recurring backups
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Drop job log entries older than the given number of days
    PruneLogs {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Delete local copies of completed backups older than the given number of days
    PruneLocal {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Remove staging leftovers of interrupted jobs
    Sweep {
        /// Minimum age in hours
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}

#[derive(Debug, Subcommand)]
enum ScheduleAction {
    Add {
        name: String,
        #[arg(long = "type", default_value = "full")]
        backup_type: BackupType,
        #[arg(long, default_value = "daily")]
        frequency: String,
        #[arg(long = "destination", short = 'd', default_value = "local")]
        destinations: Vec<String>,
        #[arg(long, default_value_t = 5)]
        retention: usize,
        #[arg(long)]
        incremental: bool,
        /// JSON object merged into the backup options of each run
        #[arg(long)]
        settings: Option<String>,
    },
    List,
    Remove { id: u64 },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    match run_app(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the command succeeded.
async fn run_app(cli: Cli) -> Result<bool> {
    let config = AppConfig::load_from_json(&cli.config).with_context(|| {
        format!("Failed to load application configuration from {}", cli.config.display())
    })?;
    let retention_days = config.log_retention_days;
    let engine = Engine::from_config(config)
        .await
        .context("Failed to initialise the engine")?;

    match cli.command {
        Command::Backup {
            backup_type,
            destinations,
            exclude_table,
            exclude_file,
            compression_level,
            incremental,
            parent,
        } => {
            println!("🚀 Starting {} backup...", backup_type);
            let outcome = engine
                .create_backup(BackupOptions {
                    backup_type,
                    exclude_tables: exclude_table,
                    exclude_files: exclude_file,
                    compression_level,
                    chunk_size: None,
                    destinations,
                    incremental: incremental || parent.is_some(),
                    incremental_parent: parent,
                })
                .await;
            print_json(&outcome)?;
            Ok(outcome.success)
        }
        Command::Restore {
            backup_id,
            skip_database,
            skip_files,
            keep_urls,
            restore_point,
            table_prefix,
        } => {
            println!("🔄 Restoring backup {}...", backup_id);
            let outcome = engine
                .restore_backup(
                    backup_id,
                    RestoreOptions {
                        restore_database: !skip_database,
                        restore_files: !skip_files,
                        update_urls: !keep_urls,
                        create_restore_point: restore_point,
                        target_table_prefix: table_prefix,
                    },
                )
                .await;
            print_json(&outcome)?;
            Ok(outcome.success)
        }
        Command::Delete { backup_id } => {
            let deleted = engine.delete_backup(backup_id).await?;
            if deleted {
                println!("✓ Backup {} deleted", backup_id);
            } else {
                println!("Backup {} not found", backup_id);
            }
            Ok(deleted)
        }
        Command::List => {
            print_json(&engine.list_backups())?;
            Ok(true)
        }
        Command::RunSchedules => {
            let runs = engine.run_due_schedules().await;
            print_json(&runs)?;
            Ok(runs.iter().all(|r| r.success))
        }
        Command::SearchReplace {
            search,
            replace,
            tables,
        } => {
            let tables = (!tables.is_empty()).then_some(tables);
            let report = engine.search_replace(&search, &replace, tables).await;
            print_json(&report)?;
            Ok(report.errors.is_empty())
        }
        Command::Progress { job_id } => match engine.progress(&job_id) {
            Some(record) => {
                print_json(&record)?;
                Ok(true)
            }
            None => {
                println!("No progress recorded for {}", job_id);
                Ok(false)
            }
        },
        Command::TestStorage { destination } => {
            let ok = engine.test_destination(&destination).await?;
            if ok {
                println!("✓ {} is reachable", destination);
            } else {
                println!("✗ {} failed the connection test", destination);
            }
            Ok(ok)
        }
        Command::Schedule { action } => run_schedule_action(&engine, action),
        Command::PruneLogs { days } => {
            let removed = engine.prune_logs(days.unwrap_or(retention_days))?;
            println!("Removed {} log entries", removed);
            Ok(true)
        }
        Command::PruneLocal { days } => {
            let Some(days) = days.or(engine.context().config.local_retention_days) else {
                println!("No local retention configured; pass --days");
                return Ok(false);
            };
            let removed = engine.prune_local_copies(days).await?;
            println!("Removed {} local backup copies", removed);
            Ok(true)
        }
        Command::Sweep { older_than_hours } => {
            let max_age = older_than_hours
                .map(|h| Duration::from_secs(h * 3600))
                .unwrap_or(STALE_STAGING_AGE);
            let removed = engine.sweep_stale_staging(max_age).await?;
            println!("Removed {} stale staging entries", removed);
            Ok(true)
        }
    }
}

fn run_schedule_action(engine: &Engine, action: ScheduleAction) -> Result<bool> {
    let catalog = engine.catalog();
    match action {
        ScheduleAction::Add {
            name,
            backup_type,
            frequency,
            destinations,
            retention,
            incremental,
            settings,
        } => {
            let mut schedule = ScheduleDefinition::new(name, backup_type, Frequency::parse(&frequency));
            schedule.destinations = destinations;
            schedule.retention_count = retention;
            schedule.incremental = incremental;
            schedule.next_run = Utc::now();
            if let Some(raw) = settings {
                schedule.settings =
                    serde_json::from_str(&raw).context("--settings must be a JSON object")?;
            }
            let stored = catalog.add_schedule(schedule)?;
            print_json(&stored)?;
            Ok(true)
        }
        ScheduleAction::List => {
            print_json(&catalog.list_schedules())?;
            Ok(true)
        }
        ScheduleAction::Remove { id } => {
            let removed = catalog.remove_schedule(id)?;
            match removed {
                Some(schedule) => println!("✓ Schedule '{}' removed", schedule.name),
                None => println!("Schedule {} not found", id),
            }
            Ok(true)
        }
    }
}
