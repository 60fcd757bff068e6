//! Backup Engine - Main entry point
//!
//! Incremental multi-volume backups with resumable uploads.

use anyhow::Result;
use backup_engine::{
    codec::codec_from_config,
    config::Config,
    maintenance::{Maintenance, MaintenanceReport},
    naming::parse_time_spec,
    restore::{RestoreOptions, Restorer},
    storage::backend_from_url,
    transfer::format_duration,
    utils::{self, shutdown::ShutdownCoordinator},
    BackupEngine, BackupMode,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backend URL (overrides config)
    #[arg(short, long)]
    target: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up the source directory
    Backup {
        /// Start a new chain
        #[arg(long, conflicts_with = "incremental")]
        full: bool,
        /// Fail instead of falling back to a full backup
        #[arg(long)]
        incremental: bool,
        /// Source directory (overrides config)
        #[arg(long)]
        source: Option<PathBuf>,
    },
    /// Restore a point in time into a directory
    Restore {
        target_dir: PathBuf,
        /// Time to restore (e.g. 3D, 20240101T000000Z); latest when omitted
        #[arg(long)]
        time: Option<String>,
        /// Restore into a non-empty directory
        #[arg(long)]
        force: bool,
    },
    /// Show the collection status
    Status,
    /// Delete orphaned and incomplete files
    Cleanup {
        #[arg(long)]
        force: bool,
    },
    /// Delete chains that ended before a time
    RemoveOlderThan {
        time: String,
        #[arg(long)]
        force: bool,
    },
    /// Keep only the newest N chains
    RemoveAllButNFull {
        count: usize,
        #[arg(long)]
        force: bool,
    },
    /// Delete incrementals of all but the newest N chains
    RemoveAllIncOfButNFull {
        count: usize,
        #[arg(long)]
        force: bool,
    },
}

fn parse_time(spec: &str) -> Result<i64> {
    Ok(parse_time_spec(spec, chrono::Utc::now().timestamp())?)
}

fn print_report(report: &MaintenanceReport) {
    for name in report.remote.iter().chain(report.local.iter()) {
        println!("{}{}", if report.deleted { "deleted " } else { "would delete " }, name);
    }
    for set in &report.retained {
        println!("kept {} (needed by later sets)", set);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    if let Some(target) = args.target {
        config.archive.target_url = target;
    }
    if let Command::Backup {
        source: Some(source),
        ..
    } = &args.command
    {
        config.backup.source_dir = source.clone();
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, &config.log)?;

    tracing::info!(
        "backup-engine v{} (target: {})",
        env!("CARGO_PKG_VERSION"),
        config.archive.target_url
    );

    let config = Arc::new(config);
    let backend = backend_from_url(&config.archive.target_url, &config)?;
    let codec = codec_from_config(&config.volume)?;

    match args.command {
        Command::Backup {
            full, incremental, ..
        } => {
            let mode = if full {
                BackupMode::Full
            } else if incremental {
                BackupMode::Incremental
            } else {
                BackupMode::Auto
            };
            let cancel = ShutdownCoordinator::new().install();
            let engine = BackupEngine::new(config, backend, codec)?.with_cancel(cancel);
            let result = engine.execute(mode).await?;
            if result.skipped {
                println!("No changes; {} backup skipped", result.backup_type);
            } else {
                println!(
                    "{} backup: {} volumes, {} files ({} new, {} changed, {} deleted) in {}",
                    result.backup_type,
                    result.volumes,
                    result.source.source_files,
                    result.source.new_files,
                    result.source.changed_files,
                    result.source.deleted_files,
                    format_duration(result.duration_secs)
                );
            }
        }
        Command::Restore {
            target_dir,
            time,
            force,
        } => {
            let time = time.as_deref().map(parse_time).transpose()?;
            let stats = Restorer::new(config, backend, codec)?
                .restore(RestoreOptions {
                    time,
                    target: target_dir,
                    force,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Status => {
            let status = Maintenance::new(config, backend)?.status().await?;
            println!("{}", status);
        }
        Command::Cleanup { force } => {
            let report = Maintenance::new(config, backend)?.cleanup(force).await?;
            print_report(&report);
        }
        Command::RemoveOlderThan { time, force } => {
            let time = parse_time(&time)?;
            let report = Maintenance::new(config, backend)?
                .remove_older_than(time, force)
                .await?;
            print_report(&report);
        }
        Command::RemoveAllButNFull { count, force } => {
            let report = Maintenance::new(config, backend)?
                .remove_all_but_n_full(count, force)
                .await?;
            print_report(&report);
        }
        Command::RemoveAllIncOfButNFull { count, force } => {
            let report = Maintenance::new(config, backend)?
                .remove_all_inc_of_but_n_full(count, force)
                .await?;
            print_report(&report);
        }
    }

    Ok(())
}
