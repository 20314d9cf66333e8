//! spread-vault
//!
//! Serves the aggregated spread series over HTTP while regenerating it from
//! the rotating shards and backing everything up. The one-shot subcommands
//! run a single pass of each job for cron use and debugging.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use spread_vault::backup::BackupTrigger;
use spread_vault::scheduler::Service;
use spread_vault::{server, Config, RunOutcome};

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "spread-vault")]
#[command(about = "Aggregate spread shards, serve the series and keep it backed up", long_about = None)]
struct Args {
    /// Path to the configuration YAML file
    #[arg(short, long, value_name = "FILE", env = "SPREAD_VAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Shard directory, overrides the configuration
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Port to listen on when serving
    #[arg(short, long, env = "PORT", default_value = "8000")]
    port: u16,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recover, then serve HTTP and run the background loops (default)
    Serve,
    /// Regenerate the artifacts once
    Aggregate,
    /// Run one manual backup
    Backup,
    /// Restore from the newest usable backup, even if local data looks healthy
    Restore,
    /// Print local data freshness and provider availability
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = args.data_dir {
        config.storage.data_dir = dir;
    }
    info!("Data directory: {:?}", config.storage.data_dir);

    let service = Service::build(config).await?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(service, args.port).await,
        Command::Aggregate => match service.aggregate().await? {
            RunOutcome::Completed(report) => {
                info!(
                    "Aggregated {} points, {} files changed",
                    report.metadata.total_points,
                    report.changed_files.len()
                );
                Ok(())
            }
            RunOutcome::Coalesced => Ok(()),
        },
        Command::Backup => match service.backup(BackupTrigger::Manual).await? {
            RunOutcome::Completed(report) if report.success => {
                info!(
                    "Backup complete: {}/{} files, {} bytes uploaded",
                    report.manifest.files_succeeded, report.manifest.files_attempted, report.bytes_uploaded
                );
                Ok(())
            }
            RunOutcome::Completed(report) => bail!(
                "Backup finished with {} failed files (manifest {:?})",
                report.manifest.files_failed,
                report.manifest_key
            ),
            RunOutcome::Coalesced => Ok(()),
        },
        Command::Restore => {
            if let RunOutcome::Completed(report) = service.recovery.run(true).await {
                println!("{}", serde_json::to_string_pretty(&report)?);
                if let Some(reason) = report.degraded_reason {
                    bail!("Restore incomplete: {}", reason);
                }
                if report.files_restored > 0 || report.shards_restored > 0 {
                    if let Err(e) = service.aggregate().await {
                        warn!("Regeneration after restore failed: {}", e);
                    }
                }
            }
            Ok(())
        }
        Command::Status => {
            let freshness = service.recovery.check_freshness().await;
            let status = serde_json::json!({
                "freshness": freshness,
                "providers": service.registry.statuses(),
                "backup_enabled": service.orchestrator.is_enabled(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

async fn run_server(service: std::sync::Arc<Service>, port: u16) -> Result<()> {
    service.startup().await;
    let handles = service.spawn_background().await;

    let shutdown = service.shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        shutdown.cancel();
    });

    let result = server::serve(service.clone(), port, service.shutdown.clone()).await;
    service.shutdown.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }
    service.drain().await;
    info!("Stopped");
    result
}
