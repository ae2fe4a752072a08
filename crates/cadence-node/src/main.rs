//! Cadence devnet node binary
//!
//! Runs every validator of a devnet in this process and reports commits,
//! timeouts and forks when stopped.

mod cli;
mod config;
mod consensus_driver;
mod devnet;
mod ledger;
mod mempool;
mod network;

use anyhow::Result;
use cli::Cli;
use config::DevnetConfig;
use devnet::Devnet;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    tracing::info!("Cadence devnet starting...");

    let mut config = match &cli.config {
        Some(path) => DevnetConfig::load(path)?,
        None => DevnetConfig::default(),
    };
    config.apply_cli(&cli);

    let duration = config.duration();
    let devnet = Devnet::build(config)?;

    // Stop on Ctrl+C or when the configured run length elapses
    let stop = async move {
        match duration {
            Some(duration) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = tokio::time::sleep(duration) => {}
                }
            }
            None => {
                tokio::signal::ctrl_c().await.ok();
            }
        }
        tracing::info!("Shutdown signal received");
    };

    let report = devnet.run(stop).await?;
    for replica in &report.replicas {
        tracing::info!(
            node = %replica.address.short(),
            epoch = ?replica.epoch,
            state_version = replica.state_version,
            committed = replica.committed,
            processed = replica.processed,
            timeouts = replica.timeouts,
            "Replica summary"
        );
    }
    tracing::info!(
        committed_commands = report.committed_commands,
        "Cadence devnet stopped"
    );

    Ok(())
}
