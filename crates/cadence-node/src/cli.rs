//! CLI argument parsing for cadence-node

use clap::Parser;
use std::path::PathBuf;

/// In-process Cadence BFT devnet
#[derive(Parser, Debug, Clone)]
#[command(name = "cadence-node")]
#[command(about = "Runs a devnet of Cadence BFT replicas in one process")]
#[command(version)]
pub struct Cli {
    /// Devnet config file (JSON). Built-in defaults are used when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Run this many equal-power validators instead of the configured set
    #[arg(long)]
    pub validators: Option<usize>,

    /// Stop after this many seconds (runs until Ctrl+C otherwise)
    #[arg(long)]
    pub duration_secs: Option<u64>,

    /// End each epoch at this view
    #[arg(long)]
    pub epoch_view_limit: Option<u64>,

    /// Base pacemaker timeout in milliseconds
    #[arg(long)]
    pub pacemaker_timeout_ms: Option<u64>,

    /// One-way network latency between replicas in milliseconds
    #[arg(long)]
    pub latency_ms: Option<u64>,

    /// Seconds between counter reports
    #[arg(long)]
    pub metrics_interval_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["cadence-node"]);
        assert!(cli.config.is_none());
        assert!(cli.validators.is_none());
        assert!(cli.duration_secs.is_none());
        assert!(cli.epoch_view_limit.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_cli_custom_values() {
        let cli = Cli::parse_from([
            "cadence-node",
            "--config", "/etc/cadence/devnet.json",
            "--validators", "7",
            "--duration-secs", "30",
            "--epoch-view-limit", "100",
            "--pacemaker-timeout-ms", "500",
            "--latency-ms", "20",
            "--metrics-interval-secs", "2",
            "--log-level", "debug",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/cadence/devnet.json")));
        assert_eq!(cli.validators, Some(7));
        assert_eq!(cli.duration_secs, Some(30));
        assert_eq!(cli.epoch_view_limit, Some(100));
        assert_eq!(cli.pacemaker_timeout_ms, Some(500));
        assert_eq!(cli.latency_ms, Some(20));
        assert_eq!(cli.metrics_interval_secs, Some(2));
        assert_eq!(cli.log_level, "debug");
    }
}
