//! Configuration types for cadence-node

use anyhow::{bail, Context, Result};
use cadence_consensus::BftConfig;
use cadence_crypto::EcdsaSigner;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::cli::Cli;

/// One validator of the devnet
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ValidatorConfig {
    /// Derive the key from this seed
    #[serde(default)]
    pub seed: Option<String>,
    /// Hex private key, takes precedence over `seed`
    #[serde(default)]
    pub key: Option<String>,
    /// Voting power
    #[serde(default = "default_power")]
    pub power: u64,
}

fn default_power() -> u64 {
    1
}

impl ValidatorConfig {
    /// Validator keyed by `seed` with unit power
    pub fn from_seed(seed: impl Into<String>) -> Self {
        Self {
            seed: Some(seed.into()),
            key: None,
            power: default_power(),
        }
    }

    /// Signing key for this validator
    pub fn signer(&self) -> Result<EcdsaSigner> {
        match (&self.key, &self.seed) {
            (Some(key), _) => EcdsaSigner::from_hex(key).context("invalid validator key"),
            (None, Some(seed)) => EcdsaSigner::from_seed(seed).context("invalid validator seed"),
            (None, None) => bail!("validator needs either `key` or `seed`"),
        }
    }
}

/// Synthetic command load
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MempoolConfig {
    /// Commands generated per second
    #[serde(default = "default_commands_per_sec")]
    pub commands_per_sec: u64,
    /// Pending commands kept before new ones are rejected
    #[serde(default = "default_mempool_capacity")]
    pub capacity: usize,
}

fn default_commands_per_sec() -> u64 {
    10
}

fn default_mempool_capacity() -> usize {
    1024
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            commands_per_sec: default_commands_per_sec(),
            capacity: default_mempool_capacity(),
        }
    }
}

/// Devnet configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DevnetConfig {
    /// Validator set of every epoch
    #[serde(default = "default_validators")]
    pub validators: Vec<ValidatorConfig>,
    /// Vertices at or beyond this view end their epoch
    #[serde(default)]
    pub epoch_view_limit: Option<u64>,
    /// Command generation
    #[serde(default)]
    pub mempool: MempoolConfig,
    /// One-way latency between replicas (ms)
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
    /// Run length; `None` runs until interrupted
    #[serde(default)]
    pub duration_secs: Option<u64>,
    /// Seconds between counter reports
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    /// Consensus tunables shared by every replica
    #[serde(default)]
    pub bft: BftConfig,
}

fn default_validators() -> Vec<ValidatorConfig> {
    seeded_validators(4)
}

fn default_latency_ms() -> u64 {
    5
}

fn default_metrics_interval_secs() -> u64 {
    10
}

fn seeded_validators(n: usize) -> Vec<ValidatorConfig> {
    (0..n)
        .map(|i| ValidatorConfig::from_seed(format!("devnet-{}", i)))
        .collect()
}

impl Default for DevnetConfig {
    fn default() -> Self {
        Self {
            validators: default_validators(),
            epoch_view_limit: None,
            mempool: MempoolConfig::default(),
            latency_ms: default_latency_ms(),
            duration_secs: None,
            metrics_interval_secs: default_metrics_interval_secs(),
            bft: BftConfig::default(),
        }
    }
}

impl DevnetConfig {
    /// Load a config file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!("Loading devnet config from {:?}", path);
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let config: DevnetConfig = serde_json::from_str(&content)
            .with_context(|| format!("cannot parse {}", path.display()))?;
        Ok(config)
    }

    /// Override file values with the flags given on the command line
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(n) = cli.validators {
            self.validators = seeded_validators(n);
        }
        if cli.duration_secs.is_some() {
            self.duration_secs = cli.duration_secs;
        }
        if cli.epoch_view_limit.is_some() {
            self.epoch_view_limit = cli.epoch_view_limit;
        }
        if let Some(timeout) = cli.pacemaker_timeout_ms {
            self.bft.pacemaker_timeout_ms = timeout;
        }
        if let Some(latency) = cli.latency_ms {
            self.latency_ms = latency;
        }
        if let Some(interval) = cli.metrics_interval_secs {
            self.metrics_interval_secs = interval;
        }
    }

    /// Reject configurations the devnet cannot run
    pub fn validate(&self) -> Result<()> {
        if self.validators.is_empty() {
            bail!("at least one validator required");
        }
        if self.validators.iter().any(|v| v.power == 0) {
            bail!("validator power must be positive");
        }
        if self.epoch_view_limit == Some(0) {
            bail!("epoch_view_limit must be positive");
        }
        if self.bft.pacemaker_timeout_ms == 0 {
            bail!("pacemaker_timeout_ms must be positive");
        }
        if self.metrics_interval_secs == 0 {
            bail!("metrics_interval_secs must be positive");
        }
        Ok(())
    }

    /// Run length, if bounded
    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs)
    }

    /// One-way network latency
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}
