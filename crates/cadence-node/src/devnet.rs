//! Devnet - N replicas, one tokio task each, wired through the in-process
//! network

use anyhow::{bail, Context, Result};
use cadence_consensus::{
    ConsensusHandles, EpochChange, EpochManager, InMemorySafetyStateStore, Validator,
    ValidatorSet, VertexMetadata, View,
};
use cadence_crypto::{EcdsaVerifier, HashSigner};
use cadence_metrics::{CounterType, CountersSnapshot, SystemCounters};
use cadence_primitives::{Address, Epoch, StateVersion, H256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::DevnetConfig;
use crate::consensus_driver::{ReplicaDriver, SystemClock};
use crate::ledger::{CommitLog, InMemoryLedger};
use crate::mempool::{generate_commands, SharedMempool};
use crate::network::{ReplicaSender, Router};

/// Observable parts of one replica
pub struct Replica {
    /// Signing address
    pub address: Address,
    /// Its counters
    pub counters: Arc<SystemCounters>,
    /// Its ledger
    pub ledger: Arc<InMemoryLedger>,
}

/// Final state of one replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaReport {
    /// Signing address
    pub address: Address,
    /// Epoch running when the devnet stopped
    pub epoch: Option<Epoch>,
    /// Ledger state version
    pub state_version: StateVersion,
    /// Vertices committed
    pub committed: u64,
    /// Committed vertices carrying a command
    pub processed: u64,
    /// Local timeouts
    pub timeouts: u64,
}

/// Outcome of a devnet run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevnetReport {
    /// One entry per replica, by address
    pub replicas: Vec<ReplicaReport>,
    /// Distinct commands committed across the network
    pub committed_commands: usize,
    /// Conflicting commits observed
    pub forks: u64,
}

/// A configured, not yet running devnet
pub struct Devnet {
    config: DevnetConfig,
    validator_set: Arc<ValidatorSet>,
    replicas: Vec<Replica>,
    drivers: Vec<ReplicaDriver>,
    mempool: Arc<SharedMempool>,
    commits: Arc<CommitLog>,
}

impl Devnet {
    /// Build every replica of `config`
    pub fn build(config: DevnetConfig) -> Result<Self> {
        config.validate()?;

        let mut signers = config
            .validators
            .iter()
            .map(|v| v.signer().map(|signer| (Arc::new(signer), v.power)))
            .collect::<Result<Vec<_>>>()?;
        signers.sort_by_key(|(signer, _)| signer.address());
        if signers.windows(2).any(|w| w[0].0.address() == w[1].0.address()) {
            bail!("duplicate validator key");
        }

        let validator_set = Arc::new(
            ValidatorSet::new(
                signers
                    .iter()
                    .map(|(signer, power)| Validator::new(signer.address(), *power)),
            )
            .context("invalid validator set")?,
        );
        let addresses: Vec<Address> = signers.iter().map(|(s, _)| s.address()).collect();
        let (router, inboxes) = Router::new(&addresses, config.latency());
        let mempool = Arc::new(SharedMempool::new(config.mempool.capacity));
        let commits = Arc::new(CommitLog::new());

        let mut replicas = Vec::with_capacity(signers.len());
        let mut drivers = Vec::with_capacity(signers.len());
        for ((signer, _), inbox) in signers.into_iter().zip(inboxes) {
            let address = signer.address();
            let sender = Arc::new(ReplicaSender::new(address, router.clone()));
            let ledger = Arc::new(InMemoryLedger::new(
                address,
                router.clone(),
                validator_set.clone(),
                config.epoch_view_limit,
                mempool.clone(),
                commits.clone(),
            ));
            let counters = Arc::new(SystemCounters::new());
            let handles = ConsensusHandles {
                bft_sender: sender.clone(),
                sync_sender: sender.clone(),
                event_sender: sender.clone(),
                timeout_sender: sender.clone(),
                epoch_sender: sender,
                ledger: ledger.clone(),
                mempool: mempool.clone(),
                clock: Arc::new(SystemClock),
                safety_store: Arc::new(InMemorySafetyStateStore::new()),
                signer,
                verifier: Arc::new(EcdsaVerifier),
                counters: counters.clone(),
            };
            drivers.push(ReplicaDriver::new(
                EpochManager::new(config.bft.clone(), handles),
                inbox,
            ));
            replicas.push(Replica {
                address,
                counters,
                ledger,
            });
        }

        tracing::info!(
            validators = replicas.len(),
            total_power = %validator_set.total_power(),
            latency_ms = config.latency_ms,
            epoch_view_limit = ?config.epoch_view_limit,
            "Devnet built"
        );

        Ok(Self {
            config,
            validator_set,
            replicas,
            drivers,
            mempool,
            commits,
        })
    }

    /// Replicas, by address
    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    /// Run until `stop` completes, then shut every replica down. Fails if
    /// a replica halted or two replicas committed conflicting commands.
    pub async fn run(mut self, stop: impl Future<Output = ()>) -> Result<DevnetReport> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let genesis = EpochChange {
            ancestor: genesis_ancestor(),
            validator_set: self.validator_set.clone(),
        };

        let generator = tokio::spawn(generate_commands(
            self.mempool.clone(),
            self.config.mempool.commands_per_sec,
            shutdown_rx.clone(),
        ));
        let tasks: Vec<_> = std::mem::take(&mut self.drivers)
            .into_iter()
            .map(|driver| tokio::spawn(driver.run(genesis.clone(), shutdown_rx.clone())))
            .collect();

        let interval = Duration::from_secs(self.config.metrics_interval_secs);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => self.log_counters(),
            }
        }

        tracing::info!("Devnet stopping");
        shutdown_tx.send(true).ok();
        generator.await.context("command generator panicked")?;

        let mut epochs = Vec::with_capacity(tasks.len());
        for (task, replica) in tasks.into_iter().zip(&self.replicas) {
            let manager = task
                .await
                .context("replica task panicked")?
                .with_context(|| format!("replica {} halted", replica.address.short()))?;
            epochs.push(manager.current_epoch());
        }

        let report = self.report(epochs);
        self.log_counters();
        if report.forks > 0 {
            bail!("{} conflicting commits detected", report.forks);
        }
        Ok(report)
    }

    fn log_counters(&self) {
        for replica in &self.replicas {
            CountersSnapshot::capture(&replica.counters).log(&replica.address.short());
        }
        tracing::info!(
            pending_commands = self.mempool.len(),
            committed_commands = self.commits.len(),
            "Devnet progress"
        );
    }

    fn report(&self, epochs: Vec<Option<Epoch>>) -> DevnetReport {
        let replicas = self
            .replicas
            .iter()
            .zip(epochs)
            .map(|(replica, epoch)| ReplicaReport {
                address: replica.address,
                epoch,
                state_version: replica.ledger.version(),
                committed: replica.counters.get(CounterType::BftCommitted),
                processed: replica.counters.get(CounterType::BftProcessed),
                timeouts: replica.counters.get(CounterType::BftTimeouts),
            })
            .collect();
        DevnetReport {
            replicas,
            committed_commands: self.commits.len(),
            forks: self.commits.forks(),
        }
    }
}

/// Ancestor of the first epoch
fn genesis_ancestor() -> VertexMetadata {
    VertexMetadata {
        epoch: 0,
        view: View::GENESIS,
        id: H256::ZERO,
        state_version: 0,
        is_end_of_epoch: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidatorConfig;

    fn quick_config() -> DevnetConfig {
        let mut config = DevnetConfig {
            latency_ms: 5,
            metrics_interval_secs: 1,
            ..Default::default()
        };
        config.bft.pacemaker_timeout_ms = 200;
        config.mempool.commands_per_sec = 50;
        config
    }

    #[test]
    fn test_build_sorts_replicas() {
        let devnet = Devnet::build(quick_config()).unwrap();
        let addresses: Vec<Address> = devnet.replicas().iter().map(|r| r.address).collect();
        assert_eq!(addresses.len(), 4);
        assert!(addresses.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_build_rejects_duplicate_keys() {
        let mut config = quick_config();
        config.validators = vec![
            ValidatorConfig::from_seed("same"),
            ValidatorConfig::from_seed("same"),
        ];
        assert!(Devnet::build(config).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_devnet_commits_without_forks() {
        let devnet = Devnet::build(quick_config()).unwrap();
        let report = devnet
            .run(tokio::time::sleep(Duration::from_secs(2)))
            .await
            .unwrap();

        assert_eq!(report.forks, 0);
        assert!(report.committed_commands > 0);
        for replica in &report.replicas {
            assert_eq!(replica.epoch, Some(1));
            assert!(replica.committed > 0, "{:?}", replica);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_devnet_moves_through_epochs() {
        let config = DevnetConfig {
            epoch_view_limit: Some(8),
            ..quick_config()
        };
        let devnet = Devnet::build(config).unwrap();
        let report = devnet
            .run(tokio::time::sleep(Duration::from_secs(2)))
            .await
            .unwrap();

        assert_eq!(report.forks, 0);
        assert!(report
            .replicas
            .iter()
            .all(|r| r.epoch.is_some_and(|e| e >= 2)));
    }
}
