//! Devnet ledger: records committed commands and drives epoch changes

use cadence_consensus::{
    Command, CommittedStateSync, ConsensusMessage, EpochChange, SyncedStateComputer,
    ValidatorSet, Vertex, VertexMetadata,
};
use cadence_primitives::{Address, Epoch, StateVersion, H256};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::mempool::SharedMempool;
use crate::network::Router;

/// Commands committed by every replica, keyed by the state they produced.
/// Two replicas committing different commands for the same key is a fork.
#[derive(Default)]
pub struct CommitLog {
    entries: Mutex<HashMap<(Epoch, StateVersion), (Address, Command)>>,
    forks: AtomicU64,
}

impl CommitLog {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a commit by `node`. Returns false if it conflicts with another
    /// replica's commit.
    pub fn record(&self, node: Address, key: (Epoch, StateVersion), command: &Command) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some((other, existing)) if existing != command => {
                self.forks.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    node = %node.short(),
                    other = %other.short(),
                    epoch = key.0,
                    state_version = key.1,
                    "Conflicting commit"
                );
                false
            }
            Some(_) => true,
            None => {
                entries.insert(key, (node, command.clone()));
                true
            }
        }
    }

    /// Conflicting commits observed
    pub fn forks(&self) -> u64 {
        self.forks.load(Ordering::Relaxed)
    }

    /// Distinct commands committed
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has been committed
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

struct LedgerState {
    version: StateVersion,
    executed: u64,
    /// Highest epoch announced to consensus
    started_epoch: Epoch,
}

/// Ledger of one replica
pub struct InMemoryLedger {
    address: Address,
    router: Arc<Router>,
    validator_set: Arc<ValidatorSet>,
    epoch_view_limit: Option<u64>,
    mempool: Arc<SharedMempool>,
    commits: Arc<CommitLog>,
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    /// Ledger posting its callbacks to `address`'s inbox. Vertices at or
    /// beyond `epoch_view_limit` end their epoch, and every epoch keeps
    /// `validator_set`.
    pub fn new(
        address: Address,
        router: Arc<Router>,
        validator_set: Arc<ValidatorSet>,
        epoch_view_limit: Option<u64>,
        mempool: Arc<SharedMempool>,
        commits: Arc<CommitLog>,
    ) -> Self {
        Self {
            address,
            router,
            validator_set,
            epoch_view_limit,
            mempool,
            commits,
            state: Mutex::new(LedgerState {
                version: 0,
                executed: 0,
                started_epoch: 1,
            }),
        }
    }

    /// State version reached by execution or sync
    pub fn version(&self) -> StateVersion {
        self.state.lock().version
    }

    /// Vertices executed
    pub fn executed(&self) -> u64 {
        self.state.lock().executed
    }

    /// Highest epoch this ledger has started
    pub fn epoch(&self) -> Epoch {
        self.state.lock().started_epoch
    }

    fn start_next_epoch(&self, state: &mut LedgerState, ancestor: &VertexMetadata) {
        let next = ancestor.epoch + 1;
        if next <= state.started_epoch {
            return;
        }
        state.started_epoch = next;
        tracing::info!(
            node = %self.address.short(),
            epoch = next,
            state_version = ancestor.state_version,
            "Ledger reached end of epoch"
        );
        self.router.send_after(
            self.address,
            ConsensusMessage::EpochChange(EpochChange {
                ancestor: *ancestor,
                validator_set: self.validator_set.clone(),
            }),
            std::time::Duration::ZERO,
        );
    }
}

impl SyncedStateComputer for InMemoryLedger {
    fn prepare(&self, vertex: &Vertex) -> bool {
        self.epoch_view_limit
            .is_some_and(|limit| vertex.view().number() >= limit)
    }

    fn execute(&self, vertex: &Vertex, metadata: &VertexMetadata) {
        let mut state = self.state.lock();
        if metadata.state_version > state.version {
            state.version = metadata.state_version;
        }
        state.executed += 1;
        if let Some(command) = vertex.command() {
            self.commits.record(
                self.address,
                (metadata.epoch, metadata.state_version),
                command,
            );
            self.mempool.committed(command);
        }
        if metadata.is_end_of_epoch {
            self.start_next_epoch(&mut state, metadata);
        }
    }

    fn sync_to(&self, target: &VertexMetadata, peers: &[Address], opaque: Option<H256>) -> bool {
        let mut state = self.state.lock();
        if target.is_end_of_epoch {
            self.start_next_epoch(&mut state, target);
        }
        if state.version >= target.state_version {
            return true;
        }
        tracing::info!(
            node = %self.address.short(),
            from = state.version,
            to = target.state_version,
            peers = peers.len(),
            "Ledger syncing"
        );
        state.version = target.state_version;
        if let Some(opaque) = opaque {
            self.router.send_after(
                self.address,
                ConsensusMessage::CommittedStateSync(CommittedStateSync {
                    state_version: target.state_version,
                    opaque,
                }),
                self.router.latency(),
            );
        }
        false
    }
}
