//! Counter storage

use std::sync::atomic::{AtomicU64, Ordering};

/// Every counter a replica maintains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CounterType {
    /// Proposals this replica broadcast as leader
    BftProposalsMade,
    /// Local timeouts that advanced the view
    BftTimeouts,
    /// Vertices inserted whose parent is not from the previous view
    BftIndirectParent,
    /// Committed vertices that carried a command
    BftProcessed,
    /// Vertices committed (with or without a command)
    BftCommitted,
    /// Proposals rejected by safety rules
    BftRejectedProposals,
    /// Safety rule violations observed
    BftSafetyViolations,
    /// Events dropped due to bad signature or non-member author
    BftInvalidMessages,
    /// GetVertices requests sent
    BftSyncRequestsSent,
    /// Current number of vertices in the store (gauge)
    BftVertexStoreSize,
    /// Current number of events parked in sync queues (gauge)
    BftSyncQueueSize,
    /// Events held waiting for a future epoch (gauge)
    EpochQueuedEvents,
    /// Epoch changes applied
    EpochChanges,
    /// Ledger state version (gauge)
    LedgerStateVersion,
}

impl CounterType {
    /// All counter kinds, in declaration order
    pub const ALL: [CounterType; 14] = [
        CounterType::BftProposalsMade,
        CounterType::BftTimeouts,
        CounterType::BftIndirectParent,
        CounterType::BftProcessed,
        CounterType::BftCommitted,
        CounterType::BftRejectedProposals,
        CounterType::BftSafetyViolations,
        CounterType::BftInvalidMessages,
        CounterType::BftSyncRequestsSent,
        CounterType::BftVertexStoreSize,
        CounterType::BftSyncQueueSize,
        CounterType::EpochQueuedEvents,
        CounterType::EpochChanges,
        CounterType::LedgerStateVersion,
    ];

    /// Stable metric name
    pub fn name(&self) -> &'static str {
        match self {
            CounterType::BftProposalsMade => "bft.proposals_made",
            CounterType::BftTimeouts => "bft.timeouts",
            CounterType::BftIndirectParent => "bft.indirect_parent",
            CounterType::BftProcessed => "bft.processed",
            CounterType::BftCommitted => "bft.committed",
            CounterType::BftRejectedProposals => "bft.rejected_proposals",
            CounterType::BftSafetyViolations => "bft.safety_violations",
            CounterType::BftInvalidMessages => "bft.invalid_messages",
            CounterType::BftSyncRequestsSent => "bft.sync_requests_sent",
            CounterType::BftVertexStoreSize => "bft.vertex_store_size",
            CounterType::BftSyncQueueSize => "bft.sync_queue_size",
            CounterType::EpochQueuedEvents => "epoch.queued_events",
            CounterType::EpochChanges => "epoch.changes",
            CounterType::LedgerStateVersion => "ledger.state_version",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Thread-safe counter table
#[derive(Debug)]
pub struct SystemCounters {
    values: [AtomicU64; CounterType::ALL.len()],
}

impl SystemCounters {
    /// All counters start at zero
    pub fn new() -> Self {
        Self {
            values: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Increment by one
    pub fn increment(&self, counter: CounterType) {
        self.add(counter, 1);
    }

    /// Increment by `delta`
    pub fn add(&self, counter: CounterType, delta: u64) {
        self.values[counter.index()].fetch_add(delta, Ordering::Relaxed);
    }

    /// Overwrite a gauge-style counter
    pub fn set(&self, counter: CounterType, value: u64) {
        self.values[counter.index()].store(value, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self, counter: CounterType) -> u64 {
        self.values[counter.index()].load(Ordering::Relaxed)
    }
}

impl Default for SystemCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_increment_and_get() {
        let counters = SystemCounters::new();
        counters.increment(CounterType::BftTimeouts);
        counters.increment(CounterType::BftTimeouts);
        counters.add(CounterType::BftProcessed, 5);
        assert_eq!(counters.get(CounterType::BftTimeouts), 2);
        assert_eq!(counters.get(CounterType::BftProcessed), 5);
        assert_eq!(counters.get(CounterType::BftCommitted), 0);
    }

    #[test]
    fn test_set_overwrites() {
        let counters = SystemCounters::new();
        counters.set(CounterType::BftVertexStoreSize, 10);
        counters.set(CounterType::BftVertexStoreSize, 3);
        assert_eq!(counters.get(CounterType::BftVertexStoreSize), 3);
    }

    #[test]
    fn test_all_indices_are_distinct() {
        for (i, counter) in CounterType::ALL.iter().enumerate() {
            assert_eq!(counter.index(), i);
        }
    }

    #[test]
    fn test_concurrent_increments() {
        let counters = Arc::new(SystemCounters::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&counters);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        c.increment(CounterType::BftProposalsMade);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counters.get(CounterType::BftProposalsMade), 4000);
    }
}
