//! ReplicaDriver - feeds one replica's inbox into its epoch manager
//!
//! The epoch manager is single threaded: the driver task owns it and hands
//! it one message at a time. Everything the replica's collaborators produce
//! (peer messages, timer expiries, ledger callbacks) arrives through the
//! inbox.

use cadence_consensus::{Clock, ConsensusResult, EpochChange, EpochManager};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

use crate::network::Inbox;

/// Wall clock in milliseconds since the Unix epoch
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Event loop of one replica
pub struct ReplicaDriver {
    manager: EpochManager,
    inbox: Inbox,
}

impl ReplicaDriver {
    /// Create a driver for `manager` reading from `inbox`
    pub fn new(manager: EpochManager, inbox: Inbox) -> Self {
        Self { manager, inbox }
    }

    /// Start the first epoch and process messages until shutdown. Returns
    /// the manager so callers can inspect its final state. Fatal consensus
    /// errors stop the replica.
    pub async fn run(
        mut self,
        initial: EpochChange,
        mut shutdown: watch::Receiver<bool>,
    ) -> ConsensusResult<EpochManager> {
        let node = self.manager.self_address().short();
        tracing::info!(node = %node, epoch = initial.epoch(), "Replica starting");
        self.manager.start(initial)?;

        let mut processed: u64 = 0;
        loop {
            tokio::select! {
                message = self.inbox.recv() => {
                    let Some(message) = message else {
                        tracing::debug!(node = %node, "Inbox closed");
                        break;
                    };
                    processed += 1;
                    if let Err(e) = self.manager.handle(message) {
                        tracing::error!(node = %node, error = %e, "Replica halted");
                        return Err(e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(
            node = %node,
            processed,
            epoch = ?self.manager.current_epoch(),
            "Replica stopped"
        );
        Ok(self.manager)
    }
}
