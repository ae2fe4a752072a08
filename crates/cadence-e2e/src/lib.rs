//! # cadence-e2e
//!
//! Deterministic end-to-end testing for the Cadence consensus core.
//!
//! Every replica runs a real [`cadence_consensus::EpochManager`]. Network
//! messages, timers and ledger callbacks all go through one virtual-time
//! queue, so a run is fully determined by its seed and message mutator.
//!
//! ## Usage
//!
//! ```ignore
//! let mut test = DeterministicTest::builder().num_nodes(4).seed(7).build()?;
//! test.start()?;
//! test.run_until(|t| t.total(CounterType::BftCommitted) > 10, 50_000)?;
//! test.assert_no_fork()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod harness;
mod scenarios;

pub use harness::{
    drop_every_kth_proposal, drop_random, isolate_until, ChannelId, CommittedEntry,
    ControlledMessage, ControlledNetwork, ControlledSender, CountingMempool, DeterministicTest,
    DeterministicTestBuilder, MessageMutator, MockLedger, TestNode, VirtualClock,
};

use cadence_consensus::ConsensusError;

/// Test result
pub type E2EResult<T> = Result<T, E2EError>;

/// E2E test errors
#[derive(Debug, thiserror::Error)]
pub enum E2EError {
    /// Setup failed
    #[error("setup failed: {0}")]
    Setup(String),

    /// A replica hit a fatal consensus error
    #[error("replica {node} failed: {source}")]
    Consensus {
        /// Replica index
        node: usize,
        /// Underlying error
        source: ConsensusError,
    },

    /// Stop condition not reached within the step budget
    #[error("condition not reached after {steps} steps ({now_ms} ms virtual)")]
    StepLimit {
        /// Steps taken
        steps: u64,
        /// Virtual time reached
        now_ms: u64,
    },

    /// Assertion failed
    #[error("assertion failed: {0}")]
    Assertion(String),
}
