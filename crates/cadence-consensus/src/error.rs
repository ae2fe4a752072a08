//! Consensus error types

use cadence_crypto::CryptoError;
use cadence_primitives::{Address, H256};
use thiserror::Error;

use crate::types::View;

/// Reasons SafetyRules refuses to sign a vote
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    /// Vertex view is not above the last voted view
    #[error("already voted at view {last_voted}, proposal is for view {view}")]
    AlreadyVoted {
        /// Proposed view
        view: View,
        /// Last view this replica voted in
        last_voted: View,
    },

    /// Vertex extends a QC below the locked view
    #[error("qc view {qc_view} is below locked view {locked}")]
    BelowLock {
        /// View certified by the vertex's QC
        qc_view: View,
        /// Current lock
        locked: View,
    },

    /// The vertex's QC is older than its parent's QC beyond tolerance
    #[error("qc timestamp {qc_timestamp} regresses from parent qc timestamp {parent_timestamp}")]
    TimestampRegression {
        /// Timestamp of the QC carried by the vertex
        qc_timestamp: u64,
        /// Timestamp of the QC carried by the parent
        parent_timestamp: u64,
    },
}

/// Consensus errors
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// Vertex parent is not present locally
    #[error("missing parent {parent} for vertex {vertex}")]
    MissingParent {
        /// Vertex being inserted
        vertex: H256,
        /// Parent that could not be found
        parent: H256,
    },

    /// Vote refused by safety rules
    #[error("safety violation: {0}")]
    SafetyViolation(#[from] SafetyViolation),

    /// Vertex is malformed or conflicts with local state
    #[error("invalid vertex: {0}")]
    InvalidVertex(String),

    /// Signature or certificate did not verify
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Author is not in the validator set
    #[error("not a validator: {0}")]
    NotValidator(Address),

    /// Message belongs to another epoch
    #[error("wrong epoch: expected {expected}, got {got}")]
    WrongEpoch {
        /// Local epoch
        expected: u64,
        /// Message epoch
        got: u64,
    },

    /// Broken internal invariant
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Safety state could not be made durable
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Signing failed
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl ConsensusError {
    /// Fatal errors must stop the event loop; everything else drops the event.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsensusError::IllegalState(_) | ConsensusError::Persistence(_)
        )
    }
}

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;
