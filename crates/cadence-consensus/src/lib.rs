//! # cadence-consensus
//!
//! Chained three-phase BFT consensus with a pacemaker, weighted rotating
//! leaders and epoch changes driven by the ledger.
//!
//! ## Components
//!
//! - [`VertexStore`]: speculative vertex tree, commits and the GetVertices sync protocol
//! - [`SafetyRules`]: voting and locking rules, signing of local messages
//! - [`Pacemaker`]: view changes driven by QCs, new-view quorums and timeouts
//! - [`WeightedRotatingLeaders`]: deterministic proposer schedule by voting power
//! - [`PendingVotes`]: vote aggregation into quorum certificates
//! - [`BftEventReducer`] and [`BftEventPreprocessor`]: the per-epoch event pipeline
//! - [`EpochManager`]: epoch lifecycle, message verification and routing
//!
//! ## Threading
//!
//! The core is a single-threaded state machine. A driver feeds
//! [`ConsensusMessage`]s into [`EpochManager::handle`] one at a time and
//! supplies the outbound seams in [`interfaces`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod epoch_manager;
pub mod error;
pub mod interfaces;
pub mod messages;
pub mod pacemaker;
pub mod pending_votes;
pub mod preprocessor;
pub mod processor;
pub mod proposal_generator;
pub mod proposer_election;
pub mod qc;
pub mod reducer;
pub mod safety_rules;
pub mod types;
pub mod validator;
pub mod verifier;
pub mod vertex_store;

#[cfg(test)]
mod test_utils;

pub use config::BftConfig;
pub use epoch_manager::{ConsensusHandles, EpochManager};
pub use error::{ConsensusError, ConsensusResult, SafetyViolation};
pub use interfaces::{
    BftSender, Clock, EpochSender, Mempool, SafetyStateStore, SyncVerticesSender,
    SyncedStateComputer, TimeoutSender, VertexStoreEventSender,
};
pub use messages::{
    CommittedStateSync, ConsensusEvent, ConsensusMessage, EpochChange, GetEpochRequest,
    GetEpochResponse, GetVerticesErrorResponse, GetVerticesRequest, GetVerticesResponse,
    LocalTimeout, NewView, Proposal, Vote,
};
pub use pacemaker::Pacemaker;
pub use pending_votes::PendingVotes;
pub use preprocessor::BftEventPreprocessor;
pub use processor::{BftEventProcessor, EmptyBftEventProcessor};
pub use proposal_generator::ProposalGenerator;
pub use proposer_election::WeightedRotatingLeaders;
pub use qc::{QuorumCertificate, TimestampedSignature, TimestampedSignatures, VoteData};
pub use reducer::BftEventReducer;
pub use safety_rules::{InMemorySafetyStateStore, SafetyRules, SafetyState};
pub use types::{Command, Vertex, VertexMetadata, View};
pub use validator::{ValidationState, Validator, ValidatorSet};
pub use verifier::MessageVerifier;
pub use vertex_store::{StoreHandles, VertexStore};
