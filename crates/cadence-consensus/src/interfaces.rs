//! Contracts the consensus core consumes from its environment.
//!
//! Implementations run wherever they like (network tasks, timers, a ledger
//! thread) but anything they want to feed back into the core must be posted
//! onto the replica's single event queue as a [`ConsensusMessage`].
//!
//! [`ConsensusMessage`]: crate::messages::ConsensusMessage

use cadence_primitives::{Address, Epoch, H256};
use std::time::Duration;

use crate::error::ConsensusResult;
use crate::messages::{
    GetEpochRequest, GetEpochResponse, GetVerticesErrorResponse, GetVerticesRequest,
    GetVerticesResponse, LocalTimeout, NewView, Proposal, Vote,
};
use crate::safety_rules::SafetyState;
use crate::types::{Command, Vertex, VertexMetadata};

/// Outbound protocol messages. Delivery is at-most-once.
pub trait BftSender: Send + Sync {
    /// Send a proposal to every listed node (the sender included)
    fn broadcast_proposal(&self, proposal: Proposal, nodes: &[Address]);
    /// Send a new-view to the leader of its view
    fn send_new_view(&self, new_view: NewView, leader: Address);
    /// Send a vote to the leader of the next view
    fn send_vote(&self, vote: Vote, leader: Address);
}

/// Vertex sync RPC
pub trait SyncVerticesSender: Send + Sync {
    /// Ask `node` for vertices
    fn send_get_vertices_request(&self, node: Address, request: GetVerticesRequest);
    /// Answer a request
    fn send_get_vertices_response(&self, node: Address, response: GetVerticesResponse);
    /// Tell the requester the chain cannot be served
    fn send_get_vertices_error_response(&self, node: Address, response: GetVerticesErrorResponse);
}

/// Notifications emitted by the vertex store
pub trait VertexStoreEventSender: Send + Sync {
    /// A vertex that was being synced is now in the store. The receiver posts
    /// `ConsensusMessage::LocalSync(vertex.id())` back to the replica.
    fn send_synced_vertex(&self, vertex: &Vertex);
    /// A vertex was committed
    fn send_committed_vertex(&self, vertex: &Vertex, metadata: &VertexMetadata);
}

/// View timer. No cancellation: stale timeouts are ignored when they fire.
pub trait TimeoutSender: Send + Sync {
    /// Post `timeout` back to the replica after `after`
    fn schedule_timeout(&self, timeout: LocalTimeout, after: Duration);
}

/// The ledger / application state machine
pub trait SyncedStateComputer: Send + Sync {
    /// Whether `vertex` closes its epoch. Only asked for vertices whose parent
    /// has not already closed it.
    fn prepare(&self, vertex: &Vertex) -> bool;

    /// Apply a committed vertex. Must tolerate repeats.
    fn execute(&self, vertex: &Vertex, metadata: &VertexMetadata);

    /// Bring the ledger to `target`. Returns true if already there; otherwise
    /// completion is signalled later with `CommittedStateSync { opaque }`
    /// (when `opaque` is set) and, if `target` closes an epoch, `EpochChange`.
    fn sync_to(&self, target: &VertexMetadata, peers: &[Address], opaque: Option<H256>) -> bool;
}

/// Epoch discovery RPC
pub trait EpochSender: Send + Sync {
    /// Ask `node` for an epoch proof
    fn send_get_epoch_request(&self, node: Address, request: GetEpochRequest);
    /// Send an epoch proof to `node`
    fn send_get_epoch_response(&self, node: Address, response: GetEpochResponse);
}

/// Source of commands for proposals
pub trait Mempool: Send + Sync {
    /// Up to `count` commands that are not in `exclude`
    fn get_commands(&self, count: usize, exclude: &[Command]) -> Vec<Command>;
}

/// Wall clock used to timestamp votes
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed origin
    fn now_ms(&self) -> u64;
}

/// Durable storage for the safety state. `persist` must not return before
/// the state would survive a crash.
pub trait SafetyStateStore: Send + Sync {
    /// Last persisted state for `epoch`
    fn load(&self, epoch: Epoch) -> ConsensusResult<Option<SafetyState>>;
    /// Make `state` durable for `epoch`
    fn persist(&self, epoch: Epoch, state: &SafetyState) -> ConsensusResult<()>;
}
