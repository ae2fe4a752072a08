//! Protocol messages and the event sum type the epoch manager dispatches on

use cadence_crypto::{keccak256, Signature};
use cadence_primitives::{Address, Epoch, StateVersion, H256};
use std::sync::Arc;

use crate::qc::{QuorumCertificate, VoteData};
use crate::types::{Vertex, VertexMetadata, View};
use crate::validator::ValidatorSet;

/// A replica's signed vote for a proposed vertex
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    /// Voter
    pub author: Address,
    /// What is being voted for
    pub vote_data: VoteData,
    /// Voter's clock (ms)
    pub timestamp: u64,
    /// Signature over [`Vote::signing_hash`]
    pub signature: Signature,
}

impl Vote {
    /// Hash signed by voters; also what QC verification recomputes
    pub fn signing_hash(vote_data: &VoteData, timestamp: u64) -> H256 {
        let mut msg = Vec::with_capacity(56);
        msg.extend_from_slice(b"cadence.vote");
        msg.extend_from_slice(vote_data.hash().as_bytes());
        msg.extend_from_slice(&timestamp.to_le_bytes());
        keccak256(&msg)
    }

    /// View of the voted vertex
    pub fn view(&self) -> View {
        self.vote_data.proposed().view
    }

    /// Epoch of the voted vertex
    pub fn epoch(&self) -> Epoch {
        self.vote_data.proposed().epoch
    }
}

/// Sent to the leader of `view` when a replica enters it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewView {
    /// Sender
    pub author: Address,
    /// Epoch
    pub epoch: Epoch,
    /// View being entered
    pub view: View,
    /// Sender's highest QC
    pub qc: QuorumCertificate,
    /// Sender's highest committed QC
    pub committed_qc: QuorumCertificate,
    /// Signature over [`NewView::signing_hash`]
    pub signature: Signature,
}

impl NewView {
    /// Hash signed by the sender
    pub fn signing_hash(epoch: Epoch, view: View, qc: &QuorumCertificate) -> H256 {
        let mut msg = Vec::with_capacity(64);
        msg.extend_from_slice(b"cadence.new_view");
        msg.extend_from_slice(&epoch.to_le_bytes());
        msg.extend_from_slice(&view.number().to_le_bytes());
        msg.extend_from_slice(qc.vote_data().hash().as_bytes());
        keccak256(&msg)
    }
}

/// A leader's proposed vertex
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Leader
    pub author: Address,
    /// Proposed vertex
    pub vertex: Vertex,
    /// Leader's highest committed QC
    pub committed_qc: QuorumCertificate,
    /// Signature over [`Proposal::signing_hash`]
    pub signature: Signature,
}

impl Proposal {
    /// Hash signed by the leader
    pub fn signing_hash(vertex_id: &H256) -> H256 {
        let mut msg = Vec::with_capacity(48);
        msg.extend_from_slice(b"cadence.proposal");
        msg.extend_from_slice(vertex_id.as_bytes());
        keccak256(&msg)
    }
}

/// Messages that drive the protocol state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// View synchronisation message
    NewView(NewView),
    /// Leader proposal
    Proposal(Proposal),
    /// Vote
    Vote(Vote),
}

impl ConsensusEvent {
    /// Epoch the event belongs to
    pub fn epoch(&self) -> Epoch {
        match self {
            ConsensusEvent::NewView(nv) => nv.epoch,
            ConsensusEvent::Proposal(p) => p.vertex.epoch(),
            ConsensusEvent::Vote(v) => v.epoch(),
        }
    }

    /// Sender
    pub fn author(&self) -> Address {
        match self {
            ConsensusEvent::NewView(nv) => nv.author,
            ConsensusEvent::Proposal(p) => p.author,
            ConsensusEvent::Vote(v) => v.author,
        }
    }

    /// View the event refers to
    pub fn view(&self) -> View {
        match self {
            ConsensusEvent::NewView(nv) => nv.view,
            ConsensusEvent::Proposal(p) => p.vertex.view(),
            ConsensusEvent::Vote(v) => v.view(),
        }
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusEvent::NewView(_) => "NEW_VIEW",
            ConsensusEvent::Proposal(_) => "PROPOSAL",
            ConsensusEvent::Vote(_) => "VOTE",
        }
    }
}

/// Ask a peer for `count` vertices ending at `vertex_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetVerticesRequest {
    /// Asking node
    pub requester: Address,
    /// Newest vertex wanted
    pub vertex_id: H256,
    /// Number of vertices, newest first
    pub count: usize,
    /// Echoed back in the response
    pub opaque: H256,
}

/// Vertices ordered newest first: `vertex_id`, then its parent, ...
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetVerticesResponse {
    /// Answering node
    pub responder: Address,
    /// Requested vertex
    pub vertex_id: H256,
    /// The chain
    pub vertices: Vec<Vertex>,
    /// Echo of the request's opaque value
    pub opaque: H256,
}

/// Sent instead of a response when the responder cannot serve the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetVerticesErrorResponse {
    /// Answering node
    pub responder: Address,
    /// Requested vertex
    pub vertex_id: H256,
    /// Responder's highest QC
    pub highest_qc: QuorumCertificate,
    /// Responder's highest committed QC
    pub highest_committed_qc: QuorumCertificate,
    /// Echo of the request's opaque value
    pub opaque: H256,
}

/// Ledger signal that an asynchronous `sync_to` has completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedStateSync {
    /// Version reached
    pub state_version: StateVersion,
    /// Value passed to `sync_to`
    pub opaque: H256,
}

/// Fired by the timeout scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalTimeout {
    /// Epoch the timeout was armed in
    pub epoch: Epoch,
    /// View the timeout was armed for
    pub view: View,
}

/// Ledger notification that a new epoch starts after `ancestor`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochChange {
    /// Last vertex of the previous epoch
    pub ancestor: VertexMetadata,
    /// Validators of the new epoch
    pub validator_set: Arc<ValidatorSet>,
}

impl EpochChange {
    /// Epoch being entered
    pub fn epoch(&self) -> Epoch {
        self.ancestor.epoch + 1
    }
}

/// Ask a peer for the proof of the start of `epoch`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetEpochRequest {
    /// Asking node
    pub author: Address,
    /// Epoch wanted
    pub epoch: Epoch,
}

/// Epoch boundary ancestor, or `None` when the responder is elsewhere
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetEpochResponse {
    /// Answering node
    pub author: Address,
    /// End-of-epoch vertex metadata
    pub ancestor: Option<VertexMetadata>,
}

/// Everything the epoch manager consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusMessage {
    /// NewView, Proposal or Vote from a peer
    Consensus(ConsensusEvent),
    /// A scheduled view timeout fired
    LocalTimeout(LocalTimeout),
    /// A vertex finished syncing into the local store
    LocalSync(H256),
    /// Peer asks for vertices
    GetVerticesRequest(GetVerticesRequest),
    /// Peer served vertices
    GetVerticesResponse(GetVerticesResponse),
    /// Peer could not serve vertices
    GetVerticesErrorResponse(GetVerticesErrorResponse),
    /// Ledger finished syncing
    CommittedStateSync(CommittedStateSync),
    /// Ledger moved to a new epoch
    EpochChange(EpochChange),
    /// Peer asks for an epoch proof
    GetEpochRequest(GetEpochRequest),
    /// Peer sent an epoch proof
    GetEpochResponse(GetEpochResponse),
}

impl ConsensusMessage {
    /// Short label for logs and network filters
    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusMessage::Consensus(event) => event.kind(),
            ConsensusMessage::LocalTimeout(_) => "LOCAL_TIMEOUT",
            ConsensusMessage::LocalSync(_) => "LOCAL_SYNC",
            ConsensusMessage::GetVerticesRequest(_) => "GET_VERTICES_REQUEST",
            ConsensusMessage::GetVerticesResponse(_) => "GET_VERTICES_RESPONSE",
            ConsensusMessage::GetVerticesErrorResponse(_) => "GET_VERTICES_ERROR",
            ConsensusMessage::CommittedStateSync(_) => "COMMITTED_STATE_SYNC",
            ConsensusMessage::EpochChange(_) => "EPOCH_CHANGE",
            ConsensusMessage::GetEpochRequest(_) => "GET_EPOCH_REQUEST",
            ConsensusMessage::GetEpochResponse(_) => "GET_EPOCH_RESPONSE",
        }
    }

    /// Messages produced by the replica itself rather than received from peers
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ConsensusMessage::LocalTimeout(_)
                | ConsensusMessage::LocalSync(_)
                | ConsensusMessage::CommittedStateSync(_)
                | ConsensusMessage::EpochChange(_)
        )
    }
}

impl From<ConsensusEvent> for ConsensusMessage {
    fn from(event: ConsensusEvent) -> Self {
        ConsensusMessage::Consensus(event)
    }
}
