//! Core data model: views, vertices and their metadata

use bytes::Bytes;
use cadence_crypto::keccak256;
use cadence_primitives::{Epoch, StateVersion, H256};
use std::fmt;

use crate::qc::QuorumCertificate;

/// One leader-driven round. Totally ordered, genesis is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct View(u64);

impl View {
    /// The genesis view
    pub const GENESIS: View = View(0);

    /// View with the given number
    pub const fn of(number: u64) -> Self {
        View(number)
    }

    /// Raw view number
    pub const fn number(&self) -> u64 {
        self.0
    }

    /// The following view
    pub fn next(&self) -> View {
        View(self.0.saturating_add(1))
    }

    /// Whether this is the genesis view
    pub fn is_genesis(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lightweight descriptor of a vertex, carried in votes and QCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexMetadata {
    /// Epoch the vertex belongs to
    pub epoch: Epoch,
    /// View the vertex was proposed in
    pub view: View,
    /// Vertex id
    pub id: H256,
    /// Ledger version after applying this vertex
    pub state_version: StateVersion,
    /// Set on the vertex that closes the epoch and on all its descendants
    pub is_end_of_epoch: bool,
}

impl VertexMetadata {
    /// Metadata of an epoch genesis vertex
    pub fn of_genesis(genesis: &Vertex) -> Self {
        VertexMetadata {
            epoch: genesis.epoch(),
            view: View::GENESIS,
            id: genesis.id(),
            state_version: genesis.qc().proposed().state_version,
            is_end_of_epoch: false,
        }
    }

    /// Append the canonical byte form used for hashing
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.epoch.to_le_bytes());
        buf.extend_from_slice(&self.view.number().to_le_bytes());
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&self.state_version.to_le_bytes());
        buf.push(self.is_end_of_epoch as u8);
    }
}

impl fmt::Display for VertexMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{epoch={} view={} id={} v={}{}}}",
            self.epoch,
            self.view,
            self.id.short(),
            self.state_version,
            if self.is_end_of_epoch { " eoe" } else { "" }
        )
    }
}

/// Opaque command payload
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Command(Bytes);

impl Command {
    /// Wrap raw bytes
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Command(payload.into())
    }

    /// Payload bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Payload length
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = &self.0[..self.0.len().min(8)];
        write!(f, "Command({}, {} bytes)", hex::encode(shown), self.0.len())
    }
}

/// A proposed unit of consensus. Immutable; the id is derived from the content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vertex {
    epoch: Epoch,
    view: View,
    qc: QuorumCertificate,
    command: Option<Command>,
    id: H256,
}

impl Vertex {
    /// Build a vertex extending the vertex certified by `qc`
    pub fn new(epoch: Epoch, view: View, qc: QuorumCertificate, command: Option<Command>) -> Self {
        let id = Self::compute_id(epoch, view, &qc, command.as_ref());
        Vertex {
            epoch,
            view,
            qc,
            command,
            id,
        }
    }

    /// Genesis vertex of the epoch following `ancestor`.
    ///
    /// Only the ancestor's epoch and state version are used, so every replica
    /// derives the same genesis regardless of how it learned about the ancestor.
    pub fn genesis(ancestor: &VertexMetadata) -> Self {
        let epoch = ancestor.epoch + 1;
        let pre_genesis = VertexMetadata {
            epoch,
            view: View::GENESIS,
            id: H256::ZERO,
            state_version: ancestor.state_version,
            is_end_of_epoch: false,
        };
        let qc = QuorumCertificate::pre_genesis(pre_genesis);
        Vertex::new(epoch, View::GENESIS, qc, None)
    }

    fn compute_id(
        epoch: Epoch,
        view: View,
        qc: &QuorumCertificate,
        command: Option<&Command>,
    ) -> H256 {
        let mut buf = Vec::with_capacity(96);
        buf.extend_from_slice(b"cadence.vertex");
        buf.extend_from_slice(&epoch.to_le_bytes());
        buf.extend_from_slice(&view.number().to_le_bytes());
        buf.extend_from_slice(qc.vote_data().hash().as_bytes());
        match command {
            Some(command) => {
                buf.push(1);
                buf.extend_from_slice(&(command.len() as u64).to_le_bytes());
                buf.extend_from_slice(command.as_bytes());
            }
            None => buf.push(0),
        }
        keccak256(&buf)
    }

    /// Epoch
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// View
    pub fn view(&self) -> View {
        self.view
    }

    /// QC certifying the parent
    pub fn qc(&self) -> &QuorumCertificate {
        &self.qc
    }

    /// Command payload, if any
    pub fn command(&self) -> Option<&Command> {
        self.command.as_ref()
    }

    /// Content hash
    pub fn id(&self) -> H256 {
        self.id
    }

    /// Id of the parent vertex
    pub fn parent_id(&self) -> H256 {
        self.qc.proposed().id
    }

    /// View of the parent vertex
    pub fn parent_view(&self) -> View {
        self.qc.view()
    }

    /// True when the parent was proposed in the immediately preceding view
    pub fn has_direct_parent(&self) -> bool {
        self.view == self.qc.view().next()
    }

    /// Whether this is an epoch genesis vertex
    pub fn is_genesis(&self) -> bool {
        self.view.is_genesis()
    }
}
