//! Voting guard.
//!
//! SafetyRules is the only component that signs on behalf of the replica and
//! the only one that mutates [`SafetyState`]. Every vote is persisted through
//! the [`SafetyStateStore`] before it is handed back to the caller, so a vote
//! that leaves the process always survives a restart.

use cadence_crypto::HashSigner;
use cadence_primitives::{Address, Epoch};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ConsensusResult, SafetyViolation};
use crate::interfaces::SafetyStateStore;
use crate::messages::{NewView, Proposal, Vote};
use crate::qc::{QuorumCertificate, VoteData};
use crate::types::{Vertex, VertexMetadata, View};

/// Persistent voting state. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SafetyState {
    /// Highest view voted in
    pub last_voted_view: View,
    /// Highest parent view of any processed QC
    pub locked_view: View,
    /// Highest view of any processed QC
    pub generic_view: View,
}

/// Safety state kept in memory, for tests and nodes without durable storage
#[derive(Debug, Default)]
pub struct InMemorySafetyStateStore {
    states: Mutex<HashMap<Epoch, SafetyState>>,
}

impl InMemorySafetyStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl SafetyStateStore for InMemorySafetyStateStore {
    fn load(&self, epoch: Epoch) -> ConsensusResult<Option<SafetyState>> {
        Ok(self.states.lock().get(&epoch).copied())
    }

    fn persist(&self, epoch: Epoch, state: &SafetyState) -> ConsensusResult<()> {
        self.states.lock().insert(epoch, *state);
        Ok(())
    }
}

/// Signs votes, new-views and proposals for one epoch
pub struct SafetyRules {
    self_address: Address,
    epoch: Epoch,
    signer: Arc<dyn HashSigner>,
    store: Arc<dyn SafetyStateStore>,
    state: SafetyState,
    timestamp_tolerance_ms: u64,
}

impl SafetyRules {
    /// Create safety rules for `epoch`, resuming from any persisted state
    pub fn new(
        epoch: Epoch,
        signer: Arc<dyn HashSigner>,
        store: Arc<dyn SafetyStateStore>,
        timestamp_tolerance_ms: u64,
    ) -> ConsensusResult<Self> {
        let state = store.load(epoch)?.unwrap_or_default();
        if state != SafetyState::default() {
            tracing::info!(
                epoch,
                last_voted = %state.last_voted_view,
                locked = %state.locked_view,
                "Resuming persisted safety state"
            );
        }
        Ok(Self {
            self_address: signer.address(),
            epoch,
            signer,
            store,
            state,
            timestamp_tolerance_ms,
        })
    }

    /// Current state
    pub fn state(&self) -> &SafetyState {
        &self.state
    }

    /// Move the lock forward with `qc`.
    ///
    /// Returns the vertex the QC commits, if any.
    pub fn process(&mut self, qc: &QuorumCertificate) -> ConsensusResult<Option<VertexMetadata>> {
        let mut next = self.state;
        next.generic_view = next.generic_view.max(qc.view());
        next.locked_view = next.locked_view.max(qc.parent().view);
        if next != self.state {
            self.store.persist(self.epoch, &next)?;
            self.state = next;
        }
        Ok(qc.committed().copied())
    }

    /// Sign a vote for `vertex`, whose metadata is `proposed` and whose
    /// parent vertex is `parent`.
    pub fn vote_for(
        &mut self,
        vertex: &Vertex,
        proposed: VertexMetadata,
        parent: &Vertex,
        timestamp: u64,
    ) -> ConsensusResult<Vote> {
        if vertex.view() <= self.state.last_voted_view {
            return Err(SafetyViolation::AlreadyVoted {
                view: vertex.view(),
                last_voted: self.state.last_voted_view,
            }
            .into());
        }
        if vertex.qc().view() < self.state.locked_view {
            return Err(SafetyViolation::BelowLock {
                qc_view: vertex.qc().view(),
                locked: self.state.locked_view,
            }
            .into());
        }
        if let (Some(qc_timestamp), Some(parent_timestamp)) =
            (vertex.qc().timestamp()?, parent.qc().timestamp()?)
        {
            if qc_timestamp.saturating_add(self.timestamp_tolerance_ms) < parent_timestamp {
                return Err(SafetyViolation::TimestampRegression {
                    qc_timestamp,
                    parent_timestamp,
                }
                .into());
            }
        }

        let vote_data = Self::construct_vote_data(vertex, proposed);
        let signature = self
            .signer
            .sign(&Vote::signing_hash(&vote_data, timestamp))?;

        let mut next = self.state;
        next.last_voted_view = vertex.view();
        self.store.persist(self.epoch, &next)?;
        self.state = next;

        Ok(Vote {
            author: self.self_address,
            vote_data,
            timestamp,
            signature,
        })
    }

    /// Vote data for `vertex`. A quorum on it commits the grandparent when the
    /// grandparent, parent and vertex occupy three consecutive views.
    fn construct_vote_data(vertex: &Vertex, proposed: VertexMetadata) -> VoteData {
        let parent = *vertex.qc().proposed();
        let grandparent = *vertex.qc().parent();
        let commits_grandparent = vertex.view() == parent.view.next()
            && !parent.view.is_genesis()
            && !grandparent.view.is_genesis()
            && parent.view == grandparent.view.next();
        let committed = commits_grandparent.then_some(grandparent);
        VoteData::new(proposed, parent, committed)
    }

    /// Sign a new-view for `view`
    pub fn sign_new_view(
        &self,
        view: View,
        highest_qc: QuorumCertificate,
        highest_committed_qc: QuorumCertificate,
    ) -> ConsensusResult<NewView> {
        let signature = self
            .signer
            .sign(&NewView::signing_hash(self.epoch, view, &highest_qc))?;
        Ok(NewView {
            author: self.self_address,
            epoch: self.epoch,
            view,
            qc: highest_qc,
            committed_qc: highest_committed_qc,
            signature,
        })
    }

    /// Sign a proposal for `vertex`
    pub fn sign_proposal(
        &self,
        vertex: Vertex,
        highest_committed_qc: QuorumCertificate,
    ) -> ConsensusResult<Proposal> {
        let signature = self.signer.sign(&Proposal::signing_hash(&vertex.id()))?;
        Ok(Proposal {
            author: self.self_address,
            vertex,
            committed_qc: highest_committed_qc,
            signature,
        })
    }
}
