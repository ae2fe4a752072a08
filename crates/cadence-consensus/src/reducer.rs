//! Protocol state transitions.
//!
//! The reducer sees only events whose QCs are already in the vertex store;
//! ordering and sync gating happen in the preprocessor in front of it.

use cadence_metrics::{CounterType, SystemCounters};
use cadence_primitives::{Address, H256};
use std::sync::Arc;

use crate::error::{ConsensusError, ConsensusResult};
use crate::interfaces::{BftSender, Clock};
use crate::messages::{NewView, Proposal, Vote};
use crate::pacemaker::Pacemaker;
use crate::pending_votes::PendingVotes;
use crate::processor::BftEventProcessor;
use crate::proposal_generator::ProposalGenerator;
use crate::proposer_election::WeightedRotatingLeaders;
use crate::qc::QuorumCertificate;
use crate::safety_rules::SafetyRules;
use crate::types::View;
use crate::validator::ValidatorSet;
use crate::vertex_store::VertexStore;

/// Chained HotStuff event handlers for one epoch
pub struct BftEventReducer {
    self_address: Address,
    validator_set: Arc<ValidatorSet>,
    proposer_election: WeightedRotatingLeaders,
    pending_votes: PendingVotes,
    safety_rules: SafetyRules,
    pacemaker: Pacemaker,
    proposal_generator: ProposalGenerator,
    last_proposed_view: View,
    sender: Arc<dyn BftSender>,
    clock: Arc<dyn Clock>,
    counters: Arc<SystemCounters>,
}

impl BftEventReducer {
    /// Assemble a reducer from its components
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_address: Address,
        validator_set: Arc<ValidatorSet>,
        proposer_election: WeightedRotatingLeaders,
        safety_rules: SafetyRules,
        pacemaker: Pacemaker,
        proposal_generator: ProposalGenerator,
        sender: Arc<dyn BftSender>,
        clock: Arc<dyn Clock>,
        counters: Arc<SystemCounters>,
    ) -> Self {
        Self {
            self_address,
            validator_set,
            proposer_election,
            pending_votes: PendingVotes::new(),
            safety_rules,
            pacemaker,
            proposal_generator,
            last_proposed_view: View::GENESIS,
            sender,
            clock,
            counters,
        }
    }

    /// View the pacemaker is in
    pub fn current_view(&self) -> View {
        self.pacemaker.current_view()
    }

    /// Leader of `view`
    pub fn proposer(&mut self, view: View) -> Address {
        self.proposer_election.proposer(view)
    }

    /// Whether this replica leads `view`
    pub fn is_proposer(&mut self, view: View) -> bool {
        self.proposer(view) == self.self_address
    }

    /// Commit what `qc` commits and advance the pacemaker past it
    fn process_qc(&mut self, store: &mut VertexStore, qc: &QuorumCertificate) -> ConsensusResult<()> {
        if let Some(committed) = self.safety_rules.process(qc)? {
            store.commit_vertex(&committed)?;
        }
        if let Some(view) = self.pacemaker.process_qc(qc.view()) {
            self.proceed_to_view(store, view)?;
        }
        Ok(())
    }

    fn proceed_to_view(&mut self, store: &VertexStore, view: View) -> ConsensusResult<()> {
        let new_view = self.safety_rules.sign_new_view(
            view,
            store.highest_qc().clone(),
            store.highest_committed_qc().clone(),
        )?;
        let leader = self.proposer(view);
        tracing::trace!(
            node = %self.self_address,
            %view,
            %leader,
            "NEW_VIEW: sending"
        );
        self.sender.send_new_view(new_view, leader);
        Ok(())
    }

    /// Extend the highest QC in `view`. At most one proposal per view: a
    /// leader that proposed on forming a QC ignores the later new-view quorum.
    fn propose(&mut self, store: &VertexStore, view: View) -> ConsensusResult<()> {
        if view <= self.last_proposed_view {
            tracing::trace!(node = %self.self_address, %view, "PROPOSAL: already proposed");
            return Ok(());
        }
        let vertex = self.proposal_generator.generate(store, view);
        let proposal = self
            .safety_rules
            .sign_proposal(vertex, store.highest_committed_qc().clone())?;
        self.last_proposed_view = view;
        tracing::debug!(
            node = %self.self_address,
            %view,
            parent_view = %proposal.vertex.parent_view(),
            "PROPOSAL: broadcasting"
        );
        self.counters.increment(CounterType::BftProposalsMade);
        self.sender
            .broadcast_proposal(proposal, &self.validator_set.addresses());
        Ok(())
    }
}

impl BftEventProcessor for BftEventReducer {
    fn start(&mut self, store: &mut VertexStore) -> ConsensusResult<()> {
        let qc = store.highest_qc().clone();
        self.process_qc(store, &qc)
    }

    fn process_vote(&mut self, store: &mut VertexStore, vote: Vote) -> ConsensusResult<()> {
        let view = vote.view();
        if !self.is_proposer(view.next()) {
            tracing::trace!(node = %self.self_address, %view, "VOTE: not the next leader, ignoring");
            return Ok(());
        }
        let Some(qc) = self.pending_votes.insert_vote(&vote, &self.validator_set) else {
            return Ok(());
        };
        tracing::trace!(node = %self.self_address, %view, "VOTE: formed qc");
        let committed_qc = store.highest_committed_qc().clone();
        if !store.sync_to_qc(&qc, &committed_qc, Some(vote.author))? {
            return Ok(());
        }
        self.process_qc(store, &qc)?;
        let next = view.next();
        if self.pacemaker.current_view() == next {
            self.propose(store, next)?;
        }
        Ok(())
    }

    fn process_new_view(&mut self, store: &mut VertexStore, new_view: NewView) -> ConsensusResult<()> {
        tracing::trace!(
            node = %self.self_address,
            view = %new_view.view,
            author = %new_view.author,
            "NEW_VIEW: processing"
        );
        self.process_qc(store, &new_view.qc)?;
        let Some(view) = self
            .pacemaker
            .process_new_view(&new_view, &self.validator_set)
        else {
            return Ok(());
        };
        self.propose(store, view)
    }

    fn process_proposal(&mut self, store: &mut VertexStore, proposal: Proposal) -> ConsensusResult<()> {
        let vertex = &proposal.vertex;
        let view = vertex.view();
        if !view.is_genesis() && self.proposer(view) != proposal.author {
            tracing::warn!(
                node = %self.self_address,
                %view,
                author = %proposal.author,
                "PROPOSAL: author is not the leader of its view"
            );
            self.counters.increment(CounterType::BftRejectedProposals);
            return Ok(());
        }

        self.process_qc(store, vertex.qc())?;
        let current = self.pacemaker.current_view();
        if view != current {
            tracing::trace!(
                node = %self.self_address,
                %view,
                %current,
                "PROPOSAL: not for the current view, ignoring"
            );
            return Ok(());
        }

        let metadata = match store.insert_vertex(vertex.clone()) {
            Ok(metadata) => metadata,
            Err(e) if !e.is_fatal() => {
                tracing::warn!(node = %self.self_address, %view, error = %e, "PROPOSAL: rejected");
                self.counters.increment(CounterType::BftRejectedProposals);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let Some(parent) = store.get_vertex(&vertex.parent_id()) else {
            return Err(ConsensusError::IllegalState(format!(
                "parent of inserted vertex {} missing",
                vertex.id().short()
            )));
        };

        match self
            .safety_rules
            .vote_for(vertex, metadata, parent, self.clock.now_ms())
        {
            Ok(vote) => {
                let next_leader = self.proposer(current.next());
                tracing::trace!(node = %self.self_address, %view, %next_leader, "VOTE: sending");
                self.sender.send_vote(vote, next_leader);
            }
            Err(ConsensusError::SafetyViolation(violation)) => {
                self.counters.increment(CounterType::BftSafetyViolations);
                tracing::warn!(
                    node = %self.self_address,
                    %view,
                    %violation,
                    "PROPOSAL: refusing to vote"
                );
            }
            Err(e) => return Err(e),
        }

        // neither leader of this view nor the next: nothing more to wait for
        if !self.is_proposer(current) && !self.is_proposer(current.next()) {
            self.pacemaker.process_next_view(current);
            let view = self.pacemaker.current_view();
            self.proceed_to_view(store, view)?;
        }
        Ok(())
    }

    fn process_local_timeout(&mut self, store: &mut VertexStore, view: View) -> ConsensusResult<()> {
        if let Some(next) = self.pacemaker.process_local_timeout(view) {
            tracing::debug!(
                node = %self.self_address,
                %view,
                timeouts = self.pacemaker.consecutive_timeouts(),
                "LOCAL_TIMEOUT: moving to next view"
            );
            self.proceed_to_view(store, next)?;
        }
        Ok(())
    }

    fn process_local_sync(&mut self, store: &mut VertexStore, vertex_id: H256) -> ConsensusResult<()> {
        tracing::trace!(node = %self.self_address, vertex = %vertex_id.short(), "SYNC_VERTICES: local sync");
        let qc = store.highest_qc().clone();
        self.process_qc(store, &qc)
    }
}
