//! Event processor seam shared by the preprocessor, the reducer and the
//! parked processor of non-validators

use cadence_primitives::H256;

use crate::error::ConsensusResult;
use crate::messages::{NewView, Proposal, Vote};
use crate::types::View;
use crate::vertex_store::VertexStore;

/// Handles the consensus events of one epoch against that epoch's store
pub trait BftEventProcessor: Send {
    /// Enter the first view
    fn start(&mut self, store: &mut VertexStore) -> ConsensusResult<()>;

    /// Verified vote
    fn process_vote(&mut self, store: &mut VertexStore, vote: Vote) -> ConsensusResult<()>;

    /// Verified new-view
    fn process_new_view(&mut self, store: &mut VertexStore, new_view: NewView) -> ConsensusResult<()>;

    /// Verified proposal
    fn process_proposal(&mut self, store: &mut VertexStore, proposal: Proposal) -> ConsensusResult<()>;

    /// Timer for `view` fired
    fn process_local_timeout(&mut self, store: &mut VertexStore, view: View) -> ConsensusResult<()>;

    /// A vertex finished syncing into the store
    fn process_local_sync(&mut self, store: &mut VertexStore, vertex_id: H256) -> ConsensusResult<()>;
}

/// Processor for replicas outside the validator set: drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyBftEventProcessor;

impl BftEventProcessor for EmptyBftEventProcessor {
    fn start(&mut self, _store: &mut VertexStore) -> ConsensusResult<()> {
        Ok(())
    }

    fn process_vote(&mut self, _store: &mut VertexStore, _vote: Vote) -> ConsensusResult<()> {
        Ok(())
    }

    fn process_new_view(&mut self, _store: &mut VertexStore, _new_view: NewView) -> ConsensusResult<()> {
        Ok(())
    }

    fn process_proposal(&mut self, _store: &mut VertexStore, _proposal: Proposal) -> ConsensusResult<()> {
        Ok(())
    }

    fn process_local_timeout(&mut self, _store: &mut VertexStore, _view: View) -> ConsensusResult<()> {
        Ok(())
    }

    fn process_local_sync(&mut self, _store: &mut VertexStore, _vertex_id: H256) -> ConsensusResult<()> {
        Ok(())
    }
}
