//! Builds the vertex a leader proposes

use std::sync::Arc;

use crate::interfaces::Mempool;
use crate::types::{Vertex, View};
use crate::vertex_store::VertexStore;

/// Extends the highest QC with at most one command from the mempool
pub struct ProposalGenerator {
    mempool: Arc<dyn Mempool>,
}

impl ProposalGenerator {
    /// Create a generator
    pub fn new(mempool: Arc<dyn Mempool>) -> Self {
        Self { mempool }
    }

    /// Vertex for `view` on top of the store's highest QC. Commands already
    /// on the uncommitted path are excluded, and nothing is proposed once the
    /// chain has closed the epoch.
    pub fn generate(&self, store: &VertexStore, view: View) -> Vertex {
        let qc = store.highest_qc().clone();
        let command = if qc.proposed().is_end_of_epoch {
            None
        } else {
            let exclude = store.commands_to(&qc.proposed().id);
            self.mempool.get_commands(1, &exclude).into_iter().next()
        };
        Vertex::new(store.epoch(), view, qc, command)
    }
}
