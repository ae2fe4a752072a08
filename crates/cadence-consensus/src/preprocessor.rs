//! Sync gate in front of the reducer.
//!
//! New-views and proposals are only forwarded once the QC they carry is in the
//! vertex store. Events that are not ready wait in a per-author FIFO queue, and
//! later events from the same author queue behind them so each author's events
//! reach the reducer in order.

use cadence_metrics::{CounterType, SystemCounters};
use cadence_primitives::{Address, H256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::error::ConsensusResult;
use crate::messages::{NewView, Proposal, Vote};
use crate::processor::BftEventProcessor;
use crate::qc::QuorumCertificate;
use crate::reducer::BftEventReducer;
use crate::types::View;
use crate::vertex_store::VertexStore;

/// Event waiting for its QC to sync
#[derive(Debug, Clone)]
enum QueuedEvent {
    NewView(NewView),
    Proposal(Proposal),
}

impl QueuedEvent {
    fn author(&self) -> Address {
        match self {
            QueuedEvent::NewView(nv) => nv.author,
            QueuedEvent::Proposal(p) => p.author,
        }
    }

    fn view(&self) -> View {
        match self {
            QueuedEvent::NewView(nv) => nv.view,
            QueuedEvent::Proposal(p) => p.vertex.view(),
        }
    }

    fn qc(&self) -> &QuorumCertificate {
        match self {
            QueuedEvent::NewView(nv) => &nv.qc,
            QueuedEvent::Proposal(p) => p.vertex.qc(),
        }
    }

    fn committed_qc(&self) -> &QuorumCertificate {
        match self {
            QueuedEvent::NewView(nv) => &nv.committed_qc,
            QueuedEvent::Proposal(p) => &p.committed_qc,
        }
    }
}

/// Bounded per-author queues
struct SyncQueues {
    queues: HashMap<Address, VecDeque<QueuedEvent>>,
    capacity: usize,
    counters: Arc<SystemCounters>,
}

impl SyncQueues {
    fn new(capacity: usize, counters: Arc<SystemCounters>) -> Self {
        Self {
            queues: HashMap::new(),
            capacity,
            counters,
        }
    }

    /// Queue `event` behind earlier events of its author. Hands it back when
    /// nothing from that author is waiting.
    fn add_if_waiting(&mut self, event: QueuedEvent) -> Option<QueuedEvent> {
        let waiting = self
            .queues
            .get(&event.author())
            .is_some_and(|queue| !queue.is_empty());
        if waiting {
            self.push(event);
            None
        } else {
            Some(event)
        }
    }

    fn push(&mut self, event: QueuedEvent) {
        let queue = self.queues.entry(event.author()).or_default();
        if queue.len() >= self.capacity {
            tracing::warn!(
                author = %event.author(),
                view = %event.view(),
                "Sync queue full, dropping event"
            );
            return;
        }
        queue.push_back(event);
        self.update_size();
    }

    fn clear(&mut self) {
        self.queues.clear();
        self.update_size();
    }

    fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    fn update_size(&self) {
        self.counters
            .set(CounterType::BftSyncQueueSize, self.len() as u64);
    }
}

/// Forwards an event whose QC is synced. Hands the event back otherwise.
fn forward_if_synced(
    reducer: &mut BftEventReducer,
    store: &mut VertexStore,
    event: QueuedEvent,
) -> ConsensusResult<Option<QueuedEvent>> {
    let synced = store.sync_to_qc(event.qc(), event.committed_qc(), Some(event.author()))?;
    if !synced {
        return Ok(Some(event));
    }
    match event {
        QueuedEvent::NewView(nv) => reducer.process_new_view(store, nv)?,
        QueuedEvent::Proposal(p) => reducer.process_proposal(store, p)?,
    }
    Ok(None)
}

/// Orders and gates events for the reducer
pub struct BftEventPreprocessor {
    self_address: Address,
    reducer: BftEventReducer,
    queues: SyncQueues,
}

impl BftEventPreprocessor {
    /// Wrap `reducer`, holding at most `queue_capacity` events per author
    pub fn new(
        self_address: Address,
        reducer: BftEventReducer,
        queue_capacity: usize,
        counters: Arc<SystemCounters>,
    ) -> Self {
        Self {
            self_address,
            reducer,
            queues: SyncQueues::new(queue_capacity, counters),
        }
    }

    /// Current view of the wrapped reducer
    pub fn current_view(&self) -> View {
        self.reducer.current_view()
    }

    /// Events waiting on sync
    pub fn queued_events(&self) -> usize {
        self.queues.len()
    }

    fn process_event(&mut self, store: &mut VertexStore, event: QueuedEvent) -> ConsensusResult<()> {
        let Some(event) = self.queues.add_if_waiting(event) else {
            return Ok(());
        };
        if let Some(blocked) = forward_if_synced(&mut self.reducer, store, event)? {
            tracing::debug!(
                node = %self.self_address,
                view = %blocked.view(),
                author = %blocked.author(),
                "Waiting for qc vertex {}",
                blocked.qc().proposed().id.short()
            );
            self.queues.push(blocked);
        }
        Ok(())
    }
}

impl BftEventProcessor for BftEventPreprocessor {
    fn start(&mut self, store: &mut VertexStore) -> ConsensusResult<()> {
        self.reducer.start(store)
    }

    fn process_vote(&mut self, store: &mut VertexStore, vote: Vote) -> ConsensusResult<()> {
        self.reducer.process_vote(store, vote)
    }

    fn process_new_view(&mut self, store: &mut VertexStore, new_view: NewView) -> ConsensusResult<()> {
        let current = self.reducer.current_view();
        if new_view.view < current {
            tracing::trace!(
                node = %self.self_address,
                view = %new_view.view,
                %current,
                "NEW_VIEW: stale"
            );
            return Ok(());
        }
        if !self.reducer.is_proposer(new_view.view) {
            tracing::warn!(
                node = %self.self_address,
                view = %new_view.view,
                author = %new_view.author,
                "NEW_VIEW: confused sender, not the leader of this view"
            );
            return Ok(());
        }
        self.process_event(store, QueuedEvent::NewView(new_view))
    }

    fn process_proposal(&mut self, store: &mut VertexStore, proposal: Proposal) -> ConsensusResult<()> {
        let current = self.reducer.current_view();
        if proposal.vertex.view() < current {
            tracing::trace!(
                node = %self.self_address,
                view = %proposal.vertex.view(),
                %current,
                "PROPOSAL: stale"
            );
            return Ok(());
        }
        self.process_event(store, QueuedEvent::Proposal(proposal))
    }

    fn process_local_timeout(&mut self, store: &mut VertexStore, view: View) -> ConsensusResult<()> {
        let before = self.reducer.current_view();
        self.reducer.process_local_timeout(store, view)?;
        if self.reducer.current_view() != before {
            self.queues.clear();
            store.retry_syncs()?;
        }
        Ok(())
    }

    fn process_local_sync(&mut self, store: &mut VertexStore, vertex_id: H256) -> ConsensusResult<()> {
        self.reducer.process_local_sync(store, vertex_id)?;

        let authors: Vec<Address> = self.queues.queues.keys().copied().collect();
        for author in authors {
            loop {
                let current = self.reducer.current_view();
                let Some(queue) = self.queues.queues.get_mut(&author) else {
                    break;
                };
                let Some(head) = queue.front() else {
                    break;
                };
                let stale = head.view() < current;
                if !stale && !store.contains(&head.qc().proposed().id) {
                    break;
                }
                let Some(event) = queue.pop_front() else {
                    break;
                };
                if stale {
                    continue;
                }
                if let Some(blocked) = forward_if_synced(&mut self.reducer, store, event)? {
                    if let Some(queue) = self.queues.queues.get_mut(&author) {
                        queue.push_front(blocked);
                    }
                    break;
                }
            }
        }
        self.queues.queues.retain(|_, queue| !queue.is_empty());
        self.queues.update_size();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::GetVerticesResponse;
    use crate::test_utils::{Network, ReplicaFixture};

    // ==================== Preprocessor Tests ====================

    /// Replica 3 at view 1 receiving the view 2 proposal while it has not
    /// seen vertex 1
    fn blocked_proposal() -> (Network, ReplicaFixture<BftEventPreprocessor>, crate::types::Vertex) {
        let net = Network::new(4);
        let mut r = ReplicaFixture::preprocessor(&net, 3);
        r.start();

        let genesis_qc = net.genesis_qc();
        let v1 = net.proposal(1, &genesis_qc, Some("a")).vertex;
        let md1 = net.metadata(&v1, 1);
        let qc1 = net.qc(md1, *genesis_qc.proposed(), None, &[0, 1, 2]);
        let p2 = net.proposal(2, &qc1, Some("b"));
        r.processor.process_proposal(&mut r.store, p2).unwrap();
        (net, r, v1)
    }

    #[test]
    fn test_proposal_waits_for_sync() {
        let (net, r, v1) = blocked_proposal();
        assert_eq!(r.processor.queued_events(), 1);
        assert!(r.env.votes.lock().is_empty());
        let requests = r.env.sync_requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, net.address(2));
        assert_eq!(requests[0].1.vertex_id, v1.id());
    }

    #[test]
    fn test_queued_proposal_processed_after_sync() {
        let (_net, mut r, v1) = blocked_proposal();
        let request = r.env.sync_requests.lock()[0].1.clone();
        r.store
            .process_get_vertices_response(GetVerticesResponse {
                responder: request.requester,
                vertex_id: v1.id(),
                vertices: vec![v1.clone()],
                opaque: request.opaque,
            })
            .unwrap();
        assert_eq!(*r.env.synced.lock(), vec![v1.id()]);

        r.processor
            .process_local_sync(&mut r.store, v1.id())
            .unwrap();
        assert_eq!(r.processor.queued_events(), 0);
        let votes = r.env.votes.lock();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].0.view(), View::of(2));
    }

    #[test]
    fn test_later_events_queue_behind_blocked_author() {
        let (net, mut r, _) = blocked_proposal();
        let nv = net.new_view(2, 3, &net.genesis_qc());
        r.processor.process_new_view(&mut r.store, nv).unwrap();
        assert_eq!(r.processor.queued_events(), 2);
    }

    #[test]
    fn test_timeout_clears_queues() {
        let (_net, mut r, _) = blocked_proposal();
        r.processor
            .process_local_timeout(&mut r.store, View::of(1))
            .unwrap();
        assert_eq!(r.processor.queued_events(), 0);
        assert_eq!(r.counters.get(CounterType::BftSyncQueueSize), 0);
        // outstanding sync was re-requested
        assert_eq!(r.env.sync_requests.lock().len(), 2);
    }

    #[test]
    fn test_new_view_for_other_leader_dropped() {
        let net = Network::new(4);
        let mut r = ReplicaFixture::preprocessor(&net, 3);
        r.start();
        let nv = net.new_view(0, 2, &net.genesis_qc());
        r.processor.process_new_view(&mut r.store, nv).unwrap();
        assert_eq!(r.processor.queued_events(), 0);
        assert!(r.env.proposals.lock().is_empty());
    }

    #[test]
    fn test_stale_proposal_dropped() {
        let net = Network::new(4);
        let mut r = ReplicaFixture::preprocessor(&net, 3);
        r.start();
        r.processor
            .process_local_timeout(&mut r.store, View::of(1))
            .unwrap();
        let p1 = net.proposal(1, &net.genesis_qc(), None);
        r.processor.process_proposal(&mut r.store, p1).unwrap();
        assert!(r.env.votes.lock().is_empty());
    }
}
