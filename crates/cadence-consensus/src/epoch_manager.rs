//! Epoch lifecycle and message routing.
//!
//! The epoch manager owns the state of the current epoch: its vertex store,
//! message verifier and event processor. Every inbound message passes through
//! [`EpochManager::handle`]. Consensus events are verified before the processor
//! sees them, events from a later epoch are held until that epoch starts, and
//! committing the end-of-epoch vertex parks the processor until the ledger
//! reports the next validator set.

use cadence_crypto::{HashSigner, HashVerifier};
use cadence_metrics::{CounterType, SystemCounters};
use cadence_primitives::{Address, Epoch};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::BftConfig;
use crate::error::ConsensusResult;
use crate::interfaces::{
    BftSender, Clock, EpochSender, Mempool, SafetyStateStore, SyncVerticesSender,
    SyncedStateComputer, TimeoutSender, VertexStoreEventSender,
};
use crate::messages::{
    ConsensusEvent, ConsensusMessage, EpochChange, GetEpochRequest, GetEpochResponse,
    LocalTimeout,
};
use crate::pacemaker::Pacemaker;
use crate::preprocessor::BftEventPreprocessor;
use crate::processor::{BftEventProcessor, EmptyBftEventProcessor};
use crate::proposal_generator::ProposalGenerator;
use crate::proposer_election::WeightedRotatingLeaders;
use crate::reducer::BftEventReducer;
use crate::safety_rules::SafetyRules;
use crate::types::VertexMetadata;
use crate::validator::ValidatorSet;
use crate::verifier::MessageVerifier;
use crate::vertex_store::{StoreHandles, VertexStore};

/// Everything a replica talks to outside the consensus core
#[derive(Clone)]
pub struct ConsensusHandles {
    /// Proposals, new-views and votes
    pub bft_sender: Arc<dyn BftSender>,
    /// GetVertices RPC
    pub sync_sender: Arc<dyn SyncVerticesSender>,
    /// Synced/committed vertex notifications
    pub event_sender: Arc<dyn VertexStoreEventSender>,
    /// Pacemaker timers
    pub timeout_sender: Arc<dyn TimeoutSender>,
    /// GetEpoch RPC
    pub epoch_sender: Arc<dyn EpochSender>,
    /// Ledger
    pub ledger: Arc<dyn SyncedStateComputer>,
    /// Command source for proposals
    pub mempool: Arc<dyn Mempool>,
    /// Wall clock for vote timestamps
    pub clock: Arc<dyn Clock>,
    /// Durable safety state
    pub safety_store: Arc<dyn SafetyStateStore>,
    /// This replica's key
    pub signer: Arc<dyn HashSigner>,
    /// Signature checks for peers' messages
    pub verifier: Arc<dyn HashVerifier>,
    /// Counters
    pub counters: Arc<SystemCounters>,
}

impl ConsensusHandles {
    fn store_handles(&self) -> StoreHandles {
        StoreHandles {
            sync_sender: self.sync_sender.clone(),
            event_sender: self.event_sender.clone(),
            ledger: self.ledger.clone(),
            counters: self.counters.clone(),
        }
    }
}

/// State of the running epoch
struct EpochState {
    epoch: Epoch,
    /// End-of-epoch vertex of the previous epoch
    ancestor: VertexMetadata,
    validator_set: Arc<ValidatorSet>,
    store: VertexStore,
    verifier: MessageVerifier,
    processor: Box<dyn BftEventProcessor>,
}

/// Runs consecutive epochs of consensus for one replica
pub struct EpochManager {
    self_address: Address,
    config: BftConfig,
    handles: ConsensusHandles,
    current: Option<EpochState>,
    /// Events from later epochs, by epoch
    queued: BTreeMap<Epoch, Vec<ConsensusEvent>>,
}

impl EpochManager {
    /// Create an idle manager. Nothing runs until [`EpochManager::start`].
    pub fn new(config: BftConfig, handles: ConsensusHandles) -> Self {
        Self {
            self_address: handles.signer.address(),
            config,
            handles,
            current: None,
            queued: BTreeMap::new(),
        }
    }

    /// Start the first epoch
    pub fn start(&mut self, initial: EpochChange) -> ConsensusResult<()> {
        self.process_epoch_change(initial)
    }

    /// Address this replica signs with
    pub fn self_address(&self) -> Address {
        self.self_address
    }

    /// Epoch currently running
    pub fn current_epoch(&self) -> Option<Epoch> {
        self.current.as_ref().map(|state| state.epoch)
    }

    /// Vertex store of the running epoch
    pub fn vertex_store(&self) -> Option<&VertexStore> {
        self.current.as_ref().map(|state| &state.store)
    }

    /// Validator set of the running epoch
    pub fn validator_set(&self) -> Option<&Arc<ValidatorSet>> {
        self.current.as_ref().map(|state| &state.validator_set)
    }

    /// Events held for later epochs
    pub fn queued_events(&self) -> usize {
        self.queued.values().map(Vec::len).sum()
    }

    /// Process one inbound message.
    ///
    /// Invalid or unusable messages are logged and dropped. Only errors that
    /// leave the replica unable to continue are returned.
    pub fn handle(&mut self, message: ConsensusMessage) -> ConsensusResult<()> {
        let kind = message.kind();
        let result = self
            .dispatch(message)
            .and_then(|()| self.check_end_of_epoch());
        match result {
            Err(e) if e.is_fatal() => {
                tracing::error!(node = %self.self_address, kind, error = %e, "Fatal consensus error");
                Err(e)
            }
            Err(e) => {
                tracing::warn!(node = %self.self_address, kind, error = %e, "Dropped message");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn dispatch(&mut self, message: ConsensusMessage) -> ConsensusResult<()> {
        match message {
            ConsensusMessage::Consensus(event) => self.process_consensus_event(event),
            ConsensusMessage::LocalTimeout(timeout) => self.process_local_timeout(timeout),
            ConsensusMessage::LocalSync(vertex_id) => match self.current.as_mut() {
                Some(state) => state.processor.process_local_sync(&mut state.store, vertex_id),
                None => Ok(()),
            },
            ConsensusMessage::GetVerticesRequest(request) => {
                if let Some(state) = &self.current {
                    state.store.process_get_vertices_request(&request);
                }
                Ok(())
            }
            ConsensusMessage::GetVerticesResponse(response) => match self.current.as_mut() {
                Some(state) => {
                    state.verifier.verify_vertices_response(&response)?;
                    state.store.process_get_vertices_response(response)
                }
                None => Ok(()),
            },
            ConsensusMessage::GetVerticesErrorResponse(response) => match self.current.as_mut() {
                Some(state) => {
                    state.verifier.verify_error_response(&response)?;
                    state.store.process_get_vertices_error_response(response)
                }
                None => Ok(()),
            },
            ConsensusMessage::CommittedStateSync(sync_done) => match self.current.as_mut() {
                Some(state) => state.store.process_committed_state_sync(&sync_done),
                None => Ok(()),
            },
            ConsensusMessage::EpochChange(change) => self.process_epoch_change(change),
            ConsensusMessage::GetEpochRequest(request) => {
                self.process_get_epoch_request(request);
                Ok(())
            }
            ConsensusMessage::GetEpochResponse(response) => {
                self.process_get_epoch_response(response);
                Ok(())
            }
        }
    }

    fn process_consensus_event(&mut self, event: ConsensusEvent) -> ConsensusResult<()> {
        let epoch = event.epoch();
        let current = self.current_epoch();
        if current.is_some_and(|current| epoch < current) {
            tracing::trace!(
                node = %self.self_address,
                kind = event.kind(),
                epoch,
                "CONSENSUS_EVENT: past epoch"
            );
            return Ok(());
        }
        if current.map_or(true, |current| epoch > current) {
            self.queue_event(event, current);
            return Ok(());
        }
        let Some(state) = self.current.as_mut() else {
            return Ok(());
        };

        if let Err(e) = state.verifier.verify_event(&event) {
            self.handles.counters.increment(CounterType::BftInvalidMessages);
            tracing::warn!(
                node = %self.self_address,
                kind = event.kind(),
                author = %event.author(),
                view = %event.view(),
                error = %e,
                "CONSENSUS_EVENT: failed verification"
            );
            return Ok(());
        }

        match event {
            ConsensusEvent::Vote(vote) => state.processor.process_vote(&mut state.store, vote),
            ConsensusEvent::NewView(new_view) => {
                state.processor.process_new_view(&mut state.store, new_view)
            }
            ConsensusEvent::Proposal(proposal) => {
                state.processor.process_proposal(&mut state.store, proposal)
            }
        }
    }

    /// Hold an event for a later epoch and ask its author for proof of the
    /// epoch that follows ours
    fn queue_event(&mut self, event: ConsensusEvent, current: Option<Epoch>) {
        let epoch = event.epoch();
        let base = current.unwrap_or(0);
        if epoch.saturating_sub(base) > self.config.max_future_epochs {
            tracing::debug!(
                node = %self.self_address,
                epoch,
                current = base,
                "CONSENSUS_EVENT: too far ahead, dropping"
            );
            return;
        }
        if self.queued_events() >= self.config.max_queued_epoch_events {
            tracing::warn!(
                node = %self.self_address,
                epoch,
                "CONSENSUS_EVENT: epoch queue full, dropping"
            );
            return;
        }

        tracing::debug!(
            node = %self.self_address,
            kind = event.kind(),
            epoch,
            current = base,
            "CONSENSUS_EVENT: queued for a later epoch"
        );
        let author = event.author();
        self.queued.entry(epoch).or_default().push(event);
        self.update_queue_size();

        if let Some(current) = current {
            self.handles.epoch_sender.send_get_epoch_request(
                author,
                GetEpochRequest {
                    author: self.self_address,
                    epoch: current + 1,
                },
            );
        }
    }

    fn update_queue_size(&self) {
        self.handles
            .counters
            .set(CounterType::EpochQueuedEvents, self.queued_events() as u64);
    }

    fn process_local_timeout(&mut self, timeout: LocalTimeout) -> ConsensusResult<()> {
        let Some(state) = self.current.as_mut() else {
            return Ok(());
        };
        if timeout.epoch != state.epoch {
            tracing::trace!(
                node = %self.self_address,
                epoch = timeout.epoch,
                view = %timeout.view,
                "LOCAL_TIMEOUT: other epoch"
            );
            return Ok(());
        }
        state.processor.process_local_timeout(&mut state.store, timeout.view)
    }

    fn process_epoch_change(&mut self, change: EpochChange) -> ConsensusResult<()> {
        let next = change.epoch();
        if let Some(current) = self.current_epoch() {
            if next <= current {
                tracing::debug!(
                    node = %self.self_address,
                    epoch = next,
                    current,
                    "EPOCH_CHANGE: not ahead of current epoch"
                );
                return Ok(());
            }
        }

        let validator_set = change.validator_set;
        let is_validator = validator_set.contains(&self.self_address);
        tracing::info!(
            node = %self.self_address,
            epoch = next,
            validators = validator_set.len(),
            is_validator,
            "EPOCH_CHANGE: starting epoch"
        );

        let mut store = VertexStore::genesis(
            self.self_address,
            &change.ancestor,
            self.handles.store_handles(),
            &self.config,
        )?;
        let verifier = MessageVerifier::new(
            next,
            store.root().id(),
            validator_set.clone(),
            self.handles.verifier.clone(),
            self.config.qc_cache_size,
        );
        let mut processor: Box<dyn BftEventProcessor> = if is_validator {
            Box::new(self.build_processor(next, &validator_set)?)
        } else {
            Box::new(EmptyBftEventProcessor)
        };

        self.handles.counters.increment(CounterType::EpochChanges);
        processor.start(&mut store)?;
        self.current = Some(EpochState {
            epoch: next,
            ancestor: change.ancestor,
            validator_set,
            store,
            verifier,
            processor,
        });

        // older epochs can never run now
        let later = self.queued.split_off(&(next + 1));
        let replay = self.queued.remove(&next).unwrap_or_default();
        self.queued = later;
        self.update_queue_size();
        for event in replay {
            if let Err(e) = self.process_consensus_event(event) {
                if e.is_fatal() {
                    return Err(e);
                }
                tracing::warn!(node = %self.self_address, error = %e, "Dropped replayed event");
            }
        }
        Ok(())
    }

    fn build_processor(
        &self,
        epoch: Epoch,
        validator_set: &Arc<ValidatorSet>,
    ) -> ConsensusResult<BftEventPreprocessor> {
        let safety_rules = SafetyRules::new(
            epoch,
            self.handles.signer.clone(),
            self.handles.safety_store.clone(),
            self.config.timestamp_tolerance_ms,
        )?;
        let pacemaker = Pacemaker::new(
            epoch,
            self.handles.timeout_sender.clone(),
            self.config.clone(),
            self.handles.counters.clone(),
        );
        let reducer = BftEventReducer::new(
            self.self_address,
            validator_set.clone(),
            WeightedRotatingLeaders::new(validator_set, self.config.proposer_cache_size),
            safety_rules,
            pacemaker,
            ProposalGenerator::new(self.handles.mempool.clone()),
            self.handles.bft_sender.clone(),
            self.handles.clock.clone(),
            self.handles.counters.clone(),
        );
        Ok(BftEventPreprocessor::new(
            self.self_address,
            reducer,
            self.config.sync_queue_capacity,
            self.handles.counters.clone(),
        ))
    }

    /// Once the end-of-epoch vertex commits, stop processing this epoch and
    /// push proof of it to the other validators
    fn check_end_of_epoch(&mut self) -> ConsensusResult<()> {
        let Some(state) = self.current.as_mut() else {
            return Ok(());
        };
        let Some(end) = state.store.take_end_of_epoch() else {
            return Ok(());
        };
        tracing::info!(
            node = %self.self_address,
            epoch = state.epoch,
            view = %end.view,
            "EPOCH_CHANGE: committed end of epoch, waiting for ledger"
        );
        state.processor = Box::new(EmptyBftEventProcessor);
        for validator in state.validator_set.addresses() {
            if validator == self.self_address {
                continue;
            }
            self.handles.epoch_sender.send_get_epoch_response(
                validator,
                GetEpochResponse {
                    author: self.self_address,
                    ancestor: Some(end),
                },
            );
        }
        Ok(())
    }

    fn process_get_epoch_request(&self, request: GetEpochRequest) {
        let ancestor = self
            .current
            .as_ref()
            .filter(|state| state.epoch == request.epoch)
            .map(|state| state.ancestor);
        tracing::debug!(
            node = %self.self_address,
            requester = %request.author,
            epoch = request.epoch,
            found = ancestor.is_some(),
            "GET_EPOCH_REQUEST"
        );
        self.handles.epoch_sender.send_get_epoch_response(
            request.author,
            GetEpochResponse {
                author: self.self_address,
                ancestor,
            },
        );
    }

    fn process_get_epoch_response(&self, response: GetEpochResponse) {
        let Some(ancestor) = response.ancestor else {
            tracing::debug!(
                node = %self.self_address,
                responder = %response.author,
                "GET_EPOCH_RESPONSE: peer has no proof"
            );
            return;
        };
        let current = self.current_epoch().unwrap_or(0);
        if ancestor.epoch < current {
            tracing::trace!(
                node = %self.self_address,
                epoch = ancestor.epoch,
                current,
                "GET_EPOCH_RESPONSE: stale"
            );
            return;
        }
        tracing::info!(
            node = %self.self_address,
            responder = %response.author,
            epoch = ancestor.epoch,
            view = %ancestor.view,
            "GET_EPOCH_RESPONSE: syncing ledger to end of epoch"
        );
        self.handles
            .ledger
            .sync_to(&ancestor, &[response.author], None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::GetVerticesResponse;
    use crate::safety_rules::InMemorySafetyStateStore;
    use crate::test_utils::{Network, TestEnv};
    use crate::types::{Vertex, View};
    use crate::qc::QuorumCertificate;
    use cadence_crypto::{EcdsaSigner, EcdsaVerifier};
    use cadence_primitives::H256;

    struct Harness {
        net: Network,
        env: Arc<TestEnv>,
        counters: Arc<SystemCounters>,
        manager: EpochManager,
    }

    fn harness_with_signer(net: Network, signer: Arc<dyn HashSigner>) -> Harness {
        let env = Arc::new(TestEnv::default());
        let counters = Arc::new(SystemCounters::new());
        let handles = ConsensusHandles {
            bft_sender: env.clone(),
            sync_sender: env.clone(),
            event_sender: env.clone(),
            timeout_sender: env.clone(),
            epoch_sender: env.clone(),
            ledger: env.clone(),
            mempool: env.clone(),
            clock: env.clone(),
            safety_store: Arc::new(InMemorySafetyStateStore::new()),
            signer,
            verifier: Arc::new(EcdsaVerifier),
            counters: counters.clone(),
        };
        let mut manager = EpochManager::new(BftConfig::default(), handles);
        manager
            .start(EpochChange {
                ancestor: net.genesis_ancestor(),
                validator_set: net.validator_set.clone(),
            })
            .unwrap();
        Harness {
            net,
            env,
            counters,
            manager,
        }
    }

    fn harness(i: usize) -> Harness {
        let net = Network::new(4);
        let signer = net.signer(i);
        harness_with_signer(net, signer)
    }

    fn epoch_one_end() -> VertexMetadata {
        VertexMetadata {
            epoch: 1,
            view: View::of(7),
            id: H256::from_bytes([7; 32]),
            state_version: 4,
            is_end_of_epoch: true,
        }
    }

    // ==================== Epoch Start Tests ====================

    #[test]
    fn test_validator_starts_first_view() {
        let h = harness(2);
        assert_eq!(h.manager.current_epoch(), Some(1));
        assert_eq!(h.counters.get(CounterType::EpochChanges), 1);
        let new_views = h.env.new_views.lock();
        assert_eq!(new_views.len(), 1);
        assert_eq!(new_views[0].0.view, View::of(1));
        assert_eq!(new_views[0].1, h.net.address(1));
    }

    #[test]
    fn test_non_validator_stays_passive() {
        let net = Network::new(4);
        let outsider = Arc::new(EcdsaSigner::from_seed("observer").unwrap());
        let h = harness_with_signer(net, outsider);
        assert_eq!(h.manager.current_epoch(), Some(1));
        assert!(h.env.new_views.lock().is_empty());
        assert!(h.env.timeouts.lock().is_empty());
    }

    #[test]
    fn test_older_epoch_change_ignored() {
        let mut h = harness(0);
        let change = EpochChange {
            ancestor: h.net.genesis_ancestor(),
            validator_set: h.net.validator_set.clone(),
        };
        h.manager.handle(ConsensusMessage::EpochChange(change)).unwrap();
        assert_eq!(h.counters.get(CounterType::EpochChanges), 1);
    }

    // ==================== Routing Tests ====================

    #[test]
    fn test_leader_proposes_after_new_view_quorum() {
        let mut h = harness(1);
        let qc = h.net.genesis_qc();
        for i in [0, 2, 3] {
            let nv = h.net.new_view(i, 1, &qc);
            h.manager
                .handle(ConsensusEvent::NewView(nv).into())
                .unwrap();
        }
        let proposals = h.env.proposals.lock();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].0.vertex.view(), View::of(1));
    }

    #[test]
    fn test_forged_event_counted_and_dropped() {
        let mut h = harness(1);
        let mut nv = h.net.new_view(0, 1, &h.net.genesis_qc());
        nv.author = h.net.address(2);
        h.manager
            .handle(ConsensusEvent::NewView(nv).into())
            .unwrap();
        assert_eq!(h.counters.get(CounterType::BftInvalidMessages), 1);
    }

    #[test]
    fn test_timeout_for_other_epoch_ignored() {
        let mut h = harness(0);
        let before = h.env.timeouts.lock().len();
        h.manager
            .handle(ConsensusMessage::LocalTimeout(LocalTimeout {
                epoch: 5,
                view: View::of(1),
            }))
            .unwrap();
        assert_eq!(h.env.timeouts.lock().len(), before);
        assert_eq!(h.counters.get(CounterType::BftTimeouts), 0);

        h.manager
            .handle(ConsensusMessage::LocalTimeout(LocalTimeout {
                epoch: 1,
                view: View::of(1),
            }))
            .unwrap();
        assert_eq!(h.counters.get(CounterType::BftTimeouts), 1);
    }

    #[test]
    fn test_sync_response_with_forged_qc_rejected() {
        let mut h = harness(3);
        let genesis_qc = h.net.genesis_qc();
        let genesis_md = *genesis_qc.proposed();
        let v1 = Vertex::new(1, View::of(1), genesis_qc, None);
        let md1 = h.net.metadata(&v1, 0);
        let v2 = Vertex::new(1, View::of(2), h.net.qc(md1, genesis_md, None, &[0, 1, 2]), None);
        let md2 = h.net.metadata(&v2, 0);
        let qc2 = h.net.qc(md2, md1, None, &[0, 1, 2]);

        let nv = h.net.new_view(0, 3, &qc2);
        h.manager
            .handle(ConsensusEvent::NewView(nv).into())
            .unwrap();
        let request = {
            let requests = h.env.sync_requests.lock();
            assert_eq!(requests.len(), 1);
            requests[0].1.clone()
        };
        assert_eq!(request.vertex_id, v2.id());

        // same vote data keeps the id, but one signature is not a quorum
        let forged = Vertex::new(1, View::of(2), h.net.qc(md1, genesis_md, None, &[0]), None);
        assert_eq!(forged.id(), v2.id());
        let responder = h.net.address(0);
        let response = |vertex: Vertex| GetVerticesResponse {
            responder,
            vertex_id: request.vertex_id,
            vertices: vec![vertex],
            opaque: request.opaque,
        };

        h.manager
            .handle(ConsensusMessage::GetVerticesResponse(response(forged)))
            .unwrap();
        assert_eq!(h.env.sync_requests.lock().len(), 1);

        // the genuine chain continues toward its parent
        h.manager
            .handle(ConsensusMessage::GetVerticesResponse(response(v2.clone())))
            .unwrap();
        let requests = h.env.sync_requests.lock();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].1.vertex_id, v1.id());
    }

    // ==================== Epoch Queue Tests ====================

    fn epoch_two_genesis_qc() -> QuorumCertificate {
        QuorumCertificate::genesis(&Vertex::genesis(&epoch_one_end()))
    }

    #[test]
    fn test_future_event_queued_and_replayed() {
        let mut h = harness(1);
        let qc = epoch_two_genesis_qc();
        for i in [0, 2, 3] {
            let nv = h.net.new_view_in(2, i, 1, &qc, &qc);
            h.manager
                .handle(ConsensusEvent::NewView(nv).into())
                .unwrap();
        }
        assert_eq!(h.manager.queued_events(), 3);
        assert_eq!(h.counters.get(CounterType::EpochQueuedEvents), 3);
        {
            let requests = h.env.epoch_requests.lock();
            assert_eq!(requests.len(), 3);
            assert_eq!(requests[0].0, h.net.address(0));
            assert_eq!(requests[0].1.epoch, 2);
        }
        assert!(h.env.proposals.lock().is_empty());

        let change = EpochChange {
            ancestor: epoch_one_end(),
            validator_set: h.net.validator_set.clone(),
        };
        h.manager.handle(ConsensusMessage::EpochChange(change)).unwrap();
        assert_eq!(h.manager.current_epoch(), Some(2));
        assert_eq!(h.manager.queued_events(), 0);
        let proposals = h.env.proposals.lock();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].0.vertex.epoch(), 2);
    }

    #[test]
    fn test_far_future_event_dropped() {
        let mut h = harness(1);
        let mut ancestor = epoch_one_end();
        ancestor.epoch = 9;
        let qc = QuorumCertificate::genesis(&Vertex::genesis(&ancestor));
        let nv = h.net.new_view_in(10, 0, 1, &qc, &qc);
        h.manager
            .handle(ConsensusEvent::NewView(nv).into())
            .unwrap();
        assert_eq!(h.manager.queued_events(), 0);
        assert!(h.env.epoch_requests.lock().is_empty());
    }

    // ==================== Epoch Proof Tests ====================

    #[test]
    fn test_epoch_request_answered_for_current_epoch() {
        let mut h = harness(0);
        let requester = h.net.address(3);
        h.manager
            .handle(ConsensusMessage::GetEpochRequest(GetEpochRequest {
                author: requester,
                epoch: 1,
            }))
            .unwrap();
        h.manager
            .handle(ConsensusMessage::GetEpochRequest(GetEpochRequest {
                author: requester,
                epoch: 2,
            }))
            .unwrap();
        let responses = h.env.epoch_responses.lock();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].1.ancestor, Some(h.net.genesis_ancestor()));
        assert_eq!(responses[1].1.ancestor, None);
    }

    #[test]
    fn test_epoch_response_syncs_ledger() {
        let mut h = harness(0);
        h.manager
            .handle(ConsensusMessage::GetEpochResponse(GetEpochResponse {
                author: h.net.address(2),
                ancestor: Some(epoch_one_end()),
            }))
            .unwrap();
        h.manager
            .handle(ConsensusMessage::GetEpochResponse(GetEpochResponse {
                author: h.net.address(2),
                ancestor: None,
            }))
            .unwrap();
        assert_eq!(*h.env.ledger_syncs.lock(), vec![epoch_one_end()]);
    }
}
