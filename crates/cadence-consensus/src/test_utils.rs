//! Fixtures shared by the unit tests of the event pipeline

use cadence_crypto::{EcdsaSigner, HashSigner};
use cadence_metrics::SystemCounters;
use cadence_primitives::{Address, H256, U256};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::BftConfig;
use crate::interfaces::{
    BftSender, Clock, EpochSender, Mempool, SyncVerticesSender, SyncedStateComputer,
    TimeoutSender, VertexStoreEventSender,
};
use crate::messages::{
    GetEpochRequest, GetEpochResponse, GetVerticesErrorResponse, GetVerticesRequest,
    GetVerticesResponse, LocalTimeout, NewView, Proposal, Vote,
};
use crate::pacemaker::Pacemaker;
use crate::preprocessor::BftEventPreprocessor;
use crate::processor::BftEventProcessor;
use crate::proposal_generator::ProposalGenerator;
use crate::proposer_election::WeightedRotatingLeaders;
use crate::qc::{QuorumCertificate, TimestampedSignature, TimestampedSignatures, VoteData};
use crate::reducer::BftEventReducer;
use crate::safety_rules::{InMemorySafetyStateStore, SafetyRules};
use crate::types::{Command, Vertex, VertexMetadata, View};
use crate::validator::{Validator, ValidatorSet};
use crate::vertex_store::{StoreHandles, VertexStore};

/// Records everything a replica sends
#[derive(Default)]
pub(crate) struct TestEnv {
    pub proposals: Mutex<Vec<(Proposal, Vec<Address>)>>,
    pub new_views: Mutex<Vec<(NewView, Address)>>,
    pub votes: Mutex<Vec<(Vote, Address)>>,
    pub timeouts: Mutex<Vec<LocalTimeout>>,
    pub sync_requests: Mutex<Vec<(Address, GetVerticesRequest)>>,
    pub sync_responses: Mutex<Vec<(Address, GetVerticesResponse)>>,
    pub synced: Mutex<Vec<H256>>,
    pub committed: Mutex<Vec<VertexMetadata>>,
    pub ledger_syncs: Mutex<Vec<VertexMetadata>>,
    pub epoch_requests: Mutex<Vec<(Address, GetEpochRequest)>>,
    pub epoch_responses: Mutex<Vec<(Address, GetEpochResponse)>>,
    pub end_of_epoch_from: Mutex<Option<u64>>,
    next_command: AtomicU64,
}

impl TestEnv {
    pub fn handles(self: &Arc<Self>, counters: &Arc<SystemCounters>) -> StoreHandles {
        StoreHandles {
            sync_sender: self.clone(),
            event_sender: self.clone(),
            ledger: self.clone(),
            counters: counters.clone(),
        }
    }
}

impl BftSender for TestEnv {
    fn broadcast_proposal(&self, proposal: Proposal, nodes: &[Address]) {
        self.proposals.lock().push((proposal, nodes.to_vec()));
    }
    fn send_new_view(&self, new_view: NewView, leader: Address) {
        self.new_views.lock().push((new_view, leader));
    }
    fn send_vote(&self, vote: Vote, leader: Address) {
        self.votes.lock().push((vote, leader));
    }
}

impl SyncVerticesSender for TestEnv {
    fn send_get_vertices_request(&self, node: Address, request: GetVerticesRequest) {
        self.sync_requests.lock().push((node, request));
    }
    fn send_get_vertices_response(&self, node: Address, response: GetVerticesResponse) {
        self.sync_responses.lock().push((node, response));
    }
    fn send_get_vertices_error_response(&self, _node: Address, _response: GetVerticesErrorResponse) {}
}

impl VertexStoreEventSender for TestEnv {
    fn send_synced_vertex(&self, vertex: &Vertex) {
        self.synced.lock().push(vertex.id());
    }
    fn send_committed_vertex(&self, _vertex: &Vertex, metadata: &VertexMetadata) {
        self.committed.lock().push(*metadata);
    }
}

impl TimeoutSender for TestEnv {
    fn schedule_timeout(&self, timeout: LocalTimeout, _after: Duration) {
        self.timeouts.lock().push(timeout);
    }
}

impl SyncedStateComputer for TestEnv {
    fn prepare(&self, vertex: &Vertex) -> bool {
        self.end_of_epoch_from
            .lock()
            .is_some_and(|view| vertex.view().number() >= view)
    }
    fn execute(&self, _vertex: &Vertex, _metadata: &VertexMetadata) {}
    fn sync_to(&self, target: &VertexMetadata, _peers: &[Address], _opaque: Option<H256>) -> bool {
        self.ledger_syncs.lock().push(*target);
        false
    }
}

impl EpochSender for TestEnv {
    fn send_get_epoch_request(&self, node: Address, request: GetEpochRequest) {
        self.epoch_requests.lock().push((node, request));
    }
    fn send_get_epoch_response(&self, node: Address, response: GetEpochResponse) {
        self.epoch_responses.lock().push((node, response));
    }
}

impl Mempool for TestEnv {
    fn get_commands(&self, count: usize, _exclude: &[Command]) -> Vec<Command> {
        (0..count)
            .map(|_| {
                let n = self.next_command.fetch_add(1, Ordering::Relaxed);
                Command::new(format!("cmd-{}", n).into_bytes())
            })
            .collect()
    }
}

impl Clock for TestEnv {
    fn now_ms(&self) -> u64 {
        1_000
    }
}

/// Equal-power validators sorted by address, so validator `i` leads views
/// `i`, `i + n`, ...
pub(crate) struct Network {
    signers: Vec<Arc<EcdsaSigner>>,
    pub validator_set: Arc<ValidatorSet>,
}

impl Network {
    pub fn new(n: usize) -> Self {
        Self::weighted(&vec![1; n])
    }

    /// Validator `i` (in address order) gets `powers[i]`. Leaders then follow
    /// the weighted schedule, so `proposal` only fits equal powers.
    pub fn weighted(powers: &[u64]) -> Self {
        let mut signers: Vec<Arc<EcdsaSigner>> = (0..powers.len())
            .map(|i| Arc::new(EcdsaSigner::from_seed(&format!("node-{}", i)).unwrap()))
            .collect();
        signers.sort_by_key(|s| s.address());
        let validator_set = Arc::new(
            ValidatorSet::new(
                signers
                    .iter()
                    .zip(powers)
                    .map(|(s, power)| Validator::new(s.address(), *power)),
            )
            .unwrap(),
        );
        Self {
            signers,
            validator_set,
        }
    }

    pub fn address(&self, i: usize) -> Address {
        self.signers[i].address()
    }

    pub fn signer(&self, i: usize) -> Arc<EcdsaSigner> {
        self.signers[i].clone()
    }

    pub fn genesis_ancestor(&self) -> VertexMetadata {
        VertexMetadata {
            epoch: 0,
            view: View::GENESIS,
            id: H256::ZERO,
            state_version: 0,
            is_end_of_epoch: true,
        }
    }

    pub fn genesis_qc(&self) -> QuorumCertificate {
        QuorumCertificate::genesis(&Vertex::genesis(&self.genesis_ancestor()))
    }

    /// Metadata a replica computes for `vertex` when nothing ends the epoch
    pub fn metadata(&self, vertex: &Vertex, state_version: u64) -> VertexMetadata {
        VertexMetadata {
            epoch: vertex.epoch(),
            view: vertex.view(),
            id: vertex.id(),
            state_version,
            is_end_of_epoch: false,
        }
    }

    /// Signed proposal by the leader of `view`
    pub fn proposal(&self, view: u64, qc: &QuorumCertificate, command: Option<&str>) -> Proposal {
        let signer = &self.signers[view as usize % self.signers.len()];
        let command = command.map(|c| Command::new(c.as_bytes().to_vec()));
        let vertex = Vertex::new(1, View::of(view), qc.clone(), command);
        let signature = signer.sign(&Proposal::signing_hash(&vertex.id())).unwrap();
        Proposal {
            author: signer.address(),
            vertex,
            committed_qc: self.genesis_qc(),
            signature,
        }
    }

    pub fn new_view(&self, i: usize, view: u64, qc: &QuorumCertificate) -> NewView {
        self.new_view_in(1, i, view, qc, &self.genesis_qc())
    }

    pub fn new_view_in(
        &self,
        epoch: u64,
        i: usize,
        view: u64,
        qc: &QuorumCertificate,
        committed_qc: &QuorumCertificate,
    ) -> NewView {
        let signer = &self.signers[i];
        let view = View::of(view);
        let signature = signer
            .sign(&NewView::signing_hash(epoch, view, qc))
            .unwrap();
        NewView {
            author: signer.address(),
            epoch,
            view,
            qc: qc.clone(),
            committed_qc: committed_qc.clone(),
            signature,
        }
    }

    pub fn vote(&self, i: usize, proposed: VertexMetadata, parent: VertexMetadata) -> Vote {
        let signer = &self.signers[i];
        let vote_data = VoteData::new(proposed, parent, None);
        let timestamp = 1_000;
        let signature = signer
            .sign(&Vote::signing_hash(&vote_data, timestamp))
            .unwrap();
        Vote {
            author: signer.address(),
            vote_data,
            timestamp,
            signature,
        }
    }

    /// QC signed by the listed validators
    pub fn qc(
        &self,
        proposed: VertexMetadata,
        parent: VertexMetadata,
        committed: Option<VertexMetadata>,
        signers: &[usize],
    ) -> QuorumCertificate {
        let vote_data = VoteData::new(proposed, parent, committed);
        let mut signatures = TimestampedSignatures::new();
        for &i in signers {
            let timestamp = 1_000 + i as u64;
            let signature = self.signers[i]
                .sign(&Vote::signing_hash(&vote_data, timestamp))
                .unwrap();
            signatures.insert(
                self.address(i),
                TimestampedSignature {
                    timestamp,
                    power: U256::one(),
                    signature,
                },
            );
        }
        QuorumCertificate::new(vote_data, signatures)
    }
}

/// One replica's processor and store at epoch 1
pub(crate) struct ReplicaFixture<P> {
    pub env: Arc<TestEnv>,
    pub counters: Arc<SystemCounters>,
    pub store: VertexStore,
    pub processor: P,
}

pub(crate) fn build_reducer(
    net: &Network,
    i: usize,
    env: &Arc<TestEnv>,
    counters: &Arc<SystemCounters>,
    config: &BftConfig,
) -> BftEventReducer {
    let safety_rules = SafetyRules::new(
        1,
        net.signer(i),
        Arc::new(InMemorySafetyStateStore::new()),
        config.timestamp_tolerance_ms,
    )
    .unwrap();
    let pacemaker = Pacemaker::new(1, env.clone(), config.clone(), counters.clone());
    BftEventReducer::new(
        net.address(i),
        net.validator_set.clone(),
        WeightedRotatingLeaders::new(&net.validator_set, config.proposer_cache_size),
        safety_rules,
        pacemaker,
        ProposalGenerator::new(env.clone()),
        env.clone(),
        env.clone(),
        counters.clone(),
    )
}

impl<P: BftEventProcessor> ReplicaFixture<P> {
    fn with(net: &Network, i: usize, build: impl FnOnce(&Arc<TestEnv>, &Arc<SystemCounters>) -> P) -> Self {
        let env = Arc::new(TestEnv::default());
        let counters = Arc::new(SystemCounters::new());
        let store = VertexStore::genesis(
            net.address(i),
            &net.genesis_ancestor(),
            env.handles(&counters),
            &BftConfig::default(),
        )
        .unwrap();
        let processor = build(&env, &counters);
        Self {
            env,
            counters,
            store,
            processor,
        }
    }

    pub fn start(&mut self) {
        self.processor.start(&mut self.store).unwrap();
    }
}

impl ReplicaFixture<BftEventReducer> {
    pub fn reducer(net: &Network, i: usize) -> Self {
        Self::with(net, i, |env, counters| {
            build_reducer(net, i, env, counters, &BftConfig::default())
        })
    }
}

impl ReplicaFixture<BftEventPreprocessor> {
    pub fn preprocessor(net: &Network, i: usize) -> Self {
        Self::with(net, i, |env, counters| {
            let config = BftConfig::default();
            let reducer = build_reducer(net, i, env, counters, &config);
            BftEventPreprocessor::new(
                net.address(i),
                reducer,
                config.sync_queue_capacity,
                counters.clone(),
            )
        })
    }
}
