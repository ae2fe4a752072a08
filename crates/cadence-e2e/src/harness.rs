//! Deterministic simulation of a validator network.
//!
//! All traffic, including each replica's own timers and ledger callbacks, is
//! queued in a single [`ControlledNetwork`] ordered by virtual arrival time and
//! then by send order. [`DeterministicTest`] pops one message at a time and
//! hands it to the receiving replica's epoch manager, after asking the
//! configured [`MessageMutator`] whether a network message gets through.

use cadence_consensus::{
    BftConfig, BftSender, Clock, Command, ConsensusHandles, ConsensusMessage, CommittedStateSync,
    ConsensusEvent, EpochChange, EpochManager, EpochSender, GetEpochRequest, GetEpochResponse,
    GetVerticesErrorResponse, GetVerticesRequest, GetVerticesResponse, InMemorySafetyStateStore,
    LocalTimeout, Mempool, NewView, Proposal, SyncVerticesSender, SyncedStateComputer,
    TimeoutSender, Validator, ValidatorSet, Vertex, VertexMetadata, VertexStoreEventSender, View,
    Vote,
};
use cadence_crypto::{EcdsaSigner, EcdsaVerifier, HashSigner};
use cadence_metrics::{CounterType, SystemCounters};
use cadence_primitives::{Address, Epoch, StateVersion, H256};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use crate::{E2EError, E2EResult};

/// Base of every replica's wall clock
const CLOCK_BASE_MS: u64 = 1_000_000_000;

/// Sender and receiver of a queued message, as replica indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    /// Sending replica
    pub sender: usize,
    /// Receiving replica
    pub receiver: usize,
}

impl ChannelId {
    /// Channel a replica uses for its own timers and callbacks
    pub fn local(node: usize) -> Self {
        Self {
            sender: node,
            receiver: node,
        }
    }
}

/// Message in flight
#[derive(Debug, Clone)]
pub struct ControlledMessage {
    /// Route
    pub channel: ChannelId,
    /// Payload
    pub message: ConsensusMessage,
    /// Virtual delivery time
    pub arrival_ms: u64,
}

impl ControlledMessage {
    /// Timers and ledger callbacks never cross the network
    pub fn is_local(&self) -> bool {
        self.message.is_local()
    }

    /// Proposal payload, if any
    pub fn proposal(&self) -> Option<&Proposal> {
        match &self.message {
            ConsensusMessage::Consensus(ConsensusEvent::Proposal(proposal)) => Some(proposal),
            _ => None,
        }
    }
}

struct Pending {
    seq: u64,
    message: ControlledMessage,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // reversed: BinaryHeap pops the earliest arrival first
    fn cmp(&self, other: &Self) -> Ordering {
        (other.message.arrival_ms, other.seq).cmp(&(self.message.arrival_ms, self.seq))
    }
}

#[derive(Default)]
struct NetworkState {
    now_ms: u64,
    seq: u64,
    queue: BinaryHeap<Pending>,
}

/// Virtual-time message queue shared by every replica of a test
pub struct ControlledNetwork {
    addresses: Vec<Address>,
    index: HashMap<Address, usize>,
    latency_ms: u64,
    state: Mutex<NetworkState>,
}

impl ControlledNetwork {
    /// Network between `addresses`, delivering every message after `latency_ms`
    pub fn new(addresses: Vec<Address>, latency_ms: u64) -> Self {
        let index = addresses
            .iter()
            .enumerate()
            .map(|(i, address)| (*address, i))
            .collect();
        Self {
            addresses,
            index,
            latency_ms,
            state: Mutex::new(NetworkState::default()),
        }
    }

    /// Current virtual time
    pub fn now_ms(&self) -> u64 {
        self.state.lock().now_ms
    }

    /// Replica index of `address`
    pub fn index_of(&self, address: &Address) -> Option<usize> {
        self.index.get(address).copied()
    }

    /// Address of replica `node`
    pub fn address(&self, node: usize) -> Address {
        self.addresses[node]
    }

    /// Messages not yet delivered
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn push(&self, channel: ChannelId, message: ConsensusMessage, delay_ms: u64) {
        let mut state = self.state.lock();
        let seq = state.seq;
        state.seq += 1;
        let arrival_ms = state.now_ms.saturating_add(delay_ms);
        state.queue.push(Pending {
            seq,
            message: ControlledMessage {
                channel,
                message,
                arrival_ms,
            },
        });
    }

    fn send(&self, sender: usize, receiver: &Address, message: ConsensusMessage) {
        match self.index_of(receiver) {
            Some(receiver) => self.push(ChannelId { sender, receiver }, message, self.latency_ms),
            None => tracing::trace!(%receiver, "Message to unknown node dropped"),
        }
    }

    fn send_local(&self, node: usize, message: ConsensusMessage, delay_ms: u64) {
        self.push(ChannelId::local(node), message, delay_ms);
    }

    /// Take the next message and advance virtual time to its arrival
    pub(crate) fn pop(&self) -> Option<ControlledMessage> {
        let mut state = self.state.lock();
        let next = state.queue.pop()?;
        state.now_ms = state.now_ms.max(next.message.arrival_ms);
        Some(next.message)
    }
}

/// Outbound seams of one replica, all feeding the controlled network
pub struct ControlledSender {
    node: usize,
    network: Arc<ControlledNetwork>,
}

impl ControlledSender {
    /// Sender for replica `node`
    pub fn new(node: usize, network: Arc<ControlledNetwork>) -> Self {
        Self { node, network }
    }
}

impl BftSender for ControlledSender {
    fn broadcast_proposal(&self, proposal: Proposal, nodes: &[Address]) {
        for node in nodes {
            self.network.send(
                self.node,
                node,
                ConsensusEvent::Proposal(proposal.clone()).into(),
            );
        }
    }

    fn send_new_view(&self, new_view: NewView, leader: Address) {
        self.network
            .send(self.node, &leader, ConsensusEvent::NewView(new_view).into());
    }

    fn send_vote(&self, vote: Vote, leader: Address) {
        self.network
            .send(self.node, &leader, ConsensusEvent::Vote(vote).into());
    }
}

impl SyncVerticesSender for ControlledSender {
    fn send_get_vertices_request(&self, node: Address, request: GetVerticesRequest) {
        self.network
            .send(self.node, &node, ConsensusMessage::GetVerticesRequest(request));
    }

    fn send_get_vertices_response(&self, node: Address, response: GetVerticesResponse) {
        self.network
            .send(self.node, &node, ConsensusMessage::GetVerticesResponse(response));
    }

    fn send_get_vertices_error_response(&self, node: Address, response: GetVerticesErrorResponse) {
        self.network.send(
            self.node,
            &node,
            ConsensusMessage::GetVerticesErrorResponse(response),
        );
    }
}

impl VertexStoreEventSender for ControlledSender {
    fn send_synced_vertex(&self, vertex: &Vertex) {
        self.network
            .send_local(self.node, ConsensusMessage::LocalSync(vertex.id()), 0);
    }

    fn send_committed_vertex(&self, vertex: &Vertex, metadata: &VertexMetadata) {
        tracing::trace!(
            node = self.node,
            view = %metadata.view,
            vertex = %vertex.id().short(),
            "Committed"
        );
    }
}

impl TimeoutSender for ControlledSender {
    fn schedule_timeout(&self, timeout: LocalTimeout, after: Duration) {
        self.network.send_local(
            self.node,
            ConsensusMessage::LocalTimeout(timeout),
            after.as_millis() as u64,
        );
    }
}

impl EpochSender for ControlledSender {
    fn send_get_epoch_request(&self, node: Address, request: GetEpochRequest) {
        self.network
            .send(self.node, &node, ConsensusMessage::GetEpochRequest(request));
    }

    fn send_get_epoch_response(&self, node: Address, response: GetEpochResponse) {
        self.network
            .send(self.node, &node, ConsensusMessage::GetEpochResponse(response));
    }
}

/// Wall clock derived from virtual time, optionally running backwards
pub struct VirtualClock {
    network: Arc<ControlledNetwork>,
    drift: i64,
}

impl VirtualClock {
    /// Clock advancing `drift` ms per virtual ms
    pub fn new(network: Arc<ControlledNetwork>, drift: i64) -> Self {
        Self { network, drift }
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> u64 {
        let elapsed = self.network.now_ms() as i128 * self.drift as i128;
        (CLOCK_BASE_MS as i128 + elapsed).clamp(0, u64::MAX as i128) as u64
    }
}

/// Mempool handing out unique commands tagged with the replica index
pub struct CountingMempool {
    node: usize,
    next: AtomicU64,
}

impl CountingMempool {
    /// Mempool of replica `node`
    pub fn new(node: usize) -> Self {
        Self {
            node,
            next: AtomicU64::new(0),
        }
    }
}

impl Mempool for CountingMempool {
    fn get_commands(&self, count: usize, _exclude: &[Command]) -> Vec<Command> {
        (0..count)
            .map(|_| {
                let n = self.next.fetch_add(1, AtomicOrdering::Relaxed);
                Command::new(format!("node-{}-cmd-{}", self.node, n).into_bytes())
            })
            .collect()
    }
}

/// A vertex the ledger executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedEntry {
    /// Metadata the store committed it with
    pub metadata: VertexMetadata,
    /// Its command
    pub command: Option<Command>,
}

struct LedgerState {
    version: StateVersion,
    executed: Vec<CommittedEntry>,
    started_epoch: Epoch,
}

/// Ledger that records executed vertices and emits the ledger callbacks of a
/// real state computer
pub struct MockLedger {
    node: usize,
    network: Arc<ControlledNetwork>,
    validator_set: Arc<ValidatorSet>,
    epoch_view_limit: Option<u64>,
    state: Mutex<LedgerState>,
}

impl MockLedger {
    /// Ledger of replica `node`. Vertices at or beyond `epoch_view_limit`
    /// end their epoch, and every epoch keeps `validator_set`.
    pub fn new(
        node: usize,
        network: Arc<ControlledNetwork>,
        validator_set: Arc<ValidatorSet>,
        epoch_view_limit: Option<u64>,
    ) -> Self {
        Self {
            node,
            network,
            validator_set,
            epoch_view_limit,
            state: Mutex::new(LedgerState {
                version: 0,
                executed: Vec::new(),
                started_epoch: 1,
            }),
        }
    }

    /// State version reached by execution or sync
    pub fn version(&self) -> StateVersion {
        self.state.lock().version
    }

    /// Every vertex executed, in order
    pub fn executed(&self) -> Vec<CommittedEntry> {
        self.state.lock().executed.clone()
    }

    /// Commands executed, keyed by the epoch and state version they produced
    pub fn commands(&self) -> HashMap<(Epoch, StateVersion), Command> {
        self.state
            .lock()
            .executed
            .iter()
            .filter_map(|entry| {
                entry.command.clone().map(|command| {
                    ((entry.metadata.epoch, entry.metadata.state_version), command)
                })
            })
            .collect()
    }

    fn start_next_epoch(&self, state: &mut LedgerState, ancestor: &VertexMetadata) {
        let next = ancestor.epoch + 1;
        if next <= state.started_epoch {
            return;
        }
        state.started_epoch = next;
        tracing::debug!(node = self.node, epoch = next, "Ledger reached end of epoch");
        self.network.send_local(
            self.node,
            ConsensusMessage::EpochChange(EpochChange {
                ancestor: *ancestor,
                validator_set: self.validator_set.clone(),
            }),
            0,
        );
    }
}

impl SyncedStateComputer for MockLedger {
    fn prepare(&self, vertex: &Vertex) -> bool {
        self.epoch_view_limit
            .is_some_and(|limit| vertex.view().number() >= limit)
    }

    fn execute(&self, vertex: &Vertex, metadata: &VertexMetadata) {
        let mut state = self.state.lock();
        state.version = metadata.state_version;
        state.executed.push(CommittedEntry {
            metadata: *metadata,
            command: vertex.command().cloned(),
        });
        if metadata.is_end_of_epoch {
            self.start_next_epoch(&mut state, metadata);
        }
    }

    fn sync_to(&self, target: &VertexMetadata, peers: &[Address], opaque: Option<H256>) -> bool {
        let mut state = self.state.lock();
        if target.is_end_of_epoch {
            self.start_next_epoch(&mut state, target);
        }
        if state.version >= target.state_version {
            return true;
        }
        tracing::debug!(
            node = self.node,
            from = state.version,
            to = target.state_version,
            peers = peers.len(),
            "Ledger syncing"
        );
        state.version = target.state_version;
        if let Some(opaque) = opaque {
            self.network.send_local(
                self.node,
                ConsensusMessage::CommittedStateSync(CommittedStateSync {
                    state_version: target.state_version,
                    opaque,
                }),
                self.network.latency_ms,
            );
        }
        false
    }
}

/// Decides whether a network message is delivered
pub trait MessageMutator: Send {
    /// `false` drops the message
    fn deliver(&mut self, message: &ControlledMessage, rng: &mut ChaCha8Rng) -> bool;
}

impl<F> MessageMutator for F
where
    F: FnMut(&ControlledMessage, &mut ChaCha8Rng) -> bool + Send,
{
    fn deliver(&mut self, message: &ControlledMessage, rng: &mut ChaCha8Rng) -> bool {
        self(message, rng)
    }
}

/// Drop every copy of the proposals for views divisible by `k`
pub fn drop_every_kth_proposal(k: u64) -> impl MessageMutator {
    move |message: &ControlledMessage, _: &mut ChaCha8Rng| {
        message
            .proposal()
            .map_or(true, |p| p.vertex.view().number() % k != 0)
    }
}

/// Drop each network message with probability `rate`
pub fn drop_random(rate: f64) -> impl MessageMutator {
    move |_: &ControlledMessage, rng: &mut ChaCha8Rng| !rng.gen_bool(rate)
}

/// Cut replica `node` off from every peer until `until_ms`
pub fn isolate_until(node: usize, until_ms: u64) -> impl MessageMutator {
    move |message: &ControlledMessage, _: &mut ChaCha8Rng| {
        let touches = message.channel.sender == node || message.channel.receiver == node;
        !touches || message.arrival_ms >= until_ms
    }
}

/// One simulated replica
pub struct TestNode {
    /// Signing address
    pub address: Address,
    /// Consensus instance
    pub manager: EpochManager,
    /// Its counters
    pub counters: Arc<SystemCounters>,
    /// Its ledger
    pub ledger: Arc<MockLedger>,
}

/// Builder for [`DeterministicTest`]
pub struct DeterministicTestBuilder {
    num_nodes: usize,
    powers: Option<Vec<u64>>,
    seed: u64,
    config: BftConfig,
    latency_ms: u64,
    epoch_view_limit: Option<u64>,
    clock_drift: i64,
    mutator: Option<Box<dyn MessageMutator>>,
}

impl Default for DeterministicTestBuilder {
    fn default() -> Self {
        Self {
            num_nodes: 4,
            powers: None,
            seed: 0,
            config: BftConfig::default(),
            latency_ms: 1,
            epoch_view_limit: None,
            clock_drift: 1,
            mutator: None,
        }
    }
}

impl DeterministicTestBuilder {
    /// Number of equal-power validators
    pub fn num_nodes(mut self, n: usize) -> Self {
        self.num_nodes = n;
        self
    }

    /// Voting power per validator; sets the node count
    pub fn powers(mut self, powers: Vec<u64>) -> Self {
        self.num_nodes = powers.len();
        self.powers = Some(powers);
        self
    }

    /// Seed for the mutator's random source
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Consensus configuration shared by every replica
    pub fn config(mut self, config: BftConfig) -> Self {
        self.config = config;
        self
    }

    /// One-way network latency
    pub fn latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// End every epoch at this view
    pub fn epoch_view_limit(mut self, view: u64) -> Self {
        self.epoch_view_limit = Some(view);
        self
    }

    /// Wall-clock ms per virtual ms; negative runs clocks backwards
    pub fn clock_drift(mut self, drift: i64) -> Self {
        self.clock_drift = drift;
        self
    }

    /// Message filter applied to network traffic
    pub fn mutator(mut self, mutator: impl MessageMutator + 'static) -> Self {
        self.mutator = Some(Box::new(mutator));
        self
    }

    /// Create the replicas. Nothing runs until [`DeterministicTest::start`].
    pub fn build(self) -> E2EResult<DeterministicTest> {
        if self.num_nodes == 0 {
            return Err(E2EError::Setup("at least one node required".into()));
        }
        let mut signers = (0..self.num_nodes)
            .map(|i| {
                EcdsaSigner::from_seed(&format!("validator-{}", i))
                    .map(|signer| (i, Arc::new(signer)))
                    .map_err(|e| E2EError::Setup(e.to_string()))
            })
            .collect::<E2EResult<Vec<_>>>()?;
        // the power list follows seed order, replicas are indexed by address
        let powers = self.powers.unwrap_or_else(|| vec![1; self.num_nodes]);
        let validator_set = Arc::new(
            ValidatorSet::new(
                signers
                    .iter()
                    .map(|(i, signer)| Validator::new(signer.address(), powers[*i])),
            )
            .map_err(|e| E2EError::Setup(e.to_string()))?,
        );
        signers.sort_by_key(|(_, signer)| signer.address());

        let addresses: Vec<Address> = signers.iter().map(|(_, s)| s.address()).collect();
        let network = Arc::new(ControlledNetwork::new(addresses, self.latency_ms));

        let nodes = signers
            .into_iter()
            .enumerate()
            .map(|(node, (_, signer))| {
                let sender = Arc::new(ControlledSender::new(node, network.clone()));
                let ledger = Arc::new(MockLedger::new(
                    node,
                    network.clone(),
                    validator_set.clone(),
                    self.epoch_view_limit,
                ));
                let counters = Arc::new(SystemCounters::new());
                let handles = ConsensusHandles {
                    bft_sender: sender.clone(),
                    sync_sender: sender.clone(),
                    event_sender: sender.clone(),
                    timeout_sender: sender.clone(),
                    epoch_sender: sender,
                    ledger: ledger.clone(),
                    mempool: Arc::new(CountingMempool::new(node)),
                    clock: Arc::new(VirtualClock::new(network.clone(), self.clock_drift)),
                    safety_store: Arc::new(InMemorySafetyStateStore::new()),
                    signer: signer.clone(),
                    verifier: Arc::new(EcdsaVerifier),
                    counters: counters.clone(),
                };
                TestNode {
                    address: signer.address(),
                    manager: EpochManager::new(self.config.clone(), handles),
                    counters,
                    ledger,
                }
            })
            .collect();

        let mutator = self.mutator.unwrap_or_else(|| -> Box<dyn MessageMutator> {
            Box::new(|_: &ControlledMessage, _: &mut ChaCha8Rng| true)
        });
        Ok(DeterministicTest {
            network,
            nodes,
            validator_set,
            rng: ChaCha8Rng::seed_from_u64(self.seed),
            mutator,
            steps: 0,
            dropped: 0,
        })
    }
}

/// A network of replicas driven one message at a time
pub struct DeterministicTest {
    network: Arc<ControlledNetwork>,
    nodes: Vec<TestNode>,
    validator_set: Arc<ValidatorSet>,
    rng: ChaCha8Rng,
    mutator: Box<dyn MessageMutator>,
    steps: u64,
    dropped: u64,
}

impl DeterministicTest {
    /// Start configuring a test
    pub fn builder() -> DeterministicTestBuilder {
        DeterministicTestBuilder::default()
    }

    /// Start epoch 1 on every replica
    pub fn start(&mut self) -> E2EResult<()> {
        let genesis_ancestor = VertexMetadata {
            epoch: 0,
            view: View::GENESIS,
            id: H256::ZERO,
            state_version: 0,
            is_end_of_epoch: true,
        };
        for (i, node) in self.nodes.iter_mut().enumerate() {
            node.manager
                .start(EpochChange {
                    ancestor: genesis_ancestor,
                    validator_set: self.validator_set.clone(),
                })
                .map_err(|source| E2EError::Consensus { node: i, source })?;
        }
        Ok(())
    }

    /// Deliver the next message. Returns `false` once nothing is queued.
    pub fn step(&mut self) -> E2EResult<bool> {
        let Some(message) = self.network.pop() else {
            return Ok(false);
        };
        self.steps += 1;
        if !message.is_local() && !self.mutator.deliver(&message, &mut self.rng) {
            self.dropped += 1;
            tracing::trace!(
                from = message.channel.sender,
                to = message.channel.receiver,
                kind = message.message.kind(),
                "Dropped by mutator"
            );
            return Ok(true);
        }
        let receiver = message.channel.receiver;
        self.nodes[receiver]
            .manager
            .handle(message.message)
            .map_err(|source| E2EError::Consensus {
                node: receiver,
                source,
            })?;
        Ok(true)
    }

    /// Step until `done` holds, failing after `max_steps` deliveries
    pub fn run_until(
        &mut self,
        done: impl Fn(&DeterministicTest) -> bool,
        max_steps: u64,
    ) -> E2EResult<()> {
        let limit = self.steps + max_steps;
        while !done(self) {
            if self.steps >= limit || !self.step()? {
                return Err(E2EError::StepLimit {
                    steps: self.steps,
                    now_ms: self.now_ms(),
                });
            }
        }
        Ok(())
    }

    /// Step until virtual time reaches `until_ms`
    pub fn run_for(&mut self, until_ms: u64, max_steps: u64) -> E2EResult<()> {
        self.run_until(|t| t.now_ms() >= until_ms, max_steps)
    }

    /// Current virtual time
    pub fn now_ms(&self) -> u64 {
        self.network.now_ms()
    }

    /// Messages delivered or dropped so far
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Network messages the mutator dropped
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Replicas, indexed by address order
    pub fn nodes(&self) -> &[TestNode] {
        &self.nodes
    }

    /// Replica `i`
    pub fn node(&self, i: usize) -> &TestNode {
        &self.nodes[i]
    }

    /// Counters of replica `i`
    pub fn counters(&self, i: usize) -> &SystemCounters {
        &self.nodes[i].counters
    }

    /// Sum of `counter` over every replica
    pub fn total(&self, counter: CounterType) -> u64 {
        self.nodes.iter().map(|n| n.counters.get(counter)).sum()
    }

    /// Smallest value of `counter` over every replica
    pub fn min(&self, counter: CounterType) -> u64 {
        self.nodes
            .iter()
            .map(|n| n.counters.get(counter))
            .min()
            .unwrap_or(0)
    }

    /// Epoch of the slowest replica
    pub fn min_epoch(&self) -> Epoch {
        self.nodes
            .iter()
            .map(|n| n.manager.current_epoch().unwrap_or(0))
            .min()
            .unwrap_or(0)
    }

    /// The committed chains of all replicas agree wherever they overlap
    pub fn assert_no_fork(&self) -> E2EResult<()> {
        let mut seen: HashMap<(Epoch, StateVersion), (usize, Command)> = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            for (key, command) in node.ledger.commands() {
                match seen.get(&key) {
                    Some((other, existing)) if *existing != command => {
                        return Err(E2EError::Assertion(format!(
                            "replicas {} and {} committed different commands at epoch {} version {}",
                            other, i, key.0, key.1
                        )));
                    }
                    Some(_) => {}
                    None => {
                        seen.insert(key, (i, command));
                    }
                }
            }
        }
        Ok(())
    }
}
