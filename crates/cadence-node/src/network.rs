//! In-process network between replicas.
//!
//! Every replica owns one unbounded inbox. Peer traffic is delivered after
//! the configured latency; timers and ledger callbacks land in the same inbox
//! so the replica's driver sees a single ordered event stream.

use cadence_consensus::{
    BftSender, ConsensusEvent, ConsensusMessage, EpochSender, GetEpochRequest, GetEpochResponse,
    GetVerticesErrorResponse, GetVerticesRequest, GetVerticesResponse, LocalTimeout, NewView,
    Proposal, SyncVerticesSender, TimeoutSender, Vertex, VertexMetadata, VertexStoreEventSender,
    Vote,
};
use cadence_primitives::Address;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Receiving end of a replica's inbox
pub type Inbox = mpsc::UnboundedReceiver<ConsensusMessage>;

/// Routes messages to replica inboxes by address
pub struct Router {
    inboxes: HashMap<Address, mpsc::UnboundedSender<ConsensusMessage>>,
    latency: Duration,
}

impl Router {
    /// Create the inboxes for `addresses`
    pub fn new(addresses: &[Address], latency: Duration) -> (Arc<Self>, Vec<Inbox>) {
        let mut inboxes = HashMap::with_capacity(addresses.len());
        let mut receivers = Vec::with_capacity(addresses.len());
        for address in addresses {
            let (tx, rx) = mpsc::unbounded_channel();
            inboxes.insert(*address, tx);
            receivers.push(rx);
        }
        (Arc::new(Self { inboxes, latency }), receivers)
    }

    /// One-way latency applied to peer traffic
    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// Deliver `message` to `to` after `delay`. Must be called from within
    /// the runtime.
    pub fn send_after(&self, to: Address, message: ConsensusMessage, delay: Duration) {
        let Some(inbox) = self.inboxes.get(&to).cloned() else {
            tracing::warn!(to = %to, kind = message.kind(), "No route to node");
            return;
        };
        if delay.is_zero() {
            Self::push(&inbox, to, message);
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::push(&inbox, to, message);
        });
    }

    /// Deliver peer traffic with the network latency
    pub fn send(&self, to: Address, message: ConsensusMessage) {
        self.send_after(to, message, self.latency);
    }

    fn push(inbox: &mpsc::UnboundedSender<ConsensusMessage>, to: Address, message: ConsensusMessage) {
        if inbox.send(message).is_err() {
            tracing::trace!(to = %to, "Inbox closed, message discarded");
        }
    }
}

/// Outbound seams of one replica
pub struct ReplicaSender {
    self_address: Address,
    router: Arc<Router>,
}

impl ReplicaSender {
    /// Sender for the replica at `self_address`
    pub fn new(self_address: Address, router: Arc<Router>) -> Self {
        Self {
            self_address,
            router,
        }
    }

    fn send_local(&self, message: ConsensusMessage, after: Duration) {
        self.router.send_after(self.self_address, message, after);
    }
}

impl BftSender for ReplicaSender {
    fn broadcast_proposal(&self, proposal: Proposal, nodes: &[Address]) {
        for node in nodes {
            self.router.send(
                *node,
                ConsensusEvent::Proposal(proposal.clone()).into(),
            );
        }
    }

    fn send_new_view(&self, new_view: NewView, leader: Address) {
        self.router
            .send(leader, ConsensusEvent::NewView(new_view).into());
    }

    fn send_vote(&self, vote: Vote, leader: Address) {
        self.router.send(leader, ConsensusEvent::Vote(vote).into());
    }
}

impl SyncVerticesSender for ReplicaSender {
    fn send_get_vertices_request(&self, node: Address, request: GetVerticesRequest) {
        self.router
            .send(node, ConsensusMessage::GetVerticesRequest(request));
    }

    fn send_get_vertices_response(&self, node: Address, response: GetVerticesResponse) {
        self.router
            .send(node, ConsensusMessage::GetVerticesResponse(response));
    }

    fn send_get_vertices_error_response(&self, node: Address, response: GetVerticesErrorResponse) {
        self.router
            .send(node, ConsensusMessage::GetVerticesErrorResponse(response));
    }
}

impl VertexStoreEventSender for ReplicaSender {
    fn send_synced_vertex(&self, vertex: &Vertex) {
        self.send_local(ConsensusMessage::LocalSync(vertex.id()), Duration::ZERO);
    }

    fn send_committed_vertex(&self, vertex: &Vertex, metadata: &VertexMetadata) {
        tracing::trace!(
            node = %self.self_address.short(),
            epoch = metadata.epoch,
            view = %metadata.view,
            vertex = %vertex.id().short(),
            "Committed"
        );
    }
}

impl TimeoutSender for ReplicaSender {
    fn schedule_timeout(&self, timeout: LocalTimeout, after: Duration) {
        self.send_local(ConsensusMessage::LocalTimeout(timeout), after);
    }
}

impl EpochSender for ReplicaSender {
    fn send_get_epoch_request(&self, node: Address, request: GetEpochRequest) {
        self.router
            .send(node, ConsensusMessage::GetEpochRequest(request));
    }

    fn send_get_epoch_response(&self, node: Address, response: GetEpochResponse) {
        self.router
            .send(node, ConsensusMessage::GetEpochResponse(response));
    }
}
