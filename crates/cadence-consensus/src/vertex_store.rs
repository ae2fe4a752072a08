//! Speculative vertex tree rooted at the last committed vertex.
//!
//! The store owns every uncommitted vertex this replica knows of, the highest
//! QC and the highest committed QC. Commits walk from the root to the target,
//! hand each vertex to the ledger and prune everything that does not descend
//! from the new root.
//!
//! Missing vertices are fetched with the GetVertices RPC. A sync is keyed by
//! the id of the vertex the QC certifies and that key travels as the request's
//! opaque value. Two kinds exist:
//!
//! - QC sync: fetch the certified vertex, then its ancestors one at a time,
//!   until one connects to the local tree.
//! - Committed sync: when the committed vertex of the peer's highest committed
//!   QC is above the root and unknown, fetch the three vertices ending at that
//!   QC, sync the ledger to the committed vertex and rebuild the store rooted
//!   there.

use cadence_metrics::{CounterType, SystemCounters};
use cadence_primitives::{Address, Epoch, H256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::BftConfig;
use crate::error::{ConsensusError, ConsensusResult};
use crate::interfaces::{SyncVerticesSender, SyncedStateComputer, VertexStoreEventSender};
use crate::messages::{
    CommittedStateSync, GetVerticesErrorResponse, GetVerticesRequest, GetVerticesResponse,
};
use crate::qc::QuorumCertificate;
use crate::types::{Command, Vertex, VertexMetadata, View};

/// Number of vertices fetched for a committed sync: the committed vertex and
/// the two descendants whose QCs prove it.
const COMMITTED_SYNC_COUNT: usize = 3;

/// Collaborators shared by every store a replica builds
#[derive(Clone)]
pub struct StoreHandles {
    /// GetVertices RPC
    pub sync_sender: Arc<dyn SyncVerticesSender>,
    /// Synced/committed notifications
    pub event_sender: Arc<dyn VertexStoreEventSender>,
    /// Ledger
    pub ledger: Arc<dyn SyncedStateComputer>,
    /// Counters
    pub counters: Arc<SystemCounters>,
}

#[derive(Debug, Clone)]
struct StoredVertex {
    vertex: Vertex,
    metadata: VertexMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncStage {
    /// Waiting for the three vertices ending at the committed QC
    CommittedVertices,
    /// Waiting for the ledger to reach the committed vertex
    LedgerSync,
    /// Walking back from the QC's vertex to a known ancestor
    QcVertices,
}

#[derive(Debug)]
struct SyncState {
    qc: QuorumCertificate,
    committed_qc: QuorumCertificate,
    author: Address,
    stage: SyncStage,
    /// Newest first
    fetched: Vec<Vertex>,
    attempts: u32,
    requested: H256,
    count: usize,
}

/// The vertex tree
pub struct VertexStore {
    self_address: Address,
    epoch: Epoch,
    root_id: H256,
    entries: HashMap<H256, StoredVertex>,
    highest_qc: QuorumCertificate,
    highest_committed_qc: QuorumCertificate,
    syncing: HashMap<H256, SyncState>,
    end_of_epoch: Option<VertexMetadata>,
    end_of_epoch_seen: bool,
    handles: StoreHandles,
    max_sync_attempts: u32,
    get_vertices_max: usize,
}

impl VertexStore {
    /// Create a store rooted at `root`.
    ///
    /// `root_qc` must certify `root`, and `root_committed_qc` must commit it.
    pub fn new(
        self_address: Address,
        root: Vertex,
        root_qc: QuorumCertificate,
        root_committed_qc: QuorumCertificate,
        handles: StoreHandles,
        config: &BftConfig,
    ) -> ConsensusResult<Self> {
        let mut store = Self {
            self_address,
            epoch: root.epoch(),
            root_id: root.id(),
            entries: HashMap::new(),
            highest_qc: root_qc.clone(),
            highest_committed_qc: root_committed_qc.clone(),
            syncing: HashMap::new(),
            end_of_epoch: None,
            end_of_epoch_seen: false,
            handles,
            max_sync_attempts: config.max_sync_attempts,
            get_vertices_max: config.get_vertices_max,
        };
        store.reset(root, root_qc, root_committed_qc)?;
        Ok(store)
    }

    /// Create a store for the epoch following `ancestor`, rooted at its genesis
    pub fn genesis(
        self_address: Address,
        ancestor: &VertexMetadata,
        handles: StoreHandles,
        config: &BftConfig,
    ) -> ConsensusResult<Self> {
        let genesis = Vertex::genesis(ancestor);
        let qc = QuorumCertificate::genesis(&genesis);
        Self::new(self_address, genesis, qc.clone(), qc, handles, config)
    }

    fn reset(
        &mut self,
        root: Vertex,
        root_qc: QuorumCertificate,
        root_committed_qc: QuorumCertificate,
    ) -> ConsensusResult<()> {
        if root_qc.proposed().id != root.id() {
            return Err(ConsensusError::IllegalState(format!(
                "root qc certifies {} but root is {}",
                root_qc.proposed().id.short(),
                root.id().short()
            )));
        }
        if root_committed_qc.committed().map(|md| md.id) != Some(root.id()) {
            return Err(ConsensusError::IllegalState(format!(
                "committed qc does not commit root {}",
                root.id().short()
            )));
        }
        if root.epoch() != self.epoch {
            return Err(ConsensusError::WrongEpoch {
                expected: self.epoch,
                got: root.epoch(),
            });
        }

        let metadata = *root_qc.proposed();
        self.root_id = root.id();
        self.entries.clear();
        self.entries.insert(root.id(), StoredVertex { vertex: root, metadata });
        self.highest_qc = root_qc;
        self.highest_committed_qc = root_committed_qc;
        self.update_size();
        Ok(())
    }

    /// Epoch of every vertex in the store
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Last committed vertex
    pub fn root(&self) -> &Vertex {
        // the root is never pruned
        &self.entries[&self.root_id].vertex
    }

    /// Metadata of the root
    pub fn root_metadata(&self) -> &VertexMetadata {
        &self.entries[&self.root_id].metadata
    }

    fn root_view(&self) -> View {
        self.root_metadata().view
    }

    /// Highest QC seen on a vertex in the store
    pub fn highest_qc(&self) -> &QuorumCertificate {
        &self.highest_qc
    }

    /// QC carrying the highest committed vertex
    pub fn highest_committed_qc(&self) -> &QuorumCertificate {
        &self.highest_committed_qc
    }

    /// Whether the vertex is stored
    pub fn contains(&self, id: &H256) -> bool {
        self.entries.contains_key(id)
    }

    /// Stored vertex
    pub fn get_vertex(&self, id: &H256) -> Option<&Vertex> {
        self.entries.get(id).map(|entry| &entry.vertex)
    }

    /// Metadata computed when the vertex was inserted
    pub fn get_metadata(&self, id: &H256) -> Option<&VertexMetadata> {
        self.entries.get(id).map(|entry| &entry.metadata)
    }

    /// Number of stored vertices, root included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false: the root is always stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a sync toward `id` is in flight
    pub fn is_syncing(&self, id: &H256) -> bool {
        self.syncing.contains_key(id)
    }

    /// Number of syncs in flight
    pub fn syncs_in_flight(&self) -> usize {
        self.syncing.len()
    }

    /// End-of-epoch vertex committed since the last call, reported once
    pub fn take_end_of_epoch(&mut self) -> Option<VertexMetadata> {
        self.end_of_epoch.take()
    }

    fn update_size(&self) {
        self.handles
            .counters
            .set(CounterType::BftVertexStoreSize, self.entries.len() as u64);
    }

    /// Insert a vertex whose parent is stored.
    ///
    /// Returns its metadata. Inserting a stored vertex again returns the
    /// existing metadata.
    pub fn insert_vertex(&mut self, vertex: Vertex) -> ConsensusResult<VertexMetadata> {
        if let Some(existing) = self.entries.get(&vertex.id()) {
            return Ok(existing.metadata);
        }
        if vertex.epoch() != self.epoch {
            return Err(ConsensusError::WrongEpoch {
                expected: self.epoch,
                got: vertex.epoch(),
            });
        }
        let parent = self
            .entries
            .get(&vertex.parent_id())
            .ok_or(ConsensusError::MissingParent {
                vertex: vertex.id(),
                parent: vertex.parent_id(),
            })?
            .metadata;
        if vertex.view() <= parent.view {
            return Err(ConsensusError::InvalidVertex(format!(
                "view {} does not extend parent view {}",
                vertex.view(),
                parent.view
            )));
        }
        if *vertex.qc().proposed() != parent {
            return Err(ConsensusError::InvalidVertex(format!(
                "qc metadata for {} disagrees with local parent",
                parent.id.short()
            )));
        }

        let metadata = if parent.is_end_of_epoch {
            if vertex.command().is_some() {
                return Err(ConsensusError::InvalidVertex(
                    "command after end of epoch".to_string(),
                ));
            }
            VertexMetadata {
                epoch: vertex.epoch(),
                view: vertex.view(),
                id: vertex.id(),
                state_version: parent.state_version,
                is_end_of_epoch: true,
            }
        } else {
            let increment = u64::from(vertex.command().is_some());
            VertexMetadata {
                epoch: vertex.epoch(),
                view: vertex.view(),
                id: vertex.id(),
                state_version: parent.state_version + increment,
                is_end_of_epoch: self.handles.ledger.prepare(&vertex),
            }
        };

        if !vertex.has_direct_parent() {
            self.handles.counters.increment(CounterType::BftIndirectParent);
        }
        tracing::trace!(vertex = %metadata, "Inserted vertex");
        self.entries
            .insert(vertex.id(), StoredVertex { vertex, metadata });
        self.update_size();
        Ok(metadata)
    }

    /// Record `qc` if the vertex it certifies is stored
    fn add_qc(&mut self, qc: &QuorumCertificate) -> bool {
        if !self.entries.contains_key(&qc.proposed().id) {
            return false;
        }
        if qc.view() > self.highest_qc.view() {
            self.highest_qc = qc.clone();
        }
        if let Some(committed) = qc.committed() {
            let current = self.highest_committed_qc.committed().map(|md| md.view);
            if current.map_or(true, |view| committed.view > view) {
                self.highest_committed_qc = qc.clone();
            }
        }
        true
    }

    /// Make sure the vertex certified by `qc` is stored.
    ///
    /// Returns true when it already is (or lies below the root). Otherwise a
    /// sync toward it is started from `author` and false is returned; a
    /// [`VertexStoreEventSender::send_synced_vertex`] notification follows
    /// once it lands.
    pub fn sync_to_qc(
        &mut self,
        qc: &QuorumCertificate,
        committed_qc: &QuorumCertificate,
        author: Option<Address>,
    ) -> ConsensusResult<bool> {
        if qc.view() < self.root_view() {
            return Ok(true);
        }
        if self.add_qc(qc) {
            return Ok(true);
        }
        let Some(author) = author else {
            return Err(ConsensusError::IllegalState(format!(
                "local qc for missing vertex {}",
                qc.proposed().id.short()
            )));
        };

        let key = qc.proposed().id;
        if self.syncing.contains_key(&key) {
            return Ok(false);
        }

        let needs_committed_sync = committed_qc.committed().is_some_and(|committed| {
            !self.entries.contains_key(&committed.id) && self.root_view() < committed.view
        });
        let (stage, requested, count) = if needs_committed_sync {
            (
                SyncStage::CommittedVertices,
                committed_qc.proposed().id,
                COMMITTED_SYNC_COUNT,
            )
        } else {
            (SyncStage::QcVertices, key, 1)
        };
        tracing::debug!(
            vertex = %key.short(),
            %author,
            ?stage,
            "SYNC_VERTICES: starting sync"
        );
        let sync = SyncState {
            qc: qc.clone(),
            committed_qc: committed_qc.clone(),
            author,
            stage,
            fetched: Vec::new(),
            attempts: 0,
            requested,
            count,
        };
        self.send_request(key, &sync);
        self.syncing.insert(key, sync);
        Ok(false)
    }

    fn send_request(&self, key: H256, sync: &SyncState) {
        self.handles
            .counters
            .increment(CounterType::BftSyncRequestsSent);
        self.handles.sync_sender.send_get_vertices_request(
            sync.author,
            GetVerticesRequest {
                requester: self.self_address,
                vertex_id: sync.requested,
                count: sync.count,
                opaque: key,
            },
        );
    }

    /// Serve a peer's request from the local tree
    pub fn process_get_vertices_request(&self, request: &GetVerticesRequest) {
        let mut vertices = Vec::new();
        if request.count > 0 && request.count <= self.get_vertices_max {
            let mut next = request.vertex_id;
            while vertices.len() < request.count {
                let Some(entry) = self.entries.get(&next) else {
                    break;
                };
                next = entry.vertex.parent_id();
                vertices.push(entry.vertex.clone());
            }
        }

        if !vertices.is_empty() && vertices.len() == request.count {
            tracing::trace!(
                vertex = %request.vertex_id.short(),
                count = request.count,
                requester = %request.requester,
                "SYNC_VERTICES: serving"
            );
            self.handles.sync_sender.send_get_vertices_response(
                request.requester,
                GetVerticesResponse {
                    responder: self.self_address,
                    vertex_id: request.vertex_id,
                    vertices,
                    opaque: request.opaque,
                },
            );
        } else {
            tracing::debug!(
                vertex = %request.vertex_id.short(),
                count = request.count,
                requester = %request.requester,
                "SYNC_VERTICES: cannot serve, sending highest qc"
            );
            self.handles.sync_sender.send_get_vertices_error_response(
                request.requester,
                GetVerticesErrorResponse {
                    responder: self.self_address,
                    vertex_id: request.vertex_id,
                    highest_qc: self.highest_qc.clone(),
                    highest_committed_qc: self.highest_committed_qc.clone(),
                    opaque: request.opaque,
                },
            );
        }
    }

    /// Continue the sync a response belongs to
    pub fn process_get_vertices_response(
        &mut self,
        response: GetVerticesResponse,
    ) -> ConsensusResult<()> {
        let key = response.opaque;
        let Some(sync) = self.syncing.get(&key) else {
            tracing::trace!(vertex = %response.vertex_id.short(), "SYNC_VERTICES: no sync for response");
            return Ok(());
        };
        if sync.stage == SyncStage::LedgerSync || response.vertex_id != sync.requested {
            tracing::trace!(vertex = %response.vertex_id.short(), "SYNC_VERTICES: stale response");
            return Ok(());
        }
        Self::validate_chain(&response, sync.count)?;

        let Some(mut sync) = self.syncing.remove(&key) else {
            return Ok(());
        };
        match sync.stage {
            SyncStage::CommittedVertices => {
                let committed = sync.committed_qc.committed().copied();
                let oldest = response.vertices.last().map(|v| v.id());
                let Some(committed) = committed.filter(|md| Some(md.id) == oldest) else {
                    return Err(ConsensusError::InvalidVertex(
                        "committed sync response does not end at committed vertex".to_string(),
                    ));
                };
                sync.fetched = response.vertices;
                sync.stage = SyncStage::LedgerSync;
                tracing::debug!(target_vertex = %committed, "SYNC_VERTICES: syncing ledger");
                if self
                    .handles
                    .ledger
                    .sync_to(&committed, &[sync.author], Some(key))
                {
                    self.rebuild(key, sync)
                } else {
                    self.syncing.insert(key, sync);
                    Ok(())
                }
            }
            SyncStage::QcVertices => {
                sync.fetched.extend(response.vertices);
                self.continue_qc_sync(key, sync)
            }
            SyncStage::LedgerSync => Ok(()),
        }
    }

    fn validate_chain(response: &GetVerticesResponse, count: usize) -> ConsensusResult<()> {
        if response.vertices.len() != count {
            return Err(ConsensusError::InvalidVertex(format!(
                "expected {} vertices, got {}",
                count,
                response.vertices.len()
            )));
        }
        if response.vertices.first().map(|v| v.id()) != Some(response.vertex_id) {
            return Err(ConsensusError::InvalidVertex(
                "response does not start at requested vertex".to_string(),
            ));
        }
        for pair in response.vertices.windows(2) {
            if pair[0].parent_id() != pair[1].id() {
                return Err(ConsensusError::InvalidVertex(
                    "response vertices are not a chain".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn continue_qc_sync(&mut self, key: H256, mut sync: SyncState) -> ConsensusResult<()> {
        let Some(oldest) = sync.fetched.last() else {
            return Ok(());
        };
        let parent_id = oldest.parent_id();
        if self.entries.contains_key(&parent_id) {
            for vertex in sync.fetched.drain(..).rev() {
                self.insert_vertex(vertex)?;
            }
            self.finish_sync(&sync.qc);
            return Ok(());
        }
        if oldest.parent_view() <= self.root_view() {
            tracing::debug!(
                vertex = %key.short(),
                "SYNC_VERTICES: chain does not reach the root, abandoning"
            );
            return Ok(());
        }
        sync.requested = parent_id;
        sync.count = 1;
        sync.attempts = 0;
        self.send_request(key, &sync);
        self.syncing.insert(key, sync);
        Ok(())
    }

    fn finish_sync(&mut self, qc: &QuorumCertificate) {
        if !self.add_qc(qc) {
            return;
        }
        if let Some(entry) = self.entries.get(&qc.proposed().id) {
            tracing::debug!(vertex = %entry.metadata, "SYNC_VERTICES: synced");
            self.handles.event_sender.send_synced_vertex(&entry.vertex);
        }
    }

    /// Rebuild rooted at the committed vertex of a committed sync, then
    /// finish or restart the QC part of the sync
    fn rebuild(&mut self, key: H256, mut sync: SyncState) -> ConsensusResult<()> {
        let mut fetched = std::mem::take(&mut sync.fetched);
        fetched.sort_by_key(|v| v.view());
        let mut fetched = fetched.into_iter();
        let (Some(root), Some(child)) = (fetched.next(), fetched.next()) else {
            return Err(ConsensusError::IllegalState(
                "committed sync without enough vertices".to_string(),
            ));
        };
        let root_qc = child.qc().clone();
        tracing::info!(
            root = %root_qc.proposed(),
            "SYNC_VERTICES: rebuilding vertex store"
        );
        self.reset(root, root_qc, sync.committed_qc.clone())?;
        self.insert_vertex(child)?;
        for vertex in fetched {
            self.insert_vertex(vertex)?;
        }

        if self.entries.contains_key(&sync.qc.proposed().id) {
            self.finish_sync(&sync.qc);
            return Ok(());
        }
        sync.stage = SyncStage::QcVertices;
        sync.requested = key;
        sync.count = 1;
        sync.attempts = 0;
        self.send_request(key, &sync);
        self.syncing.insert(key, sync);
        Ok(())
    }

    /// Peer could not serve a request: drop that sync and sync to the peer's
    /// highest QC instead
    pub fn process_get_vertices_error_response(
        &mut self,
        response: GetVerticesErrorResponse,
    ) -> ConsensusResult<()> {
        if self.syncing.remove(&response.opaque).is_none() {
            return Ok(());
        }
        tracing::debug!(
            vertex = %response.vertex_id.short(),
            responder = %response.responder,
            "SYNC_VERTICES: peer could not serve"
        );
        self.sync_to_qc(
            &response.highest_qc,
            &response.highest_committed_qc,
            Some(response.responder),
        )?;
        Ok(())
    }

    /// The ledger finished a sync started by a committed sync
    pub fn process_committed_state_sync(
        &mut self,
        sync_done: &CommittedStateSync,
    ) -> ConsensusResult<()> {
        let in_ledger_sync = self
            .syncing
            .get(&sync_done.opaque)
            .is_some_and(|sync| sync.stage == SyncStage::LedgerSync);
        if !in_ledger_sync {
            return Ok(());
        }
        match self.syncing.remove(&sync_done.opaque) {
            Some(sync) => self.rebuild(sync_done.opaque, sync),
            None => Ok(()),
        }
    }

    /// Re-request every outstanding sync, abandoning those that ran out of
    /// attempts
    pub fn retry_syncs(&mut self) -> ConsensusResult<()> {
        let keys: Vec<H256> = self.syncing.keys().copied().collect();
        for key in keys {
            let Some(mut sync) = self.syncing.remove(&key) else {
                continue;
            };
            sync.attempts += 1;
            if sync.attempts > self.max_sync_attempts {
                tracing::warn!(
                    vertex = %key.short(),
                    attempts = sync.attempts - 1,
                    "SYNC_VERTICES: giving up"
                );
                continue;
            }
            if sync.stage == SyncStage::LedgerSync {
                let Some(committed) = sync.committed_qc.committed().copied() else {
                    continue;
                };
                if self
                    .handles
                    .ledger
                    .sync_to(&committed, &[sync.author], Some(key))
                {
                    self.rebuild(key, sync)?;
                    continue;
                }
            } else {
                self.send_request(key, &sync);
            }
            self.syncing.insert(key, sync);
        }
        Ok(())
    }

    /// Commit the vertex described by `metadata` and every uncommitted
    /// ancestor.
    ///
    /// Returns `None` when it is at or below the root.
    pub fn commit_vertex(&mut self, metadata: &VertexMetadata) -> ConsensusResult<Option<Vertex>> {
        if metadata.view <= self.root_view() {
            return Ok(None);
        }
        let path = self.path_from_root(&metadata.id).ok_or_else(|| {
            ConsensusError::IllegalState(format!(
                "commit of {} which does not descend from root",
                metadata
            ))
        })?;

        for id in &path {
            let Some(entry) = self.entries.get(id) else {
                continue;
            };
            let md = entry.metadata;
            self.handles.ledger.execute(&entry.vertex, &md);
            self.handles.counters.increment(CounterType::BftCommitted);
            if entry.vertex.command().is_some() {
                self.handles.counters.increment(CounterType::BftProcessed);
            }
            self.handles
                .counters
                .set(CounterType::LedgerStateVersion, md.state_version);
            self.handles
                .event_sender
                .send_committed_vertex(&entry.vertex, &md);
            if md.is_end_of_epoch && !self.end_of_epoch_seen {
                self.end_of_epoch_seen = true;
                self.end_of_epoch = Some(md);
            }
        }
        tracing::debug!(vertex = %metadata, vertices = path.len(), "Committed");

        self.root_id = metadata.id;
        self.prune();
        Ok(self.get_vertex(&metadata.id).cloned())
    }

    /// Ids from just above the root down to `tip`, oldest first. `None` when
    /// `tip` is not a stored descendant of the root.
    fn path_from_root(&self, tip: &H256) -> Option<Vec<H256>> {
        let mut path = Vec::new();
        let mut next = *tip;
        while next != self.root_id {
            let entry = self.entries.get(&next)?;
            path.push(next);
            next = entry.vertex.parent_id();
        }
        path.reverse();
        Some(path)
    }

    fn prune(&mut self) {
        let root_view = self.root_view();
        let mut by_view: Vec<(View, H256, H256)> = self
            .entries
            .values()
            .filter(|entry| entry.metadata.view > root_view)
            .map(|entry| {
                (
                    entry.metadata.view,
                    entry.vertex.id(),
                    entry.vertex.parent_id(),
                )
            })
            .collect();
        by_view.sort();

        let mut keep = HashSet::from([self.root_id]);
        for (_, id, parent) in by_view {
            if keep.contains(&parent) {
                keep.insert(id);
            }
        }
        self.entries.retain(|id, _| keep.contains(id));
        self.update_size();
    }

    /// Commands on the uncommitted path from the root to `tip`
    pub fn commands_to(&self, tip: &H256) -> Vec<Command> {
        self.path_from_root(tip)
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.entries.get(id)?.vertex.command().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qc::{TimestampedSignatures, VoteData};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<(Address, GetVerticesRequest)>>,
        responses: Mutex<Vec<(Address, GetVerticesResponse)>>,
        errors: Mutex<Vec<(Address, GetVerticesErrorResponse)>>,
        synced: Mutex<Vec<H256>>,
        committed: Mutex<Vec<VertexMetadata>>,
        executed: Mutex<Vec<VertexMetadata>>,
        ledger_syncs: Mutex<Vec<(VertexMetadata, Option<H256>)>>,
        ledger_synced: Mutex<bool>,
        end_of_epoch_from: Mutex<Option<u64>>,
    }

    impl SyncVerticesSender for Recorder {
        fn send_get_vertices_request(&self, node: Address, request: GetVerticesRequest) {
            self.requests.lock().push((node, request));
        }
        fn send_get_vertices_response(&self, node: Address, response: GetVerticesResponse) {
            self.responses.lock().push((node, response));
        }
        fn send_get_vertices_error_response(
            &self,
            node: Address,
            response: GetVerticesErrorResponse,
        ) {
            self.errors.lock().push((node, response));
        }
    }

    impl VertexStoreEventSender for Recorder {
        fn send_synced_vertex(&self, vertex: &Vertex) {
            self.synced.lock().push(vertex.id());
        }
        fn send_committed_vertex(&self, _vertex: &Vertex, metadata: &VertexMetadata) {
            self.committed.lock().push(*metadata);
        }
    }

    impl SyncedStateComputer for Recorder {
        fn prepare(&self, vertex: &Vertex) -> bool {
            self.end_of_epoch_from
                .lock()
                .is_some_and(|view| vertex.view().number() >= view)
        }
        fn execute(&self, _vertex: &Vertex, metadata: &VertexMetadata) {
            self.executed.lock().push(*metadata);
        }
        fn sync_to(&self, target: &VertexMetadata, _peers: &[Address], opaque: Option<H256>) -> bool {
            self.ledger_syncs.lock().push((*target, opaque));
            *self.ledger_synced.lock()
        }
    }

    fn addr(n: u8) -> Address {
        Address::from_bytes([n; 20])
    }

    fn ancestor() -> VertexMetadata {
        VertexMetadata {
            epoch: 0,
            view: View::GENESIS,
            id: H256::ZERO,
            state_version: 0,
            is_end_of_epoch: true,
        }
    }

    fn store_with(recorder: &Arc<Recorder>, counters: &Arc<SystemCounters>) -> VertexStore {
        let handles = StoreHandles {
            sync_sender: recorder.clone(),
            event_sender: recorder.clone(),
            ledger: recorder.clone(),
            counters: counters.clone(),
        };
        VertexStore::genesis(addr(1), &ancestor(), handles, &BftConfig::default()).unwrap()
    }

    fn store() -> (VertexStore, Arc<Recorder>, Arc<SystemCounters>) {
        let recorder = Arc::new(Recorder::default());
        let counters = Arc::new(SystemCounters::new());
        (store_with(&recorder, &counters), recorder, counters)
    }

    /// QC on the stored vertex `id`
    fn qc_on(store: &VertexStore, id: &H256, committed: Option<VertexMetadata>) -> QuorumCertificate {
        let proposed = *store.get_metadata(id).unwrap();
        let parent = *store.get_vertex(id).unwrap().qc().proposed();
        QuorumCertificate::new(
            VoteData::new(proposed, parent, committed),
            TimestampedSignatures::new(),
        )
    }

    /// Insert a child of `parent` at `view`
    fn extend(store: &mut VertexStore, parent: &H256, view: u64, command: Option<&str>) -> H256 {
        let qc = qc_on(store, parent, None);
        let vertex = Vertex::new(1, View::of(view), qc, command.map(|c| Command::new(c.as_bytes().to_vec())));
        let id = vertex.id();
        store.insert_vertex(vertex).unwrap();
        id
    }

    /// genesis <- 1 <- 2 <- ... <- n, every vertex with a command
    fn chain(store: &mut VertexStore, n: u64) -> Vec<H256> {
        let mut ids = vec![store.root().id()];
        for view in 1..=n {
            let parent = *ids.last().unwrap();
            ids.push(extend(store, &parent, view, Some(&format!("cmd-{}", view))));
        }
        ids
    }

    // ==================== Insert Tests ====================

    #[test]
    fn test_genesis_store() {
        let (store, _, _) = store();
        assert_eq!(store.len(), 1);
        assert_eq!(store.epoch(), 1);
        assert!(store.highest_qc().is_genesis());
        assert_eq!(store.highest_qc().proposed().id, store.root().id());
    }

    #[test]
    fn test_inconsistent_root_is_illegal() {
        let recorder = Arc::new(Recorder::default());
        let handles = StoreHandles {
            sync_sender: recorder.clone(),
            event_sender: recorder.clone(),
            ledger: recorder,
            counters: Arc::new(SystemCounters::new()),
        };
        let genesis = Vertex::genesis(&ancestor());
        let other = Vertex::genesis(&VertexMetadata {
            state_version: 7,
            ..ancestor()
        });
        let qc = QuorumCertificate::genesis(&other);
        let err = VertexStore::new(addr(1), genesis, qc.clone(), qc, handles, &BftConfig::default())
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_insert_missing_parent() {
        let (mut store, _, _) = store();
        let (mut other, _, _) = self::store();
        let ids = chain(&mut other, 2);
        let orphan = other.get_vertex(&ids[2]).unwrap().clone();
        let err = store.insert_vertex(orphan).unwrap_err();
        assert!(matches!(err, ConsensusError::MissingParent { .. }));
    }

    #[test]
    fn test_insert_assigns_state_versions() {
        let (mut store, _, counters) = store();
        let ids = chain(&mut store, 2);
        let empty = extend(&mut store, &ids[2], 3, None);
        assert_eq!(store.get_metadata(&ids[1]).unwrap().state_version, 1);
        assert_eq!(store.get_metadata(&ids[2]).unwrap().state_version, 2);
        assert_eq!(store.get_metadata(&empty).unwrap().state_version, 2);
        assert_eq!(counters.get(CounterType::BftVertexStoreSize), 4);

        // same vertex again is a no-op
        let again = store.get_vertex(&ids[1]).unwrap().clone();
        assert_eq!(store.insert_vertex(again).unwrap().view, View::of(1));
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_indirect_parent_counted() {
        let (mut store, _, counters) = store();
        let root = store.root().id();
        extend(&mut store, &root, 1, None);
        extend(&mut store, &root, 3, None);
        assert_eq!(counters.get(CounterType::BftIndirectParent), 1);
    }

    #[test]
    fn test_insert_rejects_non_increasing_view() {
        let (mut store, _, _) = store();
        let ids = chain(&mut store, 2);
        let qc = qc_on(&store, &ids[2], None);
        let vertex = Vertex::new(1, View::of(2), qc, None);
        assert!(matches!(
            store.insert_vertex(vertex).unwrap_err(),
            ConsensusError::InvalidVertex(_)
        ));
    }

    #[test]
    fn test_end_of_epoch_inherited() {
        let (mut store, recorder, _) = store();
        *recorder.end_of_epoch_from.lock() = Some(2);
        let ids = chain(&mut store, 2);
        assert!(!store.get_metadata(&ids[1]).unwrap().is_end_of_epoch);
        assert!(store.get_metadata(&ids[2]).unwrap().is_end_of_epoch);

        let empty = extend(&mut store, &ids[2], 3, None);
        let md = *store.get_metadata(&empty).unwrap();
        assert!(md.is_end_of_epoch);
        assert_eq!(md.state_version, 2);

        let qc = qc_on(&store, &empty, None);
        let with_command = Vertex::new(1, View::of(4), qc, Some(Command::new(vec![1u8])));
        assert!(matches!(
            store.insert_vertex(with_command).unwrap_err(),
            ConsensusError::InvalidVertex(_)
        ));
    }

    // ==================== Commit Tests ====================

    #[test]
    fn test_commit_executes_path_and_prunes() {
        let (mut store, recorder, counters) = store();
        let ids = chain(&mut store, 4);
        let fork = extend(&mut store, &ids[1], 5, None);
        let md = *store.get_metadata(&ids[3]).unwrap();

        let committed = store.commit_vertex(&md).unwrap().unwrap();
        assert_eq!(committed.id(), ids[3]);
        let executed: Vec<_> = recorder.executed.lock().iter().map(|m| m.id).collect();
        assert_eq!(executed, vec![ids[1], ids[2], ids[3]]);
        assert_eq!(recorder.committed.lock().len(), 3);
        assert_eq!(counters.get(CounterType::BftCommitted), 3);
        assert_eq!(counters.get(CounterType::BftProcessed), 3);
        assert_eq!(counters.get(CounterType::LedgerStateVersion), 3);

        assert_eq!(store.root().id(), ids[3]);
        assert!(!store.contains(&fork));
        assert!(!store.contains(&ids[2]));
        assert!(store.contains(&ids[4]));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_commit_twice_is_noop() {
        let (mut store, recorder, _) = store();
        let ids = chain(&mut store, 2);
        let md = *store.get_metadata(&ids[2]).unwrap();
        assert!(store.commit_vertex(&md).unwrap().is_some());
        assert!(store.commit_vertex(&md).unwrap().is_none());
        let below = *store.get_metadata(&ids[2]).unwrap();
        assert!(store.commit_vertex(&below).unwrap().is_none());
        assert_eq!(recorder.executed.lock().len(), 2);
    }

    #[test]
    fn test_commit_unknown_is_illegal() {
        let (mut store, _, _) = store();
        let md = VertexMetadata {
            epoch: 1,
            view: View::of(5),
            id: H256::from_bytes([5; 32]),
            state_version: 5,
            is_end_of_epoch: false,
        };
        assert!(store.commit_vertex(&md).unwrap_err().is_fatal());
    }

    #[test]
    fn test_end_of_epoch_reported_once() {
        let (mut store, recorder, _) = store();
        *recorder.end_of_epoch_from.lock() = Some(2);
        let ids = chain(&mut store, 2);
        let tail = extend(&mut store, &ids[2], 3, None);
        let md = *store.get_metadata(&ids[2]).unwrap();
        store.commit_vertex(&md).unwrap();
        assert_eq!(store.take_end_of_epoch().map(|m| m.id), Some(ids[2]));
        assert!(store.take_end_of_epoch().is_none());

        let tail_md = *store.get_metadata(&tail).unwrap();
        store.commit_vertex(&tail_md).unwrap();
        assert!(store.take_end_of_epoch().is_none());
    }

    #[test]
    fn test_commands_to_tip() {
        let (mut store, _, _) = store();
        let ids = chain(&mut store, 3);
        let commands = store.commands_to(&ids[3]);
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].as_bytes(), b"cmd-1");
        assert!(store.commands_to(&H256::from_bytes([9; 32])).is_empty());
    }

    // ==================== Sync Tests ====================

    #[test]
    fn test_serve_get_vertices() {
        let (mut store, recorder, _) = store();
        let ids = chain(&mut store, 3);
        store.process_get_vertices_request(&GetVerticesRequest {
            requester: addr(2),
            vertex_id: ids[3],
            count: 3,
            opaque: ids[3],
        });
        let responses = recorder.responses.lock();
        let (to, response) = &responses[0];
        assert_eq!(*to, addr(2));
        let served: Vec<_> = response.vertices.iter().map(|v| v.id()).collect();
        assert_eq!(served, vec![ids[3], ids[2], ids[1]]);
    }

    #[test]
    fn test_unknown_vertex_gets_error_response() {
        let (store, recorder, _) = store();
        store.process_get_vertices_request(&GetVerticesRequest {
            requester: addr(2),
            vertex_id: H256::from_bytes([3; 32]),
            count: 1,
            opaque: H256::ZERO,
        });
        assert!(recorder.responses.lock().is_empty());
        let errors = recorder.errors.lock();
        assert!(errors[0].1.highest_qc.is_genesis());
    }

    #[test]
    fn test_sync_without_author_is_illegal() {
        let (mut remote, _, _) = store();
        let ids = chain(&mut remote, 2);
        let qc = qc_on(&remote, &ids[2], None);
        let (mut local, _, _) = store();
        let committed = local.highest_committed_qc().clone();
        assert!(local.sync_to_qc(&qc, &committed, None).unwrap_err().is_fatal());
    }

    /// Hand every request the local store sent to the remote store and feed
    /// the answers back
    fn pump(local: &mut VertexStore, local_rec: &Recorder, remote: &VertexStore, remote_rec: &Recorder) {
        loop {
            let requests: Vec<_> = local_rec.requests.lock().drain(..).collect();
            if requests.is_empty() {
                return;
            }
            for (_, request) in requests {
                remote.process_get_vertices_request(&request);
            }
            let responses: Vec<_> = remote_rec.responses.lock().drain(..).collect();
            for (_, response) in responses {
                local.process_get_vertices_response(response).unwrap();
            }
        }
    }

    #[test]
    fn test_qc_sync_walks_back_to_known_parent() {
        let (mut remote, remote_rec, _) = store();
        let ids = chain(&mut remote, 3);
        let qc = qc_on(&remote, &ids[3], None);

        let (mut local, local_rec, _) = store();
        let local_root = local.root().id();
        extend(&mut local, &local_root, 1, Some("cmd-1"));
        let committed = local.highest_committed_qc().clone();

        assert!(!local.sync_to_qc(&qc, &committed, Some(addr(2))).unwrap());
        // asking again while in flight does not send another request
        assert!(!local.sync_to_qc(&qc, &committed, Some(addr(2))).unwrap());
        {
            let requests = local_rec.requests.lock();
            assert_eq!(requests.len(), 1);
            assert_eq!(requests[0].1.count, 1);
            assert_eq!(requests[0].1.vertex_id, ids[3]);
        }

        pump(&mut local, &local_rec, &remote, &remote_rec);
        assert!(local.contains(&ids[2]));
        assert!(local.contains(&ids[3]));
        assert_eq!(*local_rec.synced.lock(), vec![ids[3]]);
        assert_eq!(local.highest_qc().view(), View::of(3));
        assert_eq!(local.syncs_in_flight(), 0);
        assert!(local.sync_to_qc(&qc, &committed, Some(addr(2))).unwrap());
    }

    #[test]
    fn test_committed_sync_fetches_three_and_rebuilds() {
        let (mut remote, remote_rec, _) = store();
        let ids = chain(&mut remote, 5);
        let committed_md = *remote.get_metadata(&ids[3]).unwrap();
        let qc = qc_on(&remote, &ids[5], Some(committed_md));

        let (mut local, local_rec, counters) = store();
        *local_rec.ledger_synced.lock() = true;
        assert!(!local.sync_to_qc(&qc, &qc, Some(addr(2))).unwrap());
        {
            let requests = local_rec.requests.lock();
            assert_eq!(requests.len(), 1);
            assert_eq!(requests[0].1.count, 3);
            assert_eq!(requests[0].1.vertex_id, ids[5]);
        }

        pump(&mut local, &local_rec, &remote, &remote_rec);
        assert_eq!(counters.get(CounterType::BftSyncRequestsSent), 1);
        assert_eq!(local_rec.ledger_syncs.lock()[0].0, committed_md);
        assert_eq!(local.root().id(), ids[3]);
        assert_eq!(*local_rec.synced.lock(), vec![ids[5]]);
        assert_eq!(local.highest_qc().view(), View::of(5));
        assert_eq!(local.highest_committed_qc().committed(), Some(&committed_md));
    }

    #[test]
    fn test_committed_sync_waits_for_ledger() {
        let (mut remote, remote_rec, _) = store();
        let ids = chain(&mut remote, 5);
        let committed_md = *remote.get_metadata(&ids[3]).unwrap();
        let qc = qc_on(&remote, &ids[5], Some(committed_md));

        let (mut local, local_rec, _) = store();
        local.sync_to_qc(&qc, &qc, Some(addr(2))).unwrap();
        pump(&mut local, &local_rec, &remote, &remote_rec);
        assert!(local_rec.synced.lock().is_empty());

        let opaque = local_rec.ledger_syncs.lock()[0].1.unwrap();
        local
            .process_committed_state_sync(&CommittedStateSync {
                state_version: committed_md.state_version,
                opaque,
            })
            .unwrap();
        assert_eq!(local.root().id(), ids[3]);
        assert_eq!(*local_rec.synced.lock(), vec![ids[5]]);
    }

    #[test]
    fn test_error_response_redirects_sync() {
        let (mut remote, _, _) = store();
        let ids = chain(&mut remote, 2);
        let qc = qc_on(&remote, &ids[2], None);

        let (mut local, local_rec, _) = store();
        let committed = local.highest_committed_qc().clone();
        local.sync_to_qc(&qc, &committed, Some(addr(2))).unwrap();
        let opaque = local_rec.requests.lock()[0].1.opaque;

        // peer only knows genesis: nothing left to sync
        local
            .process_get_vertices_error_response(GetVerticesErrorResponse {
                responder: addr(2),
                vertex_id: ids[2],
                highest_qc: committed.clone(),
                highest_committed_qc: committed,
                opaque,
            })
            .unwrap();
        assert_eq!(local.syncs_in_flight(), 0);
        assert_eq!(local_rec.requests.lock().len(), 1);
    }

    #[test]
    fn test_retries_are_bounded() {
        let (mut remote, _, _) = store();
        let ids = chain(&mut remote, 2);
        let qc = qc_on(&remote, &ids[2], None);

        let (mut local, local_rec, _) = store();
        let committed = local.highest_committed_qc().clone();
        local.sync_to_qc(&qc, &committed, Some(addr(2))).unwrap();
        let max = BftConfig::default().max_sync_attempts as usize;
        for _ in 0..max + 3 {
            local.retry_syncs().unwrap();
        }
        assert_eq!(local.syncs_in_flight(), 0);
        assert_eq!(local_rec.requests.lock().len(), 1 + max);
    }
}
