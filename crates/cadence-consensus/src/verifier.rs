//! Authentication of incoming protocol messages

use cadence_crypto::{HashVerifier, Signature};
use cadence_primitives::{Address, Epoch, H256, U256};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::error::{ConsensusError, ConsensusResult};
use crate::messages::{
    ConsensusEvent, GetVerticesErrorResponse, GetVerticesResponse, NewView, Proposal, Vote,
};
use crate::qc::QuorumCertificate;
use crate::validator::ValidatorSet;

/// Checks signatures, membership and QC quorums for one epoch.
///
/// QCs that verified once are remembered by digest.
pub struct MessageVerifier {
    epoch: Epoch,
    genesis_id: H256,
    validator_set: Arc<ValidatorSet>,
    verifier: Arc<dyn HashVerifier>,
    verified_qcs: LruCache<H256, ()>,
}

impl MessageVerifier {
    /// Create a verifier for `epoch`, whose genesis vertex is `genesis_id`
    pub fn new(
        epoch: Epoch,
        genesis_id: H256,
        validator_set: Arc<ValidatorSet>,
        verifier: Arc<dyn HashVerifier>,
        cache_size: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            epoch,
            genesis_id,
            validator_set,
            verifier,
            verified_qcs: LruCache::new(capacity),
        }
    }

    /// Verify a consensus event and every QC it carries
    pub fn verify_event(&mut self, event: &ConsensusEvent) -> ConsensusResult<()> {
        if event.epoch() != self.epoch {
            return Err(ConsensusError::WrongEpoch {
                expected: self.epoch,
                got: event.epoch(),
            });
        }
        let author = event.author();
        if !self.validator_set.contains(&author) {
            return Err(ConsensusError::NotValidator(author));
        }
        match event {
            ConsensusEvent::Vote(vote) => {
                let hash = Vote::signing_hash(&vote.vote_data, vote.timestamp);
                self.check_signature(&author, &hash, &vote.signature, "vote")
            }
            ConsensusEvent::NewView(new_view) => {
                let hash = NewView::signing_hash(new_view.epoch, new_view.view, &new_view.qc);
                self.check_signature(&author, &hash, &new_view.signature, "new-view")?;
                self.verify_qc(&new_view.qc)?;
                self.verify_qc(&new_view.committed_qc)
            }
            ConsensusEvent::Proposal(proposal) => {
                let hash = Proposal::signing_hash(&proposal.vertex.id());
                self.check_signature(&author, &hash, &proposal.signature, "proposal")?;
                self.verify_qc(proposal.vertex.qc())?;
                self.verify_qc(&proposal.committed_qc)
            }
        }
    }

    /// Verify the QCs a peer sent instead of vertices
    pub fn verify_error_response(
        &mut self,
        response: &GetVerticesErrorResponse,
    ) -> ConsensusResult<()> {
        self.verify_qc(&response.highest_qc)?;
        self.verify_qc(&response.highest_committed_qc)
    }

    /// Verify the QC of every vertex a peer served. The epoch's genesis
    /// vertex carries no signed QC and is accepted by id.
    pub fn verify_vertices_response(
        &mut self,
        response: &GetVerticesResponse,
    ) -> ConsensusResult<()> {
        for vertex in &response.vertices {
            if vertex.view().is_genesis() {
                if vertex.id() != self.genesis_id {
                    return Err(ConsensusError::InvalidVertex(format!(
                        "foreign genesis vertex {} from {}",
                        vertex.id().short(),
                        response.responder
                    )));
                }
                continue;
            }
            self.verify_qc(vertex.qc())?;
        }
        Ok(())
    }

    fn check_signature(
        &self,
        author: &Address,
        hash: &H256,
        signature: &Signature,
        what: &str,
    ) -> ConsensusResult<()> {
        if self.verifier.verify(author, hash, signature) {
            Ok(())
        } else {
            Err(ConsensusError::InvalidSignature(format!(
                "{} from {}",
                what, author
            )))
        }
    }

    /// A QC is valid when it belongs to this epoch and either certifies the
    /// epoch's genesis without signatures, or carries valid signatures from
    /// members totalling a quorum of power.
    pub fn verify_qc(&mut self, qc: &QuorumCertificate) -> ConsensusResult<()> {
        if qc.epoch() != self.epoch {
            return Err(ConsensusError::WrongEpoch {
                expected: self.epoch,
                got: qc.epoch(),
            });
        }
        if qc.is_genesis() {
            return if qc.proposed().id == self.genesis_id {
                Ok(())
            } else {
                Err(ConsensusError::InvalidSignature(
                    "unsigned qc for a non-genesis vertex".to_string(),
                ))
            };
        }

        let digest = qc.digest();
        if self.verified_qcs.get(&digest).is_some() {
            return Ok(());
        }

        let mut power = U256::zero();
        for (author, signature) in qc.signatures().iter() {
            let Some(member_power) = self.validator_set.power_of(author) else {
                return Err(ConsensusError::NotValidator(*author));
            };
            if signature.power != member_power {
                return Err(ConsensusError::InvalidSignature(format!(
                    "qc claims wrong power for {}",
                    author
                )));
            }
            let hash = Vote::signing_hash(qc.vote_data(), signature.timestamp);
            self.check_signature(author, &hash, &signature.signature, "qc signature")?;
            power = power.saturating_add(member_power);
        }
        if !self.validator_set.has_quorum(power) {
            return Err(ConsensusError::InvalidSignature(format!(
                "qc for view {} lacks a quorum",
                qc.view()
            )));
        }
        self.verified_qcs.put(digest, ());
        Ok(())
    }
}
