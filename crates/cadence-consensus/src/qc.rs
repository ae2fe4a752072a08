//! Vote data and quorum certificates

use cadence_crypto::{keccak256, Signature};
use cadence_primitives::{Address, Epoch, H256, U256};
use std::collections::BTreeMap;

use crate::error::{ConsensusError, ConsensusResult};
use crate::types::{Vertex, VertexMetadata, View};

/// The content a replica signs when voting
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VoteData {
    proposed: VertexMetadata,
    parent: VertexMetadata,
    committed: Option<VertexMetadata>,
}

impl VoteData {
    /// Create vote data
    pub fn new(
        proposed: VertexMetadata,
        parent: VertexMetadata,
        committed: Option<VertexMetadata>,
    ) -> Self {
        VoteData {
            proposed,
            parent,
            committed,
        }
    }

    /// Vertex being voted for
    pub fn proposed(&self) -> &VertexMetadata {
        &self.proposed
    }

    /// Its parent
    pub fn parent(&self) -> &VertexMetadata {
        &self.parent
    }

    /// Vertex committed if this vote data gathers a quorum
    pub fn committed(&self) -> Option<&VertexMetadata> {
        self.committed.as_ref()
    }

    /// Canonical hash
    pub fn hash(&self) -> H256 {
        let mut buf = Vec::with_capacity(160);
        buf.extend_from_slice(b"cadence.vote_data");
        self.proposed.encode_into(&mut buf);
        self.parent.encode_into(&mut buf);
        match &self.committed {
            Some(committed) => {
                buf.push(1);
                committed.encode_into(&mut buf);
            }
            None => buf.push(0),
        }
        keccak256(&buf)
    }
}

/// One signer's contribution to a QC
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimestampedSignature {
    /// Signer's clock when voting (ms)
    pub timestamp: u64,
    /// Signer's voting power
    pub power: U256,
    /// Signature over the vote hash
    pub signature: Signature,
}

/// Signatures aggregated into a QC, keyed by signer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimestampedSignatures(BTreeMap<Address, TimestampedSignature>);

impl TimestampedSignatures {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a signer's entry
    pub fn insert(&mut self, author: Address, signature: TimestampedSignature) {
        self.0.insert(author, signature);
    }

    /// Remove a signer's entry
    pub fn remove(&mut self, author: &Address) -> Option<TimestampedSignature> {
        self.0.remove(author)
    }

    /// Number of signers
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no signers
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in signer order
    pub fn iter(&self) -> impl Iterator<Item = (&Address, &TimestampedSignature)> {
        self.0.iter()
    }

    /// Sum of signer power
    pub fn total_power(&self) -> U256 {
        self.0
            .values()
            .fold(U256::zero(), |acc, s| acc.saturating_add(s.power))
    }

    /// Power-weighted median timestamp.
    ///
    /// Timestamps are taken in ascending order; the result is the first one at
    /// which the cumulative weight reaches half of the total (`2 * cum >= total`).
    pub fn weighted_timestamp(&self) -> ConsensusResult<u64> {
        let total = self.total_power();
        if total.is_zero() {
            return Err(ConsensusError::IllegalState(
                "weighted timestamp over zero total power".to_string(),
            ));
        }
        let mut entries: Vec<(u64, U256)> = self
            .0
            .values()
            .map(|s| (s.timestamp, s.power))
            .collect();
        entries.sort_by_key(|(timestamp, _)| *timestamp);

        let mut cumulative = U256::zero();
        for (timestamp, power) in &entries {
            cumulative = cumulative.saturating_add(*power);
            if cumulative.saturating_mul(U256::from(2u8)) >= total {
                return Ok(*timestamp);
            }
        }
        Err(ConsensusError::IllegalState(
            "weighted timestamp not reached".to_string(),
        ))
    }
}

/// Proof that a quorum of voting power certified `vote_data().proposed()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumCertificate {
    vote_data: VoteData,
    signatures: TimestampedSignatures,
}

impl QuorumCertificate {
    /// Assemble a QC
    pub fn new(vote_data: VoteData, signatures: TimestampedSignatures) -> Self {
        QuorumCertificate {
            vote_data,
            signatures,
        }
    }

    /// Self-referencing certificate embedded in a genesis vertex
    pub(crate) fn pre_genesis(metadata: VertexMetadata) -> Self {
        QuorumCertificate::new(
            VoteData::new(metadata, metadata, Some(metadata)),
            TimestampedSignatures::new(),
        )
    }

    /// The unsigned certificate for an epoch genesis vertex
    pub fn genesis(genesis: &Vertex) -> Self {
        let md = VertexMetadata::of_genesis(genesis);
        QuorumCertificate::new(VoteData::new(md, md, Some(md)), TimestampedSignatures::new())
    }

    /// Certified vote data
    pub fn vote_data(&self) -> &VoteData {
        &self.vote_data
    }

    /// Aggregated signatures
    pub fn signatures(&self) -> &TimestampedSignatures {
        &self.signatures
    }

    /// Certified vertex
    pub fn proposed(&self) -> &VertexMetadata {
        self.vote_data.proposed()
    }

    /// Parent of the certified vertex
    pub fn parent(&self) -> &VertexMetadata {
        self.vote_data.parent()
    }

    /// Vertex committed by this QC under the three-chain rule
    pub fn committed(&self) -> Option<&VertexMetadata> {
        self.vote_data.committed()
    }

    /// View of the certified vertex
    pub fn view(&self) -> View {
        self.vote_data.proposed().view
    }

    /// Epoch of the certified vertex
    pub fn epoch(&self) -> Epoch {
        self.vote_data.proposed().epoch
    }

    /// Unsigned genesis certificate
    pub fn is_genesis(&self) -> bool {
        self.view().is_genesis() && self.signatures.is_empty()
    }

    /// Canonical timestamp; `None` for the unsigned genesis certificate
    pub fn timestamp(&self) -> ConsensusResult<Option<u64>> {
        if self.signatures.is_empty() {
            return Ok(None);
        }
        self.signatures.weighted_timestamp().map(Some)
    }

    /// Hash over vote data and every signature, used to cache verification
    pub fn digest(&self) -> H256 {
        let mut buf = Vec::with_capacity(32 + self.signatures.len() * 100);
        buf.extend_from_slice(self.vote_data.hash().as_bytes());
        for (author, sig) in self.signatures.iter() {
            buf.extend_from_slice(author.as_bytes());
            buf.extend_from_slice(&sig.timestamp.to_le_bytes());
            let mut power = [0u8; 32];
            sig.power.to_little_endian(&mut power);
            buf.extend_from_slice(&power);
            buf.extend_from_slice(&sig.signature.to_bytes());
        }
        keccak256(&buf)
    }
}
