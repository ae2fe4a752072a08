//! Aggregation of votes into quorum certificates

use cadence_primitives::{Address, H256};
use std::collections::HashMap;
use std::sync::Arc;

use crate::messages::Vote;
use crate::qc::{QuorumCertificate, TimestampedSignature, TimestampedSignatures, VoteData};
use crate::types::View;
use crate::validator::{ValidationState, ValidatorSet};

/// Last vote seen from an author
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PreviousVote {
    view: View,
    vote_data_hash: H256,
}

struct VoteAccumulator {
    vote_data: VoteData,
    state: ValidationState<TimestampedSignature>,
}

/// Vote accumulators keyed by the hash of the voted data.
///
/// Only an author's latest vote counts: a newer vote removes the older one
/// from its accumulator, which also bounds how many accumulators stay alive.
#[derive(Default)]
pub struct PendingVotes {
    accumulators: HashMap<H256, VoteAccumulator>,
    previous_votes: HashMap<Address, PreviousVote>,
}

impl PendingVotes {
    /// Empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a verified vote. Returns a QC when this vote completes a quorum.
    /// Votes from non-members are dropped.
    pub fn insert_vote(
        &mut self,
        vote: &Vote,
        validator_set: &Arc<ValidatorSet>,
    ) -> Option<QuorumCertificate> {
        let Some(power) = validator_set.power_of(&vote.author) else {
            tracing::debug!(author = %vote.author, "VOTE: dropping vote from non-member");
            return None;
        };
        let vote_data_hash = vote.vote_data.hash();
        if !self.replace_previous_vote(vote.author, vote.view(), vote_data_hash) {
            return None;
        }

        let accumulator = self
            .accumulators
            .entry(vote_data_hash)
            .or_insert_with(|| VoteAccumulator {
                vote_data: vote.vote_data.clone(),
                state: ValidationState::new(Arc::clone(validator_set)),
            });
        let signature = TimestampedSignature {
            timestamp: vote.timestamp,
            power,
            signature: vote.signature,
        };
        if !accumulator.state.add(vote.author, signature) || !accumulator.state.is_complete() {
            return None;
        }

        let accumulator = self.accumulators.remove(&vote_data_hash)?;
        let mut signatures = TimestampedSignatures::new();
        for (author, signature) in accumulator.state.entries() {
            signatures.insert(*author, signature.clone());
        }
        Some(QuorumCertificate::new(accumulator.vote_data, signatures))
    }

    /// Returns false for an exact duplicate of the author's previous vote
    fn replace_previous_vote(&mut self, author: Address, view: View, vote_data_hash: H256) -> bool {
        let this_vote = PreviousVote {
            view,
            vote_data_hash,
        };
        let Some(previous) = self.previous_votes.insert(author, this_vote) else {
            return true;
        };
        if previous == this_vote {
            return false;
        }
        if let Some(accumulator) = self.accumulators.get_mut(&previous.vote_data_hash) {
            accumulator.state.remove(&author);
            if accumulator.state.is_empty() {
                self.accumulators.remove(&previous.vote_data_hash);
            }
        }
        true
    }

    /// Number of live accumulators
    pub fn pending(&self) -> usize {
        self.accumulators.len()
    }
}
