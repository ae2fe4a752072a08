//! Per-epoch validator set and quorum accounting

use cadence_primitives::{Address, U256};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ConsensusError, ConsensusResult};

/// A validator and its voting power
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validator {
    /// Node identity
    pub address: Address,
    /// Voting power
    pub power: U256,
}

impl Validator {
    /// Create a validator
    pub fn new(address: Address, power: impl Into<U256>) -> Self {
        Self {
            address,
            power: power.into(),
        }
    }
}

/// Immutable validator set for one epoch, ordered by address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    powers: BTreeMap<Address, U256>,
    total_power: U256,
}

impl ValidatorSet {
    /// Build a set. Duplicate members, zero-power members and zero total
    /// power are construction bugs.
    pub fn new(validators: impl IntoIterator<Item = Validator>) -> ConsensusResult<Self> {
        let mut powers = BTreeMap::new();
        for validator in validators {
            if validator.power.is_zero() {
                return Err(ConsensusError::IllegalState(format!(
                    "validator {} has zero power",
                    validator.address
                )));
            }
            if powers.insert(validator.address, validator.power).is_some() {
                return Err(ConsensusError::IllegalState(format!(
                    "duplicate validator {}",
                    validator.address
                )));
            }
        }
        let total_power = powers
            .values()
            .fold(U256::zero(), |acc, p| acc.saturating_add(*p));
        if total_power.is_zero() {
            return Err(ConsensusError::IllegalState(
                "validator set has zero total power".to_string(),
            ));
        }
        let validators = powers
            .iter()
            .map(|(address, power)| Validator::new(*address, *power))
            .collect();
        Ok(Self {
            validators,
            powers,
            total_power,
        })
    }

    /// Validators sorted by address
    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    /// Member addresses sorted
    pub fn addresses(&self) -> Vec<Address> {
        self.validators.iter().map(|v| v.address).collect()
    }

    /// Membership test
    pub fn contains(&self, address: &Address) -> bool {
        self.powers.contains_key(address)
    }

    /// Power of a member
    pub fn power_of(&self, address: &Address) -> Option<U256> {
        self.powers.get(address).copied()
    }

    /// Sum of all power
    pub fn total_power(&self) -> U256 {
        self.total_power
    }

    /// Number of validators
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Never true for a constructed set
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// 2f+1 of the total power
    pub fn quorum_threshold(&self) -> U256 {
        let total = self.total_power;
        total - (total - U256::one()) / U256::from(3u8)
    }

    /// Whether `power` reaches a quorum
    pub fn has_quorum(&self, power: U256) -> bool {
        power >= self.quorum_threshold()
    }
}

/// Accumulates per-signer entries until their power reaches a quorum
#[derive(Debug, Clone)]
pub struct ValidationState<T> {
    validator_set: Arc<ValidatorSet>,
    entries: BTreeMap<Address, T>,
    power: U256,
}

impl<T> ValidationState<T> {
    /// Empty accumulator over `validator_set`
    pub fn new(validator_set: Arc<ValidatorSet>) -> Self {
        Self {
            validator_set,
            entries: BTreeMap::new(),
            power: U256::zero(),
        }
    }

    /// Add an entry. Returns false for non-members and for signers already
    /// present.
    pub fn add(&mut self, author: Address, entry: T) -> bool {
        let Some(power) = self.validator_set.power_of(&author) else {
            return false;
        };
        if self.entries.contains_key(&author) {
            return false;
        }
        self.entries.insert(author, entry);
        self.power = self.power.saturating_add(power);
        true
    }

    /// Remove a signer's entry
    pub fn remove(&mut self, author: &Address) -> Option<T> {
        let entry = self.entries.remove(author)?;
        if let Some(power) = self.validator_set.power_of(author) {
            self.power = self.power.saturating_sub(power);
        }
        Some(entry)
    }

    /// Whether accumulated power reaches a quorum
    pub fn is_complete(&self) -> bool {
        self.validator_set.has_quorum(self.power)
    }

    /// Whether no entries are held
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Accumulated power
    pub fn power(&self) -> U256 {
        self.power
    }

    /// Entries by signer
    pub fn entries(&self) -> &BTreeMap<Address, T> {
        &self.entries
    }
}
