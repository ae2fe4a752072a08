//! Power-weighted rotating leader schedule

use cadence_primitives::{Address, U256};
use lru::LruCache;
use std::num::NonZeroUsize;

use crate::types::View;
use crate::validator::ValidatorSet;

/// Smooth weighted round-robin over the validator set.
///
/// Each step every validator gains its power; the heaviest (lowest address on
/// ties) leads and pays back the total power. The leader of view `v` is the
/// result of step `v + 1`. The schedule repeats every `total / gcd(powers)`
/// steps, so views are reduced modulo that period when it fits in a `u64`.
///
/// Weights are kept shifted by the total power so they stay unsigned.
pub struct WeightedRotatingLeaders {
    validators: Vec<(Address, U256)>,
    total: U256,
    period: Option<u64>,
    weights: Vec<U256>,
    /// Number of steps already applied to `weights`
    steps: u64,
    cache: LruCache<u64, Address>,
}

impl WeightedRotatingLeaders {
    /// Build a schedule for `validator_set`
    pub fn new(validator_set: &ValidatorSet, cache_size: usize) -> Self {
        let validators: Vec<(Address, U256)> = validator_set
            .validators()
            .iter()
            .map(|v| (v.address, v.power))
            .collect();
        let total = validator_set.total_power();
        let divisor = validators
            .iter()
            .fold(U256::zero(), |acc, (_, power)| gcd(acc, *power));
        let period = if divisor.is_zero() {
            None
        } else {
            let cycle = total / divisor;
            (cycle <= U256::from(u64::MAX)).then(|| cycle.as_u64())
        };
        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        let weights = vec![total; validators.len()];
        Self {
            validators,
            total,
            period,
            weights,
            steps: 0,
            cache: LruCache::new(cache_size),
        }
    }

    /// Leader of `view`. Pure in (validator set, view); the cache only saves work.
    pub fn proposer(&mut self, view: View) -> Address {
        let index = match self.period {
            Some(period) => view.number() % period,
            None => view.number(),
        };
        if let Some(address) = self.cache.get(&index) {
            return *address;
        }
        if index < self.steps {
            self.reset();
        }
        let mut leader = self.step();
        while self.steps <= index {
            leader = self.step();
        }
        self.cache.put(index, leader);
        leader
    }

    fn reset(&mut self) {
        self.weights.iter_mut().for_each(|w| *w = self.total);
        self.steps = 0;
    }

    /// Apply one step and return its leader. Step `k` (0-based) leads view `k`.
    fn step(&mut self) -> Address {
        let mut heaviest = 0;
        for (i, (_, power)) in self.validators.iter().enumerate() {
            self.weights[i] = self.weights[i].saturating_add(*power);
            if self.weights[i] > self.weights[heaviest] {
                heaviest = i;
            }
        }
        self.weights[heaviest] = self.weights[heaviest].saturating_sub(self.total);
        self.steps += 1;
        let leader = self.validators[heaviest].0;
        self.cache.put(self.steps - 1, leader);
        leader
    }
}

fn gcd(a: U256, b: U256) -> U256 {
    let (mut a, mut b) = (a, b);
    while !b.is_zero() {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::Validator;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn addr(n: u8) -> Address {
        Address::from_bytes([n; 20])
    }

    fn set(powers: &[u64]) -> ValidatorSet {
        ValidatorSet::new(
            powers
                .iter()
                .enumerate()
                .map(|(i, p)| Validator::new(addr(i as u8 + 1), *p)),
        )
        .unwrap()
    }

    #[test]
    fn test_equal_power_cycles_in_address_order() {
        let mut leaders = WeightedRotatingLeaders::new(&set(&[1, 1, 1, 1]), 10);
        let schedule: Vec<Address> = (0..8).map(|v| leaders.proposer(View::of(v))).collect();
        assert_eq!(
            schedule,
            vec![addr(1), addr(2), addr(3), addr(4), addr(1), addr(2), addr(3), addr(4)]
        );
    }

    #[test]
    fn test_weighted_frequency() {
        let mut leaders = WeightedRotatingLeaders::new(&set(&[3, 1]), 4);
        let mut counts: HashMap<Address, usize> = HashMap::new();
        for v in 0..400 {
            *counts.entry(leaders.proposer(View::of(v))).or_default() += 1;
        }
        assert_eq!(counts[&addr(1)], 300);
        assert_eq!(counts[&addr(2)], 100);
    }

    #[test]
    fn test_smooth_interleaving() {
        let mut leaders = WeightedRotatingLeaders::new(&set(&[5, 1, 1]), 16);
        let schedule: Vec<Address> = (0..7).map(|v| leaders.proposer(View::of(v))).collect();
        assert_eq!(
            schedule,
            vec![addr(1), addr(1), addr(2), addr(1), addr(3), addr(1), addr(1)]
        );
    }

    #[test]
    fn test_huge_powers_have_no_period() {
        let vs = ValidatorSet::new(vec![
            Validator::new(addr(1), U256::MAX / U256::from(4u8)),
            Validator::new(addr(2), U256::from(1u8)),
        ])
        .unwrap();
        let mut leaders = WeightedRotatingLeaders::new(&vs, 2);
        assert_eq!(leaders.proposer(View::of(0)), addr(1));
        assert_eq!(leaders.proposer(View::of(1000)), addr(1));
    }

    proptest! {
        #[test]
        fn prop_schedule_independent_of_query_order(
            powers in proptest::collection::vec(1u64..20, 1..6),
            views in proptest::collection::vec(0u64..300, 1..40),
        ) {
            let vs = set(&powers);
            let mut fresh = WeightedRotatingLeaders::new(&vs, 3);
            let mut sequential = WeightedRotatingLeaders::new(&vs, 3);
            let reference: Vec<Address> = (0..300).map(|v| sequential.proposer(View::of(v))).collect();
            for v in views {
                prop_assert_eq!(fresh.proposer(View::of(v)), reference[v as usize]);
            }
        }
    }
}
