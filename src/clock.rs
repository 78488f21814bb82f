//! Vector clocks over actor ids.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ActorId;

/// Highest observed sequence number for each actor.
///
/// An entry `(a, n)` with `n >= 1` means "I have observed up to `n` changes
/// from actor `a`"; a missing entry counts as zero. Clocks form a partial
/// order: `A <= B` iff every entry of `A` is `<=` the matching entry of `B`.
/// Zero entries are never stored, and the [`BTreeMap`] keeps actor ids sorted,
/// so equal clocks serialize identically.
#[derive(Debug, Serialize, Deserialize, Clone, Eq, PartialEq, Default)]
pub struct Clock {
    entries: BTreeMap<ActorId, u64>,
}

impl Clock {
    /// The empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// The observed sequence for `actor`, zero when absent.
    pub fn get(&self, actor: &ActorId) -> u64 {
        self.entries.get(actor).copied().unwrap_or(0)
    }

    /// Record a new observation, keeping the pointwise maximum.
    pub fn seen(&mut self, actor: ActorId, seq: u64) {
        if seq == 0 {
            return;
        }
        self.entries
            .entry(actor)
            .and_modify(|s| *s = (*s).max(seq))
            .or_insert(seq);
    }

    /// Merge another clock into this one (pointwise maximum).
    pub fn merge(&mut self, other: &Self) {
        for (actor, seq) in other.iter() {
            self.seen(*actor, *seq);
        }
    }

    /// Whether every entry of `self` is covered by `other`.
    pub fn le(&self, other: &Self) -> bool {
        self.iter().all(|(actor, seq)| *seq <= other.get(actor))
    }

    /// Iterate over the non-zero entries in actor id order.
    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, ActorId, u64> {
        self.entries.iter()
    }

    /// The actor ids with a non-zero entry.
    pub fn actors(&self) -> impl Iterator<Item = &ActorId> {
        self.entries.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(ActorId, u64)> for Clock {
    fn from_iter<T: IntoIterator<Item = (ActorId, u64)>>(iter: T) -> Self {
        let mut clock = Clock::new();
        for (actor, seq) in iter {
            clock.seen(actor, seq);
        }
        clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Keypair;

    fn actor() -> ActorId {
        Keypair::generate(&mut rand::thread_rng()).public()
    }

    #[test]
    fn merge_is_pointwise_max() {
        let (a, b) = (actor(), actor());
        let mut left: Clock = [(a, 3), (b, 1)].into_iter().collect();
        let right: Clock = [(a, 2), (b, 5)].into_iter().collect();
        left.merge(&right);
        assert_eq!(left.get(&a), 3);
        assert_eq!(left.get(&b), 5);
    }

    #[test]
    fn partial_order() {
        let (a, b) = (actor(), actor());
        let small: Clock = [(a, 1)].into_iter().collect();
        let big: Clock = [(a, 2), (b, 1)].into_iter().collect();
        let other: Clock = [(b, 3)].into_iter().collect();
        assert!(small.le(&big));
        assert!(!big.le(&small));
        assert!(!small.le(&other));
        assert!(!other.le(&small));
        assert!(Clock::new().le(&small));
    }

    #[test]
    fn zero_entries_are_dropped() {
        let a = actor();
        let mut clock = Clock::new();
        clock.seen(a, 0);
        assert!(clock.is_empty());
        let from_zero: Clock = [(a, 0)].into_iter().collect();
        assert_eq!(from_zero, Clock::new());
    }

    #[test]
    fn canonical_serialization() {
        let (a, b) = (actor(), actor());
        let one: Clock = [(a, 1), (b, 2)].into_iter().collect();
        let two: Clock = [(b, 2), (a, 1)].into_iter().collect();
        assert_eq!(
            postcard::to_stdvec(&one).unwrap(),
            postcard::to_stdvec(&two).unwrap()
        );
    }
}
