//! Redelivery tracker.
//!
//! Positions that were read but not delivered (no permits, fenced, or
//! their owner vanished) wait here with their sticky-key hash until a
//! replay read picks them up again. The hash side-index answers the
//! ordering-fence question "is anything older pending for these keys"
//! without walking the set.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::log::Position;

#[derive(Debug, Default)]
pub struct RedeliveryTracker {
    positions: BTreeMap<Position, u32>,
    hash_counts: HashMap<u32, usize>,
}

impl RedeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `position` for replay under `hash`. Re-adding an already
    /// tracked position is a no-op.
    pub fn add(&mut self, position: Position, hash: u32) {
        if self.positions.insert(position, hash).is_none() {
            *self.hash_counts.entry(hash).or_insert(0) += 1;
        }
    }

    /// Stop tracking `position` (it was replayed or is gone from the
    /// backlog). Returns whether it was tracked.
    pub fn remove(&mut self, position: Position) -> bool {
        match self.positions.remove(&position) {
            Some(hash) => {
                if let Some(count) = self.hash_counts.get_mut(&hash) {
                    *count -= 1;
                    if *count == 0 {
                        self.hash_counts.remove(&hash);
                    }
                }
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, position: Position) -> bool {
        self.positions.contains_key(&position)
    }

    /// Whether any tracked position carries one of these hashes.
    pub fn contains_any_hash(&self, hashes: &HashSet<u32>) -> bool {
        hashes.iter().any(|h| self.hash_counts.contains_key(h))
    }

    /// Lowest tracked position; the replay-precedence check peeks it.
    pub fn first_position(&self) -> Option<Position> {
        self.positions.first_key_value().map(|(&p, _)| p)
    }

    /// The next positions to replay, ascending, without removing them.
    /// Removal happens when they are sent or reported unreplayable.
    pub fn drain(&self, limit: usize) -> BTreeSet<Position> {
        self.positions.keys().take(limit).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(ledger: u64, entry: i64) -> Position {
        Position::new(ledger, entry)
    }

    #[test]
    fn test_add_remove_membership() {
        let mut tracker = RedeliveryTracker::new();
        tracker.add(p(1, 3), 7);
        tracker.add(p(1, 5), 9);
        tracker.add(p(1, 3), 7); // duplicate, no double count
        assert_eq!(tracker.len(), 2);
        assert!(tracker.contains(p(1, 3)));
        assert!(tracker.remove(p(1, 3)));
        assert!(!tracker.remove(p(1, 3)));
        assert!(!tracker.contains(p(1, 3)));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_hash_index_tracks_counts() {
        let mut tracker = RedeliveryTracker::new();
        tracker.add(p(1, 1), 42);
        tracker.add(p(1, 2), 42);
        let wanted: HashSet<u32> = [42].into();
        tracker.remove(p(1, 1));
        assert!(tracker.contains_any_hash(&wanted), "one position still pending");
        tracker.remove(p(1, 2));
        assert!(!tracker.contains_any_hash(&wanted));
    }

    #[test]
    fn test_drain_is_ascending_and_non_destructive() {
        let mut tracker = RedeliveryTracker::new();
        tracker.add(p(2, 0), 1);
        tracker.add(p(1, 9), 2);
        tracker.add(p(1, 4), 3);
        let drained: Vec<Position> = tracker.drain(2).into_iter().collect();
        assert_eq!(drained, vec![p(1, 4), p(1, 9)]);
        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.first_position(), Some(p(1, 4)));
    }
}
