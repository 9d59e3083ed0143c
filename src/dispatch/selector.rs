//! Sticky-key consumer selection.
//!
//! Maps the 32-bit hash of an entry's sticky key to the consumer that
//! currently owns that slot. Three strategies, all deterministic pure
//! functions of the membership so replicas agree on every selection:
//!
//! - consistent-hash ring (stable under churn, the default for AutoSplit
//!   subscriptions with consistent hashing enabled)
//! - uniform auto-split of the hash space over name-sorted members
//! - exclusive ranges claimed by each consumer at subscribe time
//!
//! The selector tracks consumers by name only; resolving a name to a live
//! consumer is the registry's job, which keeps ownership in one place.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh32::xxh32;

use crate::config::KeySharedMode;
use crate::error::DispatchError;

/// Seed for the sticky-key hash. Fixed so selections are stable across
/// brokers and restarts.
const STICKY_KEY_HASH_SEED: u32 = 0;

/// 32-bit hash of an application sticky key.
#[inline]
pub fn sticky_key_hash(key: &[u8]) -> u32 {
    xxh32(key, STICKY_KEY_HASH_SEED)
}

/// Inclusive range of hash values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRange {
    pub start: u32,
    pub end: u32,
}

impl HashRange {
    pub fn new(start: u32, end: u32) -> Result<Self, DispatchError> {
        if start > end {
            return Err(DispatchError::InvalidArgument(format!(
                "hash range start {start} exceeds end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    #[inline]
    pub fn contains(&self, hash: u32) -> bool {
        self.start <= hash && hash <= self.end
    }

    #[inline]
    pub fn overlaps(&self, other: &HashRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Consistent-hash ring: each consumer sits at `replica_points` points;
/// a hash selects the next point clockwise. Point collisions keep all
/// candidate names sorted and the query hash picks among them
/// (`hash % candidates.len()`).
#[derive(Debug, Default)]
pub struct ConsistentHashRing {
    replica_points: u32,
    points: BTreeMap<u32, Vec<String>>,
}

impl ConsistentHashRing {
    fn new(replica_points: u32) -> Self {
        Self {
            replica_points,
            points: BTreeMap::new(),
        }
    }

    fn ring_point(name: &str, replica: u32) -> u32 {
        xxh32(format!("{name}-{replica}").as_bytes(), STICKY_KEY_HASH_SEED)
    }

    fn add(&mut self, name: &str) {
        for replica in 0..self.replica_points {
            let point = Self::ring_point(name, replica);
            let owners = self.points.entry(point).or_default();
            if !owners.iter().any(|n| n == name) {
                owners.push(name.to_string());
                owners.sort();
            }
        }
    }

    fn remove(&mut self, name: &str) {
        for replica in 0..self.replica_points {
            let point = Self::ring_point(name, replica);
            if let Some(owners) = self.points.get_mut(&point) {
                owners.retain(|n| n != name);
                if owners.is_empty() {
                    self.points.remove(&point);
                }
            }
        }
    }

    fn select(&self, hash: u32) -> Option<&str> {
        let owners = self
            .points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next()) // wrap around
            .map(|(_, owners)| owners)?;
        owners
            .get(hash as usize % owners.len())
            .map(String::as_str)
    }

    /// Hash ranges owned per consumer, reconstructed from the ring. A
    /// collided point's span is attributed to the candidate its own hash
    /// selects; the point is the span's upper endpoint, so the
    /// representative lies inside the range it labels.
    fn ranges(&self) -> HashMap<String, Vec<HashRange>> {
        let mut out: HashMap<String, Vec<HashRange>> = HashMap::new();
        if self.points.is_empty() {
            return out;
        }
        let points: Vec<(u32, &str)> = self
            .points
            .iter()
            .map(|(&p, owners)| (p, owners[p as usize % owners.len()].as_str()))
            .collect();
        let mut push = |name: &str, start: u32, end: u32| {
            out.entry(name.to_string())
                .or_default()
                .push(HashRange { start, end });
        };
        for window in points.windows(2) {
            let (prev, _) = window[0];
            let (point, owner) = window[1];
            push(owner, prev + 1, point);
        }
        // Wrap-around: everything after the last point and up to the first
        // point belongs to the first point's owner.
        let (first_point, first_owner) = points[0];
        let (last_point, _) = points[points.len() - 1];
        if last_point < u32::MAX {
            push(first_owner, last_point + 1, u32::MAX);
        }
        push(first_owner, 0, first_point);
        out
    }
}

/// Uniform split of the hash space into one consecutive range per
/// consumer, recomputed on every membership change.
#[derive(Debug, Default)]
pub struct AutoSplitRanges {
    members: Vec<String>, // kept sorted
}

impl AutoSplitRanges {
    fn add(&mut self, name: &str) {
        if let Err(idx) = self.members.binary_search_by(|m| m.as_str().cmp(name)) {
            self.members.insert(idx, name.to_string());
        }
    }

    fn remove(&mut self, name: &str) {
        if let Ok(idx) = self.members.binary_search_by(|m| m.as_str().cmp(name)) {
            self.members.remove(idx);
        }
    }

    fn select(&self, hash: u32) -> Option<&str> {
        let n = self.members.len() as u64;
        if n == 0 {
            return None;
        }
        let idx = (u64::from(hash) * n) >> 32;
        Some(self.members[idx as usize].as_str())
    }

    fn ranges(&self) -> HashMap<String, Vec<HashRange>> {
        let n = self.members.len() as u64;
        self.members
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let start = ((i as u64) << 32).div_ceil(n) as u32;
                let end = ((((i as u64 + 1) << 32).div_ceil(n)) - 1) as u32;
                (name.clone(), vec![HashRange { start, end }])
            })
            .collect()
    }
}

/// Explicitly claimed ranges; disjointness is enforced at subscribe time
/// and unclaimed hashes select nobody.
#[derive(Debug, Default)]
pub struct ExclusiveRanges {
    claims: BTreeMap<u32, (u32, String)>, // start -> (end, owner)
}

impl ExclusiveRanges {
    fn add(&mut self, name: &str, ranges: &[HashRange]) -> Result<(), DispatchError> {
        if ranges.is_empty() {
            return Err(DispatchError::InvalidArgument(format!(
                "consumer {name} claimed no hash ranges"
            )));
        }
        for (i, a) in ranges.iter().enumerate() {
            if a.start > a.end {
                return Err(DispatchError::InvalidArgument(format!(
                    "hash range start {} exceeds end {}",
                    a.start, a.end
                )));
            }
            for b in &ranges[i + 1..] {
                if a.overlaps(b) {
                    return Err(DispatchError::InvalidArgument(format!(
                        "consumer {name} claimed overlapping ranges"
                    )));
                }
            }
            for (&start, &(end, ref owner)) in &self.claims {
                if a.overlaps(&HashRange { start, end }) {
                    return Err(DispatchError::InvalidArgument(format!(
                        "range [{}, {}] conflicts with consumer {owner}",
                        a.start, a.end
                    )));
                }
            }
        }
        for r in ranges {
            self.claims.insert(r.start, (r.end, name.to_string()));
        }
        Ok(())
    }

    fn remove(&mut self, name: &str) {
        self.claims.retain(|_, (_, owner)| owner != name);
    }

    fn select(&self, hash: u32) -> Option<&str> {
        let (_, &(end, ref owner)) = self.claims.range(..=hash).next_back()?;
        (hash <= end).then_some(owner.as_str())
    }

    fn ranges(&self) -> HashMap<String, Vec<HashRange>> {
        let mut out: HashMap<String, Vec<HashRange>> = HashMap::new();
        for (&start, &(end, ref owner)) in &self.claims {
            out.entry(owner.clone())
                .or_default()
                .push(HashRange { start, end });
        }
        out
    }
}

/// Selector over the three key-shared strategies.
#[derive(Debug)]
pub enum StickyKeySelector {
    ConsistentHash(ConsistentHashRing),
    AutoSplit(AutoSplitRanges),
    Exclusive(ExclusiveRanges),
}

impl StickyKeySelector {
    /// Pick the strategy for a subscription configuration.
    pub fn for_mode(
        mode: KeySharedMode,
        use_consistent_hashing: bool,
        replica_points: u32,
    ) -> Self {
        match mode {
            KeySharedMode::AutoSplit if use_consistent_hashing => {
                Self::ConsistentHash(ConsistentHashRing::new(replica_points.max(1)))
            }
            KeySharedMode::AutoSplit => Self::AutoSplit(AutoSplitRanges::default()),
            KeySharedMode::Sticky => Self::Exclusive(ExclusiveRanges::default()),
        }
    }

    /// Register a consumer. `claims` is required in Sticky mode and
    /// ignored by the other strategies.
    pub fn add_consumer(
        &mut self,
        name: &str,
        claims: Option<&[HashRange]>,
    ) -> Result<(), DispatchError> {
        match self {
            Self::ConsistentHash(ring) => {
                ring.add(name);
                Ok(())
            }
            Self::AutoSplit(split) => {
                split.add(name);
                Ok(())
            }
            Self::Exclusive(exclusive) => {
                let ranges = claims.ok_or_else(|| {
                    DispatchError::InvalidArgument(format!(
                        "consumer {name} subscribed in Sticky mode without hash ranges"
                    ))
                })?;
                exclusive.add(name, ranges)
            }
        }
    }

    pub fn remove_consumer(&mut self, name: &str) {
        match self {
            Self::ConsistentHash(ring) => ring.remove(name),
            Self::AutoSplit(split) => split.remove(name),
            Self::Exclusive(exclusive) => exclusive.remove(name),
        }
    }

    /// The consumer owning `hash`, or `None` when nobody does.
    pub fn select(&self, hash: u32) -> Option<&str> {
        match self {
            Self::ConsistentHash(ring) => ring.select(hash),
            Self::AutoSplit(split) => split.select(hash),
            Self::Exclusive(exclusive) => exclusive.select(hash),
        }
    }

    /// Hash ranges currently owned per consumer.
    pub fn consumer_ranges(&self) -> HashMap<String, Vec<HashRange>> {
        match self {
            Self::ConsistentHash(ring) => ring.ranges(),
            Self::AutoSplit(split) => split.ranges(),
            Self::Exclusive(exclusive) => exclusive.ranges(),
        }
    }
}
