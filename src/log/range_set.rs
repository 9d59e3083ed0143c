//! Sparse position range set.
//!
//! Tracks a union of half-open `(lo, hi]` intervals over log positions.
//! Storage is a directory of non-empty ledgers (`BTreeMap` by ledger id),
//! each holding its intervals as run-length pairs keyed by open lower
//! bound. Within one ledger no two runs overlap or touch; touching runs
//! are coalesced on insert.

use std::collections::BTreeMap;

use super::position::{Position, PositionInterval, ENTRY_BEFORE_FIRST};

/// Intervals of one ledger: open lower bound -> closed upper bound.
///
/// Every run `(lo, hi]` satisfies `-1 <= lo < hi` and covers the entry ids
/// `lo+1 ..= hi`.
#[derive(Debug, Clone, Default)]
struct LedgerRuns {
    runs: BTreeMap<i64, i64>,
}

impl LedgerRuns {
    fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    fn len(&self) -> usize {
        self.runs.len()
    }

    /// Add the run `(lo, hi]`, merging overlapping and touching runs.
    fn add(&mut self, lo: i64, hi: i64) {
        debug_assert!(lo >= ENTRY_BEFORE_FIRST && lo < hi);

        let mut new_lo = lo;
        let mut new_hi = hi;
        let mut absorbed = Vec::new();

        // Runs with lower bound beyond `hi` cannot overlap or touch; walk
        // backwards from `hi` and stop at the first run that ends below `lo`.
        for (&a, &b) in self.runs.range(..=hi).rev() {
            if b < lo {
                break;
            }
            new_lo = new_lo.min(a);
            new_hi = new_hi.max(b);
            absorbed.push(a);
        }
        for a in absorbed {
            self.runs.remove(&a);
        }
        self.runs.insert(new_lo, new_hi);
    }

    /// Remove the closed entry range `[lo, hi]` (entry ids, both included).
    fn remove_closed(&mut self, lo: i64, hi: i64) {
        debug_assert!(lo >= 0);
        if lo > hi {
            return;
        }

        let mut removed = Vec::new();
        let mut reinsert = Vec::new();

        // A run `(a, b]` holds entries `a+1..=b`; it intersects `[lo, hi]`
        // iff `a < hi` and `b >= lo`.
        for (&a, &b) in self.runs.range(..hi).rev() {
            if b < lo {
                break;
            }
            removed.push(a);
            if a < lo - 1 {
                reinsert.push((a, lo - 1)); // left remainder (a, lo-1]
            }
            if b > hi {
                reinsert.push((hi, b)); // right remainder (hi, b]
            }
        }
        for a in removed {
            self.runs.remove(&a);
        }
        for (a, b) in reinsert {
            self.runs.insert(a, b);
        }
    }

    /// The run containing entry `e`, if any.
    fn run_containing(&self, e: i64) -> Option<(i64, i64)> {
        let (&a, &b) = self.runs.range(..e).next_back()?;
        (b >= e).then_some((a, b))
    }

    fn contains(&self, e: i64) -> bool {
        self.run_containing(e).is_some()
    }

    fn first(&self) -> Option<(i64, i64)> {
        self.runs.first_key_value().map(|(&a, &b)| (a, b))
    }

    fn last(&self) -> Option<(i64, i64)> {
        self.runs.last_key_value().map(|(&a, &b)| (a, b))
    }

    /// Count of entries present inside the half-open window `(lo, hi]`.
    ///
    /// Touches only the runs intersecting the window.
    fn cardinality(&self, lo: i64, hi: i64) -> u64 {
        let mut count = 0u64;
        // The run containing the window start may begin below `lo`.
        if let Some((&a, &b)) = self.runs.range(..=lo).next_back() {
            if b > lo {
                count += (b.min(hi) - a.max(lo)) as u64;
            }
        }
        for (&a, &b) in self.runs.range(lo + 1..hi) {
            count += (b.min(hi) - a) as u64;
        }
        count
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        let mut prev: Option<(i64, i64)> = None;
        for (&a, &b) in &self.runs {
            assert!(a >= ENTRY_BEFORE_FIRST && a < b, "degenerate run ({a}, {b}]");
            if let Some((_, pb)) = prev {
                assert!(a > pb, "overlapping or touching runs at ({a}, {b}]");
            }
            prev = Some((a, b));
        }
    }
}

/// Sparse set of half-open position intervals.
///
/// Single-owner structure: all mutation happens on the dispatcher's
/// executor, so there is no interior locking.
#[derive(Debug, Clone, Default)]
pub struct PositionRangeSet {
    ledgers: BTreeMap<u64, LedgerRuns>,
}

impl PositionRangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the half-open range `(lo, hi]`. Empty input is a no-op.
    ///
    /// A range that straddles ledger boundaries is split at them. Only
    /// coverage the set already knows about is materialized for the lower
    /// and intermediate ledgers; the upper ledger receives `(-1, hi]`.
    pub fn add_open_closed(&mut self, lo: Position, hi: Position) {
        if lo >= hi {
            return;
        }

        if lo.ledger_id == hi.ledger_id {
            self.ledgers
                .entry(lo.ledger_id)
                .or_default()
                .add(lo.entry_id, hi.entry_id);
            return;
        }

        // Lower ledger: close every gap above the bound, up to the last
        // entry the set has seen for it.
        if let Some(runs) = self.ledgers.get_mut(&lo.ledger_id) {
            if let Some((_, last_hi)) = runs.last() {
                if last_hi > lo.entry_id {
                    runs.add(lo.entry_id, last_hi);
                }
            }
        }

        // Intermediate ledgers: conceptually fully covered; materialize up
        // to their known last entry.
        for (_, runs) in self
            .ledgers
            .range_mut(lo.ledger_id.saturating_add(1)..hi.ledger_id)
        {
            if let Some((_, last_hi)) = runs.last() {
                runs.add(ENTRY_BEFORE_FIRST, last_hi);
            }
        }

        // Upper ledger: everything from the ledger start to the bound.
        if hi.entry_id >= 0 {
            self.ledgers
                .entry(hi.ledger_id)
                .or_default()
                .add(ENTRY_BEFORE_FIRST, hi.entry_id);
        }
    }

    /// Remove the closed range `[lo, hi]` of positions.
    ///
    /// Partial overlap truncates the affected intervals; full containment
    /// splits them.
    pub fn remove_range(&mut self, lo: Position, hi: Position) {
        if lo > hi {
            return;
        }
        let affected: Vec<u64> = self
            .ledgers
            .range(lo.ledger_id..=hi.ledger_id)
            .map(|(&l, _)| l)
            .collect();
        for ledger in affected {
            let win_lo = if ledger == lo.ledger_id {
                lo.entry_id.max(0)
            } else {
                0
            };
            let win_hi = if ledger == hi.ledger_id {
                hi.entry_id
            } else {
                i64::MAX
            };
            if let Some(runs) = self.ledgers.get_mut(&ledger) {
                runs.remove_closed(win_lo, win_hi);
                if runs.is_empty() {
                    self.ledgers.remove(&ledger);
                }
            }
        }
    }

    /// Remove every position `<= p`.
    pub fn remove_at_most(&mut self, p: Position) {
        let whole: Vec<u64> = self
            .ledgers
            .range(..p.ledger_id)
            .map(|(&l, _)| l)
            .collect();
        for ledger in whole {
            self.ledgers.remove(&ledger);
        }
        if p.entry_id >= 0 {
            if let Some(runs) = self.ledgers.get_mut(&p.ledger_id) {
                runs.remove_closed(0, p.entry_id);
                if runs.is_empty() {
                    self.ledgers.remove(&p.ledger_id);
                }
            }
        }
    }

    /// Remove every position `>= p`.
    pub fn remove_at_least(&mut self, p: Position) {
        let whole: Vec<u64> = self
            .ledgers
            .range(p.ledger_id.saturating_add(1)..)
            .map(|(&l, _)| l)
            .collect();
        for ledger in whole {
            self.ledgers.remove(&ledger);
        }
        if let Some(runs) = self.ledgers.get_mut(&p.ledger_id) {
            runs.remove_closed(p.entry_id.max(0), i64::MAX);
            if runs.is_empty() {
                self.ledgers.remove(&p.ledger_id);
            }
        }
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.ledgers.clear();
    }

    /// Whether the point `p` lies in some interval.
    pub fn contains(&self, p: Position) -> bool {
        self.ledgers
            .get(&p.ledger_id)
            .is_some_and(|runs| runs.contains(p.entry_id))
    }

    /// The unique interval containing `p`, if any.
    pub fn range_containing(&self, p: Position) -> Option<PositionInterval> {
        let (a, b) = self.ledgers.get(&p.ledger_id)?.run_containing(p.entry_id)?;
        Some(PositionInterval::new(
            Position::new(p.ledger_id, a),
            Position::new(p.ledger_id, b),
        ))
    }

    /// Lowest interval, or `None` when empty.
    pub fn first_range(&self) -> Option<PositionInterval> {
        let (&ledger, runs) = self.ledgers.first_key_value()?;
        let (a, b) = runs.first()?;
        Some(PositionInterval::new(
            Position::new(ledger, a),
            Position::new(ledger, b),
        ))
    }

    /// Highest interval, or `None` when empty.
    pub fn last_range(&self) -> Option<PositionInterval> {
        let (&ledger, runs) = self.ledgers.last_key_value()?;
        let (a, b) = runs.last()?;
        Some(PositionInterval::new(
            Position::new(ledger, a),
            Position::new(ledger, b),
        ))
    }

    /// `(first.lo, last.hi]` of the union, or `None` when empty.
    pub fn span(&self) -> Option<PositionInterval> {
        Some(PositionInterval::new(
            self.first_range()?.lo,
            self.last_range()?.hi,
        ))
    }

    /// Number of stored intervals.
    pub fn len(&self) -> usize {
        self.ledgers.values().map(LedgerRuns::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ledgers.is_empty()
    }

    /// Ascending iterator over the intervals.
    pub fn as_ranges(&self) -> impl Iterator<Item = PositionInterval> + '_ {
        self.ledgers.iter().flat_map(|(&ledger, runs)| {
            runs.runs.iter().map(move |(&a, &b)| {
                PositionInterval::new(Position::new(ledger, a), Position::new(ledger, b))
            })
        })
    }

    /// Visit raw interval bounds ascending; stop when the visitor says so.
    pub fn for_each_raw_range<F>(&self, mut visitor: F)
    where
        F: FnMut(u64, i64, u64, i64) -> bool,
    {
        for (&ledger, runs) in &self.ledgers {
            for (&a, &b) in &runs.runs {
                if !visitor(ledger, a, ledger, b) {
                    return;
                }
            }
        }
    }

    /// Count of present entries inside the half-open window `(lo, hi]`.
    pub fn cardinality(&self, lo: Position, hi: Position) -> u64 {
        if lo >= hi {
            return 0;
        }
        let mut count = 0u64;
        for (&ledger, runs) in self.ledgers.range(lo.ledger_id..=hi.ledger_id) {
            let win_lo = if ledger == lo.ledger_id {
                lo.entry_id
            } else {
                ENTRY_BEFORE_FIRST
            };
            let win_hi = if ledger == hi.ledger_id {
                hi.entry_id
            } else {
                i64::MAX
            };
            count += runs.cardinality(win_lo, win_hi);
        }
        count
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        for (ledger, runs) in &self.ledgers {
            assert!(!runs.is_empty(), "empty ledger {ledger} in directory");
            runs.assert_invariants();
        }
    }
}
