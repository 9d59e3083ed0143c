//! Range set test suite.
//!
//! Scenario coverage plus a randomized comparison against a naive
//! reference model (a plain set of entry ids), with a seeded RNG so every
//! failure reproduces.

use std::collections::BTreeSet;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::position::{Position, PositionInterval};
use super::range_set::PositionRangeSet;

fn p(ledger: u64, entry: i64) -> Position {
    Position::new(ledger, entry)
}

fn interval(lo_l: u64, lo_e: i64, hi_l: u64, hi_e: i64) -> PositionInterval {
    PositionInterval::new(p(lo_l, lo_e), p(hi_l, hi_e))
}

fn ranges_of(set: &PositionRangeSet) -> Vec<PositionInterval> {
    set.as_ranges().collect()
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[test]
fn test_single_ledger_disjoint_adds_are_kept_exactly() {
    let mut set = PositionRangeSet::new();
    set.add_open_closed(p(0, -1), p(0, 5));
    set.add_open_closed(p(0, 7), p(0, 10));
    set.add_open_closed(p(0, 97), p(0, 99));
    set.add_open_closed(p(0, 101), p(0, 106));
    set.assert_invariants();

    assert_eq!(
        ranges_of(&set),
        vec![
            interval(0, -1, 0, 5),
            interval(0, 7, 0, 10),
            interval(0, 97, 0, 99),
            interval(0, 101, 0, 106),
        ]
    );
    assert_eq!(set.len(), 4);
    assert_eq!(set.first_range(), Some(interval(0, -1, 0, 5)));
    assert_eq!(set.last_range(), Some(interval(0, 101, 0, 106)));
    assert_eq!(set.span(), Some(interval(0, -1, 0, 106)));
}

#[test]
fn test_cross_ledger_adds_normalize_to_known_coverage() {
    let mut set = PositionRangeSet::new();
    set.add_open_closed(p(0, 98), p(0, 99));
    set.add_open_closed(p(0, 100), p(1, 5));
    set.add_open_closed(p(1, 10), p(1, 15));
    set.add_open_closed(p(1, 20), p(2, 10));
    set.assert_invariants();

    assert_eq!(
        ranges_of(&set),
        vec![
            interval(0, 98, 0, 99),
            interval(1, -1, 1, 5),
            interval(1, 10, 1, 15),
            interval(2, -1, 2, 10),
        ]
    );
}

#[test]
fn test_cross_ledger_add_merges_existing_tail_coverage() {
    let mut set = PositionRangeSet::new();
    set.add_open_closed(p(0, 200), p(0, 210));
    set.add_open_closed(p(1, 3), p(1, 7));
    // Spans ledgers 0..2: ledger 0 closes its gap up to 210, ledger 1 is
    // intermediate and collapses to its known last entry, ledger 2 takes
    // the bounded head.
    set.add_open_closed(p(0, 100), p(2, 5));
    set.assert_invariants();

    assert_eq!(
        ranges_of(&set),
        vec![
            interval(0, 100, 0, 210),
            interval(1, -1, 1, 7),
            interval(2, -1, 2, 5),
        ]
    );
}

#[test]
fn test_cardinality_of_half_open_window() {
    let mut set = PositionRangeSet::new();
    set.add_open_closed(p(1, 0), p(1, 20));
    set.add_open_closed(p(1, 30), p(1, 90));
    assert_eq!(set.cardinality(p(1, 0), p(1, 100)), 80);
    // Window cut inside both runs.
    assert_eq!(set.cardinality(p(1, 10), p(1, 40)), 20);
    // Degenerate window.
    assert_eq!(set.cardinality(p(1, 50), p(1, 50)), 0);
}

#[test]
fn test_remove_at_most_truncates_across_ledgers() {
    let mut set = PositionRangeSet::new();
    set.add_open_closed(p(0, 1), p(0, 50));
    set.add_open_closed(p(1, 9), p(1, 15));
    set.add_open_closed(p(2, 24), p(2, 28));
    set.add_open_closed(p(3, 11), p(3, 20));
    set.remove_at_most(p(2, 27));
    set.assert_invariants();

    assert_eq!(
        ranges_of(&set),
        vec![interval(2, 27, 2, 28), interval(3, 11, 3, 20)]
    );
}

// =============================================================================
// COALESCING AND SPLITTING
// =============================================================================

#[test]
fn test_touching_intervals_coalesce() {
    let mut set = PositionRangeSet::new();
    set.add_open_closed(p(0, 0), p(0, 5));
    set.add_open_closed(p(0, 5), p(0, 9));
    assert_eq!(ranges_of(&set), vec![interval(0, 0, 0, 9)]);

    // Overlap coalesces too.
    set.add_open_closed(p(0, 3), p(0, 12));
    assert_eq!(ranges_of(&set), vec![interval(0, 0, 0, 12)]);

    // Bridging two runs collapses everything in between.
    set.add_open_closed(p(0, 20), p(0, 25));
    set.add_open_closed(p(0, 10), p(0, 22));
    assert_eq!(ranges_of(&set), vec![interval(0, 0, 0, 25)]);
    set.assert_invariants();
}

#[test]
fn test_remove_range_splits_on_full_containment() {
    let mut set = PositionRangeSet::new();
    set.add_open_closed(p(0, 0), p(0, 10));
    set.remove_range(p(0, 3), p(0, 5));
    assert_eq!(
        ranges_of(&set),
        vec![interval(0, 0, 0, 2), interval(0, 5, 0, 10)]
    );
    set.assert_invariants();
}

#[test]
fn test_remove_range_truncates_on_partial_overlap() {
    let mut set = PositionRangeSet::new();
    set.add_open_closed(p(0, 4), p(0, 9));
    set.remove_range(p(0, 8), p(0, 30));
    assert_eq!(ranges_of(&set), vec![interval(0, 4, 0, 7)]);
    set.remove_range(p(0, 0), p(0, 5));
    assert_eq!(ranges_of(&set), vec![interval(0, 5, 0, 7)]);
    set.assert_invariants();
}

#[test]
fn test_add_remove_round_trip_leaves_empty() {
    let mut set = PositionRangeSet::new();
    set.add_open_closed(p(0, 4), p(0, 9));
    set.remove_range(p(0, 5), p(0, 9));
    assert!(set.is_empty());
    assert_eq!(set.span(), None);
    assert_eq!(set.first_range(), None);

    // Overlapping adds, then removal of the union.
    set.add_open_closed(p(0, 2), p(0, 8));
    set.add_open_closed(p(0, 5), p(0, 14));
    set.remove_range(p(0, 3), p(0, 14));
    assert!(set.is_empty());
}

#[test]
fn test_sentinel_round_trips_through_first_range() {
    let mut set = PositionRangeSet::new();
    set.add_open_closed(p(3, -1), p(3, 4));
    assert_eq!(set.first_range(), Some(interval(3, -1, 3, 4)));
    assert!(set.contains(p(3, 0)));
    assert!(!set.contains(p(3, 5)));
}

#[test]
fn test_empty_input_never_creates_storage() {
    let mut set = PositionRangeSet::new();
    set.add_open_closed(p(1, 5), p(1, 5));
    set.add_open_closed(p(1, 7), p(1, 6));
    assert!(set.is_empty());
}

// =============================================================================
// LOOKUPS AND ITERATION
// =============================================================================

#[test]
fn test_contains_matches_range_containing() {
    let mut set = PositionRangeSet::new();
    set.add_open_closed(p(1, 4), p(1, 9));
    assert!(!set.contains(p(1, 4)));
    assert!(set.contains(p(1, 5)));
    assert!(set.contains(p(1, 9)));
    assert!(!set.contains(p(1, 10)));
    assert_eq!(set.range_containing(p(1, 7)), Some(interval(1, 4, 1, 9)));
    assert_eq!(set.range_containing(p(1, 4)), None);
    assert_eq!(set.range_containing(p(2, 7)), None);
}

#[test]
fn test_for_each_raw_range_stops_on_false() {
    let mut set = PositionRangeSet::new();
    set.add_open_closed(p(0, 0), p(0, 2));
    set.add_open_closed(p(1, 0), p(1, 2));
    set.add_open_closed(p(2, 0), p(2, 2));
    let mut seen = Vec::new();
    set.for_each_raw_range(|lo_l, lo_e, hi_l, hi_e| {
        seen.push((lo_l, lo_e, hi_l, hi_e));
        seen.len() < 2
    });
    assert_eq!(seen, vec![(0, 0, 0, 2), (1, 0, 1, 2)]);
}

#[test]
fn test_remove_at_least() {
    let mut set = PositionRangeSet::new();
    set.add_open_closed(p(1, 0), p(1, 10));
    set.add_open_closed(p(2, 0), p(2, 10));
    set.remove_at_least(p(1, 6));
    assert_eq!(ranges_of(&set), vec![interval(1, 0, 1, 5)]);
    set.remove_at_least(p(1, -1));
    assert!(set.is_empty());
}

// =============================================================================
// REFERENCE-MODEL COMPARISON
// =============================================================================

/// Naive model: the set of present entry ids of a single ledger.
#[derive(Default)]
struct Model {
    entries: BTreeSet<i64>,
}

impl Model {
    fn add(&mut self, lo: i64, hi: i64) {
        self.entries.extend(lo + 1..=hi);
    }

    fn remove(&mut self, lo: i64, hi: i64) {
        self.entries.retain(|e| *e < lo || *e > hi);
    }

    /// Maximal runs of consecutive entries as open-closed intervals.
    fn intervals(&self, ledger: u64) -> Vec<PositionInterval> {
        let mut out = Vec::new();
        let mut run: Option<(i64, i64)> = None;
        for &e in &self.entries {
            run = match run {
                Some((first, last)) if e == last + 1 => Some((first, e)),
                Some((first, last)) => {
                    out.push(interval(ledger, first - 1, ledger, last));
                    Some((e, e))
                }
                None => Some((e, e)),
            };
        }
        if let Some((first, last)) = run {
            out.push(interval(ledger, first - 1, ledger, last));
        }
        out
    }
}

#[test]
fn test_randomized_ops_match_reference_model() {
    const LEDGER: u64 = 7;
    const MAX_ENTRY: i64 = 200;

    let mut rng = ChaCha8Rng::seed_from_u64(0xfa9_0u64);
    for _ in 0..200 {
        let mut set = PositionRangeSet::new();
        let mut model = Model::default();

        for _ in 0..40 {
            if rng.gen_bool(0.65) {
                let lo = rng.gen_range(-1..MAX_ENTRY);
                let hi = rng.gen_range(lo + 1..=MAX_ENTRY);
                set.add_open_closed(p(LEDGER, lo), p(LEDGER, hi));
                model.add(lo, hi);
            } else {
                let lo = rng.gen_range(0..=MAX_ENTRY);
                let hi = rng.gen_range(lo..=MAX_ENTRY);
                set.remove_range(p(LEDGER, lo), p(LEDGER, hi));
                model.remove(lo, hi);
            }

            set.assert_invariants();
            assert_eq!(ranges_of(&set), model.intervals(LEDGER));
            assert_eq!(
                set.cardinality(p(LEDGER, -1), p(LEDGER, MAX_ENTRY)),
                model.entries.len() as u64
            );
        }

        // Point membership agrees everywhere.
        for e in 0..=MAX_ENTRY {
            assert_eq!(
                set.contains(p(LEDGER, e)),
                model.entries.contains(&e),
                "entry {e} disagrees"
            );
        }
    }
}

#[test]
fn test_first_and_last_bound_all_ranges() {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut set = PositionRangeSet::new();
    for _ in 0..60 {
        let ledger = rng.gen_range(0..4u64);
        let lo = rng.gen_range(-1..100i64);
        let hi = rng.gen_range(lo + 1..=100i64);
        set.add_open_closed(p(ledger, lo), p(ledger, hi));
    }
    let first = set.first_range().unwrap();
    let last = set.last_range().unwrap();
    for r in set.as_ranges() {
        assert!(first.lo <= r.lo && first.hi <= r.hi);
        assert!(last.hi >= r.hi && last.lo >= r.lo);
    }
    let span = set.span().unwrap();
    assert_eq!(span.lo, first.lo);
    assert_eq!(span.hi, last.hi);
}
