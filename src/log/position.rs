//! Log positions.
//!
//! A position addresses one entry in the segmented log as a
//! `(ledger_id, entry_id)` pair, ordered lexicographically. The entry id
//! `-1` is a sentinel meaning "immediately before entry 0 of the ledger"
//! and is used as the open lower bound of half-open intervals.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Entry id sentinel marking the open lower bound at the start of a ledger.
pub const ENTRY_BEFORE_FIRST: i64 = -1;

/// Address of a single entry in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub ledger_id: u64,
    pub entry_id: i64,
}

impl Position {
    /// Create a position.
    #[inline]
    pub const fn new(ledger_id: u64, entry_id: i64) -> Self {
        Self {
            ledger_id,
            entry_id,
        }
    }

    /// The sentinel position just before the first entry of a ledger.
    #[inline]
    pub const fn before_ledger(ledger_id: u64) -> Self {
        Self {
            ledger_id,
            entry_id: ENTRY_BEFORE_FIRST,
        }
    }

    /// Open lower bound for the half-open interval ending at `self`.
    ///
    /// Entry 0 maps to the `-1` sentinel of its own ledger, so an interval
    /// never straddles a ledger boundary.
    #[inline]
    pub fn open_lower_bound(&self) -> Self {
        Self {
            ledger_id: self.ledger_id,
            entry_id: self.entry_id - 1,
        }
    }

    /// Whether this position denotes an actual entry (not a sentinel).
    #[inline]
    pub fn is_entry(&self) -> bool {
        self.entry_id >= 0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ledger_id, self.entry_id)
    }
}

/// A half-open interval `(lo, hi]` over positions, with `lo < hi`.
///
/// Intervals produced by the range set never straddle a ledger boundary;
/// the span of the whole set may.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionInterval {
    /// Open lower bound (excluded).
    pub lo: Position,
    /// Closed upper bound (included).
    pub hi: Position,
}

impl PositionInterval {
    #[inline]
    pub const fn new(lo: Position, hi: Position) -> Self {
        Self { lo, hi }
    }

    /// Whether `p` lies inside `(lo, hi]`.
    #[inline]
    pub fn contains(&self, p: Position) -> bool {
        self.lo < p && p <= self.hi
    }
}

impl fmt::Display for PositionInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.lo, self.hi)
    }
}
