//! In-memory log and cursor.
//!
//! Backs the demo broker and the tests: a segmented append-only store with
//! ledger roll-over, and a cursor that tracks individual acknowledgements
//! in a [`PositionRangeSet`] and drains them into the mark-delete pointer
//! as gaps close.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::DispatchError;

use super::cursor::{Cursor, ReplayBatch};
use super::entry::Entry;
use super::position::{Position, PositionInterval};
use super::range_set::PositionRangeSet;

/// Append-only in-memory segmented log.
pub struct MemoryLedger {
    entries_per_ledger: u64,
    inner: Mutex<LedgerState>,
}

struct LedgerState {
    entries: BTreeMap<Position, Arc<Entry>>,
    current_ledger: u64,
    next_entry: i64,
}

impl MemoryLedger {
    /// Create an empty log that rolls to a fresh ledger every
    /// `entries_per_ledger` appends.
    pub fn new(entries_per_ledger: u64) -> Self {
        assert!(entries_per_ledger > 0);
        Self {
            entries_per_ledger,
            inner: Mutex::new(LedgerState {
                entries: BTreeMap::new(),
                current_ledger: 1,
                next_entry: 0,
            }),
        }
    }

    /// Append one entry, returning its position.
    pub fn append(&self, sticky_key: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Position {
        let mut state = self.inner.lock();
        let position = Position::new(state.current_ledger, state.next_entry);
        state
            .entries
            .insert(position, Arc::new(Entry::new(position, sticky_key, payload)));
        state.next_entry += 1;
        if state.next_entry as u64 >= self.entries_per_ledger {
            state.current_ledger += 1;
            state.next_entry = 0;
        }
        position
    }

    pub fn get(&self, p: Position) -> Option<Arc<Entry>> {
        self.inner.lock().entries.get(&p).cloned()
    }

    /// Up to `max` entries strictly after `p`, ascending.
    pub fn read_after(&self, p: Position, max: usize) -> Vec<Arc<Entry>> {
        self.inner
            .lock()
            .entries
            .range((Excluded(p), Unbounded))
            .take(max)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Position of the first entry strictly after `p`.
    pub fn next_position(&self, p: Position) -> Option<Position> {
        self.inner
            .lock()
            .entries
            .range((Excluded(p), Unbounded))
            .next()
            .map(|(&pos, _)| pos)
    }

    pub fn last_position(&self) -> Option<Position> {
        self.inner.lock().entries.last_key_value().map(|(&p, _)| p)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// First ledger id used by this log.
    pub fn first_ledger_id(&self) -> u64 {
        1
    }
}

/// Cursor over a [`MemoryLedger`] with individual-ack tracking.
pub struct MemoryCursor {
    ledger: Arc<MemoryLedger>,
    closed: AtomicBool,
    state: Mutex<CursorState>,
}

struct CursorState {
    /// Last position handed out by `read_entries`; reads resume after it.
    read_position: Position,
    /// Everything at or below is acknowledged.
    mark_delete: Position,
    /// Individually-acknowledged intervals above `mark_delete`.
    acked: PositionRangeSet,
}

impl MemoryCursor {
    pub fn new(ledger: Arc<MemoryLedger>) -> Self {
        let start = Position::before_ledger(ledger.first_ledger_id());
        Self {
            ledger,
            closed: AtomicBool::new(false),
            state: Mutex::new(CursorState {
                read_position: start,
                mark_delete: start,
                acked: PositionRangeSet::new(),
            }),
        }
    }

    /// Acknowledge a single entry. Returns the new mark-delete position
    /// when the ack closed a gap and the pointer advanced.
    pub fn ack(&self, p: Position) -> Option<Position> {
        let mut state = self.state.lock();
        if p <= state.mark_delete || state.acked.contains(p) {
            return None;
        }
        state.acked.add_open_closed(p.open_lower_bound(), p);

        let mut md = state.mark_delete;
        loop {
            let Some(first) = state.acked.first_range() else {
                break;
            };
            let contiguous = first.lo <= md
                || self
                    .ledger
                    .next_position(md)
                    .is_some_and(|q| q > first.lo && q <= first.hi);
            if !contiguous {
                break;
            }
            md = md.max(first.hi);
            state.acked.remove_at_most(md);
        }
        if md > state.mark_delete {
            state.mark_delete = md;
            Some(md)
        } else {
            None
        }
    }

    /// Stop serving reads; the dispatcher shuts down on the next cycle.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn read_position(&self) -> Position {
        self.state.lock().read_position
    }
}

#[async_trait::async_trait]
impl Cursor for MemoryCursor {
    async fn read_entries(&self, max: usize) -> Result<Vec<Arc<Entry>>, DispatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DispatchError::CursorClosed);
        }
        let mut state = self.state.lock();
        let batch = self.ledger.read_after(state.read_position, max);
        if let Some(last) = batch.last() {
            state.read_position = last.position;
        }
        Ok(batch)
    }

    async fn replay_entries(
        &self,
        positions: &BTreeSet<Position>,
    ) -> Result<ReplayBatch, DispatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DispatchError::CursorClosed);
        }
        let state = self.state.lock();
        let mut batch = ReplayBatch::default();
        for &p in positions {
            if p <= state.mark_delete || state.acked.contains(p) {
                batch.unreplayable.insert(p);
                continue;
            }
            match self.ledger.get(p) {
                Some(entry) => batch.entries.push(entry),
                None => {
                    batch.unreplayable.insert(p);
                }
            }
        }
        Ok(batch)
    }

    fn mark_delete_position(&self) -> Option<Position> {
        Some(self.state.lock().mark_delete)
    }

    fn individually_deleted_intervals(&self, visit: &mut dyn FnMut(PositionInterval) -> bool) {
        let state = self.state.lock();
        for interval in state.acked.as_ranges() {
            if !visit(interval) {
                break;
            }
        }
    }

    fn rewind(&self) {
        let mut state = self.state.lock();
        state.read_position = state.mark_delete;
    }

    fn next_valid_position(&self, p: Position) -> Option<Position> {
        self.ledger.next_position(p)
    }

    fn entries_since_first_unacked(&self) -> u64 {
        let state = self.state.lock();
        let inner = self.ledger.inner.lock();
        inner
            .entries
            .range((Excluded(state.mark_delete), Unbounded))
            .take_while(|(&p, _)| p <= state.read_position)
            .count() as u64
    }
}
