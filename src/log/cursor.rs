//! Cursor interface.
//!
//! The dispatcher consumes the log exclusively through this trait: batch
//! reads from the current read position, targeted replay reads, the
//! mark-delete pointer and the individually-acknowledged gaps above it.
//! Durable storage behind the cursor is someone else's problem.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::DispatchError;

use super::entry::Entry;
use super::position::{Position, PositionInterval};

/// How a batch of entries was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadType {
    /// Forward read from the cursor's read position.
    Normal,
    /// Targeted re-read of previously deferred positions.
    Replay,
}

/// Result of a replay read.
#[derive(Debug, Default)]
pub struct ReplayBatch {
    /// Entries found, ascending by position.
    pub entries: Vec<Arc<Entry>>,
    /// Requested positions that no longer exist in the backlog
    /// (acknowledged or trimmed); the caller must stop tracking them.
    pub unreplayable: BTreeSet<Position>,
}

/// Subscription cursor over the segmented log.
#[async_trait::async_trait]
pub trait Cursor: Send + Sync {
    /// Read up to `max` entries past the read position, advancing it.
    /// An empty result means the backlog is drained, not an error.
    async fn read_entries(&self, max: usize) -> Result<Vec<Arc<Entry>>, DispatchError>;

    /// Re-read the given positions. Positions that cannot be replayed are
    /// reported back in [`ReplayBatch::unreplayable`].
    async fn replay_entries(
        &self,
        positions: &BTreeSet<Position>,
    ) -> Result<ReplayBatch, DispatchError>;

    /// Highest position such that everything at or below is acknowledged,
    /// or `None` when the cursor cannot tell yet.
    fn mark_delete_position(&self) -> Option<Position>;

    /// Visit the individually-acknowledged intervals above the mark-delete
    /// position, ascending; stop when the visitor returns `false`.
    fn individually_deleted_intervals(&self, visit: &mut dyn FnMut(PositionInterval) -> bool);

    /// Reset the read position back to the mark-delete position.
    fn rewind(&self);

    /// Position of the first durable entry strictly after `p`, or `None`
    /// when the log ends there. Used to detect gaps at ledger boundaries.
    fn next_valid_position(&self, p: Position) -> Option<Position>;

    /// Number of backlog entries between the first unacknowledged message
    /// and the read position. Feeds the join-fence heuristic.
    fn entries_since_first_unacked(&self) -> u64;
}
