//! Segmented log model.
//!
//! Positions and entries, the sparse position range set, the cursor
//! interface the dispatcher consumes, and an in-memory log + cursor
//! implementation for the demo broker and the tests.

pub mod cursor;
pub mod entry;
pub mod memory;
pub mod position;
pub mod range_set;

#[cfg(test)]
mod range_set_tests;

pub use cursor::{Cursor, ReadType, ReplayBatch};
pub use entry::Entry;
pub use memory::{MemoryCursor, MemoryLedger};
pub use position::{Position, PositionInterval, ENTRY_BEFORE_FIRST};
pub use range_set::PositionRangeSet;
