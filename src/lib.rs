//! Fanout Backend Library
//!
//! Key-shared dispatch core of the broker: the segmented-log model with
//! its sparse position range set, and the sticky-key dispatcher that
//! fans entries out to competing consumers while preserving per-key
//! order under churn.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod log;

pub use config::{BrokerConfig, KeySharedMode, SubscriptionOptions};
pub use dispatch::{
    sticky_key_hash, Consumer, HashRange, RedeliveryTracker, StickyKeyDispatcher,
};
pub use error::DispatchError;
pub use log::{
    Cursor, Entry, MemoryCursor, MemoryLedger, Position, PositionInterval, PositionRangeSet,
    ReadType,
};
