//! Dispatch error kinds.
//!
//! The read loop applies a fixed policy per kind: invalid arguments and
//! invariant violations surface to the caller, transport and not-ready
//! conditions are retried on the next cycle, and a closed cursor shuts the
//! dispatcher down cleanly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Caller error: selector range conflict, duplicate consumer, unknown mode.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The cursor cannot answer yet (e.g. no mark-delete position).
    #[error("not ready: {0}")]
    NotReady(&'static str),

    /// A consumer send failed; the batch goes back to redelivery.
    #[error("transport failure: {0}")]
    Transport(anyhow::Error),

    /// The cursor is gone; the dispatcher terminates cleanly.
    #[error("cursor closed")]
    CursorClosed,

    /// A broken internal invariant. Programming error, terminates dispatch.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl DispatchError {
    /// Whether the next read cycle may simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::NotReady(_))
    }
}
