//! Error types for spool operations.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by spool primitives.
///
/// Invalid arguments, timeouts, and I/O failures are distinct variants so
/// callers can tell a malformed request from a stalled peer or a broken
/// medium. Background write failures are latched by the store and re-raised
/// on the next operation that touches it (see
/// [`AppendStore`](crate::AppendStore)).
#[derive(Debug, Error)]
pub enum Error {
    /// A range read was requested with `to` before `from`.
    #[error("invalid range: to={to} is before from={from}")]
    InvalidRange {
        /// Start of the requested range (inclusive).
        from: u64,
        /// End of the requested range (exclusive).
        to: u64,
    },

    /// The cache window moved underneath a read that assumed a
    /// point-in-time snapshot. Returned instead of wrong data.
    #[error(
        "cache window out of sync: window_start={window_start}, window_len={window_len}, \
         requested {from}..{to}, count={count}"
    )]
    WindowDesync {
        /// Index of the first cached element at failure time.
        window_start: i64,
        /// Number of cached elements at failure time.
        window_len: usize,
        /// Start of the requested range.
        from: u64,
        /// End of the requested range.
        to: u64,
        /// Element count of the owning store.
        count: u64,
    },

    /// An I/O error on the backing medium.
    #[error("storage I/O: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("codec: {0}")]
    Codec(String),

    /// A previously scheduled background write failed. The failure is
    /// latched: every subsequent store operation returns it.
    #[error("background write failed: {0}")]
    WriteFailed(String),

    /// The store has been closed and its medium discarded.
    #[error("store is closed")]
    Closed,

    /// Waiting for the next element (or for a drain) exceeded the
    /// configured bound.
    #[error("timed out after {waited:?} waiting for the next element")]
    Timeout {
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// The log already reclaimed its first node; new subscriptions must
    /// start before the first shrink.
    #[error("log head already reclaimed, subscription must start before the first shrink")]
    Expired,

    /// The publisher made no progress within its retry budget because no
    /// reader released nodes for reclamation.
    #[error("publisher stalled: {pending} unreclaimed elements and no reader progress")]
    Stalled {
        /// Unreclaimed element count at the time the publisher gave up.
        pending: u64,
    },
}

/// Result type for spool operations.
pub type Result<T> = std::result::Result<T, Error>;
