//! Configuration for spool primitives.
//!
//! Plain structs with documented defaults. Timeouts and retry budgets that
//! govern waiting behavior are configuration, not constants, so tests and
//! latency-sensitive deployments can tighten or relax them.

use std::time::Duration;

/// Configuration for a [`WindowedCache`](crate::WindowedCache) and its
/// owned store.
///
/// # Example
///
/// ```
/// use spool::CacheConfig;
///
/// let config = CacheConfig {
///     capacity: 80,
///     eviction_step: 10,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Target number of elements kept in the in-memory tail window.
    ///
    /// Reads that start further back than `capacity` elements from the tail
    /// bypass the window and replay the backing medium directly.
    pub capacity: usize,

    /// Eviction batch size.
    ///
    /// The window is trimmed only once it overflows `capacity` by at least
    /// this many elements, so the cost of shifting memory is amortized.
    /// The window length therefore never exceeds `capacity + eviction_step`.
    pub eviction_step: usize,

    /// Capacity of the store's pending-write queue.
    ///
    /// Appends enqueue to this queue and return without waiting for the
    /// write; once the queue is full, appends wait for the writer to catch
    /// up.
    pub queue_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            eviction_step: 100,
            queue_capacity: 10_000,
        }
    }
}

/// Configuration for a [`BroadcastLog`](crate::BroadcastLog).
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Maximum number of unreclaimed elements before the publisher stalls.
    ///
    /// Caps memory use when a reader is slow: the publisher waits for
    /// reclamation instead of dropping data, and fails with
    /// [`Error::Stalled`](crate::Error::Stalled) once its retry budget is
    /// exhausted.
    pub max_unreclaimed: usize,

    /// How long a cursor waits for the next element to be linked before
    /// failing with [`Error::Timeout`](crate::Error::Timeout).
    pub link_timeout: Duration,

    /// How long the stalled publisher waits for a reclamation signal
    /// between retries.
    pub stall_retry_interval: Duration,

    /// Number of reclamation waits before a stalled publisher gives up.
    pub stall_retries: u32,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            max_unreclaimed: 10_000,
            link_timeout: Duration::from_secs(10),
            stall_retry_interval: Duration::from_millis(100),
            stall_retries: 10,
        }
    }
}
