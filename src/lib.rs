//! spool: concurrent buffering and streaming primitives.
//!
//! This crate moves data between producer and consumer tasks under memory
//! and I/O pressure. It provides three independent primitives:
//!
//! - [`WindowedCache`] over an [`AppendStore`]: an unbounded append-only
//!   sequence persisted asynchronously to a private temp file, with an
//!   in-memory window over the most recent elements. Recent range reads are
//!   served from memory; older or oversized reads replay the medium.
//! - [`ConflatingQueue`]: a producer/consumer queue of key/value pairs
//!   that, under load, keeps only the latest value per key instead of
//!   queuing every update.
//! - [`BroadcastLog`]: a growing append-only sequence fed by one producer
//!   and iterated concurrently by any number of independent cursors, with
//!   head reclamation once no cursor still needs a node.
//!
//! # Consistency Model
//!
//! Store writes are fire-and-forget: the element count advances
//! synchronously while persistence happens on a background writer task.
//! Readers that need the medium to match the count drain first (range
//! reads do this internally). Within each primitive, single-producer order
//! is preserved end to end; there is no ordering guarantee across
//! primitives.
//!
//! # Example
//!
//! ```ignore
//! use spool::{CacheConfig, WindowedCache};
//!
//! let cache = WindowedCache::string_rows("telemetry", CacheConfig::default())?;
//! cache.append(vec!["row-1".into()]).await?;
//! cache.append(vec!["row-2".into()]).await?;
//!
//! // Recent reads come from the in-memory window.
//! let tail = cache.subrange(0, cache.count()).await?;
//! assert_eq!(tail.len(), 2);
//! ```

mod broadcast;
mod cache;
mod codec;
mod config;
mod conflate;
mod error;
mod store;

pub use broadcast::{BroadcastCursor, BroadcastLog};
pub use cache::WindowedCache;
pub use codec::{Codec, JsonCodec};
pub use config::{BroadcastConfig, CacheConfig};
pub use conflate::ConflatingQueue;
pub use error::{Error, Result};
pub use store::AppendStore;
