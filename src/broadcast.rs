//! Multi-consumer broadcast log with head reclamation.
//!
//! A single producer appends to a chain of nodes; any number of cursors
//! iterate the chain independently, each suspending until the next node is
//! linked. A cursor pins the node it currently points at, and the head of
//! the chain is reclaimed once no cursor still needs it, bounding memory
//! while readers lag.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::BroadcastConfig;
use crate::error::{Error, Result};

/// A growing, append-only broadcast sequence.
///
/// # Lifecycle
///
/// The log starts empty (a sentinel node with sequence −1). The producer
/// appends with [`publish`](BroadcastLog::publish) or by handing a stream
/// to [`consume`](BroadcastLog::consume); the log is terminated with
/// [`finish`](BroadcastLog::finish), after which every cursor observes end
/// of stream.
///
/// # Backpressure
///
/// The producer never drops data. Once more than `max_unreclaimed`
/// elements are waiting on slow readers, [`publish`](BroadcastLog::publish)
/// waits for reclamation and eventually fails with
/// [`Error::Stalled`] if no reader makes progress.
///
/// # Example
///
/// ```ignore
/// use spool::BroadcastLog;
///
/// let log = BroadcastLog::new();
/// let mut cursor = log.subscribe()?;
/// log.consume(futures::stream::iter(1..=100));
/// while let Some(value) = cursor.next().await? {
///     println!("{value}");
/// }
/// ```
pub struct BroadcastLog<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BroadcastLog<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<T> {
    head: Mutex<Arc<Node<T>>>,
    tail: Mutex<Arc<Node<T>>>,
    next_seq: AtomicI64,
    /// Signalled whenever a node is unpinned or the head advances.
    reclaimed: Notify,
    config: BroadcastConfig,
}

struct Node<T> {
    /// `None` only for the sentinel head.
    value: Option<T>,
    seq: i64,
    /// Number of cursors currently pointing at this node.
    pinned: AtomicUsize,
    link: Mutex<Link<T>>,
    /// Signalled when the link (or the last flag) is set.
    linked: Notify,
}

struct Link<T> {
    next: Option<Arc<Node<T>>>,
    last: bool,
}

impl<T> Node<T> {
    fn sentinel() -> Arc<Self> {
        Arc::new(Self {
            value: None,
            seq: -1,
            pinned: AtomicUsize::new(0),
            link: Mutex::new(Link {
                next: None,
                last: false,
            }),
            linked: Notify::new(),
        })
    }

    fn new(value: T, seq: i64) -> Arc<Self> {
        Arc::new(Self {
            value: Some(value),
            seq,
            pinned: AtomicUsize::new(0),
            link: Mutex::new(Link {
                next: None,
                last: false,
            }),
            linked: Notify::new(),
        })
    }

    fn set_next(&self, next: Arc<Node<T>>) {
        {
            let mut link = self.link.lock().expect("lock poisoned");
            assert!(
                link.next.is_none() && !link.last,
                "node {} already linked",
                self.seq
            );
            link.next = Some(next);
        }
        self.linked.notify_waiters();
    }

    fn set_last(&self) {
        {
            let mut link = self.link.lock().expect("lock poisoned");
            if link.last || link.next.is_some() {
                return;
            }
            link.last = true;
        }
        self.linked.notify_waiters();
    }

    fn is_linked(&self) -> bool {
        let link = self.link.lock().expect("lock poisoned");
        link.next.is_some() || link.last
    }

    /// Waits until this node's forward link or last flag is set, bounded
    /// by `timeout`.
    async fn wait_linked(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.linked.notified();
            if self.is_linked() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Timeout { waited: timeout });
            }
        }
    }
}

impl<T> BroadcastLog<T> {
    /// Creates a log with the default configuration.
    pub fn new() -> Self {
        Self::with_config(BroadcastConfig::default())
    }

    /// Creates a log with an explicit configuration.
    pub fn with_config(config: BroadcastConfig) -> Self {
        let sentinel = Node::sentinel();
        Self {
            shared: Arc::new(Shared {
                head: Mutex::new(Arc::clone(&sentinel)),
                tail: Mutex::new(sentinel),
                next_seq: AtomicI64::new(0),
                reclaimed: Notify::new(),
                config,
            }),
        }
    }

    /// Number of elements not yet reclaimed.
    pub fn count(&self) -> u64 {
        let head_seq = self.shared.head.lock().expect("lock poisoned").seq;
        let tail_seq = self.shared.tail.lock().expect("lock poisoned").seq;
        (tail_seq - head_seq).max(0) as u64
    }

    /// Returns an independent cursor starting at sequence 0.
    ///
    /// Fails with [`Error::Expired`] if the log has already reclaimed its
    /// first node; a subscription must be taken before the first shrink
    /// passes it by.
    pub fn subscribe(&self) -> Result<BroadcastCursor<T>> {
        let head = self.shared.head.lock().expect("lock poisoned");
        if head.seq != -1 {
            return Err(Error::Expired);
        }
        // Pin under the head lock so a concurrent shrink cannot slip past.
        head.pinned.fetch_add(1, Ordering::SeqCst);
        Ok(BroadcastCursor {
            shared: Arc::clone(&self.shared),
            node: Arc::clone(&head),
        })
    }

    /// Appends one element, then applies backpressure if readers lag.
    ///
    /// Fails with [`Error::Stalled`] when more than `max_unreclaimed`
    /// elements are pending and no reader releases nodes within the retry
    /// budget. Data is never dropped.
    pub async fn publish(&self, value: T) -> Result<()> {
        let seq = self.shared.next_seq.fetch_add(1, Ordering::SeqCst);
        let node = Node::new(value, seq);
        {
            let mut tail = self.shared.tail.lock().expect("lock poisoned");
            tail.set_next(Arc::clone(&node));
            *tail = node;
        }
        self.await_headroom().await
    }

    /// Marks the log as terminated: the tail node becomes the last node
    /// and every waiting cursor observes end of stream. Idempotent.
    pub fn finish(&self) {
        let tail = self.shared.tail.lock().expect("lock poisoned").clone();
        tail.set_last();
    }

    /// Spawns the producer task: publishes every element of `source`, then
    /// terminates the log, also on error, so readers never hang on an
    /// abandoned stream.
    pub fn consume<S>(&self, source: S) -> tokio::task::JoinHandle<Result<()>>
    where
        S: Stream<Item = T> + Send + 'static,
        T: Send + Sync + 'static,
    {
        let log = self.clone();
        tokio::spawn(async move {
            let mut source = std::pin::pin!(source);
            let mut result = Ok(());
            while let Some(value) = source.next().await {
                if let Err(e) = log.publish(value).await {
                    tracing::warn!(error = %e, "publisher stopped, terminating log");
                    result = Err(e);
                    break;
                }
            }
            log.finish();
            result
        })
    }

    /// Reclaims every node from the head forward that is fully linked and
    /// pinned by no cursor, stopping at the terminal node. Returns the
    /// number reclaimed.
    ///
    /// Called by the producer after each publish; may also be called
    /// externally to force reclamation.
    pub fn shrink(&self) -> usize {
        let mut reclaimed = 0;
        {
            let mut head = self.shared.head.lock().expect("lock poisoned");
            loop {
                if head.pinned.load(Ordering::SeqCst) != 0 {
                    break;
                }
                let next = {
                    let link = head.link.lock().expect("lock poisoned");
                    link.next.clone()
                };
                match next {
                    Some(next) => {
                        *head = next;
                        reclaimed += 1;
                    }
                    // Unlinked or terminal: the head stays put.
                    None => break,
                }
            }
        }
        if reclaimed > 0 {
            self.shared.reclaimed.notify_waiters();
        }
        reclaimed
    }

    async fn await_headroom(&self) -> Result<()> {
        let max = self.shared.config.max_unreclaimed as u64;
        let mut waits = 0;
        loop {
            self.shrink();
            let pending = self.count();
            if pending <= max {
                return Ok(());
            }
            if waits >= self.shared.config.stall_retries {
                return Err(Error::Stalled { pending });
            }
            let notified = self.shared.reclaimed.notified();
            let _ = tokio::time::timeout(self.shared.config.stall_retry_interval, notified).await;
            waits += 1;
        }
    }
}

impl<T> Default for BroadcastLog<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// An independent reading position over a [`BroadcastLog`].
///
/// Dropping a cursor releases its pin so the log can reclaim past it.
pub struct BroadcastCursor<T> {
    shared: Arc<Shared<T>>,
    node: Arc<Node<T>>,
}

impl<T: Clone> BroadcastCursor<T> {
    /// Advances to the next element.
    ///
    /// Suspends until the producer links the next node or terminates the
    /// log; `Ok(None)` signals end of stream. If nothing is linked within
    /// the configured `link_timeout`, fails with [`Error::Timeout`]; the
    /// cursor stays valid and the call may be retried.
    pub async fn next(&mut self) -> Result<Option<T>> {
        self.node
            .wait_linked(self.shared.config.link_timeout)
            .await?;
        let next = {
            let link = self.node.link.lock().expect("lock poisoned");
            link.next.clone()
        };
        let Some(next) = next else {
            // Terminal node: the stream has ended.
            return Ok(None);
        };
        // Pin the successor before releasing the current node so no gap
        // opens for reclamation.
        next.pinned.fetch_add(1, Ordering::SeqCst);
        self.node.pinned.fetch_sub(1, Ordering::SeqCst);
        self.shared.reclaimed.notify_waiters();
        self.node = next;
        Ok(self.node.value.clone())
    }
}

impl<T> Drop for BroadcastCursor<T> {
    fn drop(&mut self) {
        self.node.pinned.fetch_sub(1, Ordering::SeqCst);
        self.shared.reclaimed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn collect(mut cursor: BroadcastCursor<i64>) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(value) = cursor.next().await.unwrap() {
            out.push(value);
        }
        out
    }

    #[tokio::test]
    async fn should_deliver_all_elements_to_single_cursor() {
        // given
        let log = BroadcastLog::new();
        let cursor = log.subscribe().unwrap();

        // when
        for value in 1..=5 {
            log.publish(value).await.unwrap();
        }
        log.finish();

        // then
        assert_eq!(collect(cursor).await, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn should_deliver_independently_to_multiple_cursors() {
        // given
        let log = BroadcastLog::new();
        let first = log.subscribe().unwrap();
        let second = log.subscribe().unwrap();

        // when
        for value in 1..=3 {
            log.publish(value).await.unwrap();
        }
        log.finish();

        // then - each cursor observes the full sequence
        assert_eq!(collect(first).await, vec![1, 2, 3]);
        assert_eq!(collect(second).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn should_expire_subscription_after_head_reclaimed() {
        // given - publishes with no cursor attached, so the producer's
        // reclamation pass advances the head past the first node
        let log = BroadcastLog::new();
        for value in 1..=3 {
            log.publish(value).await.unwrap();
        }

        // when
        let result = log.subscribe();

        // then - a late subscription fails fast instead of skipping data
        assert!(matches!(result, Err(Error::Expired)));
    }

    #[tokio::test]
    async fn should_reclaim_everything_after_cursors_finish() {
        // given
        let log = BroadcastLog::new();
        let cursor = log.subscribe().unwrap();
        for value in 1..=10 {
            log.publish(value).await.unwrap();
        }
        log.finish();

        // when
        collect(cursor).await;
        let _ = log.shrink();

        // then
        assert_eq!(log.count(), 0);
    }

    #[tokio::test]
    async fn should_treat_repeated_finish_as_noop() {
        // given
        let log = BroadcastLog::new();
        let cursor = log.subscribe().unwrap();
        log.publish(1).await.unwrap();

        // when
        log.finish();
        log.finish();

        // then
        assert_eq!(collect(cursor).await, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn should_time_out_when_nothing_is_linked() {
        // given
        let log: BroadcastLog<i64> = BroadcastLog::with_config(BroadcastConfig {
            link_timeout: Duration::from_millis(100),
            ..Default::default()
        });
        let mut cursor = log.subscribe().unwrap();

        // when
        let result = cursor.next().await;

        // then - a distinct timeout, not end of stream
        assert!(matches!(result, Err(Error::Timeout { .. })));

        // and the cursor remains usable once the producer resumes
        log.publish(7).await.unwrap();
        assert_eq!(cursor.next().await.unwrap(), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn should_stall_publisher_when_no_reader_progress() {
        // given - a lagging cursor pinning the head
        let log = BroadcastLog::with_config(BroadcastConfig {
            max_unreclaimed: 2,
            stall_retry_interval: Duration::from_millis(10),
            stall_retries: 2,
            ..Default::default()
        });
        let _cursor = log.subscribe().unwrap();
        log.publish(1).await.unwrap();
        log.publish(2).await.unwrap();

        // when - the third element exceeds the unreclaimed bound
        let result = log.publish(3).await;

        // then
        assert!(matches!(result, Err(Error::Stalled { pending: 3 })));
    }

    #[tokio::test]
    async fn should_terminate_log_from_consume_even_when_stalled() {
        // given - an unreadable log that will stall the producer
        let log = BroadcastLog::with_config(BroadcastConfig {
            max_unreclaimed: 1,
            stall_retry_interval: Duration::from_millis(1),
            stall_retries: 1,
            ..Default::default()
        });
        let mut cursor = log.subscribe().unwrap();

        // when - the producer gives up mid-stream
        let produced = log.consume(futures::stream::iter(1..=100)).await.unwrap();

        // then - the error is reported and the log is still terminated
        assert!(matches!(produced, Err(Error::Stalled { .. })));
        let mut seen = Vec::new();
        while let Some(value) = cursor.next().await.unwrap() {
            seen.push(value);
        }
        assert!(!seen.is_empty());
        assert!(seen.len() < 100);
    }
}
