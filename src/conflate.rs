//! Key-conflating producer/consumer queue.
//!
//! Under load, only the latest value per key is kept: an offer for a key
//! that is already pending replaces its value in place instead of queuing a
//! second entry. Distinct keys are delivered in first-offered order.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

use tokio::sync::Notify;

/// An unbounded blocking queue of key/value pairs that conflates pending
/// values per key.
///
/// # Guarantees
///
/// * At most one entry is pending per key; successive offers before the key
///   is consumed collapse into the latest value.
/// * No value is lost and none is delivered twice: every offer is either
///   delivered or overwritten by a later offer for the same key.
/// * Keys are delivered in the order they first became pending; conflation
///   never reorders distinct keys.
/// * `offer` never blocks and never rejects (the queue is unbounded).
///
/// # Example
///
/// ```ignore
/// use spool::ConflatingQueue;
///
/// let queue = ConflatingQueue::new();
/// queue.offer("BTCUSD", 7001);
/// queue.offer("BTCUSD", 7002); // conflated: replaces 7001
/// let (key, value) = queue.take().await;
/// assert_eq!((key, value), ("BTCUSD", 7002));
/// ```
pub struct ConflatingQueue<K, V> {
    inner: Mutex<Inner<K, V>>,
    ready: Notify,
}

struct Inner<K, V> {
    /// Latest pending value per key.
    slots: HashMap<K, V>,
    /// Keys awaiting consumption, in first-offered order.
    queue: VecDeque<K>,
}

impl<K, V> ConflatingQueue<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                queue: VecDeque::new(),
            }),
            ready: Notify::new(),
        }
    }

    /// Offers a value for a key.
    ///
    /// If the key has no pending entry, it is enqueued for delivery. If it
    /// does, the pending value is replaced and the key keeps its queue
    /// position.
    pub fn offer(&self, key: K, value: V) {
        let enqueued = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            let fresh = inner.slots.insert(key.clone(), value).is_none();
            if fresh {
                inner.queue.push_back(key);
            }
            fresh
        };
        if enqueued {
            self.ready.notify_one();
        }
    }

    /// Removes and returns the next pending pair, suspending until one is
    /// available.
    pub async fn take(&self) -> (K, V) {
        loop {
            let notified = self.ready.notified();
            if let Some(pair) = self.try_take() {
                return pair;
            }
            notified.await;
        }
    }

    /// Removes and returns the next pending pair without waiting.
    pub fn try_take(&self) -> Option<(K, V)> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let key = inner.queue.pop_front()?;
        let value = inner
            .slots
            .remove(&key)
            .expect("queued key always has a slot");
        Some((key, value))
    }

    /// Whether the delivery queue is empty. Best-effort under concurrent
    /// offers.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("lock poisoned").queue.is_empty()
    }

    /// Number of keys awaiting delivery. Best-effort under concurrent
    /// offers.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").queue.len()
    }
}

impl<K, V> Default for ConflatingQueue<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
