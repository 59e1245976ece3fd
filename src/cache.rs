//! Windowed tail cache over an append-only store.
//!
//! This module provides [`WindowedCache`], which keeps the most recently
//! appended elements in memory and serves small recent range reads without
//! touching the medium. Reads that start deeper into history than the
//! window can reach bypass the cache and replay the store directly, so a
//! bulk historical scan never pollutes the window.

use std::collections::VecDeque;

use tokio::sync::Mutex;

use crate::codec::{Codec, JsonCodec};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::store::AppendStore;

/// Index value marking an invalidated window.
const INVALIDATED: i64 = -1;

/// A sliding tail window over an owned [`AppendStore`].
///
/// The window holds up to `capacity + eviction_step` elements ending at the
/// store's count. Appends go to both the store (asynchronously persisted)
/// and the window; eviction trims the oldest elements in batches of at
/// least `eviction_step` to amortize shifting.
///
/// # Read Semantics
///
/// * A range starting within `capacity` of the tail is served from the
///   window, reloading it from the store first if it is stale.
/// * A range starting deeper than `capacity` behind the tail reads the
///   store directly and leaves the window untouched.
/// * A range entirely past the count is empty, not an error.
///
/// If the window is found mid-read to no longer cover the request (it moved
/// during the call), the read fails with [`Error::WindowDesync`] rather
/// than returning wrong data.
///
/// # Concurrency
///
/// Every method touching the window runs inside a single mutex per cache
/// instance. The coarse lock is deliberate: throughput is dominated by the
/// medium, not the lock. Appends follow the store's single-appender
/// discipline; reads may come from any number of tasks.
///
/// # Example
///
/// ```ignore
/// use spool::{CacheConfig, WindowedCache};
///
/// let cache = WindowedCache::string_rows("telemetry", CacheConfig::default())?;
/// cache.append(vec!["row".into()]).await?;
/// let tail = cache.subrange(cache.count().saturating_sub(10), cache.count()).await?;
/// ```
pub struct WindowedCache<T, C> {
    store: AppendStore<T, C>,
    state: Mutex<WindowState<T>>,
    capacity: usize,
    eviction_step: usize,
}

struct WindowState<T> {
    /// Index of the first cached element, or [`INVALIDATED`].
    start: i64,
    items: VecDeque<T>,
}

impl WindowedCache<Vec<String>, JsonCodec> {
    /// Creates a cache of string rows, the common telemetry shape.
    pub fn string_rows(id: impl Into<String>, config: CacheConfig) -> Result<Self> {
        Self::create(id, JsonCodec, config)
    }
}

impl<T, C> WindowedCache<T, C>
where
    T: Clone + Send + 'static,
    C: Codec<T>,
{
    /// Creates a cache and its backing store. Must be called within a
    /// tokio runtime.
    pub fn create(id: impl Into<String>, codec: C, config: CacheConfig) -> Result<Self> {
        let store = AppendStore::create(id, codec, config.queue_capacity)?;
        Ok(Self {
            store,
            state: Mutex::new(WindowState {
                start: 0,
                items: VecDeque::new(),
            }),
            capacity: config.capacity,
            eviction_step: config.eviction_step,
        })
    }

    /// Returns the number of appended elements. See
    /// [`AppendStore::count`].
    pub fn count(&self) -> u64 {
        self.store.count()
    }

    /// Appends a single element to the store and the window.
    pub async fn append(&self, value: T) -> Result<()> {
        self.append_all(vec![value]).await
    }

    /// Appends a batch to the store (write scheduled asynchronously) and
    /// the window, then evicts. Returns without waiting for the write.
    pub async fn append_all(&self, values: Vec<T>) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        self.store.append_all(values.clone()).await?;
        if state.start >= 0 {
            state.items.extend(values);
        }
        self.evict(&mut state);
        Ok(())
    }

    /// Returns the element at `index`, or `None` past the end.
    pub async fn get(&self, index: u64) -> Result<Option<T>> {
        Ok(self
            .subrange(index, index.saturating_add(1))
            .await?
            .into_iter()
            .next())
    }

    /// Reads `from..to`, serving from the window when it covers the range
    /// and from the store otherwise.
    pub async fn subrange(&self, from: u64, to: u64) -> Result<Vec<T>> {
        if to < from {
            return Err(Error::InvalidRange { from, to });
        }
        if from >= self.store.count() {
            tracing::debug!(from, to, "range past the end, returning empty");
            return Ok(Vec::new());
        }
        let mut state = self.state.lock().await;
        let count = self.store.count();
        let to = to.min(count);
        if count - from > self.capacity as u64 {
            tracing::debug!(
                from,
                to,
                count,
                "range starts beyond window reach, reading store directly"
            );
            return self.store.subrange(from, to).await;
        }
        self.reload_if_stale(&mut state, from, count).await?;

        let offset = from as i64 - state.start;
        let start_incl = if offset >= 0 { offset as usize } else { usize::MAX };
        let end_excl = state
            .items
            .len()
            .min(start_incl.saturating_add((to - from) as usize));
        if start_incl >= end_excl {
            return Err(Error::WindowDesync {
                window_start: state.start,
                window_len: state.items.len(),
                from,
                to,
                count,
            });
        }
        Ok(state.items.range(start_incl..end_excl).cloned().collect())
    }

    /// Invalidates the window; the next cached read reloads it from the
    /// store. Idempotent.
    pub async fn clear_cache(&self) {
        let mut state = self.state.lock().await;
        tracing::info!(start = state.start, "clearing cache window");
        state.start = INVALIDATED;
        state.items = VecDeque::new();
    }

    /// Clears the store and the window. Idempotent.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.store.clear().await?;
        state.start = 0;
        state.items.clear();
        Ok(())
    }

    /// Waits for all scheduled writes to reach the medium. See
    /// [`AppendStore::drain`].
    pub async fn drain(&self) -> Result<()> {
        self.store.drain().await
    }

    /// Closes the owned store and discards the window. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await?;
        let mut state = self.state.lock().await;
        state.items = VecDeque::new();
        state.start = INVALIDATED;
        Ok(())
    }

    fn evict(&self, state: &mut WindowState<T>) {
        let overflow = state.items.len().saturating_sub(self.capacity);
        if overflow > 0 && overflow >= self.eviction_step {
            state.items.drain(..overflow);
            state.start += overflow as i64;
            tracing::debug!(start = state.start, "evicted cache window");
        }
    }

    async fn reload_if_stale(
        &self,
        state: &mut WindowState<T>,
        from: u64,
        count: u64,
    ) -> Result<()> {
        if state.start >= 0 && from as i64 >= state.start {
            return Ok(());
        }
        let start = count.saturating_sub(self.capacity as u64);
        tracing::info!(start, count, "cache miss, reloading window from store");
        state.items = self.store.subrange(start, count).await?.into();
        state.start = start as i64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::Rng;

    use super::*;

    const COUNT: u64 = 10_000;
    const CACHE_CAPACITY: usize = 80;
    const CACHE_STEP: usize = 10;
    const MAX_COUNT: u64 = 30;

    fn config() -> CacheConfig {
        CacheConfig {
            capacity: CACHE_CAPACITY,
            eviction_step: CACHE_STEP,
            queue_capacity: 10_000,
        }
    }

    fn row(index: u64) -> Vec<String> {
        vec![
            index.to_string(),
            format!("payload-a-{index}"),
            format!("payload-b-{index}"),
        ]
    }

    fn random_rows() -> Vec<Vec<String>> {
        let mut rng = rand::rng();
        (0..COUNT)
            .map(|index| {
                vec![
                    index.to_string(),
                    rng.random::<i64>().to_string(),
                    rng.random::<i64>().to_string(),
                    rng.random::<i64>().to_string(),
                ]
            })
            .collect()
    }

    async fn populated_cache() -> (WindowedCache<Vec<String>, JsonCodec>, Vec<Vec<String>>) {
        let expected = random_rows();
        let cache = WindowedCache::string_rows("rows", config()).unwrap();
        for row in &expected {
            cache.append(row.clone()).await.unwrap();
        }
        (cache, expected)
    }

    async fn window_len(cache: &WindowedCache<Vec<String>, JsonCodec>) -> usize {
        cache.state.lock().await.items.len()
    }

    async fn window_start(cache: &WindowedCache<Vec<String>, JsonCodec>) -> i64 {
        cache.state.lock().await.start
    }

    async fn assert_slice(
        cache: &WindowedCache<Vec<String>, JsonCodec>,
        expected: &[Vec<String>],
        from: u64,
        to: u64,
    ) {
        let clamped = to.min(expected.len() as u64);
        assert_eq!(
            cache.subrange(from, to).await.unwrap(),
            expected[from as usize..clamped as usize]
        );
    }

    #[tokio::test]
    async fn should_serve_recent_and_historic_slices() {
        // given
        let (cache, expected) = populated_cache().await;
        assert!(window_start(&cache).await > (COUNT - 100) as i64);

        // when / then - historic slices bypass the window, recent slices
        // hit it, and the window never outgrows capacity + step
        assert_slice(&cache, &expected, 10, 10 + MAX_COUNT).await;
        assert!(window_len(&cache).await <= CACHE_CAPACITY + CACHE_STEP);
        assert_slice(&cache, &expected, 900, 900 + MAX_COUNT).await;
        assert_slice(&cache, &expected, COUNT - 500, COUNT - 500 + MAX_COUNT).await;
        assert_slice(&cache, &expected, COUNT - 30, COUNT).await;
        assert!(window_len(&cache).await <= CACHE_CAPACITY + CACHE_STEP);
        assert!(window_start(&cache).await <= (COUNT - 30) as i64);
    }

    #[tokio::test]
    async fn should_reload_window_after_cache_clear() {
        // given
        let (cache, expected) = populated_cache().await;
        cache.clear_cache().await;

        // when - a tail read forces a reload
        let tail = cache.subrange(COUNT - 20, COUNT).await.unwrap();

        // then
        assert_eq!(tail, expected[(COUNT - 20) as usize..]);

        // and an append keeps serving a clamped tail read
        cache.append(vec!["extra".into()]).await.unwrap();
        let tail = cache.subrange(COUNT - 20, COUNT - 20 + 300).await.unwrap();
        assert_eq!(tail.len(), 21);
        assert_eq!(tail[0][0], (COUNT - 20).to_string());

        // and a full scan still round-trips through the store
        assert_eq!(
            cache.subrange(0, COUNT + 1).await.unwrap().len() as u64,
            COUNT + 1
        );
    }

    #[tokio::test]
    async fn should_leave_window_untouched_on_historic_get() {
        // given
        let (cache, expected) = populated_cache().await;
        let len_before = window_len(&cache).await;

        // when
        let first = cache.get(0).await.unwrap();

        // then
        assert_eq!(first.as_ref(), expected.first());
        assert_eq!(window_len(&cache).await, len_before);
    }

    #[tokio::test]
    async fn should_return_empty_past_the_end() {
        // given
        let (cache, _) = populated_cache().await;

        // when
        let rows = cache.subrange(COUNT * 2, COUNT * 2 + MAX_COUNT).await.unwrap();

        // then
        assert!(rows.is_empty());
        assert!(cache.get(COUNT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn should_reject_inverted_range() {
        // given
        let cache = WindowedCache::string_rows("inverted", config()).unwrap();

        // when
        let result = cache.subrange(3, 1).await;

        // then
        assert!(matches!(result, Err(Error::InvalidRange { from: 3, to: 1 })));
    }

    #[tokio::test]
    async fn should_round_trip_after_clear() {
        // given
        let (cache, _) = populated_cache().await;
        assert_eq!(cache.count(), COUNT);

        // when
        cache.clear().await.unwrap();
        cache.clear().await.unwrap(); // idempotent

        // then
        assert_eq!(cache.count(), 0);
        cache.append(vec!["fresh".into()]).await.unwrap();
        assert_eq!(
            cache.subrange(0, 1).await.unwrap(),
            vec![vec!["fresh".to_string()]]
        );
    }

    #[tokio::test]
    async fn should_treat_repeated_cache_clear_as_noop() {
        // given
        let (cache, expected) = populated_cache().await;

        // when
        cache.clear_cache().await;
        cache.clear_cache().await;

        // then - the next tail read still reloads correctly
        assert_slice(&cache, &expected, COUNT - 10, COUNT).await;
    }

    #[tokio::test]
    async fn should_round_trip_full_sequence_after_drain() {
        // given
        let cache = WindowedCache::string_rows("roundtrip", config()).unwrap();
        for index in 0..200u64 {
            cache.append(row(index)).await.unwrap();
        }

        // when
        cache.drain().await.unwrap();
        let all = cache.subrange(0, cache.count()).await.unwrap();

        // then
        let expected: Vec<Vec<String>> = (0..200).map(row).collect();
        assert_eq!(all, expected);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// Randomized append batches never violate the window bound nor the
        /// window/count relation.
        #[test]
        fn window_bound_holds_for_random_batches(
            batches in prop::collection::vec(1usize..50, 1..40),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let cache = WindowedCache::string_rows("prop", config()).unwrap();
                let mut appended = 0u64;
                for batch in batches {
                    let values: Vec<Vec<String>> =
                        (0..batch).map(|i| row(appended + i as u64)).collect();
                    appended += batch as u64;
                    cache.append_all(values).await.unwrap();

                    let state = cache.state.lock().await;
                    prop_assert!(state.items.len() <= CACHE_CAPACITY + CACHE_STEP);
                    prop_assert_eq!(
                        state.start + state.items.len() as i64,
                        cache.store.count() as i64
                    );
                    drop(state);
                }
                Ok(())
            })?;
        }
    }
}
