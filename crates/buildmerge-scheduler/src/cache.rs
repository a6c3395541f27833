//! Bounded least-recently-used lookup cache.
//!
//! Values are loaded through an optional miss function. Concurrent `get`s
//! for the same missing key share one load; a failed load is handed to
//! every waiter and nothing is cached, so the next `get` retries.

use buildmerge_core::{Error, Result};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

/// Loader invoked on cache misses.
pub type MissFn<K, V> = Arc<dyn Fn(K) -> BoxFuture<'static, Result<V>> + Send + Sync>;

type PendingLoad<V> = Shared<BoxFuture<'static, Result<V>>>;

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Loader invocations. Lower than `misses` when concurrent misses shared a load.
    pub loads: u64,
    pub evictions: u64,
    pub size: usize,
    pub max_size: usize,
}

struct CacheState<K, V> {
    /// Ordered from least to most recently used.
    entries: IndexMap<K, V>,
    pending: HashMap<K, PendingLoad<V>>,
    max_size: usize,
    stats: CacheStats,
}

impl<K: Eq + Hash + Clone, V: Clone> CacheState<K, V> {
    /// Look up a resident value and mark it most recently used.
    fn touch(&mut self, key: &K) -> Option<V> {
        let value = self.entries.shift_remove(key)?;
        self.entries.insert(key.clone(), value.clone());
        Some(value)
    }

    fn insert(&mut self, key: K, value: V) {
        self.entries.shift_remove(&key);
        self.entries.insert(key, value);
        self.evict();
    }

    fn evict(&mut self) {
        while self.entries.len() > self.max_size {
            self.entries.shift_remove_index(0);
            self.stats.evictions += 1;
        }
    }
}

pub struct LruCache<K, V> {
    state: Mutex<CacheState<K, V>>,
    miss_fn: Option<MissFn<K, V>>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// A cache whose misses must be filled with [`LruCache::put_new`].
    pub fn new(max_size: usize) -> Self {
        Self::build(max_size, None)
    }

    /// A cache that loads missing keys with `miss_fn`.
    pub fn with_loader<F, Fut>(max_size: usize, miss_fn: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let miss_fn: MissFn<K, V> = Arc::new(move |key| miss_fn(key).boxed());
        Self::build(max_size, Some(miss_fn))
    }

    fn build(max_size: usize, miss_fn: Option<MissFn<K, V>>) -> Self {
        let max_size = max_size.max(1);
        Self {
            state: Mutex::new(CacheState {
                entries: IndexMap::new(),
                pending: HashMap::new(),
                max_size,
                stats: CacheStats {
                    max_size,
                    ..CacheStats::default()
                },
            }),
            miss_fn,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<K, V>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the value for `key`, loading it on a miss.
    ///
    /// Without a loader, a miss is an error.
    pub async fn get(&self, key: K) -> Result<V> {
        let load = {
            let mut state = self.lock();
            if let Some(value) = state.touch(&key) {
                state.stats.hits += 1;
                return Ok(value);
            }
            state.stats.misses += 1;

            match state.pending.get(&key) {
                Some(pending) => pending.clone(),
                None => {
                    let miss_fn = self.miss_fn.as_ref().ok_or_else(|| {
                        Error::NotFound(format!("{:?} is not cached and the cache has no loader", key))
                    })?;
                    let load = miss_fn(key.clone()).shared();
                    state.pending.insert(key.clone(), load.clone());
                    state.stats.loads += 1;
                    load
                }
            }
        };

        let result = load.clone().await;

        // Whichever waiter finishes first retires the load.
        let mut state = self.lock();
        let ours = state
            .pending
            .get(&key)
            .is_some_and(|pending| pending.ptr_eq(&load));
        if ours {
            state.pending.remove(&key);
        }
        let value = result?;
        // A put_new that landed while loading wins.
        if let Some(resident) = state.entries.get(&key) {
            return Ok(resident.clone());
        }
        if ours {
            state.insert(key, value.clone());
        }
        Ok(value)
    }

    /// Return the value for `key` if resident, without loading.
    pub fn get_if_present(&self, key: &K) -> Option<V> {
        let mut state = self.lock();
        let value = state.touch(key);
        match value {
            Some(_) => state.stats.hits += 1,
            None => state.stats.misses += 1,
        }
        value
    }

    /// Insert a value the caller computed authoritatively, replacing any
    /// resident value.
    pub fn put_new(&self, key: K, value: V) {
        self.lock().insert(key, value);
    }

    /// Whether `key` is resident. Does not affect recency.
    pub fn contains(&self, key: &K) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Change the capacity, evicting least recently used entries as needed.
    pub fn set_max_size(&self, max_size: usize) {
        let mut state = self.lock();
        state.max_size = max_size.max(1);
        state.stats.max_size = state.max_size;
        state.evict();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            size: state.entries.len(),
            ..state.stats
        }
    }
}

impl<K, V> Debug for LruCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruCache")
            .field("stats", &self.stats())
            .field("has_loader", &self.miss_fn.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn counting_cache(max_size: usize) -> (LruCache<u32, String>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = LruCache::with_loader(max_size, move |key: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, Error>(format!("value-{}", key)) }
        });
        (cache, calls)
    }

    #[tokio::test]
    async fn test_loads_once_then_serves_from_memory() {
        let (cache, calls) = counting_cache(10);

        assert_eq!(cache.get(1).await.unwrap(), "value-1");
        assert_eq!(cache.get(1).await.unwrap(), "value-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[tokio::test]
    async fn test_put_new_skips_loader() {
        let (cache, calls) = counting_cache(10);
        cache.put_new(5, "authoritative".to_string());

        assert_eq!(cache.get(5).await.unwrap(), "authoritative");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        cache.put_new(5, "replaced".to_string());
        assert_eq!(cache.get(5).await.unwrap(), "replaced");
    }

    #[tokio::test]
    async fn test_evicts_least_recently_used() {
        let (cache, calls) = counting_cache(2);
        cache.get(1).await.unwrap();
        cache.get(2).await.unwrap();
        // Touch 1 so 2 becomes the oldest.
        cache.get(1).await.unwrap();
        cache.get(3).await.unwrap();

        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
        assert_eq!(cache.stats().evictions, 1);

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        cache.get(2).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_miss_without_loader_is_error() {
        let cache: LruCache<u32, String> = LruCache::new(4);
        assert!(matches!(cache.get(1).await, Err(Error::NotFound(_))));
        assert_eq!(cache.get_if_present(&1), None);

        cache.put_new(1, "one".to_string());
        assert_eq!(cache.get_if_present(&1), Some("one".to_string()));
        assert_eq!(cache.get(1).await.unwrap(), "one");

        let stats = cache.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 2);
    }

    #[tokio::test]
    async fn test_put_new_during_load_wins() {
        let release = Arc::new(Notify::new());
        let gate = release.clone();
        let cache = Arc::new(LruCache::with_loader(10, move |_: u32| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok::<_, Error>("stale".to_string())
            }
        }));

        let waiter = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get(1).await }
        });
        while cache.stats().loads < 1 {
            tokio::task::yield_now().await;
        }

        cache.put_new(1, "fresh".to_string());
        release.notify_one();

        assert_eq!(waiter.await.unwrap().unwrap(), "fresh");
        assert_eq!(cache.get_if_present(&1), Some("fresh".to_string()));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_load() {
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());
        let counter = calls.clone();
        let gate = release.clone();
        let cache = Arc::new(LruCache::with_loader(10, move |key: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok::<_, Error>(key * 10)
            }
        }));

        let first = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get(4).await }
        });
        let second = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get(4).await }
        });

        // Let both callers reach the pending load before releasing it.
        while cache.stats().misses < 2 {
            tokio::task::yield_now().await;
        }
        release.notify_one();

        assert_eq!(first.await.unwrap().unwrap(), 40);
        assert_eq!(second.await.unwrap().unwrap(), 40);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().loads, 1);
    }

    #[tokio::test]
    async fn test_loader_error_reaches_waiters_and_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = LruCache::with_loader(10, move |key: u32| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(Error::Store("connection reset".to_string()))
                } else {
                    Ok(key)
                }
            }
        });

        assert_eq!(
            cache.get(9).await,
            Err(Error::Store("connection reset".to_string()))
        );
        assert!(!cache.contains(&9));

        assert_eq!(cache.get(9).await.unwrap(), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shrinking_capacity_evicts_oldest() {
        let (cache, _) = counting_cache(3);
        for key in 1..=3 {
            cache.get(key).await.unwrap();
        }
        cache.set_max_size(1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&3));
        assert_eq!(cache.stats().max_size, 1);
    }
}
