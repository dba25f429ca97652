//! Bounded TTL cache for ledger reads.
//!
//! Owned by whichever component needs it; nothing here is process-global.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

struct CacheEntry<V> {
    value: V,
    cached_at: Instant,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct TtlCache<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
    capacity: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(entry) = self.entries.get(key) {
            if Instant::now() < entry.expires_at {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            // Release the shard before removing from it.
            drop(entry);
            self.entries.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: K, value: V) {
        if !self.entries.contains_key(&key) {
            self.evict_until_fits();
        }
        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                value,
                cached_at: now,
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Drop expired entries, then the oldest, until one more entry fits.
    fn evict_until_fits(&self) {
        if self.entries.len() < self.capacity {
            return;
        }
        let now = Instant::now();
        self.entries.retain(|_, entry| now < entry.expires_at);
        if self.entries.len() < self.capacity {
            return;
        }

        let mut by_age: Vec<(K, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.cached_at))
            .collect();
        by_age.sort_by_key(|(_, cached_at)| *cached_at);

        let excess = self.entries.len() + 1 - self.capacity;
        let mut evicted = 0u64;
        for (key, _) in by_age.into_iter().take(excess) {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        debug!(evicted, capacity = self.capacity, "Evicted cache entries to make space");
    }

    /// Cached value for `key`, or the result of `load` (cached on success).
    /// Concurrent misses may both call `load`; the last insert wins.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }
        let value = load().await?;
        self.insert(key, value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_within_ttl() {
        let cache = TtlCache::new(4, Duration::from_secs(60));
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache = TtlCache::new(4, Duration::from_millis(5));
        cache.insert("a", 1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = TtlCache::new(2, Duration::from_secs(60));
        cache.insert(1, "one");
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(2, "two");
        cache.insert(3, "three");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&3), Some("three"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn expired_entries_go_before_live_ones() {
        let cache = TtlCache::new(2, Duration::from_millis(300));
        cache.insert(1, "one");
        std::thread::sleep(Duration::from_millis(350));
        cache.insert(2, "two");
        cache.insert(3, "three");
        assert_eq!(cache.get(&2), Some("two"));
        assert_eq!(cache.get(&3), Some("three"));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn replacing_a_key_does_not_evict() {
        let cache = TtlCache::new(2, Duration::from_secs(60));
        cache.insert(1, "one");
        cache.insert(2, "two");
        cache.insert(2, "deux");
        assert_eq!(cache.get(&1), Some("one"));
        assert_eq!(cache.get(&2), Some("deux"));
        cache.invalidate(&1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn loader_runs_once_per_ttl() {
        let cache = TtlCache::new(4, Duration::from_secs(60));
        let mut calls = 0;
        for _ in 0..3 {
            let v: Result<u32, ()> = cache
                .get_or_try_insert_with("k", || {
                    calls += 1;
                    async { Ok(42) }
                })
                .await;
            assert_eq!(v, Ok(42));
        }
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn loader_errors_are_not_cached() {
        let cache: TtlCache<&str, u32> = TtlCache::new(4, Duration::from_secs(60));
        let first: Result<u32, &str> = cache.get_or_try_insert_with("k", || async { Err("down") }).await;
        assert_eq!(first, Err("down"));
        assert!(cache.is_empty());
    }
}
