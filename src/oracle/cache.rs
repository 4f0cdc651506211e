//! TTL cache with stale-while-revalidate windows and per-key single-flight
//! locks. Values are fresh up to the TTL, servable-but-stale up to twice the
//! TTL, and gone after that.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone)]
struct Entry<V> {
    value: V,
    stored_at: Instant,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CacheLookup<V> {
    Fresh(V),
    Stale(V),
    Miss,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

pub struct SwrCache<V: Clone> {
    ttl: Duration,
    entries: DashMap<String, Entry<V>>,
    flights: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> SwrCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            flights: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Classifies the cached value for `key` by age. Fresh lookups count as
    /// hits, everything else as misses.
    pub fn lookup(&self, key: &str) -> CacheLookup<V> {
        let result = match self.entries.get(key) {
            None => CacheLookup::Miss,
            Some(entry) => {
                let age = Instant::now().duration_since(entry.stored_at);
                if age <= self.ttl {
                    CacheLookup::Fresh(entry.value.clone())
                } else if age <= self.ttl * 2 {
                    CacheLookup::Stale(entry.value.clone())
                } else {
                    CacheLookup::Miss
                }
            }
        };
        match &result {
            CacheLookup::Fresh(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            _ => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    pub fn insert(&self, key: &str, value: V) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Per-key lock serializing upstream fetches: at most one flight per key.
    pub fn flight(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.flights
            .entry(key.to_string())
            .or_default()
            .value()
            .clone()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn value_ages_from_fresh_to_stale_to_miss() {
        let cache: SwrCache<u32> = SwrCache::new(Duration::from_secs(300));
        cache.insert("k", 7);

        assert_eq!(cache.lookup("k"), CacheLookup::Fresh(7));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(cache.lookup("k"), CacheLookup::Stale(7));

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(cache.lookup("k"), CacheLookup::Miss);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_count_fresh_hits_and_everything_else_as_misses() {
        let cache: SwrCache<u32> = SwrCache::new(Duration::from_secs(10));
        assert_eq!(cache.lookup("k"), CacheLookup::Miss);
        cache.insert("k", 1);
        cache.lookup("k");
        tokio::time::advance(Duration::from_secs(11)).await;
        cache.lookup("k");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn flight_lock_is_shared_per_key() {
        let cache: SwrCache<u32> = SwrCache::new(Duration::from_secs(10));
        let a = cache.flight("k");
        let b = cache.flight("k");
        let guard = a.lock().await;
        assert!(b.try_lock().is_err());
        drop(guard);
        assert!(b.try_lock().is_ok());
    }
}
