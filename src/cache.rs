//! Response cache keyed by query name.
//!
//! Entries expire passively: a lookup hands back whatever is stored and the
//! caller decides whether it is still fresh. Memory stays bounded through a
//! capacity limit (oldest entries evicted first, in batches) and an optional background sweep.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A full cache evicts `capacity / EVICTION_BATCH_DIVISOR` of its oldest
/// entries at once so that scans happen once per batch, not once per insert.
const EVICTION_BATCH_DIVISOR: usize = 10;

/// One cached upstream response. Never mutated; a refresh replaces it whole.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    payload: Bytes,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    pub fn new(payload: Bytes, ttl: Duration) -> Self {
        Self {
            payload,
            created_at: Instant::now(),
            ttl,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Expired strictly after `ttl` has elapsed; at exactly `ttl` the entry is still served.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

pub struct DnsCache {
    entries: DashMap<String, CacheEntry>,
    capacity: usize,
}

impl DnsCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Stored entry for `name`, expired or not.
    pub fn lookup(&self, name: &str) -> Option<CacheEntry> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    /// Payload for `name` only while its entry is unexpired.
    pub fn get_fresh(&self, name: &str) -> Option<Bytes> {
        self.lookup(name)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.payload)
    }

    /// Insert a fresh entry for `name`, replacing any previous one.
    pub fn store(&self, name: &str, payload: Bytes, ttl: Duration) {
        if !self.entries.contains_key(name) && self.entries.len() >= self.capacity {
            self.make_room();
        }

        self.entries
            .insert(name.to_owned(), CacheEntry::new(payload, ttl));
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired_at(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // Concurrent stores may briefly overshoot capacity by the number of racing inserts.
    fn make_room(&self) {
        let purged = self.purge_expired();
        if purged > 0 {
            debug!(purged, "Dropped expired entries to make room");
        }

        if self.entries.len() < self.capacity {
            return;
        }

        let batch = self.eviction_batch();
        let mut oldest: BinaryHeap<(Instant, String)> = BinaryHeap::with_capacity(batch + 1);
        for entry in self.entries.iter() {
            let created_at = entry.value().created_at;
            if oldest.len() == batch
                && oldest.peek().is_some_and(|(newest, _)| created_at >= *newest)
            {
                continue;
            }
            oldest.push((created_at, entry.key().clone()));
            if oldest.len() > batch {
                oldest.pop();
            }
        }

        let evicted = oldest.len();
        for (_, name) in oldest {
            self.entries.remove(&name);
        }
        debug!(evicted, remaining = self.entries.len(), "Evicted oldest cache entries");
    }

    /// Entries dropped per full-cache eviction: a tenth of capacity, at least one.
    fn eviction_batch(&self) -> usize {
        (self.capacity / EVICTION_BATCH_DIVISOR).max(1)
    }

    /// Periodically purge expired entries until `shutdown` is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Cache sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = cache.purge_expired();
                        if removed > 0 {
                            debug!(removed, remaining = cache.len(), "Swept expired cache entries");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(tag: &str) -> Bytes {
        Bytes::copy_from_slice(tag.as_bytes())
    }

    #[test]
    fn test_lookup_returns_stored_bytes() {
        let cache = DnsCache::new(16);
        cache.store("example.com", payload("answer"), Duration::from_secs(30));

        let entry = cache.lookup("example.com").unwrap();
        assert_eq!(entry.payload(), &payload("answer"));
        assert_eq!(entry.ttl(), Duration::from_secs(30));
        assert!(!entry.is_expired());
    }

    #[test]
    fn test_lookup_missing() {
        let cache = DnsCache::new(16);
        assert!(cache.lookup("nothing.test").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_overwrite_replaces_payload() {
        let cache = DnsCache::new(16);
        cache.store("example.com", payload("old"), Duration::from_secs(30));
        cache.store("example.com", payload("new"), Duration::from_secs(30));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_fresh("example.com"), Some(payload("new")));
    }

    #[test]
    fn test_independent_keys() {
        let cache = DnsCache::new(16);
        cache.store("a.test", payload("a"), Duration::from_secs(30));
        assert!(cache.lookup("b.test").is_none());

        cache.store("b.test", payload("b"), Duration::from_secs(30));
        assert_eq!(cache.get_fresh("a.test"), Some(payload("a")));
        assert_eq!(cache.get_fresh("b.test"), Some(payload("b")));
    }

    #[test]
    fn test_keys_are_case_sensitive() {
        let cache = DnsCache::new(16);
        cache.store("Example.com", payload("upper"), Duration::from_secs(30));
        assert!(cache.lookup("example.com").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_boundary() {
        let cache = DnsCache::new(16);
        cache.store("example.com", payload("answer"), Duration::from_secs(5));

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert_eq!(cache.get_fresh("example.com"), Some(payload("answer")));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(cache.get_fresh("example.com").is_none());

        // Passive expiry: the stale entry is still held.
        let stale = cache.lookup("example.com").unwrap();
        assert!(stale.is_expired());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_after_expiry() {
        let cache = DnsCache::new(16);
        cache.store("example.com", payload("first"), Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;

        cache.store("example.com", payload("second"), Duration::from_secs(1));
        assert_eq!(cache.get_fresh("example.com"), Some(payload("second")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let cache = DnsCache::new(2);
        cache.store("first.test", payload("1"), Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.store("second.test", payload("2"), Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.store("third.test", payload("3"), Duration::from_secs(60));

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup("first.test").is_none());
        assert!(cache.lookup("second.test").is_some());
        assert!(cache.lookup("third.test").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cache_evicts_a_batch_of_oldest() {
        let cache = DnsCache::new(20);
        for i in 0..20 {
            cache.store(&format!("host{i}.test"), payload("x"), Duration::from_secs(600));
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        assert_eq!(cache.len(), 20);

        cache.store("host20.test", payload("x"), Duration::from_secs(600));

        // A tenth of capacity goes at once, leaving headroom for the next inserts.
        assert_eq!(cache.len(), 19);
        assert!(cache.lookup("host0.test").is_none());
        assert!(cache.lookup("host1.test").is_none());
        assert!(cache.lookup("host2.test").is_some());
        assert!(cache.lookup("host20.test").is_some());

        cache.store("host21.test", payload("x"), Duration::from_secs(600));
        assert_eq!(cache.len(), 20);
        assert!(cache.lookup("host2.test").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_prefers_expired_entries() {
        let cache = DnsCache::new(2);
        cache.store("old.test", payload("1"), Duration::from_secs(60));
        cache.store("short.test", payload("2"), Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;

        cache.store("new.test", payload("3"), Duration::from_secs(60));
        assert!(cache.lookup("short.test").is_none());
        assert!(cache.lookup("old.test").is_some());
        assert!(cache.lookup("new.test").is_some());
    }

    #[test]
    fn test_overwrite_at_capacity_does_not_evict() {
        let cache = DnsCache::new(2);
        cache.store("a.test", payload("a"), Duration::from_secs(60));
        cache.store("b.test", payload("b"), Duration::from_secs(60));
        cache.store("a.test", payload("a2"), Duration::from_secs(60));

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup("b.test").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = DnsCache::new(16);
        cache.store("short.test", payload("s"), Duration::from_secs(1));
        cache.store("long.test", payload("l"), Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.lookup("short.test").is_none());
        assert!(cache.lookup("long.test").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_reclaims_entries() {
        let cache = Arc::new(DnsCache::new(16));
        let shutdown = CancellationToken::new();
        let sweeper = cache.spawn_sweeper(Duration::from_secs(10), shutdown.clone());

        cache.store("short.test", payload("s"), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(cache.is_empty());

        shutdown.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_writers_leave_whole_entries() {
        let cache = Arc::new(DnsCache::new(64));
        let writers: Vec<_> = (0..8u8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    for _ in 0..100 {
                        cache.store("race.test", Bytes::from(vec![i; 64]), Duration::from_secs(60));
                    }
                })
            })
            .collect();

        for writer in writers {
            writer.await.unwrap();
        }

        let entry = cache.lookup("race.test").unwrap();
        let first = entry.payload()[0];
        assert!(entry.payload().iter().all(|b| *b == first));
        assert_eq!(cache.len(), 1);
    }
}
