//! Content-addressed, TTL- and capacity-bounded store for synthesis results.
//!
//! One lock guards the whole map. Critical sections never call out to a
//! backend; the worst case inside the lock is the linear eviction scan.

mod key;

pub use key::CacheKey;

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Bytes,
    /// Insertion time, refreshed on every hit.
    pub timestamp: Instant,
}

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

pub struct SynthesisCache {
    name: &'static str,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    capacity: usize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    stats: CacheStats,
}

impl SynthesisCache {
    pub fn new(name: &'static str, capacity: usize, ttl: Duration) -> Self {
        Self::with_clock(name, capacity, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: &'static str,
        capacity: usize,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::with_capacity(capacity)),
            capacity,
            ttl,
            clock,
            stats: CacheStats::default(),
        }
    }

    /// Returns the payload if present and younger than the TTL. A stale entry
    /// is removed and reported as a miss; a hit refreshes the timestamp.
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if now.saturating_duration_since(entry.timestamp) < self.ttl => {
                entry.timestamp = now;
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.payload.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts or replaces. When full, the entry with the oldest timestamp goes first.
    pub fn put(&self, key: CacheKey, payload: impl Into<Bytes>) {
        if self.capacity == 0 {
            return;
        }
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.timestamp)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                payload: payload.into(),
                timestamp: now,
            },
        );
    }

    /// Drops every TTL-expired entry, returning how many went.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.timestamp) < self.ttl);
        let purged = before - entries.len();
        self.stats
            .expirations
            .fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Periodic TTL purge. `get` enforces the TTL on its own; this only
    /// keeps memory from holding dead payloads between requests.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(cache = cache.name, purged, "Swept expired cache entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(3600);

    fn cache_with_clock(capacity: usize) -> (SynthesisCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let cache = SynthesisCache::with_clock("test", capacity, TTL, clock.clone());
        (cache, clock)
    }

    fn key(n: usize) -> CacheKey {
        CacheKey::from_raw(format!("key-{n}"))
    }

    #[test]
    fn put_then_get_returns_payload() {
        let (cache, _) = cache_with_clock(4);
        cache.put(key(1), b"payload".to_vec());
        assert_eq!(cache.get(&key(1)).as_deref(), Some(&b"payload"[..]));
        assert_eq!(cache.get(&key(2)), None);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let (cache, clock) = cache_with_clock(4);
        cache.put(key(1), Bytes::from_static(b"v"));
        clock.advance(TTL + Duration::from_secs(1));
        assert_eq!(cache.get(&key(1)), None);
        assert!(!cache.contains(&key(1)));
    }

    #[test]
    fn entry_is_live_just_before_ttl() {
        let (cache, clock) = cache_with_clock(4);
        cache.put(key(1), Bytes::from_static(b"v"));
        clock.advance(TTL - Duration::from_secs(1));
        assert!(cache.get(&key(1)).is_some());
    }

    #[test]
    fn hit_refreshes_ttl() {
        let (cache, clock) = cache_with_clock(4);
        cache.put(key(1), Bytes::from_static(b"v"));
        clock.advance(TTL - Duration::from_secs(10));
        assert!(cache.get(&key(1)).is_some());
        clock.advance(Duration::from_secs(20));
        assert!(cache.get(&key(1)).is_some());
    }

    #[test]
    fn capacity_evicts_least_recently_touched() {
        let (cache, clock) = cache_with_clock(3);
        for n in 0..3 {
            cache.put(key(n), Bytes::from_static(b"v"));
            clock.advance(Duration::from_secs(1));
        }
        // key 0 becomes the freshest, leaving key 1 as the oldest.
        assert!(cache.get(&key(0)).is_some());
        clock.advance(Duration::from_secs(1));

        cache.put(key(3), Bytes::from_static(b"v"));
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&key(1)));
        for n in [0, 2, 3] {
            assert!(cache.contains(&key(n)), "key {n} evicted");
        }
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn replacing_a_key_does_not_evict() {
        let (cache, _) = cache_with_clock(2);
        cache.put(key(0), Bytes::from_static(b"a"));
        cache.put(key(1), Bytes::from_static(b"b"));
        cache.put(key(1), Bytes::from_static(b"c"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&key(1)).as_deref(), Some(&b"c"[..]));
    }

    #[test]
    fn purge_drops_only_stale_entries() {
        let (cache, clock) = cache_with_clock(8);
        cache.put(key(0), Bytes::from_static(b"old"));
        clock.advance(TTL / 2);
        cache.put(key(1), Bytes::from_static(b"new"));
        clock.advance(TTL / 2 + Duration::from_secs(1));
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.contains(&key(1)));
    }

    #[test]
    fn zero_capacity_stores_nothing() {
        let (cache, _) = cache_with_clock(0);
        cache.put(key(0), Bytes::from_static(b"v"));
        assert!(cache.is_empty());
    }
}
