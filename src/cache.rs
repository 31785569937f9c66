//! Lookup cache with TTL in front of the realm store
//!
//! Provides a thread-safe, TTL-based cache for memoized records (API apps,
//! realms). Cache keys are HMAC-SHA256 digests of `prefix:namespace:id`, so
//! the identifiers themselves never sit in memory as keys.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::digest::KeyedDigest;

/// Prefix mixed into every cache key before hashing
pub const KEY_PREFIX: &str = "cache:";

/// Thread-safe lookup cache with TTL expiry
pub struct Cache<V> {
    /// Cache entries keyed by the hashed key
    entries: DashMap<String, CachedValue<V>>,
    /// Key hasher
    keys: KeyedDigest,
    /// Cache statistics
    stats: CacheStats,
}

/// A cached value with TTL metadata
struct CachedValue<V> {
    /// The cached value
    value: V,
    /// When this entry was cached
    cached_at: Instant,
    /// Time-to-live duration
    ttl: Duration,
}

impl<V> CachedValue<V> {
    /// Check if this entry has expired
    fn is_expired(&self) -> bool {
        Instant::now().duration_since(self.cached_at) > self.ttl
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Total cache hits (entries served from cache)
    pub hits: AtomicU64,
    /// Total cache misses (entries not found or expired)
    pub misses: AtomicU64,
    /// Total evictions (expired entries removed)
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Get current cache hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get current cache miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get current eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Calculate hit rate as a percentage (0.0-1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

impl<V: Clone> Cache<V> {
    /// Create a new empty cache whose keys are hashed with `hmac_key`
    #[must_use]
    pub fn new(hmac_key: impl AsRef<[u8]>) -> Self {
        Self {
            entries: DashMap::new(),
            keys: KeyedDigest::new(hmac_key),
            stats: CacheStats::default(),
        }
    }

    /// Build a cache key from a namespace and an identifier
    ///
    /// The key is `hex(HMAC(prefix ‖ namespace ‖ ':' ‖ id))`.
    #[must_use]
    pub fn build_key(&self, namespace: &str, id: &str) -> String {
        self.keys.hex(format!("{KEY_PREFIX}{namespace}:{id}"))
    }

    /// Get a cached value if it exists and hasn't expired
    ///
    /// Expired entries are automatically evicted.
    pub fn get(&self, key: &str) -> Option<V> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Store a value in the cache with the given TTL
    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        let entry = CachedValue {
            value,
            cached_at: Instant::now(),
            ttl,
        };
        self.entries.insert(key.to_string(), entry);
    }

    /// Read-through lookup.
    ///
    /// On a miss `loader` runs and a `Some` result is cached for `ttl`;
    /// `None` is not cached so newly created records become visible at once.
    /// Concurrent misses may both run the loader; the last write wins, which
    /// is harmless because both wrote the same record.
    pub async fn fetch<F, Fut, E>(&self, key: &str, ttl: Duration, loader: F) -> Result<Option<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(Some(hit));
        }

        let loaded = loader().await?;
        if let Some(ref value) = loaded {
            self.set(key, value.clone(), ttl);
        }
        Ok(loaded)
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits(),
            misses: self.stats.misses(),
            evictions: self.stats.evictions(),
            size: self.entries.len(),
            hit_rate: self.stats.hit_rate(),
        }
    }

    /// Evict expired entries (background maintenance)
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let count = before.saturating_sub(self.entries.len());

        if count > 0 {
            self.stats
                .evictions
                .fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total evictions
    pub evictions: u64,
    /// Current number of entries
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}
