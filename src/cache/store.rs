use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::cache::types::{CacheEntry, CacheStats, CacheStatsSnapshot};
use crate::config::CacheConfig;

// ---------------------------------------------------------------------------
// CacheStore -- bounded TTL + LRU map
// ---------------------------------------------------------------------------

/// In-memory key/value store with per-entry expiry and least-recently-used
/// eviction. Safe to share across sessions behind an `Arc`.
///
/// The `LruCache` is unbounded; `max_size` is enforced on insert so a zero
/// capacity means "store nothing" and every eviction is counted.
pub struct CacheStore<V> {
    entries: Mutex<LruCache<String, CacheEntry<V>>>,
    max_size: usize,
    default_ttl: Option<Duration>,
    stats: CacheStats,
}

impl<V: Clone> CacheStore<V> {
    /// Create a store holding at most `max_size` entries. `default_ttl` of
    /// `None` keeps entries until evicted.
    pub fn new(max_size: usize, default_ttl: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            max_size,
            default_ttl,
            stats: CacheStats::new(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_size, config.ttl_secs.map(Duration::from_secs))
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<String, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a live entry, marking it most recently used. Expired entries
    /// count as a miss and are removed.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries();

        let expired = match entries.peek(key) {
            None => {
                self.stats.record_miss();
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            entries.pop(key);
            self.stats.record_expiration();
            self.stats.record_miss();
            tracing::debug!(key = %key, "Cache entry expired");
            return None;
        }

        let entry = entries.get_mut(key)?;
        entry.last_accessed = now;
        entry.hit_count += 1;
        self.stats.record_hit();
        Some(entry.value.clone())
    }

    /// Insert or overwrite with the store's default TTL.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.put(key, value, self.default_ttl);
    }

    /// Insert or overwrite with an explicit TTL (`None` never expires), then
    /// evict least-recently-used entries until the size bound holds.
    pub fn put(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        let now = Instant::now();
        let mut entries = self.entries();

        entries.put(
            key.clone(),
            CacheEntry {
                key,
                value,
                inserted_at: now,
                last_accessed: now,
                expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
                hit_count: 0,
            },
        );

        while entries.len() > self.max_size {
            let Some((oldest, _)) = entries.pop_lru() else {
                break;
            };
            self.stats.record_eviction();
            tracing::debug!(key = %oldest, "Cache entry evicted (LRU)");
        }
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries().pop(key).map(|e| e.value)
    }

    /// Whether a live entry exists, without counting as an access.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries()
            .peek(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
            self.stats.record_expiration();
        }
        expired.len()
    }

    /// Remove all entries and reset counters together.
    pub fn clear(&self) {
        let mut entries = self.entries();
        entries.clear();
        self.stats.reset();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        let entries = self.entries();
        self.stats.snapshot(entries.len(), self.max_size)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
