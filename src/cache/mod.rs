//! Response caching.
//!
//! [`CacheStore`] is a bounded TTL + LRU map keyed by [`key::cache_key`].
//! A store is either owned privately by one session's cache interceptor or
//! shared across sessions by handing the same `Arc<ResponseCache>` to each.

pub mod key;
pub mod store;
pub mod types;

pub use self::key::cache_key;
pub use self::store::CacheStore;
pub use self::types::{CacheEntry, CacheStats, CacheStatsSnapshot, CachedResponse};

/// The store used by the response cache interceptor.
pub type ResponseCache = CacheStore<CachedResponse>;
