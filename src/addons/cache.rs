use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use super::{Addon, AddonContext, AddonError, Interception};
use crate::cache::{CacheStatsSnapshot, CachedResponse, ResponseCache, cache_key};
use crate::config::CacheConfig;
use crate::providers::types::{ChatResponse, ResponseSource};

pub const CACHE_ADDON_NAME: &str = "cache";

/// Context field holding the key computed at lookup time.
const KEY_FIELD: &str = "cache.key";

/// Answers repeated requests from a [`ResponseCache`].
///
/// Only provider responses are stored; a response that was itself served
/// by an interceptor is never written back.
pub struct CacheAddon {
    store: Arc<ResponseCache>,
    ttl: Option<Duration>,
}

impl CacheAddon {
    /// Cache with a private store.
    pub fn new(max_size: usize, ttl: Option<Duration>) -> Self {
        Self::shared(Arc::new(ResponseCache::new(max_size, ttl)))
    }

    /// Cache backed by a store that other sessions may also use.
    pub fn shared(store: Arc<ResponseCache>) -> Self {
        let ttl = store.default_ttl();
        Self { store, ttl }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::shared(Arc::new(ResponseCache::from_config(config)))
    }

    /// Override the TTL used for entries written by this addon.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<ResponseCache> {
        &self.store
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.store.stats()
    }

    fn key(ctx: &AddonContext) -> String {
        cache_key(&ctx.prompt, &ctx.model, &ctx.params)
    }

    /// The key looked up in `pre_request`, so a prompt rewritten by a later
    /// addon is still stored under the key the next identical request uses.
    fn stored_key(ctx: &AddonContext) -> String {
        ctx.custom
            .get(KEY_FIELD)
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| Self::key(ctx), str::to_string)
    }
}

impl Addon for CacheAddon {
    fn name(&self) -> &str {
        CACHE_ADDON_NAME
    }

    fn description(&self) -> &str {
        "Serves identical requests from an in-memory TTL/LRU cache"
    }

    fn pre_request<'a>(
        &'a self,
        ctx: &'a mut AddonContext,
    ) -> BoxFuture<'a, Result<Option<Interception>, AddonError>> {
        Box::pin(async move {
            let key = Self::key(ctx);
            ctx.custom.insert(KEY_FIELD.to_string(), key.clone().into());
            let Some(cached) = self.store.get(&key) else {
                return Ok(None);
            };
            tracing::debug!(request_id = %ctx.request_id, model = %ctx.model, "Cache hit");
            Ok(Some(Interception {
                content: cached.content,
                input_tokens: cached.input_tokens,
                output_tokens: cached.output_tokens,
                finish_reason: cached.finish_reason,
            }))
        })
    }

    fn post_request<'a>(
        &'a self,
        response: ChatResponse,
        ctx: &'a mut AddonContext,
    ) -> BoxFuture<'a, Result<ChatResponse, AddonError>> {
        Box::pin(async move {
            if response.source == ResponseSource::Provider {
                self.store
                    .put(Self::stored_key(ctx), CachedResponse::from(&response), self.ttl);
            }
            Ok(response)
        })
    }
}
