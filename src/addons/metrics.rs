use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use serde::Serialize;

use super::{Addon, AddonContext, AddonError};
use crate::error::Error;
use crate::providers::types::ChatResponse;

pub const METRICS_ADDON_NAME: &str = "metrics";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub responses: u64,
    pub from_provider: u64,
    pub intercepted: u64,
    pub errors_seen: u64,
    pub output_tokens: u64,
}

/// Counts responses and failures as seen by the hooks.
///
/// Post-request hooks run for short-circuited responses too, so the totals
/// stay consistent whether or not the cache answered.
#[derive(Debug, Default)]
pub struct MetricsAddon {
    responses: AtomicU64,
    from_provider: AtomicU64,
    intercepted: AtomicU64,
    errors_seen: AtomicU64,
    output_tokens: AtomicU64,
}

impl MetricsAddon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            responses: self.responses.load(Ordering::Relaxed),
            from_provider: self.from_provider.load(Ordering::Relaxed),
            intercepted: self.intercepted.load(Ordering::Relaxed),
            errors_seen: self.errors_seen.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
        }
    }
}

impl Addon for MetricsAddon {
    fn name(&self) -> &str {
        METRICS_ADDON_NAME
    }

    fn post_request<'a>(
        &'a self,
        response: ChatResponse,
        _ctx: &'a mut AddonContext,
    ) -> BoxFuture<'a, Result<ChatResponse, AddonError>> {
        Box::pin(async move {
            self.responses.fetch_add(1, Ordering::Relaxed);
            if response.is_intercepted() {
                self.intercepted.fetch_add(1, Ordering::Relaxed);
            } else {
                self.from_provider.fetch_add(1, Ordering::Relaxed);
            }
            self.output_tokens
                .fetch_add(u64::from(response.output_tokens), Ordering::Relaxed);
            Ok(response)
        })
    }

    fn on_error<'a>(
        &'a self,
        error: &'a Error,
        ctx: &'a mut AddonContext,
    ) -> BoxFuture<'a, Result<bool, AddonError>> {
        Box::pin(async move {
            self.errors_seen.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(request_id = %ctx.request_id, kind = %error.kind(), "Attempt failed");
            Ok(false)
        })
    }
}
