use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use serde::Serialize;

use super::{Addon, AddonContext, AddonError};
use crate::error::Error;
use crate::providers::RetryPolicy;
use crate::providers::types::ChatResponse;

pub const RETRY_ADDON_NAME: &str = "retry";

/// Retry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    /// Retries granted.
    pub total_retries: u64,
    /// Requests that succeeded after at least one retry.
    pub successful_retries: u64,
    /// Requests that ran out of retries.
    pub exhausted: u64,
}

/// Grants retries for transient failures with exponential backoff.
///
/// Waits inside `on_error` before asking the session to try again. Retry
/// state lives in the request's [`AddonContext`], so one addon can serve
/// any number of concurrent requests.
pub struct RetryAddon {
    policy: RetryPolicy,
    total_retries: AtomicU64,
    successful_retries: AtomicU64,
    exhausted: AtomicU64,
}

impl RetryAddon {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            total_retries: AtomicU64::new(0),
            successful_retries: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            total_retries: self.total_retries.load(Ordering::Relaxed),
            successful_retries: self.successful_retries.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

impl Default for RetryAddon {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Addon for RetryAddon {
    fn name(&self) -> &str {
        RETRY_ADDON_NAME
    }

    fn description(&self) -> &str {
        "Retries transient provider failures with exponential backoff"
    }

    fn retry_cap(&self) -> u32 {
        self.policy.max_retries
    }

    fn post_request<'a>(
        &'a self,
        response: ChatResponse,
        ctx: &'a mut AddonContext,
    ) -> BoxFuture<'a, Result<ChatResponse, AddonError>> {
        Box::pin(async move {
            if ctx.retry_count > 0 {
                self.successful_retries.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    request_id = %ctx.request_id,
                    retries = ctx.retry_count,
                    "Request succeeded after retry"
                );
            }
            Ok(response)
        })
    }

    fn on_error<'a>(
        &'a self,
        error: &'a Error,
        ctx: &'a mut AddonContext,
    ) -> BoxFuture<'a, Result<bool, AddonError>> {
        Box::pin(async move {
            if !self.policy.is_retryable(error.kind()) {
                return Ok(false);
            }

            if !self.policy.has_budget(ctx.retry_count) {
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    request_id = %ctx.request_id,
                    retries = ctx.retry_count,
                    max_retries = self.policy.max_retries,
                    error = %error,
                    "Max retries exceeded"
                );
                return Ok(false);
            }

            // Prefer provider-supplied retry_after over calculated backoff.
            let mut delay = match error {
                Error::Provider(provider_error) => provider_error.retry_after_duration(),
                _ => None,
            }
            .unwrap_or_else(|| self.policy.delay_for(ctx.retry_count));

            // Delays never shrink within one request and never exceed the cap.
            if let Some(previous) = ctx.last_retry_delay {
                delay = delay.max(previous);
            }
            delay = delay.min(self.policy.max_delay);

            ctx.retry_count += 1;
            ctx.last_retry_delay = Some(delay);
            self.total_retries.fetch_add(1, Ordering::Relaxed);

            tracing::warn!(
                request_id = %ctx.request_id,
                attempt = ctx.retry_count,
                backoff_ms = delay.as_millis() as u64,
                error = %error,
                "Request failed, retrying after backoff"
            );

            tokio::time::sleep(delay).await;
            Ok(true)
        })
    }
}
