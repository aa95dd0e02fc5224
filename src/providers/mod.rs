//! Provider boundary.
//!
//! Defines the [`Provider`] trait that every text-generation backend
//! implements, the classified [`ProviderError`] it fails with, and the retry
//! policy used to decide which of those failures are worth another attempt.
//! Wire protocols live outside this crate; a provider only has to turn a
//! [`ChatRequest`] into a [`ProviderReply`] carrying token counts.

pub mod pricing;
pub mod retry;
pub mod types;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use crate::error::ErrorKind;
use crate::providers::types::{ChatParams, ChatRequest, ProviderReply};

pub use self::pricing::{ModelPricing, estimate_tokens};
pub use self::retry::RetryPolicy;

/// Output tokens assumed when a request does not cap `max_tokens`.
pub const DEFAULT_OUTPUT_ESTIMATE: u32 = 500;

// ---------------------------------------------------------------------------
// ProviderError
// ---------------------------------------------------------------------------

/// Errors a provider can fail a request with.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("Rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    ConnectivityFailed(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Malformed request: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Classification used by the retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ConnectivityFailed(_) => ErrorKind::ConnectivityFailed,
            Self::Unavailable(_) => ErrorKind::ProviderUnavailable,
            Self::ModelNotFound(_) => ErrorKind::ModelNotFound,
            Self::Malformed(_) => ErrorKind::MalformedRequest,
        }
    }

    /// Provider-supplied wait before the next attempt, if any.
    pub fn retry_after_duration(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// A pay-per-use text generation backend.
///
/// `send` returns a boxed future so the trait stays dyn-compatible and can be
/// held as `Arc<dyn Provider>` by a session.
pub trait Provider: Send + Sync {
    /// Identifier recorded in contexts and snapshots (e.g. "openai").
    fn id(&self) -> &str;

    /// Pricing for a model, or `None` when the provider does not know it.
    fn pricing(&self, model: &str) -> Option<ModelPricing>;

    /// Whether this provider can serve `model`.
    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    /// Lightweight reachability check run before a session opens.
    fn health_check(&self) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async { Ok(()) })
    }

    /// Upper-bound cost estimate used for budget admission.
    fn estimate_cost(&self, prompt: &str, model: &str, params: &ChatParams) -> f64 {
        let Some(pricing) = self.pricing(model) else {
            return 0.0;
        };
        let mut input_tokens = estimate_tokens(prompt);
        if let Some(system) = &params.system_message {
            input_tokens += estimate_tokens(system);
        }
        let output_tokens = params.max_tokens.unwrap_or(DEFAULT_OUTPUT_ESTIMATE);
        pricing.cost(input_tokens, output_tokens)
    }

    /// Actual cost of a completed call.
    fn calculate_cost(&self, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        match self.pricing(model) {
            Some(pricing) => pricing.cost(input_tokens, output_tokens),
            None => {
                warn!(
                    provider = %self.id(),
                    model = %model,
                    "No pricing data for model, recording zero cost"
                );
                0.0
            }
        }
    }

    /// Perform one completion call.
    fn send(&self, request: &ChatRequest) -> BoxFuture<'_, Result<ProviderReply, ProviderError>>;
}
