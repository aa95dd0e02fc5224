use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::{Addon, AddonContext, AddonError};
use crate::config::{ResponseCheck, ValidationConfig};
use crate::error::Error;
use crate::providers::types::ChatResponse;

/// Default retries granted by a validator in auto-retry mode.
const DEFAULT_VALIDATION_RETRIES: u32 = 2;

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// What happens when a response fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Fail the request.
    #[default]
    Strict,
    /// Log and return the response anyway.
    Warn,
    /// Ask for a fresh provider call, up to the validator's retry cap.
    AutoRetry,
}

impl std::fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Warn => write!(f, "warn"),
            Self::AutoRetry => write!(f, "auto_retry"),
        }
    }
}

impl FromStr for ValidationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "warn" => Ok(Self::Warn),
            "auto_retry" | "auto-retry" => Ok(Self::AutoRetry),
            other => Err(format!("unknown validation mode: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidationStats {
    pub passed: u64,
    pub failed: u64,
    pub retries_requested: u64,
}

impl ValidationStats {
    pub fn success_rate(&self) -> f64 {
        let total = self.passed + self.failed;
        if total == 0 {
            0.0
        } else {
            self.passed as f64 / total as f64
        }
    }
}

// ---------------------------------------------------------------------------
// ResponseValidatorAddon
// ---------------------------------------------------------------------------

/// A response check: `Err` carries the reason for rejection.
pub type ResponseCheckFn = Arc<dyn Fn(&ChatResponse) -> Result<(), String> + Send + Sync>;

/// Validates every response with a pluggable check.
///
/// Register it ahead of the cache interceptor so rejected responses are
/// never stored.
pub struct ResponseValidatorAddon {
    name: String,
    check: ResponseCheckFn,
    mode: ValidationMode,
    max_retries: u32,
    passed: AtomicU64,
    failed: AtomicU64,
    retries_requested: AtomicU64,
}

impl ResponseValidatorAddon {
    pub fn new<F>(name: impl Into<String>, mode: ValidationMode, check: F) -> Self
    where
        F: Fn(&ChatResponse) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(check),
            mode,
            max_retries: DEFAULT_VALIDATION_RETRIES,
            passed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retries_requested: AtomicU64::new(0),
        }
    }

    /// Rejects empty or whitespace-only content.
    pub fn non_empty(mode: ValidationMode) -> Self {
        Self::new("validator", mode, |response: &ChatResponse| {
            if response.content.trim().is_empty() {
                Err("response content is empty".to_string())
            } else {
                Ok(())
            }
        })
    }

    /// Requires the content to be a JSON object, optionally inside a
    /// fenced code block.
    pub fn json_object(mode: ValidationMode) -> Self {
        Self::new("validator", mode, |response: &ChatResponse| {
            let body = extract_json(&response.content);
            match serde_json::from_str::<serde_json::Value>(body) {
                Ok(value) if value.is_object() => Ok(()),
                Ok(_) => Err("response is JSON but not an object".to_string()),
                Err(err) => Err(format!("response is not valid JSON: {err}")),
            }
        })
    }

    /// Build the configured built-in validator, if any.
    pub fn from_config(config: &ValidationConfig) -> Option<Self> {
        let validator = match config.check {
            ResponseCheck::None => return None,
            ResponseCheck::NonEmpty => Self::non_empty(config.mode),
            ResponseCheck::JsonObject => Self::json_object(config.mode),
        };
        Some(validator.with_max_retries(config.max_retries))
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    pub fn stats(&self) -> ValidationStats {
        ValidationStats {
            passed: self.passed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries_requested: self.retries_requested.load(Ordering::Relaxed),
        }
    }

    fn retry_key(&self) -> String {
        format!("{}.retries", self.name)
    }
}

/// Strip a surrounding fenced code block, if present.
fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening fence line.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.strip_suffix("```").unwrap_or(body).trim()
}

impl Addon for ResponseValidatorAddon {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Validates responses and rejects, warns or retries on failure"
    }

    fn retry_cap(&self) -> u32 {
        match self.mode {
            ValidationMode::AutoRetry => self.max_retries,
            ValidationMode::Strict | ValidationMode::Warn => 0,
        }
    }

    fn post_request<'a>(
        &'a self,
        response: ChatResponse,
        ctx: &'a mut AddonContext,
    ) -> BoxFuture<'a, Result<ChatResponse, AddonError>> {
        Box::pin(async move {
            let message = match (self.check)(&response) {
                Ok(()) => {
                    self.passed.fetch_add(1, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(message) => message,
            };
            self.failed.fetch_add(1, Ordering::Relaxed);

            match self.mode {
                ValidationMode::Warn => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        addon = %self.name,
                        error = %message,
                        "Response failed validation, returning it anyway"
                    );
                    Ok(response)
                }
                ValidationMode::Strict => Err(AddonError::Rejected {
                    message,
                    retry: false,
                }),
                ValidationMode::AutoRetry => {
                    let used = ctx.counter(&self.retry_key());
                    let retry = used < u64::from(self.max_retries);
                    if retry {
                        ctx.bump_counter(&self.retry_key());
                    }
                    Err(AddonError::Rejected { message, retry })
                }
            }
        })
    }

    fn on_error<'a>(
        &'a self,
        error: &'a Error,
        ctx: &'a mut AddonContext,
    ) -> BoxFuture<'a, Result<bool, AddonError>> {
        Box::pin(async move {
            let ours = matches!(
                error,
                Error::ValidationFailed { addon, retry_requested: true, .. } if *addon == self.name
            );
            if ours {
                self.retries_requested.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    request_id = %ctx.request_id,
                    addon = %self.name,
                    attempt = ctx.counter(&self.retry_key()),
                    "Retrying request after failed validation"
                );
            }
            Ok(ours)
        })
    }
}
