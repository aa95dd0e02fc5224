//! Retry classification and backoff delays.
//!
//! The policy only answers two questions: is this kind of failure worth
//! another attempt, and how long to wait before attempt `n`. The loop itself
//! lives in the session; the retry interceptor drives the policy.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::ErrorKind;

// MARK: - Constants

/// Default maximum number of retries.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default initial delay (1 second).
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay (60 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default exponential base.
const DEFAULT_EXPONENTIAL_BASE: f64 = 2.0;

/// Jitter factors are drawn uniformly from this range.
const JITTER_MIN: f64 = 0.5;
const JITTER_MAX: f64 = 1.5;

// MARK: - Retry Policy

/// Policy for retrying failed requests with exponential backoff and jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the first call).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub exponential_base: f64,
    /// Whether to scale delays by a random factor in `[0.5, 1.5]`.
    pub jitter: bool,
    /// Whether to retry on rate limit errors.
    pub retry_on_rate_limit: bool,
    /// Whether to retry on timeout errors.
    pub retry_on_timeout: bool,
    /// Whether to retry when the provider reports itself unavailable.
    pub retry_on_unavailable: bool,
}

impl RetryPolicy {
    /// Create a new retry policy with default settings.
    pub fn new() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            exponential_base: DEFAULT_EXPONENTIAL_BASE,
            jitter: true,
            retry_on_rate_limit: true,
            retry_on_timeout: true,
            retry_on_unavailable: true,
        }
    }

    /// Build a policy from the `[retry]` configuration section.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new()
            .with_max_retries(config.max_retries)
            .with_initial_delay(Duration::from_millis(config.initial_delay_ms))
            .with_max_delay(Duration::from_millis(config.max_delay_ms))
            .with_exponential_base(config.exponential_base)
            .with_jitter(config.jitter)
    }

    /// Set maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay before the first retry.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the exponential base.
    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether a failure of this kind should be retried.
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        match kind {
            ErrorKind::RateLimited => self.retry_on_rate_limit,
            ErrorKind::Timeout => self.retry_on_timeout,
            ErrorKind::ProviderUnavailable => self.retry_on_unavailable,
            ErrorKind::ConnectivityFailed => true,
            ErrorKind::BudgetExceeded
            | ErrorKind::ModelNotFound
            | ErrorKind::MalformedRequest
            | ErrorKind::ValidationFailed
            | ErrorKind::AddonFailure
            | ErrorKind::SessionInactive
            | ErrorKind::InvalidInput => false,
        }
    }

    /// Un-jittered delay for a zero-based attempt:
    /// `min(max_delay, initial_delay * base^attempt)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = (self.initial_delay.as_secs_f64() * self.exponential_base.powi(exponent))
            .min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }

    /// Delay before retry `attempt` (zero-based), with jitter applied when
    /// enabled. Never exceeds `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let factor = rand::rng().random_range(JITTER_MIN..=JITTER_MAX);
        base.mul_f64(factor).min(self.max_delay)
    }

    /// Whether another retry is allowed after `attempts_so_far` retries.
    pub fn has_budget(&self, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

// MARK: - Tests
