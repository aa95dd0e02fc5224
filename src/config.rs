use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::addons::validator::ValidationMode;

// ---------------------------------------------------------------------------
// Environment override tracking
// ---------------------------------------------------------------------------

/// Tracks which configuration settings were overridden by environment
/// variables.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    overrides: HashMap<String, String>,
}

impl EnvOverrides {
    /// Check whether a setting key (e.g. "session.budget_usd") is overridden.
    pub fn is_overridden(&self, key: &str) -> bool {
        self.overrides.contains_key(key)
    }

    /// Get the env var name that overrides the given setting key.
    pub fn env_var_for(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    /// All overrides as setting key -> env var name.
    pub fn all(&self) -> &HashMap<String, String> {
        &self.overrides
    }

    fn record(&mut self, key: &str, env_var: &str) {
        self.overrides.insert(key.to_string(), env_var.to_string());
    }
}

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Env var overrides are not serialized to TOML.
    #[serde(skip)]
    pub env_overrides: EnvOverrides,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Spending ceiling in USD. Absent means unlimited.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_usd: Option<f64>,
    #[serde(default = "default_model")]
    pub model: String,
    /// Usage ratios at which a logging alert fires.
    #[serde(default = "default_alerts")]
    pub alerts: Vec<f64>,
    /// Upper bound on provider attempts per logical request. Absent means
    /// derived from the retry caps of the registered addons.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Default concurrency bound for batches. Absent means unbounded.
    #[serde(default = "default_max_concurrent")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            budget_usd: None,
            model: default_model(),
            alerts: default_alerts(),
            max_attempts: None,
            max_concurrent: default_max_concurrent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Entry lifetime in seconds. Absent means entries never expire.
    #[serde(default = "default_cache_ttl")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl(),
            max_size: default_cache_max_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_base: default_exponential_base(),
            jitter: true,
        }
    }
}

/// Built-in response checks selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseCheck {
    #[default]
    None,
    NonEmpty,
    JsonObject,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub check: ResponseCheck,
    #[serde(default)]
    pub mode: ValidationMode,
    #[serde(default = "default_validation_retries")]
    pub max_retries: u32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            check: ResponseCheck::None,
            mode: ValidationMode::Strict,
            max_retries: default_validation_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_alerts() -> Vec<f64> {
    vec![0.5, 0.75, 0.9]
}
const fn default_max_concurrent() -> Option<usize> {
    Some(5)
}
const fn default_true() -> bool {
    true
}
const fn default_cache_ttl() -> Option<u64> {
    Some(3600)
}
const fn default_cache_max_size() -> usize {
    100
}
const fn default_max_retries() -> u32 {
    3
}
const fn default_initial_delay_ms() -> u64 {
    1_000
}
const fn default_max_delay_ms() -> u64 {
    60_000
}
const fn default_exponential_base() -> f64 {
    2.0
}
const fn default_validation_retries() -> u32 {
    2
}
fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Loading, env overrides and validation
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a TOML file, then apply environment variable
    /// overrides. Any setting prefixed with `METERED_` takes precedence over
    /// the file value and is tracked in `env_overrides`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Save the file-level configuration to a TOML file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize config: {e}"))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Retries the configured addons may grant one request, summed.
    pub fn retry_allowance(&self) -> u32 {
        let retry = if self.retry.enabled {
            self.retry.max_retries
        } else {
            0
        };
        let validation = match (self.validation.check, self.validation.mode) {
            (ResponseCheck::None, _) => 0,
            (_, ValidationMode::AutoRetry) => self.validation.max_retries,
            _ => 0,
        };
        retry.saturating_add(validation)
    }

    /// Reject settings no session could honour.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(budget) = self.session.budget_usd {
            if !budget.is_finite() || budget < 0.0 {
                anyhow::bail!("session.budget_usd must be a non-negative amount, got {budget}");
            }
        }
        if let Some(bad) = self
            .session
            .alerts
            .iter()
            .find(|t| !(0.0..=1.0).contains(*t))
        {
            anyhow::bail!("session.alerts entries must be within [0.0, 1.0], got {bad}");
        }
        if let Some(max_attempts) = self.session.max_attempts {
            let retries = self.retry_allowance();
            if max_attempts <= retries {
                anyhow::bail!(
                    "session.max_attempts ({max_attempts}) must exceed the {retries} retries \
                     granted by [retry] and [validation]"
                );
            }
        }
        if self.session.max_concurrent == Some(0) {
            anyhow::bail!("session.max_concurrent must be at least 1 when set");
        }
        if self.cache.max_size == 0 {
            anyhow::bail!("cache.max_size must be at least 1");
        }
        if self.retry.exponential_base < 1.0 {
            anyhow::bail!(
                "retry.exponential_base must be >= 1.0, got {}",
                self.retry.exponential_base
            );
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.initial_delay_ms,
                self.retry.max_delay_ms
            );
        }
        Ok(())
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Every supported setting has a corresponding `METERED_*` env var. When
    /// set, the value replaces the file/default value and the setting key is
    /// recorded in `env_overrides`.
    fn apply_env_overrides(&mut self) {
        let mut ov = EnvOverrides::default();

        macro_rules! env_str {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = val;
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_bool {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_parse {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    if let Ok(parsed) = val.parse() {
                        $field = parsed;
                        ov.record($key, $env);
                    }
                }
            };
        }
        // Empty clears the setting.
        macro_rules! env_opt_parse {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    if val.is_empty() {
                        $field = None;
                        ov.record($key, $env);
                    } else if let Ok(parsed) = val.parse() {
                        $field = Some(parsed);
                        ov.record($key, $env);
                    }
                }
            };
        }

        // -- Session --
        env_opt_parse!("session.budget_usd", "METERED_BUDGET_USD", self.session.budget_usd);
        env_str!("session.model", "METERED_MODEL", self.session.model);
        if let Ok(val) = std::env::var("METERED_ALERTS") {
            let parsed: Result<Vec<f64>, _> = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect();
            if let Ok(alerts) = parsed {
                self.session.alerts = alerts;
                ov.record("session.alerts", "METERED_ALERTS");
            }
        }
        env_opt_parse!(
            "session.max_attempts",
            "METERED_MAX_ATTEMPTS",
            self.session.max_attempts
        );
        env_opt_parse!(
            "session.max_concurrent",
            "METERED_MAX_CONCURRENT",
            self.session.max_concurrent
        );

        // -- Cache --
        env_bool!("cache.enabled", "METERED_CACHE_ENABLED", self.cache.enabled);
        env_opt_parse!("cache.ttl_secs", "METERED_CACHE_TTL_SECS", self.cache.ttl_secs);
        env_parse!("cache.max_size", "METERED_CACHE_MAX_SIZE", self.cache.max_size);

        // -- Retry --
        env_bool!("retry.enabled", "METERED_RETRY_ENABLED", self.retry.enabled);
        env_parse!(
            "retry.max_retries",
            "METERED_RETRY_MAX_RETRIES",
            self.retry.max_retries
        );
        env_parse!(
            "retry.initial_delay_ms",
            "METERED_RETRY_INITIAL_DELAY_MS",
            self.retry.initial_delay_ms
        );
        env_parse!(
            "retry.max_delay_ms",
            "METERED_RETRY_MAX_DELAY_MS",
            self.retry.max_delay_ms
        );
        env_bool!("retry.jitter", "METERED_RETRY_JITTER", self.retry.jitter);

        // -- Validation --
        env_parse!(
            "validation.mode",
            "METERED_VALIDATION_MODE",
            self.validation.mode
        );

        // -- Logging --
        env_str!("logging.level", "METERED_LOG_LEVEL", self.logging.level);
        env_bool!("logging.json", "METERED_LOG_JSON", self.logging.json);

        self.env_overrides = ov;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
