use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::Hook;
use crate::providers::types::{ChatParams, ChatRequest};

/// A hook failure that was logged and skipped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddonErrorRecord {
    pub addon: String,
    pub hook: Hook,
    pub message: String,
}

/// Per-request state shared by every hook and every retry of one logical
/// request.
#[derive(Debug, Clone, Serialize)]
pub struct AddonContext {
    pub request_id: String,
    pub session_id: String,
    /// The prompt as submitted by the caller.
    pub original_prompt: String,
    /// The prompt that will be sent; pre-request hooks may rewrite it.
    pub prompt: String,
    pub model: String,
    pub provider: String,
    pub params: ChatParams,
    /// Retries granted so far by the retry interceptor.
    pub retry_count: u32,
    /// Provider calls made so far.
    pub provider_calls: u32,
    /// Last backoff waited, so successive delays never shrink.
    #[serde(skip)]
    pub last_retry_delay: Option<Duration>,
    /// Most recent failed attempt, as shown to the error hooks.
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Free-form metadata callers attach to a request.
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Scratch space for addons, keyed by convention `"<addon>.<field>"`.
    pub custom: BTreeMap<String, serde_json::Value>,
    pub addon_errors: Vec<AddonErrorRecord>,
}

impl AddonContext {
    pub fn new(
        request_id: impl Into<String>,
        session_id: impl Into<String>,
        prompt: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
        params: ChatParams,
    ) -> Self {
        let prompt = prompt.into();
        Self {
            request_id: request_id.into(),
            session_id: session_id.into(),
            original_prompt: prompt.clone(),
            prompt,
            model: model.into(),
            provider: provider.into(),
            params,
            retry_count: 0,
            provider_calls: 0,
            last_retry_delay: None,
            last_error: None,
            started_at: Utc::now(),
            finished_at: None,
            metadata: BTreeMap::new(),
            custom: BTreeMap::new(),
            addon_errors: Vec::new(),
        }
    }

    /// The request the provider will receive for the current attempt.
    pub fn to_request(&self) -> ChatRequest {
        ChatRequest {
            request_id: self.request_id.clone(),
            model: self.model.clone(),
            prompt: self.prompt.clone(),
            params: self.params.clone(),
        }
    }

    pub fn record_error(&mut self, addon: &str, hook: Hook, message: impl Into<String>) {
        self.addon_errors.push(AddonErrorRecord {
            addon: addon.to_string(),
            hook,
            message: message.into(),
        });
    }

    /// Read an integer counter from `custom`, zero when absent.
    pub fn counter(&self, key: &str) -> u64 {
        self.custom
            .get(key)
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
    }

    /// Increment an integer counter in `custom`, returning the new value.
    pub fn bump_counter(&mut self, key: &str) -> u64 {
        let next = self.counter(key) + 1;
        self.custom.insert(key.to_string(), next.into());
        next
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Wall time since the request started, if it has finished.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}
