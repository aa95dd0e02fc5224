use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// Generation parameters that travel with a prompt.
///
/// `extra` holds provider-specific knobs. It is a `BTreeMap` so its
/// serialized form is key-ordered, which the cache key relies on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ChatParams {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_system_message(mut self, system: impl Into<String>) -> Self {
        self.system_message = Some(system.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// One call as handed to a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub request_id: String,
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub params: ChatParams,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// What a provider returns for a successful call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderReply {
    pub content: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Where a response came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseSource {
    /// A provider call that was reserved, sent and settled.
    Provider,
    /// A pre-request hook answered without reaching the provider.
    Intercepted { addon: String },
}

/// The result handed back to the caller of `Session::chat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub request_id: String,
    pub content: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Settled cost in USD; zero when intercepted.
    pub cost: f64,
    pub source: ResponseSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatResponse {
    pub fn from_reply(request_id: &str, reply: ProviderReply, cost: f64) -> Self {
        Self {
            request_id: request_id.to_string(),
            content: reply.content,
            model: reply.model,
            input_tokens: reply.input_tokens,
            output_tokens: reply.output_tokens,
            cost,
            source: ResponseSource::Provider,
            finish_reason: reply.finish_reason,
            created_at: Utc::now(),
        }
    }

    pub fn intercepted(
        request_id: &str,
        model: &str,
        addon: &str,
        interception: crate::addons::Interception,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            content: interception.content,
            model: model.to_string(),
            input_tokens: interception.input_tokens,
            output_tokens: interception.output_tokens,
            cost: 0.0,
            source: ResponseSource::Intercepted {
                addon: addon.to_string(),
            },
            finish_reason: interception.finish_reason,
            created_at: Utc::now(),
        }
    }

    pub fn total_tokens(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    pub fn is_intercepted(&self) -> bool {
        matches!(self.source, ResponseSource::Intercepted { .. })
    }
}
