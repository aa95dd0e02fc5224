//! Shared test provider.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use metered::providers::types::{ChatParams, ChatRequest, ProviderReply};
use metered::{ModelPricing, Provider, ProviderError};
use tokio::time::Instant;

/// A provider whose behaviour is fixed up front.
///
/// Costs default to $1 per million tokens each way. A fixed estimate or a
/// queue of actual costs can be set to make budget arithmetic exact.
pub struct ScriptedProvider {
    calls: AtomicU32,
    prompts: Mutex<Vec<String>>,
    sent_at: Mutex<Vec<Instant>>,
    content: String,
    latency: Duration,
    estimate: Option<f64>,
    actual_costs: Mutex<VecDeque<f64>>,
    failure: Option<ProviderError>,
    failures_left: Mutex<Option<u32>>,
    models: Option<Vec<String>>,
    health: Result<(), ProviderError>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
            sent_at: Mutex::new(Vec::new()),
            content: "ok".to_string(),
            latency: Duration::ZERO,
            estimate: None,
            actual_costs: Mutex::new(VecDeque::new()),
            failure: None,
            failures_left: Mutex::new(None),
            models: None,
            health: Ok(()),
        }
    }

    pub fn with_content(mut self, content: &str) -> Self {
        self.content = content.to_string();
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every request estimates at exactly this cost.
    pub fn with_estimate(mut self, estimate: f64) -> Self {
        self.estimate = Some(estimate);
        self
    }

    /// Successive settled costs; pricing applies once the queue is empty.
    pub fn with_actual_costs(self, costs: impl IntoIterator<Item = f64>) -> Self {
        *self.actual_costs.lock().unwrap() = costs.into_iter().collect();
        self
    }

    /// Fail every call with `error`.
    pub fn failing(mut self, error: ProviderError) -> Self {
        self.failure = Some(error);
        self
    }

    /// Fail only the first `n` calls.
    pub fn failing_first(self, n: u32, error: ProviderError) -> Self {
        *self.failures_left.lock().unwrap() = Some(n);
        self.failing(error)
    }

    /// Serve only these models; every model is served by default.
    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = Some(models.iter().map(|m| m.to_string()).collect());
        self
    }

    /// Fail the health check with `error`.
    pub fn unhealthy(mut self, error: ProviderError) -> Self {
        self.health = Err(error);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// Gaps between consecutive calls, in call order.
    pub fn gaps(&self) -> Vec<Duration> {
        let sent_at = self.sent_at.lock().unwrap();
        sent_at.windows(2).map(|w| w[1] - w[0]).collect()
    }

    fn next_failure(&self) -> Option<ProviderError> {
        let error = self.failure.clone()?;
        let mut left = self.failures_left.lock().unwrap();
        match left.as_mut() {
            None => Some(error),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(error)
            }
        }
    }
}

impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn pricing(&self, model: &str) -> Option<ModelPricing> {
        Some(ModelPricing::new(model, 1.0, 1.0))
    }

    fn supports_model(&self, model: &str) -> bool {
        self.models
            .as_ref()
            .is_none_or(|models| models.iter().any(|m| m == model))
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), ProviderError>> {
        let health = self.health.clone();
        Box::pin(async move { health })
    }

    fn estimate_cost(&self, prompt: &str, model: &str, params: &ChatParams) -> f64 {
        match self.estimate {
            Some(estimate) => estimate,
            None => {
                let pricing = ModelPricing::new(model, 1.0, 1.0);
                let input = metered::providers::estimate_tokens(prompt);
                pricing.cost(input, params.max_tokens.unwrap_or(100))
            }
        }
    }

    fn calculate_cost(&self, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        match self.actual_costs.lock().unwrap().pop_front() {
            Some(cost) => cost,
            None => ModelPricing::new(model, 1.0, 1.0).cost(input_tokens, output_tokens),
        }
    }

    fn send(&self, request: &ChatRequest) -> BoxFuture<'_, Result<ProviderReply, ProviderError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());
        self.sent_at.lock().unwrap().push(Instant::now());
        let failure = self.next_failure();
        let model = request.model.clone();
        Box::pin(async move {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if let Some(error) = failure {
                return Err(error);
            }
            Ok(ProviderReply {
                content: self.content.clone(),
                model,
                input_tokens: 100,
                output_tokens: 100,
                finish_reason: Some("stop".to_string()),
            })
        })
    }
}
