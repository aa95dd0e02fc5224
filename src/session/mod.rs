//! Session lifecycle and request submission.
//!
//! A [`Session`] owns one budget governor, one alert manager and one addon
//! pipeline, and drives every logical request through them:
//!
//! 1. pre-request hooks (may short-circuit),
//! 2. estimate and reserve against the budget,
//! 3. provider call,
//! 4. settle the actual cost, then check alerts,
//! 5. post-request hooks.
//!
//! Failures are offered to the error hooks, which may ask for another
//! attempt. Fatal failures (budget, pre-hook, lifecycle) skip the hooks.

mod batch;
mod guard;
mod snapshot;

pub use self::batch::{BatchItem, BatchOptions, BatchReport, BatchRequest};
pub use self::guard::SessionGuard;
pub use self::snapshot::SessionSnapshot;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::addons::cache::CacheAddon;
use crate::addons::retry::RetryAddon;
use crate::addons::validator::ResponseValidatorAddon;
use crate::addons::{Addon, AddonContext, AddonPipeline};
use crate::budget::{
    AlertCallback, AlertEvent, AlertManager, BudgetGovernor, BudgetStatus, Reservation,
    UsageRecord, UsageSummary, log_alert,
};
use crate::config::Config;
use crate::error::Error;
use crate::providers::types::{ChatParams, ChatResponse};
use crate::providers::{Provider, ProviderError, RetryPolicy};

/// Floor on provider attempts per logical request when no cap is set. The
/// effective cap also covers every retry the registered addons may grant.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Active,
    Ended,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Active => write!(f, "active"),
            Self::Ended => write!(f, "ended"),
        }
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: SessionState,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

/// Counts one admitted unit of work until dropped.
struct InFlight<'a> {
    session: &'a Session,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.session.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.session.idle.notify_waiters();
        }
    }
}

/// A reservation that is released unless explicitly settled, so a failed or
/// cancelled request never leaves funds held.
struct PendingCharge<'a> {
    governor: &'a BudgetGovernor,
    reservation: Option<Reservation>,
}

impl<'a> PendingCharge<'a> {
    fn new(governor: &'a BudgetGovernor, reservation: Reservation) -> Self {
        Self {
            governor,
            reservation: Some(reservation),
        }
    }

    fn settle(mut self, actual_cost: f64, input_tokens: u32, output_tokens: u32, model: &str) {
        if let Some(reservation) = self.reservation.take() {
            self.governor
                .settle(reservation, actual_cost, input_tokens, output_tokens, model);
        }
    }
}

impl Drop for PendingCharge<'_> {
    fn drop(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            self.governor.release(reservation);
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session {
    id: String,
    model: String,
    provider: Arc<dyn Provider>,
    governor: BudgetGovernor,
    alerts: AlertManager,
    pipeline: AddonPipeline,
    lifecycle: Mutex<Lifecycle>,
    metadata: Mutex<BTreeMap<String, serde_json::Value>>,
    next_request: AtomicU64,
    in_flight: AtomicUsize,
    idle: Notify,
    max_attempts: Option<u32>,
    max_concurrent: Option<usize>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("model", &self.model)
            .field("provider", &self.provider.id())
            .field("state", &self.state())
            .field("governor", &self.governor)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// A session with no alerts and no addons. Use [`Session::builder`] for
    /// anything richer.
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>, budget: Option<f64>) -> Self {
        Self::assemble(
            Uuid::new_v4().to_string(),
            provider,
            model.into(),
            BudgetGovernor::new(budget),
            AlertManager::new(),
            AddonPipeline::new(),
            None,
            None,
        )
    }

    pub fn builder(provider: Arc<dyn Provider>, model: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(provider, model)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        id: String,
        provider: Arc<dyn Provider>,
        model: String,
        governor: BudgetGovernor,
        alerts: AlertManager,
        pipeline: AddonPipeline,
        max_attempts: Option<u32>,
        max_concurrent: Option<usize>,
    ) -> Self {
        Self {
            id,
            model,
            provider,
            governor,
            alerts,
            pipeline,
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Created,
                started_at: None,
                ended_at: None,
            }),
            metadata: Mutex::new(BTreeMap::new()),
            next_request: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            max_attempts: max_attempts.map(|n| n.max(1)),
            max_concurrent,
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn metadata_map(&self) -> MutexGuard<'_, BTreeMap<String, serde_json::Value>> {
        self.metadata.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // MARK: - Lifecycle

    /// Open the session for requests. Idempotent while active; an ended
    /// session cannot be restarted.
    pub fn start(&self) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle();
        match lifecycle.state {
            SessionState::Created => {
                lifecycle.state = SessionState::Active;
                lifecycle.started_at = Some(Utc::now());
                info!(
                    session_id = %self.id,
                    provider = %self.provider.id(),
                    model = %self.model,
                    budget = ?self.governor.ceiling(),
                    "Session started"
                );
                Ok(())
            }
            SessionState::Active => Ok(()),
            SessionState::Ended => Err(Error::SessionInactive {
                session_id: self.id.clone(),
                state: SessionState::Ended,
            }),
        }
    }

    /// Like [`start`](Self::start), but first confirm the provider serves
    /// the session's model and answers its health check.
    ///
    /// Nothing is checked once the session is active. A failed check leaves
    /// the session in `Created`.
    pub async fn start_checked(&self) -> Result<(), Error> {
        if self.state() != SessionState::Created {
            return self.start();
        }
        if !self.provider.supports_model(&self.model) {
            warn!(
                session_id = %self.id,
                provider = %self.provider.id(),
                model = %self.model,
                "Provider does not serve the session model"
            );
            return Err(ProviderError::ModelNotFound(self.model.clone()).into());
        }
        if let Err(err) = self.provider.health_check().await {
            warn!(
                session_id = %self.id,
                provider = %self.provider.id(),
                error = %err,
                "Provider failed its health check"
            );
            return Err(err.into());
        }
        self.start()
    }

    /// Close admission. Requests already running complete and are recorded.
    /// Returns `false` if the session had already ended.
    pub fn end(&self) -> bool {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == SessionState::Ended {
                return false;
            }
            lifecycle.state = SessionState::Ended;
            lifecycle.ended_at = Some(Utc::now());
        }
        let status = self.governor.status();
        info!(
            session_id = %self.id,
            spent = status.spent,
            requests = self.request_count(),
            in_flight = self.in_flight(),
            over_budget = status.over_budget,
            "Session ended"
        );
        true
    }

    /// End the session, wait for in-flight requests and return the final
    /// snapshot.
    pub async fn finish(&self) -> SessionSnapshot {
        self.end();
        self.wait_idle().await;
        self.export()
    }

    /// Wait until no admitted request is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a wake-up in between is not lost.
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Check the session is active and count the caller as in flight, under
    /// the same lock `end` takes.
    fn admit(&self) -> Result<InFlight<'_>, Error> {
        let lifecycle = self.lifecycle();
        if lifecycle.state != SessionState::Active {
            debug!(session_id = %self.id, state = %lifecycle.state, "Request refused");
            return Err(Error::SessionInactive {
                session_id: self.id.clone(),
                state: lifecycle.state,
            });
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(InFlight { session: self })
    }

    fn next_request_id(&self) -> String {
        let n = self.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}_{n}", self.id)
    }

    // MARK: - Requests

    pub async fn chat(&self, prompt: impl Into<String>) -> Result<ChatResponse, Error> {
        self.chat_with(prompt, ChatParams::default()).await
    }

    /// Submit one logical request with explicit parameters.
    pub async fn chat_with(
        &self,
        prompt: impl Into<String>,
        params: ChatParams,
    ) -> Result<ChatResponse, Error> {
        let _in_flight = self.admit()?;
        let request_id = self.next_request_id();
        self.run_request(request_id, prompt.into(), params, None).await
    }

    async fn run_request(
        &self,
        request_id: String,
        prompt: String,
        params: ChatParams,
        held: Option<PendingCharge<'_>>,
    ) -> Result<ChatResponse, Error> {
        let mut ctx = AddonContext::new(
            request_id,
            &self.id,
            prompt,
            &self.model,
            self.provider.id(),
            params,
        );
        let result = self.drive(&mut ctx, held).await;
        ctx.finish();

        match &result {
            Ok(response) => debug!(
                request_id = %ctx.request_id,
                cost = response.cost,
                intercepted = response.is_intercepted(),
                provider_calls = ctx.provider_calls,
                retries = ctx.retry_count,
                "Request completed"
            ),
            Err(err) => warn!(
                request_id = %ctx.request_id,
                kind = %err.kind(),
                error = %err,
                provider_calls = ctx.provider_calls,
                "Request failed"
            ),
        }
        result
    }

    async fn drive(
        &self,
        ctx: &mut AddonContext,
        mut held: Option<PendingCharge<'_>>,
    ) -> Result<ChatResponse, Error> {
        let mut pending = match self.pipeline.run_pre_request(ctx).await? {
            Some((addon, interception)) => {
                // Short-circuited requests never touch the budget.
                drop(held.take());
                Some(ChatResponse::intercepted(
                    &ctx.request_id,
                    &ctx.model,
                    &addon,
                    interception,
                ))
            }
            None => None,
        };

        let mut attempts = 0u32;
        loop {
            let outcome = match pending.take() {
                Some(response) => self.pipeline.run_post_request(response, ctx).await,
                None => {
                    attempts += 1;
                    self.dispatch(ctx, held.take()).await
                }
            };
            let error = match outcome {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            if error.is_fatal() {
                return Err(error);
            }
            ctx.last_error = Some(error.to_string());
            if !self.pipeline.run_on_error(&error, ctx).await {
                return Err(error);
            }
            let max_attempts = self.attempt_limit();
            if attempts >= max_attempts {
                warn!(
                    request_id = %ctx.request_id,
                    attempts,
                    max_attempts,
                    "Attempt cap reached, giving up"
                );
                return Err(error);
            }
        }
    }

    /// Provider attempts allowed per request: the configured cap, or enough
    /// for every retry the enabled addons may grant.
    pub fn attempt_limit(&self) -> u32 {
        self.max_attempts.unwrap_or_else(|| {
            DEFAULT_MAX_ATTEMPTS.max(self.pipeline.retry_cap().saturating_add(1))
        })
    }

    /// One provider attempt: reserve, send, settle, alert, post-process.
    async fn dispatch(
        &self,
        ctx: &mut AddonContext,
        held: Option<PendingCharge<'_>>,
    ) -> Result<ChatResponse, Error> {
        let charge = match held {
            Some(charge) => charge,
            None => {
                let estimate = self
                    .provider
                    .estimate_cost(&ctx.prompt, &ctx.model, &ctx.params);
                let reservation = self
                    .governor
                    .estimate_and_reserve(&ctx.request_id, estimate)?;
                PendingCharge::new(&self.governor, reservation)
            }
        };

        ctx.provider_calls += 1;
        let request = ctx.to_request();
        let reply = match self.provider.send(&request).await {
            Ok(reply) => reply,
            Err(err) => {
                // Nothing was incurred; the hold goes back to the pool.
                drop(charge);
                return Err(err.into());
            }
        };

        let cost = self
            .provider
            .calculate_cost(&reply.model, reply.input_tokens, reply.output_tokens);
        charge.settle(cost, reply.input_tokens, reply.output_tokens, &reply.model);
        if self.governor.ceiling().is_some() {
            self.alerts.check(&self.governor.status());
        }

        let response = ChatResponse::from_reply(&ctx.request_id, reply, cost);
        let result = self.pipeline.run_post_request(response, ctx).await;
        if result.is_err() {
            // Billed but not delivered.
            self.governor.mark_failed(&ctx.request_id);
        }
        result
    }

    // MARK: - Wiring

    /// Register an addon at the end of the pipeline.
    pub fn add_addon(&self, addon: Arc<dyn Addon>) {
        self.pipeline.add(addon);
    }

    pub fn add_alert<F>(&self, threshold: f64, callback: F) -> Result<(), Error>
    where
        F: Fn(&AlertEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.alerts.add_alert(threshold, callback)
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata_map().insert(key.into(), value);
    }

    // MARK: - Accessors

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider_id(&self) -> &str {
        self.provider.id()
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lifecycle().started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.lifecycle().ended_at
    }

    /// Time since start, up to the end if the session has ended.
    pub fn duration(&self) -> Option<chrono::Duration> {
        let lifecycle = self.lifecycle();
        let start = lifecycle.started_at?;
        Some(lifecycle.ended_at.unwrap_or_else(Utc::now) - start)
    }

    pub fn governor(&self) -> &BudgetGovernor {
        &self.governor
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    pub fn pipeline(&self) -> &AddonPipeline {
        &self.pipeline
    }

    pub fn budget(&self) -> Option<f64> {
        self.governor.ceiling()
    }

    /// Settled spend.
    pub fn cost(&self) -> f64 {
        self.governor.spent()
    }

    pub fn tokens_used(&self) -> u64 {
        self.summary().total_tokens()
    }

    /// Settled provider calls.
    pub fn request_count(&self) -> u64 {
        self.summary().request_count
    }

    pub fn budget_remaining(&self) -> Option<f64> {
        self.governor.remaining()
    }

    pub fn usage_ratio(&self) -> f64 {
        self.governor.usage_ratio()
    }

    pub fn status(&self) -> BudgetStatus {
        self.governor.status()
    }

    pub fn summary(&self) -> UsageSummary {
        self.governor.summary()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.governor.records()
    }

    pub fn metadata(&self) -> BTreeMap<String, serde_json::Value> {
        self.metadata_map().clone()
    }

    /// Admitted requests and batches still running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// SessionBuilder
// ---------------------------------------------------------------------------

pub struct SessionBuilder {
    provider: Arc<dyn Provider>,
    session_id: Option<String>,
    model: String,
    budget: Option<f64>,
    alerts: Vec<(f64, AlertCallback)>,
    addons: Vec<Arc<dyn Addon>>,
    max_attempts: Option<u32>,
    max_concurrent: Option<usize>,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl SessionBuilder {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            session_id: None,
            model: model.into(),
            budget: None,
            alerts: Vec::new(),
            addons: Vec::new(),
            max_attempts: None,
            max_concurrent: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Wire a session the way the configuration describes it.
    ///
    /// Addons are registered validator first, then cache, then retry, so a
    /// rejected response is never cached.
    pub fn from_config(provider: Arc<dyn Provider>, config: &Config) -> Self {
        let mut builder = Self::new(provider, config.session.model.clone())
            .budget(config.session.budget_usd)
            .max_concurrent(config.session.max_concurrent);
        builder.max_attempts = config.session.max_attempts;

        for &threshold in &config.session.alerts {
            builder = builder.alert(threshold, log_alert);
        }
        if let Some(validator) = ResponseValidatorAddon::from_config(&config.validation) {
            builder = builder.addon(Arc::new(validator));
        }
        if config.cache.enabled {
            builder = builder.addon(Arc::new(CacheAddon::from_config(&config.cache)));
        }
        if config.retry.enabled {
            let policy = RetryPolicy::from_config(&config.retry);
            builder = builder.addon(Arc::new(RetryAddon::new(policy)));
        }
        builder
    }

    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn budget(mut self, budget: Option<f64>) -> Self {
        self.budget = budget;
        self
    }

    pub fn alert<F>(mut self, threshold: f64, callback: F) -> Self
    where
        F: Fn(&AlertEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.alerts.push((threshold, Arc::new(callback)));
        self
    }

    pub fn addon(mut self, addon: Arc<dyn Addon>) -> Self {
        self.addons.push(addon);
        self
    }

    /// Fix the provider attempts per request instead of deriving them from
    /// the registered addons.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn max_concurrent(mut self, max_concurrent: Option<usize>) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Build the session in the `Created` state. Fails on an out-of-range
    /// alert threshold, or on an attempt cap that would cut the addons'
    /// retries short.
    pub fn build(self) -> Result<Session, Error> {
        let alerts = AlertManager::new();
        for (threshold, callback) in self.alerts {
            alerts.add_callback(threshold, callback)?;
        }
        let pipeline = AddonPipeline::new();
        for addon in self.addons {
            pipeline.add(addon);
        }
        if let Some(max_attempts) = self.max_attempts {
            let retries = pipeline.retry_cap();
            if max_attempts <= retries {
                return Err(Error::AttemptCap {
                    max_attempts,
                    retries,
                });
            }
        }

        let session = Session::assemble(
            self.session_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            self.provider,
            self.model,
            BudgetGovernor::new(self.budget),
            alerts,
            pipeline,
            self.max_attempts,
            self.max_concurrent,
        );
        *session.metadata_map() = self.metadata;
        Ok(session)
    }
}
