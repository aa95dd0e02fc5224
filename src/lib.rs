//! Budget-governed request pipeline for pay-per-use text generation
//! providers.
//!
//! A [`Session`] admits each request against a monetary ceiling through a
//! reservation-based [`BudgetGovernor`], fires [`AlertManager`] thresholds as
//! spend accumulates, and runs an ordered [`AddonPipeline`] of interceptors
//! (cache, retry, validation, ...) around every provider call.

pub mod addons;
pub mod budget;
pub mod cache;
pub mod config;
pub mod error;
pub mod providers;
pub mod session;
pub mod telemetry;

pub use crate::addons::{Addon, AddonContext, AddonError, AddonPipeline, Hook, Interception};
pub use crate::budget::{
    AlertEvent, AlertManager, BudgetExceeded, BudgetGovernor, BudgetStatus, UsageRecord,
    UsageSummary,
};
pub use crate::cache::{CacheStore, ResponseCache, cache_key};
pub use crate::config::Config;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::providers::types::{ChatParams, ChatRequest, ChatResponse, ProviderReply};
pub use crate::providers::{ModelPricing, Provider, ProviderError, RetryPolicy};
pub use crate::session::{
    BatchOptions, BatchReport, Session, SessionBuilder, SessionGuard, SessionSnapshot,
    SessionState,
};
