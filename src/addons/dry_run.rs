use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;

use super::{Addon, AddonContext, AddonError, Interception};
use crate::providers::estimate_tokens;

pub const DRY_RUN_ADDON_NAME: &str = "dry_run";

/// One request seen by the dry-run interceptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DryRunEntry {
    pub request_id: String,
    pub model: String,
    pub provider: String,
    pub prompt_chars: usize,
    pub estimated_input_tokens: u32,
    pub timestamp: DateTime<Utc>,
}

/// Answers every request with a mock reply so nothing reaches the provider
/// or the budget.
pub struct DryRunAddon {
    mock_response: Option<String>,
    log: Mutex<Vec<DryRunEntry>>,
}

impl DryRunAddon {
    pub fn new() -> Self {
        Self {
            mock_response: None,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Use a fixed reply instead of the generated placeholder.
    pub fn with_mock_response(mut self, response: impl Into<String>) -> Self {
        self.mock_response = Some(response.into());
        self
    }

    fn log(&self) -> MutexGuard<'_, Vec<DryRunEntry>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests intercepted so far, oldest first.
    pub fn requests(&self) -> Vec<DryRunEntry> {
        self.log().clone()
    }

    pub fn estimated_input_tokens(&self) -> u64 {
        self.log()
            .iter()
            .map(|e| u64::from(e.estimated_input_tokens))
            .sum()
    }

    pub fn clear(&self) {
        self.log().clear();
    }
}

impl Default for DryRunAddon {
    fn default() -> Self {
        Self::new()
    }
}

impl Addon for DryRunAddon {
    fn name(&self) -> &str {
        DRY_RUN_ADDON_NAME
    }

    fn description(&self) -> &str {
        "Short-circuits every request with a mock response"
    }

    fn pre_request<'a>(
        &'a self,
        ctx: &'a mut AddonContext,
    ) -> BoxFuture<'a, Result<Option<Interception>, AddonError>> {
        Box::pin(async move {
            let content = self.mock_response.clone().unwrap_or_else(|| {
                format!(
                    "[DRY RUN] {} request to {} ({} chars)",
                    ctx.provider,
                    ctx.model,
                    ctx.prompt.chars().count()
                )
            });

            let entry = DryRunEntry {
                request_id: ctx.request_id.clone(),
                model: ctx.model.clone(),
                provider: ctx.provider.clone(),
                prompt_chars: ctx.prompt.chars().count(),
                estimated_input_tokens: estimate_tokens(&ctx.prompt),
                timestamp: Utc::now(),
            };
            tracing::info!(
                request_id = %entry.request_id,
                model = %entry.model,
                estimated_input_tokens = entry.estimated_input_tokens,
                "Dry run: request not sent"
            );
            self.log().push(entry);

            ctx.metadata.insert("dry_run".to_string(), true.into());
            Ok(Some(Interception::estimated(&ctx.prompt, content)))
        })
    }
}
