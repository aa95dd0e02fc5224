//! Request interceptors ("addons").
//!
//! An [`Addon`] can observe or alter one logical request at three points:
//!
//!   pre_request  --> may answer the request itself (short-circuit)
//!   post_request --> may rewrite or reject the response
//!   on_error     --> may ask the session to try again
//!
//! Hooks return boxed futures so addons are dyn-compatible and can be stored
//! as `Arc<dyn Addon>` in an [`AddonPipeline`].

pub mod cache;
pub mod context;
pub mod dry_run;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod validator;
pub mod whitespace;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::providers::estimate_tokens;
use crate::providers::types::ChatResponse;

pub use self::cache::CacheAddon;
pub use self::context::{AddonContext, AddonErrorRecord};
pub use self::dry_run::DryRunAddon;
pub use self::metrics::MetricsAddon;
pub use self::pipeline::AddonPipeline;
pub use self::retry::RetryAddon;
pub use self::validator::{ResponseValidatorAddon, ValidationMode};
pub use self::whitespace::WhitespaceMinimizerAddon;

// ---------------------------------------------------------------------------
// Hook identifiers & errors
// ---------------------------------------------------------------------------

/// The three interception points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    PreRequest,
    PostRequest,
    OnError,
}

impl std::fmt::Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreRequest => write!(f, "pre_request"),
            Self::PostRequest => write!(f, "post_request"),
            Self::OnError => write!(f, "on_error"),
        }
    }
}

/// How a hook can fail.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AddonError {
    /// The hook itself broke. Fatal in `pre_request`, logged and skipped
    /// elsewhere.
    #[error("{0}")]
    Failed(String),

    /// A post-request hook refused the response.
    #[error("response rejected: {message}")]
    Rejected { message: String, retry: bool },
}

// ---------------------------------------------------------------------------
// Interception
// ---------------------------------------------------------------------------

/// A response produced by a pre-request hook instead of the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Interception {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: Option<String>,
}

impl Interception {
    /// Build an interception with token counts estimated from the text.
    pub fn estimated(prompt: &str, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            input_tokens: estimate_tokens(prompt),
            output_tokens: estimate_tokens(&content),
            content,
            finish_reason: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Addon trait
// ---------------------------------------------------------------------------

/// A request interceptor. Every hook has a pass-through default.
pub trait Addon: Send + Sync {
    /// Unique name within a pipeline.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Disabled addons are skipped by every hook.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Most retries this addon may request for one logical request.
    fn retry_cap(&self) -> u32 {
        0
    }

    /// Runs before budget admission. Returning `Some` answers the request
    /// without calling the provider.
    fn pre_request<'a>(
        &'a self,
        _ctx: &'a mut AddonContext,
    ) -> BoxFuture<'a, Result<Option<Interception>, AddonError>> {
        Box::pin(async { Ok(None) })
    }

    /// Runs on every response, including short-circuited ones.
    fn post_request<'a>(
        &'a self,
        response: ChatResponse,
        _ctx: &'a mut AddonContext,
    ) -> BoxFuture<'a, Result<ChatResponse, AddonError>> {
        Box::pin(async move { Ok(response) })
    }

    /// Runs when an attempt fails. Returning `true` requests a retry.
    fn on_error<'a>(
        &'a self,
        _error: &'a Error,
        _ctx: &'a mut AddonContext,
    ) -> BoxFuture<'a, Result<bool, AddonError>> {
        Box::pin(async { Ok(false) })
    }
}
