use serde::{Deserialize, Serialize};

use crate::addons::Hook;
use crate::budget::BudgetExceeded;
use crate::providers::ProviderError;
use crate::session::SessionState;

/// Coarse classification of every failure the pipeline can surface.
///
/// The retry policy and the error hooks decide on this rather than on the
/// concrete error so that new variants stay classifiable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BudgetExceeded,
    RateLimited,
    Timeout,
    ConnectivityFailed,
    ProviderUnavailable,
    ModelNotFound,
    MalformedRequest,
    ValidationFailed,
    AddonFailure,
    SessionInactive,
    InvalidInput,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::BudgetExceeded => "budget_exceeded",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::ConnectivityFailed => "connectivity_failed",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::ModelNotFound => "model_not_found",
            Self::MalformedRequest => "malformed_request",
            Self::ValidationFailed => "validation_failed",
            Self::AddonFailure => "addon_failure",
            Self::SessionInactive => "session_inactive",
            Self::InvalidInput => "invalid_input",
        };
        f.write_str(name)
    }
}

/// Unified error type for sessions and their collaborators.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Budget(#[from] BudgetExceeded),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Validation failed ({addon}): {message}")]
    ValidationFailed {
        addon: String,
        message: String,
        /// Whether the validator asked for the request to be tried again.
        retry_requested: bool,
    },

    #[error("Addon '{addon}' failed in {hook}: {message}")]
    AddonFailure {
        addon: String,
        hook: Hook,
        message: String,
    },

    #[error("Session {session_id} is {state} and does not accept requests")]
    SessionInactive {
        session_id: String,
        state: SessionState,
    },

    #[error("Alert threshold {0} is outside [0.0, 1.0]")]
    InvalidThreshold(f64),

    #[error("Attempt cap {max_attempts} does not cover the {retries} retries the addons may grant")]
    AttemptCap { max_attempts: u32, retries: u32 },

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Budget(_) => ErrorKind::BudgetExceeded,
            Self::Provider(err) => err.kind(),
            Self::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            Self::AddonFailure { .. } => ErrorKind::AddonFailure,
            Self::SessionInactive { .. } => ErrorKind::SessionInactive,
            Self::InvalidThreshold(_) | Self::AttemptCap { .. } | Self::Snapshot(_) => {
                ErrorKind::InvalidInput
            }
        }
    }

    /// Failures that abort a request without consulting the error hooks.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::BudgetExceeded
                | ErrorKind::AddonFailure
                | ErrorKind::SessionInactive
                | ErrorKind::InvalidInput
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        tracing::error!(error = %err, "Snapshot serialization error");
        Self::Snapshot(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
