use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::{Session, SessionState};
use crate::addons::AddonPipeline;
use crate::budget::{AlertManager, AlertState, BudgetGovernor, UsageRecord, UsageSummary};
use crate::error::Error;
use crate::providers::types::{ChatRequest, ProviderReply};
use crate::providers::{ModelPricing, Provider, ProviderError};

/// Flat, serializable record of a session.
///
/// Usage records keep settlement order. Floats survive a JSON round trip
/// exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub provider: String,
    pub model: String,
    pub state: SessionState,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub budget_ceiling: Option<f64>,
    #[serde(default)]
    pub over_budget: bool,
    pub usage: UsageSummary,
    pub records: Vec<UsageRecord>,
    pub alerts: Vec<AlertState>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl SessionSnapshot {
    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn total_cost(&self) -> f64 {
        self.usage.total_cost
    }
}

/// Stand-in provider for sessions rebuilt from a snapshot. Such sessions are
/// ended, so it is never called in practice.
struct Detached {
    id: String,
}

impl Provider for Detached {
    fn id(&self) -> &str {
        &self.id
    }

    fn pricing(&self, _model: &str) -> Option<ModelPricing> {
        None
    }

    fn send(&self, _request: &ChatRequest) -> BoxFuture<'_, Result<ProviderReply, ProviderError>> {
        Box::pin(async {
            Err(ProviderError::Unavailable(
                "session was restored from a snapshot".to_string(),
            ))
        })
    }
}

impl Session {
    /// Export the session's records, alert states and metadata.
    pub fn export(&self) -> SessionSnapshot {
        let (state, start_time, end_time) = {
            let lifecycle = self.lifecycle();
            (lifecycle.state, lifecycle.started_at, lifecycle.ended_at)
        };
        let records = self.governor.records();
        SessionSnapshot {
            session_id: self.id.clone(),
            provider: self.provider.id().to_string(),
            model: self.model.clone(),
            state,
            start_time,
            end_time,
            budget_ceiling: self.governor.ceiling(),
            over_budget: self.governor.is_over_budget(),
            usage: UsageSummary::from_records(&records),
            records,
            alerts: self.alerts.states(),
            metadata: self.metadata(),
        }
    }

    /// Rebuild a read-only session from a snapshot.
    ///
    /// The result is always `Ended`: it reports usage and exports again but
    /// accepts no requests. Restored alerts log when fired.
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Result<Self, Error> {
        if let Some(bad) = snapshot
            .alerts
            .iter()
            .find(|a| !(0.0..=1.0).contains(&a.threshold))
        {
            return Err(Error::InvalidThreshold(bad.threshold));
        }

        let request_count = snapshot.records.len() as u64;
        let governor = BudgetGovernor::from_records(snapshot.budget_ceiling, snapshot.records);
        if snapshot.over_budget {
            governor.mark_over_budget();
        }

        let session = Self::assemble(
            snapshot.session_id,
            Arc::new(Detached {
                id: snapshot.provider,
            }),
            snapshot.model,
            governor,
            AlertManager::restore(&snapshot.alerts),
            AddonPipeline::new(),
            None,
            None,
        );
        {
            let mut lifecycle = session.lifecycle();
            lifecycle.state = SessionState::Ended;
            lifecycle.started_at = snapshot.start_time;
            lifecycle.ended_at = snapshot.end_time;
        }
        *session.metadata_map() = snapshot.metadata;
        session.next_request.store(request_count, Ordering::Relaxed);

        tracing::debug!(
            session_id = %session.id,
            records = request_count,
            "Session restored from snapshot"
        );
        Ok(session)
    }
}
