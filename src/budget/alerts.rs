//! Budget threshold alerts.
//!
//! Each alert fires at most once per session when the settled usage ratio
//! first reaches its threshold. `reset_all` re-arms every alert.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::governor::BudgetStatus;
use crate::error::Error;

/// Passed to an alert callback when its threshold is crossed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub threshold: f64,
    pub usage_ratio: f64,
    pub spent: f64,
    pub ceiling: Option<f64>,
    pub triggered_at: DateTime<Utc>,
}

/// Synchronous alert callback. Errors and panics are caught and logged.
pub type AlertCallback = Arc<dyn Fn(&AlertEvent) -> anyhow::Result<()> + Send + Sync>;

/// Exported state of one alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertState {
    pub threshold: f64,
    pub triggered: bool,
    pub trigger_time: Option<DateTime<Utc>>,
}

struct Alert {
    threshold: f64,
    callback: AlertCallback,
    triggered: bool,
    triggered_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Alert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Alert")
            .field("threshold", &self.threshold)
            .field("triggered", &self.triggered)
            .field("triggered_at", &self.triggered_at)
            .finish_non_exhaustive()
    }
}

/// Ordered set of threshold alerts.
#[derive(Debug, Default)]
pub struct AlertManager {
    alerts: Mutex<Vec<Alert>>,
}

impl AlertManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild alerts from exported state. Restored alerts log when fired.
    pub fn restore(states: &[AlertState]) -> Self {
        let manager = Self::new();
        {
            let mut alerts = manager.alerts();
            for state in states {
                alerts.push(Alert {
                    threshold: state.threshold,
                    callback: Arc::new(log_alert),
                    triggered: state.triggered,
                    triggered_at: state.trigger_time,
                });
            }
            alerts.sort_by(|a, b| a.threshold.total_cmp(&b.threshold));
        }
        manager
    }

    fn alerts(&self) -> MutexGuard<'_, Vec<Alert>> {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback for when the usage ratio reaches `threshold`.
    pub fn add_alert<F>(&self, threshold: f64, callback: F) -> Result<(), Error>
    where
        F: Fn(&AlertEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_callback(threshold, Arc::new(callback))
    }

    /// Register an already shared callback.
    pub fn add_callback(&self, threshold: f64, callback: AlertCallback) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::InvalidThreshold(threshold));
        }
        let mut alerts = self.alerts();
        // Keep ascending order; equal thresholds fire in registration order.
        let at = alerts.partition_point(|a| a.threshold <= threshold);
        alerts.insert(
            at,
            Alert {
                threshold,
                callback,
                triggered: false,
                triggered_at: None,
            },
        );
        tracing::debug!(threshold, "Budget alert registered");
        Ok(())
    }

    /// Remove every alert with this threshold. Returns whether any existed.
    pub fn remove_alert(&self, threshold: f64) -> bool {
        let mut alerts = self.alerts();
        let before = alerts.len();
        alerts.retain(|a| a.threshold != threshold);
        alerts.len() != before
    }

    /// Fire every untriggered alert whose threshold the usage ratio has
    /// reached, in ascending threshold order. Returns how many fired.
    pub fn check(&self, status: &BudgetStatus) -> usize {
        let now = Utc::now();
        // Claim the alerts under the lock, run callbacks outside it so a
        // callback may inspect the manager without deadlocking.
        let due: Vec<(f64, AlertCallback)> = {
            let mut alerts = self.alerts();
            alerts
                .iter_mut()
                .filter(|a| !a.triggered && a.threshold <= status.usage_ratio)
                .map(|a| {
                    a.triggered = true;
                    a.triggered_at = Some(now);
                    (a.threshold, Arc::clone(&a.callback))
                })
                .collect()
        };

        for (threshold, callback) in &due {
            let event = AlertEvent {
                threshold: *threshold,
                usage_ratio: status.usage_ratio,
                spent: status.spent,
                ceiling: status.ceiling,
                triggered_at: now,
            };
            match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(threshold, error = %err, "Alert callback failed");
                }
                Err(_) => {
                    tracing::error!(threshold, "Alert callback panicked");
                }
            }
        }
        due.len()
    }

    /// Re-arm every alert.
    pub fn reset_all(&self) {
        for alert in self.alerts().iter_mut() {
            alert.triggered = false;
            alert.triggered_at = None;
        }
    }

    pub fn clear(&self) {
        self.alerts().clear();
    }

    pub fn states(&self) -> Vec<AlertState> {
        self.alerts()
            .iter()
            .map(|a| AlertState {
                threshold: a.threshold,
                triggered: a.triggered,
                trigger_time: a.triggered_at,
            })
            .collect()
    }

    /// Thresholds that have not fired yet.
    pub fn pending(&self) -> Vec<f64> {
        self.alerts()
            .iter()
            .filter(|a| !a.triggered)
            .map(|a| a.threshold)
            .collect()
    }

    /// Thresholds that have fired.
    pub fn triggered(&self) -> Vec<f64> {
        self.alerts()
            .iter()
            .filter(|a| a.triggered)
            .map(|a| a.threshold)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.alerts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts().is_empty()
    }
}

/// Default callback: a structured warning.
pub fn log_alert(event: &AlertEvent) -> anyhow::Result<()> {
    tracing::warn!(
        threshold = event.threshold,
        usage_ratio = event.usage_ratio,
        spent = event.spent,
        ceiling = ?event.ceiling,
        "Budget alert threshold reached"
    );
    Ok(())
}
