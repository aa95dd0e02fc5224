use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::usage::{UsageRecord, UsageSummary};

/// Slack allowed when comparing sums of float costs against the ceiling.
const COST_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Admission was denied because the estimate does not fit the remaining budget.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Budget exceeded: request needs ${attempted:.4}, ${remaining:.4} remaining")]
pub struct BudgetExceeded {
    pub attempted: f64,
    pub remaining: f64,
}

// ---------------------------------------------------------------------------
// Reservation
// ---------------------------------------------------------------------------

/// A hold on part of the budget for one in-flight call.
///
/// Deliberately not `Clone`: a reservation is consumed exactly once by
/// [`BudgetGovernor::settle`] or [`BudgetGovernor::release`].
#[derive(Debug)]
#[must_use = "a reservation must be settled or released"]
pub struct Reservation {
    id: u64,
    request_id: String,
    estimated_cost: f64,
    created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn estimated_cost(&self) -> f64 {
        self.estimated_cost
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Point-in-time view of the governor's accounting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetStatus {
    pub ceiling: Option<f64>,
    pub spent: f64,
    pub reserved: f64,
    pub remaining: Option<f64>,
    pub usage_ratio: f64,
    pub over_budget: bool,
}

// ---------------------------------------------------------------------------
// BudgetGovernor
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Ledger {
    committed: f64,
    open: HashMap<u64, f64>,
    next_id: u64,
    records: Vec<UsageRecord>,
    over_budget: bool,
}

impl Ledger {
    fn reserved(&self) -> f64 {
        self.open.values().sum()
    }

    fn available(&self, ceiling: f64) -> f64 {
        (ceiling - self.committed - self.reserved()).max(0.0)
    }

    fn open_reservation(&mut self, request_id: &str, estimated_cost: f64) -> Reservation {
        let id = self.next_id;
        self.next_id += 1;
        self.open.insert(id, estimated_cost);
        Reservation {
            id,
            request_id: request_id.to_string(),
            estimated_cost,
            created_at: Utc::now(),
        }
    }
}

/// Reservation-based admission control over a monetary budget.
///
/// Every check-and-reserve happens under one mutex that is never held across
/// an `.await`, so concurrent requests can never be admitted against the same
/// remaining funds.
#[derive(Debug)]
pub struct BudgetGovernor {
    ceiling: Option<f64>,
    ledger: Mutex<Ledger>,
}

impl BudgetGovernor {
    /// Create a governor. `None` means unlimited.
    pub fn new(ceiling: Option<f64>) -> Self {
        Self {
            ceiling,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Rebuild a governor from previously settled records.
    pub fn from_records(ceiling: Option<f64>, records: Vec<UsageRecord>) -> Self {
        let committed = records.iter().map(|r| r.cost).sum::<f64>();
        let over_budget = ceiling.is_some_and(|c| committed > c + COST_EPSILON);
        Self {
            ceiling,
            ledger: Mutex::new(Ledger {
                committed,
                records,
                over_budget,
                ..Ledger::default()
            }),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        // Every critical section leaves the ledger consistent.
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ceiling(&self) -> Option<f64> {
        self.ceiling
    }

    /// Admit a request if its estimate fits what is neither spent nor held.
    ///
    /// No side effects on failure. Negative or NaN estimates are treated as
    /// zero.
    pub fn estimate_and_reserve(
        &self,
        request_id: &str,
        estimated_cost: f64,
    ) -> Result<Reservation, BudgetExceeded> {
        let estimated_cost = estimated_cost.max(0.0);
        let mut ledger = self.ledger();

        if let Some(ceiling) = self.ceiling {
            let remaining = ledger.available(ceiling);
            if ledger.over_budget || estimated_cost > remaining + COST_EPSILON {
                tracing::warn!(
                    request_id = %request_id,
                    attempted = estimated_cost,
                    remaining,
                    over_budget = ledger.over_budget,
                    "Budget admission denied"
                );
                return Err(BudgetExceeded {
                    attempted: estimated_cost,
                    remaining,
                });
            }
        }

        let reservation = ledger.open_reservation(request_id, estimated_cost);
        tracing::debug!(
            request_id = %request_id,
            estimated_cost,
            open = ledger.open.len(),
            "Budget reserved"
        );
        Ok(reservation)
    }

    /// Admit a group of requests all-or-nothing.
    pub fn reserve_all(
        &self,
        requests: &[(String, f64)],
    ) -> Result<Vec<Reservation>, BudgetExceeded> {
        let total = requests.iter().map(|(_, cost)| cost.max(0.0)).sum::<f64>();
        let mut ledger = self.ledger();

        if let Some(ceiling) = self.ceiling {
            let remaining = ledger.available(ceiling);
            if ledger.over_budget || total > remaining + COST_EPSILON {
                tracing::warn!(
                    requests = requests.len(),
                    attempted = total,
                    remaining,
                    "Group budget admission denied"
                );
                return Err(BudgetExceeded {
                    attempted: total,
                    remaining,
                });
            }
        }

        Ok(requests
            .iter()
            .map(|(request_id, cost)| ledger.open_reservation(request_id, cost.max(0.0)))
            .collect())
    }

    /// Convert a reservation into a usage record at the actual cost.
    ///
    /// Spending already incurred is always recorded. If it overshoots the
    /// ceiling the governor is marked over-budget and stops admitting.
    pub fn settle(
        &self,
        reservation: Reservation,
        actual_cost: f64,
        input_tokens: u32,
        output_tokens: u32,
        model: &str,
    ) -> UsageRecord {
        let actual_cost = actual_cost.max(0.0);
        let mut ledger = self.ledger();
        ledger.open.remove(&reservation.id);

        if let Some(ceiling) = self.ceiling {
            let remaining = ledger.available(ceiling);
            if actual_cost > remaining + COST_EPSILON {
                ledger.over_budget = true;
                tracing::warn!(
                    request_id = %reservation.request_id,
                    estimated = reservation.estimated_cost,
                    actual = actual_cost,
                    remaining,
                    "Settled cost overshoots budget, blocking further admissions"
                );
            }
        }

        ledger.committed += actual_cost;
        let record = UsageRecord {
            request_id: reservation.request_id,
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cost: actual_cost,
            timestamp: Utc::now(),
            success: true,
        };
        ledger.records.push(record.clone());

        tracing::debug!(
            request_id = %record.request_id,
            model = %record.model,
            cost = record.cost,
            committed = ledger.committed,
            "Budget settled"
        );
        record
    }

    /// Flag the latest settled record of `request_id` as unsuccessful.
    ///
    /// The spend stays committed: a response rejected after settlement was
    /// still billed. Returns `false` when nothing was settled for it.
    pub fn mark_failed(&self, request_id: &str) -> bool {
        let mut ledger = self.ledger();
        match ledger
            .records
            .iter_mut()
            .rev()
            .find(|record| record.request_id == request_id)
        {
            Some(record) => {
                record.success = false;
                tracing::debug!(request_id, cost = record.cost, "Settled request marked failed");
                true
            }
            None => false,
        }
    }

    /// Drop a reservation without recording usage.
    pub fn release(&self, reservation: Reservation) {
        let mut ledger = self.ledger();
        if ledger.open.remove(&reservation.id).is_some() {
            tracing::debug!(
                request_id = %reservation.request_id,
                released = reservation.estimated_cost,
                "Budget reservation released"
            );
        }
    }

    /// Funds neither spent nor held, or `None` when unlimited.
    pub fn remaining(&self) -> Option<f64> {
        let ledger = self.ledger();
        self.ceiling.map(|c| ledger.available(c))
    }

    /// Settled spend over the ceiling; `0.0` when unlimited.
    pub fn usage_ratio(&self) -> f64 {
        let committed = self.ledger().committed;
        Self::ratio(self.ceiling, committed)
    }

    fn ratio(ceiling: Option<f64>, committed: f64) -> f64 {
        match ceiling {
            None => 0.0,
            Some(c) if c <= 0.0 => 1.0,
            Some(c) => committed / c,
        }
    }

    pub fn status(&self) -> BudgetStatus {
        let ledger = self.ledger();
        BudgetStatus {
            ceiling: self.ceiling,
            spent: ledger.committed,
            reserved: ledger.reserved(),
            remaining: self.ceiling.map(|c| ledger.available(c)),
            usage_ratio: Self::ratio(self.ceiling, ledger.committed),
            over_budget: ledger.over_budget,
        }
    }

    pub fn spent(&self) -> f64 {
        self.ledger().committed
    }

    pub fn reserved(&self) -> f64 {
        self.ledger().reserved()
    }

    pub fn open_reservations(&self) -> usize {
        self.ledger().open.len()
    }

    pub fn is_over_budget(&self) -> bool {
        self.ledger().over_budget
    }

    /// Stop admitting new requests, as after an overshooting settlement.
    pub fn mark_over_budget(&self) {
        self.ledger().over_budget = true;
    }

    /// Settled records in settlement order.
    pub fn records(&self) -> Vec<UsageRecord> {
        self.ledger().records.clone()
    }

    pub fn summary(&self) -> UsageSummary {
        UsageSummary::from_records(&self.ledger().records)
    }
}
