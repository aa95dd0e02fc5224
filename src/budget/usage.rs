use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One settled provider call. Records are append-only; only `success` is
/// cleared when post-processing rejects a billed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

impl UsageRecord {
    pub fn total_tokens(&self) -> u64 {
        u64::from(self.input_tokens) + u64::from(self.output_tokens)
    }
}

/// Per-model slice of a [`UsageSummary`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

/// Aggregated view over a set of usage records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub request_count: u64,
    pub successful_requests: u64,
    pub total_cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub by_model: BTreeMap<String, ModelUsage>,
}

impl UsageSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a UsageRecord>) -> Self {
        let mut summary = Self::default();
        for record in records {
            summary.request_count += 1;
            if record.success {
                summary.successful_requests += 1;
            }
            summary.total_cost += record.cost;
            summary.input_tokens += u64::from(record.input_tokens);
            summary.output_tokens += u64::from(record.output_tokens);

            let model = summary.by_model.entry(record.model.clone()).or_default();
            model.requests += 1;
            model.input_tokens += u64::from(record.input_tokens);
            model.output_tokens += u64::from(record.output_tokens);
            model.cost += record.cost;
        }
        summary
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Mean cost per recorded request, zero when empty.
    pub fn average_cost(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.total_cost / self.request_count as f64
        }
    }
}
