//! Per-model pricing.
//!
//! Prices are in USD per 1M tokens (input/output). Concrete price tables are
//! supplied by provider implementations; this module only does the arithmetic.

use serde::{Deserialize, Serialize};

// MARK: - Constants

/// Rough characters-per-token ratio used for estimates.
const CHARS_PER_TOKEN: usize = 4;

const TOKENS_PER_MILLION: f64 = 1_000_000.0;

// MARK: - Types

/// Pricing information for a specific model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Model identifier.
    pub model: String,
    /// Cost per 1M input tokens in USD.
    pub input_cost_per_million: f64,
    /// Cost per 1M output tokens in USD.
    pub output_cost_per_million: f64,
}

impl ModelPricing {
    pub fn new(
        model: impl Into<String>,
        input_cost_per_million: f64,
        output_cost_per_million: f64,
    ) -> Self {
        Self {
            model: model.into(),
            input_cost_per_million,
            output_cost_per_million,
        }
    }

    /// Cost in USD for the given token counts.
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        let input = f64::from(input_tokens) / TOKENS_PER_MILLION * self.input_cost_per_million;
        let output = f64::from(output_tokens) / TOKENS_PER_MILLION * self.output_cost_per_million;
        input + output
    }
}

// MARK: - Estimation

/// Approximate token count for a piece of text (about 4 characters per token,
/// rounded up, never zero for non-empty text).
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    let tokens = chars.div_ceil(CHARS_PER_TOKEN);
    u32::try_from(tokens).unwrap_or(u32::MAX)
}

// MARK: - Tests
