//! Usage accounting types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One admitted request's cost against a window, kept until it ages out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Request identifier shared by every record of the same admission
    pub id: Uuid,
    /// Admission time
    pub timestamp: DateTime<Utc>,
    /// Cost charged (1 per request, or tokens)
    pub cost: u64,
    /// Provider name
    pub provider: String,
    /// Model or deployment name
    pub target: String,
}

/// Token usage statistics for a single LLM operation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, derive_getters::Getters,
)]
pub struct TokenUsage {
    /// Tokens in the prompt/input.
    prompt_tokens: u64,
    /// Tokens in the response/output.
    completion_tokens: u64,
    /// Total tokens (prompt + completion).
    total_tokens: u64,
}

impl TokenUsage {
    /// Create a new token usage record.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Usage where only the total is known.
    pub fn total_only(total_tokens: u64) -> Self {
        Self {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens,
        }
    }

    /// Calculate cost in USD based on pricing per million tokens.
    ///
    /// # Arguments
    ///
    /// * `prompt_price_per_million` - Cost per million prompt tokens in USD
    /// * `completion_price_per_million` - Cost per million completion tokens in USD
    pub fn calculate_cost(
        &self,
        prompt_price_per_million: f64,
        completion_price_per_million: f64,
    ) -> f64 {
        let prompt_cost = (self.prompt_tokens as f64 / 1_000_000.0) * prompt_price_per_million;
        let completion_cost =
            (self.completion_tokens as f64 / 1_000_000.0) * completion_price_per_million;
        prompt_cost + completion_cost
    }
}
