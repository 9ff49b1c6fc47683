//! Generic REST adapter.

use crate::TokenEstimator;
use crate::headers::{classify_status, single_window_info};
use ratekeeper_core::{ErrorClass, ProviderAdapter, RateLimitInfo, TokenUsage};
use ratekeeper_error::ProviderError;
use serde_json::Value;

/// Adapter for any other HTTP inference API.
///
/// Usage is read from either OpenAI-style (`prompt_tokens`/`completion_tokens`)
/// or Anthropic-style (`input_tokens`/`output_tokens`) `usage` objects.
/// 402 responses, and 403/429 responses mentioning a quota, are treated as
/// quota exhaustion.
#[derive(Debug, Clone)]
pub struct RestAdapter {
    name: String,
    estimator: TokenEstimator,
}

impl RestAdapter {
    /// Create an adapter registered under `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_estimator(name, TokenEstimator::new())
    }

    /// Create an adapter registered under `name` sharing `estimator`.
    pub fn with_estimator(name: impl Into<String>, estimator: TokenEstimator) -> Self {
        Self {
            name: name.into(),
            estimator,
        }
    }
}

impl ProviderAdapter for RestAdapter {
    fn provider_name(&self) -> &str {
        &self.name
    }

    fn estimate_tokens(&self, text: &str, model: &str) -> u64 {
        self.estimator.estimate(text, model)
    }

    fn extract_usage(&self, response: &Value) -> Option<TokenUsage> {
        let usage = response.get("usage")?;
        let field = |names: [&str; 2]| {
            names
                .iter()
                .find_map(|name| usage.get(*name).and_then(Value::as_u64))
        };
        match (
            field(["prompt_tokens", "input_tokens"]),
            field(["completion_tokens", "output_tokens"]),
        ) {
            (Some(p), Some(c)) => Some(TokenUsage::new(p, c)),
            (Some(p), None) => Some(TokenUsage::new(p, 0)),
            (None, Some(c)) => Some(TokenUsage::new(0, c)),
            (None, None) => usage
                .get("total_tokens")
                .and_then(Value::as_u64)
                .map(TokenUsage::total_only),
        }
    }

    fn extract_rate_limit_info(&self, error: &ProviderError) -> RateLimitInfo {
        single_window_info(error)
    }

    fn classify_error(&self, error: &ProviderError) -> ErrorClass {
        match error.status {
            Some(402) => ErrorClass::QuotaExhausted,
            Some(403 | 429) if error.mentions("quota") => ErrorClass::QuotaExhausted,
            status => classify_status(status),
        }
    }
}
