//! OpenAI adapter.

use crate::TokenEstimator;
use crate::headers::{classify_status, split_window_info};
use ratekeeper_core::{ErrorClass, ProviderAdapter, RateLimitInfo, TokenUsage};
use ratekeeper_error::ProviderError;
use serde_json::Value;

/// Adapter for the OpenAI API.
///
/// OpenAI enforces RPM and TPM per model and reports both through
/// `x-ratelimit-*` headers. A 429 whose code is `insufficient_quota` means the
/// account's credit is spent rather than a short-window throttle.
#[derive(Debug, Clone, Default)]
pub struct OpenAIAdapter {
    estimator: TokenEstimator,
}

impl OpenAIAdapter {
    /// Create an adapter with its own token estimator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an adapter sharing `estimator`.
    pub fn with_estimator(estimator: TokenEstimator) -> Self {
        Self { estimator }
    }
}

/// Read an OpenAI-format `usage` object (shared with Azure OpenAI).
pub(crate) fn openai_usage(response: &Value) -> Option<TokenUsage> {
    let usage = response.get("usage")?;
    let prompt = usage.get("prompt_tokens").and_then(Value::as_u64);
    let completion = usage.get("completion_tokens").and_then(Value::as_u64);
    match (prompt, completion) {
        (Some(p), Some(c)) => Some(TokenUsage::new(p, c)),
        (Some(p), None) => Some(TokenUsage::new(p, 0)),
        _ => usage
            .get("total_tokens")
            .and_then(Value::as_u64)
            .map(TokenUsage::total_only),
    }
}

impl ProviderAdapter for OpenAIAdapter {
    fn provider_name(&self) -> &str {
        "openai"
    }

    fn estimate_tokens(&self, text: &str, model: &str) -> u64 {
        self.estimator.estimate(text, model)
    }

    fn extract_usage(&self, response: &Value) -> Option<TokenUsage> {
        openai_usage(response)
    }

    fn extract_rate_limit_info(&self, error: &ProviderError) -> RateLimitInfo {
        split_window_info(error)
    }

    fn classify_error(&self, error: &ProviderError) -> ErrorClass {
        if error.mentions("insufficient_quota") || error.mentions("exceeded your current quota") {
            return ErrorClass::QuotaExhausted;
        }
        classify_status(error.status)
    }
}
