//! HuggingFace Inference API adapter.

use crate::TokenEstimator;
use crate::headers::{classify_status, single_window_info};
use ratekeeper_core::{ErrorClass, ProviderAdapter, RateLimitInfo, TokenUsage};
use ratekeeper_error::ProviderError;
use serde_json::Value;

/// Adapter for the HuggingFace Inference API.
///
/// HuggingFace does not report reliable usage counts, so token accounting
/// relies entirely on the word-count heuristic and [`ProviderAdapter::extract_usage`]
/// always returns `None`. Limits are a generic RPM. A 503 while a model is
/// loading is transient.
#[derive(Debug, Clone)]
pub struct HuggingFaceAdapter {
    estimator: TokenEstimator,
}

impl HuggingFaceAdapter {
    /// Create an adapter with its own token estimator.
    pub fn new() -> Self {
        Self::with_estimator(TokenEstimator::new())
    }

    /// Create an adapter sharing `estimator`.
    pub fn with_estimator(estimator: TokenEstimator) -> Self {
        Self { estimator }
    }
}

impl Default for HuggingFaceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for HuggingFaceAdapter {
    fn provider_name(&self) -> &str {
        "huggingface"
    }

    fn estimate_tokens(&self, text: &str, _model: &str) -> u64 {
        self.estimator.estimate_heuristic(text)
    }

    fn extract_usage(&self, _response: &Value) -> Option<TokenUsage> {
        None
    }

    fn extract_rate_limit_info(&self, error: &ProviderError) -> RateLimitInfo {
        single_window_info(error)
    }

    fn classify_error(&self, error: &ProviderError) -> ErrorClass {
        classify_status(error.status)
    }
}
