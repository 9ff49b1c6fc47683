//! Azure OpenAI adapter.

use crate::TokenEstimator;
use crate::headers::{classify_status, split_window_info};
use crate::openai::openai_usage;
use ratekeeper_core::{ErrorClass, ProviderAdapter, RateLimitInfo, TokenUsage};
use ratekeeper_error::ProviderError;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;

static RETRY_AFTER_MESSAGE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)retry after (\d+(?:\.\d+)?) seconds?").ok());

/// Adapter for Azure OpenAI deployments.
///
/// On top of OpenAI's per-minute limits, Azure deployments carry a monthly
/// token quota and a per-second request limit. Status handling:
/// - 429: throttle, retry against the same deployment
/// - 403 mentioning `InsufficientQuota`: quota exhausted, do not retry this deployment
/// - other 401/403: fatal
///
/// Azure frequently states the wait in the message ("Please retry after 20
/// seconds") instead of a header; that is used when no header is present.
#[derive(Debug, Clone, Default)]
pub struct AzureAdapter {
    estimator: TokenEstimator,
}

impl AzureAdapter {
    /// Create an adapter with its own token estimator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an adapter sharing `estimator`.
    pub fn with_estimator(estimator: TokenEstimator) -> Self {
        Self { estimator }
    }
}

impl ProviderAdapter for AzureAdapter {
    fn provider_name(&self) -> &str {
        "azure"
    }

    fn estimate_tokens(&self, text: &str, model: &str) -> u64 {
        self.estimator.estimate(text, model)
    }

    fn extract_usage(&self, response: &Value) -> Option<TokenUsage> {
        openai_usage(response)
    }

    fn extract_rate_limit_info(&self, error: &ProviderError) -> RateLimitInfo {
        let mut info = split_window_info(error);
        if info.retry_after.is_none() {
            info.retry_after = RETRY_AFTER_MESSAGE
                .as_ref()
                .and_then(|re| re.captures(&error.message))
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
        }
        info
    }

    fn classify_error(&self, error: &ProviderError) -> ErrorClass {
        match error.status {
            Some(403) if error.mentions("InsufficientQuota") => ErrorClass::QuotaExhausted,
            Some(429) => ErrorClass::Throttle,
            status => classify_status(status),
        }
    }
}
