//! Provider adapter and request executor traits.

use crate::{LlmRequest, TokenUsage};
use async_trait::async_trait;
use ratekeeper_error::ProviderError;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// How a provider failure should be handled.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    /// Provider-side throttling (429); retry after backoff
    Throttle,
    /// Long-period quota spent; never retry against the same target
    QuotaExhausted,
    /// Temporary failure (timeouts, 5xx); retry after backoff
    Transient,
    /// Authorisation or malformed request; propagate immediately
    Fatal,
}

impl ErrorClass {
    /// Whether the same target may be retried after a backoff.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Throttle | ErrorClass::Transient)
    }
}

/// Rate-limit information a provider reported alongside a failure.
///
/// Every field is optional; adapters fill in what their provider exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Provider-mandated wait before retrying
    pub retry_after: Option<Duration>,
    /// Request limit for the current window
    pub limit_requests: Option<u64>,
    /// Requests remaining in the current window
    pub remaining_requests: Option<u64>,
    /// Token limit for the current window
    pub limit_tokens: Option<u64>,
    /// Tokens remaining in the current window
    pub remaining_tokens: Option<u64>,
    /// Time until the request window resets
    pub reset_requests: Option<Duration>,
    /// Time until the token window resets
    pub reset_tokens: Option<Duration>,
}

impl RateLimitInfo {
    /// Whether the provider reported anything at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Normalises one provider's token accounting and error shapes.
///
/// Adapters are stateless: they never read or write limiter state. The
/// orchestrator looks adapters up by [`ProviderAdapter::provider_name`] and
/// only ever talks to this interface.
pub trait ProviderAdapter: Send + Sync + fmt::Debug {
    /// Provider name this adapter handles (matches configuration keys).
    fn provider_name(&self) -> &str;

    /// Approximate the token cost of `text` for `model`.
    fn estimate_tokens(&self, text: &str, model: &str) -> u64;

    /// Approximate the full token cost of a request: prompt plus the
    /// completion budget.
    fn estimate_request(&self, request: &LlmRequest, model: &str) -> u64 {
        self.estimate_tokens(&request.prompt, model) + request.max_completion_tokens.unwrap_or(0)
    }

    /// Read actual token usage from a response body, when the provider reports it.
    fn extract_usage(&self, response: &Value) -> Option<TokenUsage>;

    /// Read rate-limit headers and retry hints from a failure.
    fn extract_rate_limit_info(&self, error: &ProviderError) -> RateLimitInfo;

    /// Decide how a failure should be handled.
    fn classify_error(&self, error: &ProviderError) -> ErrorClass;
}

/// The external collaborator that performs the actual provider call.
///
/// The limiter only calls this after admission, and never while holding a
/// lock.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// Send `request` to `target` (which may be a fallback deployment rather
    /// than `request.target`) and return the raw response body.
    async fn execute(&self, target: &str, request: &LlmRequest) -> Result<Value, ProviderError>;
}
