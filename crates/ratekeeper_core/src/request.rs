//! Request description handed to adapters and executors.

use serde::{Deserialize, Serialize};

/// A logical LLM call routed through the limiter.
///
/// `target` is the model or deployment the caller asked for; the limiter may
/// substitute a fallback deployment when the target's quota is spent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Provider name (`openai`, `azure`, `huggingface`, `rest`, ...)
    pub provider: String,
    /// Model or deployment name
    pub target: String,
    /// Prompt text (or the serialised request body)
    pub prompt: String,
    /// Completion budget, charged up front against token limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u64>,
}

impl LlmRequest {
    /// Create a request with no completion budget.
    pub fn new(
        provider: impl Into<String>,
        target: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            target: target.into(),
            prompt: prompt.into(),
            max_completion_tokens: None,
        }
    }

    /// Set the completion budget.
    pub fn with_max_completion_tokens(mut self, tokens: u64) -> Self {
        self.max_completion_tokens = Some(tokens);
        self
    }
}
