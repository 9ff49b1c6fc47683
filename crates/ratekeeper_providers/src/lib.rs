//! Provider adapters for Ratekeeper.
//!
//! Each adapter implements [`ProviderAdapter`] for one provider family and
//! normalises three things the orchestrator needs without knowing which
//! provider it is talking to:
//!
//! - token estimation (exact BPE tokenizer when the model is known, otherwise
//!   a word-count heuristic)
//! - usage extraction from response bodies
//! - error classification and rate-limit header parsing
//!
//! # Available Adapters
//!
//! - **OpenAI** - RPM + TPM, `Retry-After` and `x-ratelimit-*` headers
//! - **Azure OpenAI** - adds monthly `TPM_QUOTA` and `RPS`; 403 `InsufficientQuota`
//!   is quota exhaustion
//! - **HuggingFace** - no usage counts, heuristic estimation only
//! - **Generic REST** - conservative defaults for any other HTTP API
//!
//! # Example
//!
//! ```
//! use ratekeeper_core::{ErrorClass, ProviderAdapter};
//! use ratekeeper_error::ProviderError;
//! use ratekeeper_providers::AzureAdapter;
//!
//! let azure = AzureAdapter::new();
//! let err = ProviderError::new("InsufficientQuota: monthly quota exceeded").with_status(403);
//! assert_eq!(azure.classify_error(&err), ErrorClass::QuotaExhausted);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod azure;
mod headers;
mod huggingface;
mod openai;
mod rest;
mod token;

pub use azure::AzureAdapter;
pub use headers::{parse_reset_duration, provider_error_from_response};
pub use huggingface::HuggingFaceAdapter;
pub use openai::OpenAIAdapter;
pub use rest::RestAdapter;
pub use token::{FallbackHeuristic, TokenEstimator};

use ratekeeper_core::ProviderAdapter;
use std::sync::Arc;

/// One adapter per built-in provider, sharing a single token estimator.
pub fn default_adapters() -> Vec<Arc<dyn ProviderAdapter>> {
    let estimator = TokenEstimator::new();
    vec![
        Arc::new(OpenAIAdapter::with_estimator(estimator.clone())),
        Arc::new(AzureAdapter::with_estimator(estimator.clone())),
        Arc::new(HuggingFaceAdapter::with_estimator(estimator.clone())),
        Arc::new(RestAdapter::with_estimator("rest", estimator)),
    ]
}
