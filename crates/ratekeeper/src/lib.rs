//! Ratekeeper - unified rate limiting and quota management for LLM APIs
//!
//! Ratekeeper sits between your code and LLM providers and decides when a
//! request may go out. It enforces short-window limits (RPM, TPM, RPS, RPD,
//! concurrency), tracks monthly token quotas, retries throttled and transient
//! failures with backoff, and moves to fallback deployments when a quota is
//! spent.
//!
//! # Features
//!
//! - **Sliding windows**: exact per-request windows shared across threads
//!   and, through a state directory, across processes
//! - **Quotas**: calendar or rolling periods, alert thresholds, persistence
//! - **Backoff**: Fibonacci, exponential with jitter, linear; `Retry-After`
//!   always wins
//! - **Fallback chains**: Azure-style deployments with acyclic fallbacks
//! - **Adapters**: OpenAI, Azure OpenAI, HuggingFace and generic REST
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use ratekeeper::{LlmRequest, RatekeeperConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     ratekeeper::init_observability()?;
//!     let limiter = ratekeeper::limiter_from_config(RatekeeperConfig::load()?)?;
//!
//!     let request = LlmRequest::new("azure", "gpt4-east", "Summarise this report");
//!     let outcome = limiter.execute(&request, &my_http_executor).await?;
//!     println!("served by {} after {} attempts", outcome.target(), outcome.attempts());
//!
//!     limiter.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Cargo Features
//!
//! - `observability` (default) - OpenTelemetry tracing bridge
//!
//! # Architecture
//!
//! - `ratekeeper_error` - Error types
//! - `ratekeeper_core` - Data model, adapter/executor/clock traits
//! - `ratekeeper_providers` - Provider adapters and token estimation
//! - `ratekeeper_rate_limit` - Windows, quotas, backoff, configuration and
//!   the unified limiter
//!
//! This crate (`ratekeeper`) re-exports everything for convenience.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

// Re-export workspace crates
pub use ratekeeper_core::*;
pub use ratekeeper_error::*;
pub use ratekeeper_providers::*;
pub use ratekeeper_rate_limit::*;

#[cfg(feature = "observability")]
mod observability;
#[cfg(feature = "observability")]
pub use observability::{
    ObservabilityConfig, init_observability, init_observability_with_config,
    shutdown_observability,
};

use tracing::instrument;

/// Builder pre-loaded with `config` and the built-in provider adapters.
///
/// Use this when you need to swap the clock, coordinator or sink before
/// building.
pub fn builder_from_config(config: RatekeeperConfig) -> UnifiedRateLimiterBuilder {
    UnifiedRateLimiter::builder()
        .config(config)
        .adapters(default_adapters())
}

/// Build a limiter from `config` with the built-in provider adapters.
///
/// # Errors
///
/// Returns a configuration error for invalid limits or fallback chains, or a
/// state error if the state directory or persistence file cannot be used.
#[instrument(skip(config))]
pub fn limiter_from_config(config: RatekeeperConfig) -> RatekeeperResult<UnifiedRateLimiter> {
    builder_from_config(config).build()
}

/// Load layered configuration (bundled defaults, user file, `./ratekeeper.*`)
/// and build a limiter with the built-in provider adapters.
///
/// # Errors
///
/// Returns a configuration error if any layer is invalid.
#[instrument]
pub fn load_limiter() -> RatekeeperResult<UnifiedRateLimiter> {
    limiter_from_config(RatekeeperConfig::load()?)
}
