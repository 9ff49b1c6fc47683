//! Core data types for the Ratekeeper LLM rate limiting library.
//!
//! This crate provides the data model shared by every Ratekeeper crate
//! (limit definitions, usage records, normalised rate-limit information) and
//! the seams the orchestrator is built around: [`ProviderAdapter`],
//! [`RequestExecutor`] and [`Clock`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod limit;
mod request;
mod traits;
mod usage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use limit::{LimitKey, LimitType, RateLimitConfig};
pub use request::LlmRequest;
pub use traits::{ErrorClass, ProviderAdapter, RateLimitInfo, RequestExecutor};
pub use usage::{TokenUsage, UsageRecord};
