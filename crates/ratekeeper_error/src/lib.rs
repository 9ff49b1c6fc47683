//! Error types for the Ratekeeper library.
//!
//! This crate provides the foundation error types used throughout the Ratekeeper workspace.
//!
//! # Error Hierarchy
//!
//! All errors follow the `ErrorKind` + wrapper struct pattern:
//! - `*ErrorKind` enum defines specific error conditions
//! - `*Error` struct wraps the kind with source location tracking
//! - All errors use `#[track_caller]` for automatic location capture
//!
//! The boundary taxonomy callers match on:
//! - [`RateLimitErrorKind::RateLimitExceeded`] - admission refused by policy (not retried)
//! - [`RateLimitErrorKind::QuotaExhausted`] - long-period quota spent for a target
//! - [`RateLimitErrorKind::BackoffExhausted`] - transient failures outlasted `max_retries`
//! - [`ConfigError`] - raised while loading configuration, never mid-run
//!
//! # Examples
//!
//! ```
//! use ratekeeper_error::{RatekeeperResult, RateLimitError, RateLimitErrorKind};
//!
//! fn admit() -> RatekeeperResult<()> {
//!     Err(RateLimitError::new(RateLimitErrorKind::QuotaExhausted {
//!         provider: "azure".to_string(),
//!         target: "gpt4-east".to_string(),
//!         chain: vec!["gpt4-east".to_string()],
//!     }))?
//! }
//!
//! let err = admit().unwrap_err();
//! assert!(err.is_quota_exhausted());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod provider;
mod rate_limit;
mod state;

pub use config::ConfigError;
pub use error::{RatekeeperError, RatekeeperErrorKind, RatekeeperResult};
pub use provider::ProviderError;
pub use rate_limit::{RateLimitError, RateLimitErrorKind};
pub use state::{StateError, StateErrorKind};
