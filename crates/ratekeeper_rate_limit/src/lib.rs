//! Rate limiting, quota tracking and retry orchestration for LLM providers.
//!
//! The pieces, leaves first:
//!
//! - [`BackoffStrategy`] - Fibonacci, exponential (with jitter) and linear
//!   retry delays, overridden by a provider `Retry-After`
//! - [`ParallelCoordinator`] - per-key locked state shared by threads and,
//!   through [`FileBackend`], by processes
//! - [`SlidingWindowLimiter`] - RPM/TPM/RPS/RPD windows and concurrency slots
//! - [`QuotaTracker`] - monthly (or rolling) token quotas with alert
//!   thresholds, persisted through a [`PersistenceSink`]
//! - [`DeploymentMapper`] - deployments and acyclic fallback chains
//! - [`RatekeeperConfig`] - layered YAML/JSON/TOML configuration validated
//!   against a JSON Schema
//! - [`UnifiedRateLimiter`] - `acquire` / `record_usage` / `record_failure`
//!   and the full retry/fallback state machine in `execute`
//!
//! Nothing here is a global: build one [`ParallelCoordinator`] per process
//! group and pass it to the limiter.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod config;
mod coordinator;
mod deployment;
mod limiter;
mod persistence;
mod quota;
mod window;

pub use backoff::{
    BackoffState, BackoffStrategy, DEFAULT_MAX_RETRIES, ExponentialBackoff, FibonacciBackoff,
    LinearBackoff,
};
pub use config::{
    BackoffConfig, BackoffKind, KNOWN_PROVIDERS, LimitSpec, PersistenceConfig, ProviderConfig,
    ProviderLimits, QuotaConfig, RateLimitingConfig, RatekeeperConfig, ResetKind, SystemConfig,
};
pub use ::config::FileFormat;
pub use coordinator::{BackendGuard, FileBackend, InMemoryBackend, ParallelCoordinator, StateBackend};
pub use deployment::{DeploymentConfig, DeploymentMapper};
pub use limiter::{
    DEFAULT_PERSIST_INTERVAL, ExecutionOutcome, Permit, UnifiedRateLimiter,
    UnifiedRateLimiterBuilder,
};
pub use persistence::{InMemorySink, JsonFileSink, PersistedBlob, PersistenceSink};
pub use quota::{
    DEFAULT_ALERT_THRESHOLDS, DEFAULT_TARGET, HISTORY_LEN, QuotaLimit, QuotaPeriod, QuotaPolicy,
    QuotaSnapshot, QuotaState, QuotaTracker,
};
pub use window::{Admission, CONCURRENT_POLL_INTERVAL, SlidingWindowLimiter, WindowRequest, WindowState};
