//! Retry delay strategies.
//!
//! Three strategies are provided, all capped:
//! - [`FibonacciBackoff`]: 0, 1, 1, 2, 3, 5, 8, ... seconds, capped at `max_value` (default 70s)
//! - [`ExponentialBackoff`]: `min(base_delay * 2^attempt, max_delay)`, optionally scaled by a
//!   uniform random factor in `[0.5, 1.0]`
//! - [`LinearBackoff`]: `min(base_delay * (attempt + 1), max_delay)`
//!
//! `attempt` counts retries already made, starting at 0. A `Retry-After`
//! reported by the provider always takes precedence over the computed delay.

use rand::Rng;
use ratekeeper_core::{ErrorClass, RateLimitInfo};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default retry budget for every strategy.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Computes how long to wait before the next retry and whether to retry at all.
pub trait BackoffStrategy: Send + Sync + fmt::Debug {
    /// Strategy-computed delay for retry number `attempt` (0-based).
    fn compute_delay(&self, attempt: u32) -> Duration;

    /// Maximum number of retries.
    fn max_retries(&self) -> u32;

    /// Delay before retry `attempt`; a provider `Retry-After` in `metadata`
    /// overrides the computed value.
    fn get_delay(&self, attempt: u32, metadata: Option<&RateLimitInfo>) -> Duration {
        metadata
            .and_then(|info| info.retry_after)
            .unwrap_or_else(|| self.compute_delay(attempt))
    }

    /// Whether a failure of class `class` after `attempt` retries should be retried.
    fn should_retry(&self, attempt: u32, class: ErrorClass) -> bool {
        class.is_retryable() && attempt < self.max_retries()
    }
}

/// Fibonacci backoff: `fib(attempt)` seconds capped at `max_value`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FibonacciBackoff {
    max_value: Duration,
    max_retries: u32,
}

impl FibonacciBackoff {
    /// Create a strategy capped at `max_value`.
    pub fn new(max_value: Duration) -> Self {
        Self {
            max_value,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(70))
    }
}

impl BackoffStrategy for FibonacciBackoff {
    fn compute_delay(&self, attempt: u32) -> Duration {
        let cap = self.max_value.as_secs();
        let (mut current, mut next) = (0_u64, 1_u64);
        for _ in 0..attempt {
            if current >= cap {
                break;
            }
            (current, next) = (next, current.saturating_add(next));
        }
        Duration::from_secs(current).min(self.max_value)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Exponential backoff with optional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    max_retries: u32,
}

impl ExponentialBackoff {
    /// Create a strategy without jitter.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: false,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60)).with_jitter(true)
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn compute_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(63) as i32;
        let secs = (self.base_delay.as_secs_f64() * 2f64.powi(exponent))
            .min(self.max_delay.as_secs_f64());
        let secs = if self.jitter {
            secs * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            secs
        };
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Linear backoff: `base_delay * (attempt + 1)` capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearBackoff {
    base_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
}

impl LinearBackoff {
    /// Create a linear strategy.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl BackoffStrategy for LinearBackoff {
    fn compute_delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(attempt.saturating_add(1))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Retry progress for one logical request.
///
/// Created fresh for every target the request is sent to; never shared.
#[derive(Debug, Clone)]
pub struct BackoffState {
    attempt_count: u32,
    strategy: Arc<dyn BackoffStrategy>,
}

impl BackoffState {
    /// Start a retry sequence.
    pub fn new(strategy: Arc<dyn BackoffStrategy>) -> Self {
        Self {
            attempt_count: 0,
            strategy,
        }
    }

    /// Retries performed so far.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Register a failure. Returns the delay before the next retry, or
    /// `None` if the failure must not be retried.
    pub fn next_delay(&mut self, class: ErrorClass, info: Option<&RateLimitInfo>) -> Option<Duration> {
        if !self.strategy.should_retry(self.attempt_count, class) {
            return None;
        }
        let delay = self.strategy.get_delay(self.attempt_count, info);
        self.attempt_count += 1;
        Some(delay)
    }
}
