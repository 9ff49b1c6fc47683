//! Limit definitions.

use ratekeeper_error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Kind of limit a [`RateLimitConfig`] enforces.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitType {
    /// Requests per minute
    Rpm,
    /// Tokens per minute
    Tpm,
    /// Requests per second
    Rps,
    /// Requests per day
    Rpd,
    /// Long-period (e.g. monthly) cumulative token quota
    TpmQuota,
    /// Requests in flight at once
    Concurrent,
}

impl LimitType {
    /// Default sliding window for this limit type.
    ///
    /// Returns `None` for limits that are not window based.
    pub fn default_window(self) -> Option<Duration> {
        match self {
            LimitType::Rpm | LimitType::Tpm => Some(Duration::from_secs(60)),
            LimitType::Rps => Some(Duration::from_secs(1)),
            LimitType::Rpd => Some(Duration::from_secs(86_400)),
            LimitType::TpmQuota | LimitType::Concurrent => None,
        }
    }

    /// Whether a request's cost against this limit is its token count
    /// (otherwise each request costs 1).
    pub fn counts_tokens(self) -> bool {
        matches!(self, LimitType::Tpm | LimitType::TpmQuota)
    }

    /// Whether this limit is enforced by the sliding window limiter.
    pub fn is_windowed(self) -> bool {
        self.default_window().is_some()
    }

    /// Cost of a request estimated at `tokens` against this limit.
    pub fn cost_for(self, tokens: u64) -> u64 {
        if self.counts_tokens() { tokens } else { 1 }
    }
}

/// A single limit, immutable once loaded.
///
/// The effective capacity is `limit_value * burst_allowance`.
///
/// # Examples
///
/// ```
/// use ratekeeper_core::{LimitType, RateLimitConfig};
///
/// let rpm = RateLimitConfig::new(LimitType::Rpm, 10.0)?
///     .with_burst_allowance(1.5)?;
/// assert_eq!(rpm.capacity(), 15.0);
/// assert_eq!(rpm.window().as_secs(), 60);
/// # Ok::<(), ratekeeper_error::ConfigError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, derive_getters::Getters)]
pub struct RateLimitConfig {
    /// Kind of limit
    limit_type: LimitType,
    /// Nominal limit (requests, tokens or in-flight requests)
    limit_value: f64,
    /// Sliding window length; zero for quota and concurrency limits
    window: Duration,
    /// Headroom factor, at least 1.0
    burst_allowance: f64,
}

impl RateLimitConfig {
    /// Create a limit with the type's default window and no burst headroom.
    ///
    /// # Errors
    ///
    /// Returns an error if `limit_value` is not a positive, finite number.
    #[track_caller]
    pub fn new(limit_type: LimitType, limit_value: f64) -> Result<Self, ConfigError> {
        if !(limit_value.is_finite() && limit_value > 0.0) {
            return Err(ConfigError::new(format!(
                "{} limit must be positive, got {}",
                limit_type, limit_value
            )));
        }
        Ok(Self {
            limit_type,
            limit_value,
            window: limit_type.default_window().unwrap_or(Duration::ZERO),
            burst_allowance: 1.0,
        })
    }

    /// Set the burst allowance.
    ///
    /// # Errors
    ///
    /// Returns an error if `burst_allowance` is below 1.0.
    #[track_caller]
    pub fn with_burst_allowance(mut self, burst_allowance: f64) -> Result<Self, ConfigError> {
        if !(burst_allowance.is_finite() && burst_allowance >= 1.0) {
            return Err(ConfigError::new(format!(
                "burst_allowance must be >= 1.0, got {}",
                burst_allowance
            )));
        }
        self.burst_allowance = burst_allowance;
        Ok(self)
    }

    /// Override the window length (only meaningful for windowed limits).
    pub fn with_window(mut self, window: Duration) -> Self {
        if self.limit_type.is_windowed() {
            self.window = window;
        }
        self
    }

    /// Maximum cost admitted within one window (or in flight, for
    /// concurrency limits).
    pub fn capacity(&self) -> f64 {
        self.limit_value * self.burst_allowance
    }
}

/// Identity of one piece of shared limiter state: `(provider, target, limit_type)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LimitKey {
    /// Provider name
    pub provider: String,
    /// Model or deployment name
    pub target: String,
    /// Limit this state belongs to
    pub limit_type: LimitType,
}

impl LimitKey {
    /// Create a new key.
    pub fn new(provider: impl Into<String>, target: impl Into<String>, limit_type: LimitType) -> Self {
        Self {
            provider: provider.into(),
            target: target.into(),
            limit_type,
        }
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.provider, self.target, self.limit_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_limit_type_names_round_trip_through_strum() {
        assert_eq!(LimitType::TpmQuota.to_string(), "TPM_QUOTA");
        assert_eq!(LimitType::from_str("CONCURRENT").unwrap(), LimitType::Concurrent);
    }

    #[test]
    fn test_rejects_non_positive_limits() {
        assert!(RateLimitConfig::new(LimitType::Rpm, 0.0).is_err());
        assert!(RateLimitConfig::new(LimitType::Rpm, -3.0).is_err());
        assert!(RateLimitConfig::new(LimitType::Rpm, f64::NAN).is_err());
    }

    #[test]
    fn test_rejects_burst_below_one() {
        let cfg = RateLimitConfig::new(LimitType::Tpm, 1000.0).unwrap();
        assert!(cfg.with_burst_allowance(0.9).is_err());
    }

    #[test]
    fn test_concurrent_has_no_window() {
        let cfg = RateLimitConfig::new(LimitType::Concurrent, 4.0)
            .unwrap()
            .with_window(Duration::from_secs(5));
        assert_eq!(*cfg.window(), Duration::ZERO);
    }
}
