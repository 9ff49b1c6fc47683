//! Top-level error wrapper types.

use crate::{ConfigError, ProviderError, RateLimitError, StateError};

/// Every failure the Ratekeeper workspace can surface.
///
/// # Examples
///
/// ```
/// use ratekeeper_error::{ConfigError, RatekeeperError};
///
/// let err: RatekeeperError = ConfigError::new("burst_allowance must be >= 1.0").into();
/// assert!(format!("{}", err).contains("Configuration Error"));
/// ```
#[derive(Debug, derive_more::From, derive_more::Display, derive_more::Error)]
pub enum RatekeeperErrorKind {
    /// Admission, quota or retry failure
    #[from(RateLimitError)]
    RateLimit(RateLimitError),
    /// Configuration error (load time only)
    #[from(ConfigError)]
    Config(ConfigError),
    /// Shared state or persistence error
    #[from(StateError)]
    State(StateError),
    /// Fatal provider error, propagated without retries
    #[from(ProviderError)]
    Provider(ProviderError),
}

/// Ratekeeper error with kind discrimination.
#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("Ratekeeper Error: {}", _0)]
pub struct RatekeeperError(Box<RatekeeperErrorKind>);

impl RatekeeperError {
    /// Create a new error from a kind.
    pub fn new(kind: RatekeeperErrorKind) -> Self {
        Self(Box::new(kind))
    }

    /// Get the error kind.
    pub fn kind(&self) -> &RatekeeperErrorKind {
        &self.0
    }

    /// The rate limit error, if this is one.
    pub fn as_rate_limit(&self) -> Option<&RateLimitError> {
        match self.kind() {
            RatekeeperErrorKind::RateLimit(e) => Some(e),
            _ => None,
        }
    }

    /// Whether a quota (single target or whole fallback chain) is spent.
    pub fn is_quota_exhausted(&self) -> bool {
        self.as_rate_limit()
            .is_some_and(RateLimitError::is_quota_exhausted)
    }

    /// Whether admission was refused by a short-window limit.
    pub fn is_rate_limited(&self) -> bool {
        self.as_rate_limit().is_some_and(|e| {
            matches!(
                e.kind(),
                crate::RateLimitErrorKind::RateLimitExceeded(_)
            )
        })
    }

    /// Whether this is any limit-related refusal a batch caller may choose to
    /// degrade on (rate limited, quota spent, or retries used up).
    pub fn is_limit_failure(&self) -> bool {
        self.as_rate_limit().is_some_and(|e| {
            !matches!(e.kind(), crate::RateLimitErrorKind::UnknownProvider(_))
        })
    }
}

// Generic From implementation for any type that converts to RatekeeperErrorKind
impl<T> From<T> for RatekeeperError
where
    T: Into<RatekeeperErrorKind>,
{
    fn from(err: T) -> Self {
        Self::new(err.into())
    }
}

/// Result type for Ratekeeper operations.
pub type RatekeeperResult<T> = std::result::Result<T, RatekeeperError>;
