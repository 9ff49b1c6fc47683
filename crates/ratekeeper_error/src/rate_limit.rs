//! Rate limiting error types.

/// Error kinds for admission and retry decisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub enum RateLimitErrorKind {
    /// Admission refused: the request would exceed a limit and waiting is not
    /// allowed (timeout elapsed or the cost can never fit the window).
    #[display("Rate limit exceeded: {}", _0)]
    RateLimitExceeded(String),

    /// The long-period quota is spent for `target` and for every fallback
    /// tried after it.
    #[display("Quota exhausted for {}/{} (tried {})", provider, target, chain.join(" -> "))]
    QuotaExhausted {
        /// Provider name
        provider: String,
        /// Target originally requested
        target: String,
        /// Targets tried, in order (just `target` when there is no fallback)
        chain: Vec<String>,
    },

    /// Transient failures persisted past the retry budget.
    #[display("Backoff exhausted after {} attempts: {}", attempts, last_error)]
    BackoffExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Message of the final failure
        last_error: String,
    },

    /// No adapter is registered for the provider.
    #[display("No provider adapter registered for '{}'", _0)]
    UnknownProvider(String),
}

/// Rate limiting error with location tracking.
#[derive(Debug, Clone, derive_more::Display, derive_more::Error)]
#[display("Rate Limit Error: {} at line {} in {}", kind, line, file)]
pub struct RateLimitError {
    kind: RateLimitErrorKind,
    line: u32,
    file: &'static str,
}

impl RateLimitError {
    /// Create a new rate limiting error with automatic location tracking.
    #[track_caller]
    pub fn new(kind: RateLimitErrorKind) -> Self {
        let location = std::panic::Location::caller();
        Self {
            kind,
            line: location.line(),
            file: location.file(),
        }
    }

    /// Get the error kind.
    pub fn kind(&self) -> &RateLimitErrorKind {
        &self.kind
    }

    /// Whether this error reports quota exhaustion.
    pub fn is_quota_exhausted(&self) -> bool {
        matches!(self.kind, RateLimitErrorKind::QuotaExhausted { .. })
    }
}

impl From<RateLimitErrorKind> for RateLimitError {
    #[track_caller]
    fn from(kind: RateLimitErrorKind) -> Self {
        Self::new(kind)
    }
}
