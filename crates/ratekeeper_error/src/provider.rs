//! Normalised provider failures.

use std::collections::BTreeMap;
use std::fmt;

/// A failed provider call, as reported by the external request executor.
///
/// Executors translate whatever their HTTP client or SDK returns into this
/// shape; provider adapters then classify it. Header names are stored
/// lower-cased.
///
/// # Examples
///
/// ```
/// use ratekeeper_error::ProviderError;
///
/// let err = ProviderError::new("Too many requests")
///     .with_status(429)
///     .with_header("Retry-After", "7");
/// assert_eq!(err.status, Some(429));
/// assert_eq!(err.header("retry-after"), Some("7"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Error)]
pub struct ProviderError {
    /// HTTP status code, if the failure came from a response
    pub status: Option<u16>,
    /// Provider error code (e.g. `insufficient_quota`, `InsufficientQuota`)
    pub code: Option<String>,
    /// Human-readable message or response body
    pub message: String,
    /// Response headers with lower-cased names
    pub headers: BTreeMap<String, String>,
    /// Line number where the error occurred
    pub line: u32,
    /// File where the error occurred
    pub file: &'static str,
}

impl ProviderError {
    /// Create a provider error with no status (e.g. a connection failure).
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        Self {
            status: None,
            code: None,
            message: message.into(),
            headers: BTreeMap::new(),
            line: location.line(),
            file: location.file(),
        }
    }

    /// Set the HTTP status code.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the provider error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Add a response header. The name is lower-cased.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Look up a header by (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Whether the code or message mentions `needle` (case-insensitive).
    pub fn mentions(&self, needle: &str) -> bool {
        let needle = needle.to_ascii_lowercase();
        self.code
            .as_deref()
            .is_some_and(|c| c.to_ascii_lowercase().contains(&needle))
            || self.message.to_ascii_lowercase().contains(&needle)
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Provider Error:")?;
        if let Some(status) = self.status {
            write!(f, " HTTP {}", status)?;
        }
        if let Some(code) = &self.code {
            write!(f, " [{}]", code)?;
        }
        write!(f, " {} at line {} in {}", self.message, self.line, self.file)
    }
}
