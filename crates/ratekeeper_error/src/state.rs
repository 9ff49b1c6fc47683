//! Shared-state and persistence errors.

/// Specific shared-state error conditions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub enum StateErrorKind {
    /// Filesystem operation failed
    #[display("I/O error on {}: {}", path, message)]
    Io {
        /// Path involved in the failed operation
        path: String,
        /// Underlying error message
        message: String,
    },
    /// State blob could not be encoded or decoded
    #[display("Serialization error for key '{}': {}", key, message)]
    Serialization {
        /// State key
        key: String,
        /// Underlying error message
        message: String,
    },
    /// A state closure tried to update a key it is already updating
    #[display("Nested write to key '{}' while its update is in progress", _0)]
    NestedWrite(String),
    /// The same key was passed twice to one multi-key update
    #[display("Key '{}' appears more than once in one update", _0)]
    DuplicateKey(String),
    /// Persistence sink failure
    #[display("Persistence error: {}", _0)]
    Persistence(String),
}

/// Shared-state error with location tracking.
#[derive(Debug, Clone, derive_more::Display, derive_more::Error)]
#[display("State Error: {} at line {} in {}", kind, line, file)]
pub struct StateError {
    kind: StateErrorKind,
    line: u32,
    file: &'static str,
}

impl StateError {
    /// Create a new state error with caller location tracking.
    #[track_caller]
    pub fn new(kind: StateErrorKind) -> Self {
        let location = std::panic::Location::caller();
        Self {
            kind,
            line: location.line(),
            file: location.file(),
        }
    }

    /// Shorthand for an I/O failure on `path`.
    #[track_caller]
    pub fn io(path: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        Self::new(StateErrorKind::Io {
            path: path.to_string(),
            message: err.to_string(),
        })
    }

    /// Shorthand for a (de)serialization failure on `key`.
    #[track_caller]
    pub fn serialization(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::new(StateErrorKind::Serialization {
            key: key.into(),
            message: err.to_string(),
        })
    }

    /// Get the error kind.
    pub fn kind(&self) -> &StateErrorKind {
        &self.kind
    }
}
