//! Error types for Gatekeeper.

use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Missing or invalid identifier, rule name, or rule configuration
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown rule name
    #[error("Not found: {0}")]
    NotFound(String),

    /// Counting store unreachable, timed out, or returned something malformed
    #[error("Backend error: {0}")]
    Backend(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for GatekeeperError {
    fn from(err: redis::RedisError) -> Self {
        GatekeeperError::Backend(err.to_string())
    }
}

impl GatekeeperError {
    /// Whether this error came from the counting store.
    ///
    /// Backend errors are the only kind the decision paths convert into
    /// fail-open results.
    pub fn is_backend(&self) -> bool {
        matches!(self, GatekeeperError::Backend(_))
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
