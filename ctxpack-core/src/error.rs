//! Error types for ctxpack-core

use thiserror::Error;

/// Main error type for the ctxpack-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed request (e.g. empty task text)
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown context session id on an outcome report
    #[error("session not found: {0}")]
    SessionNotFound(i64),

    /// An outcome was already recorded for this session
    #[error("outcome already recorded for session {0}")]
    OutcomeAlreadyRecorded(i64),

    /// A store operation exceeded its deadline
    #[error("store operation {operation} timed out after {timeout_ms}ms")]
    StoreTimeout { operation: String, timeout_ms: u64 },

    /// A write gave up its commit because its caller was already told it
    /// timed out
    #[error("store operation {0} abandoned after its deadline")]
    Abandoned(String),

    /// The store queue dispatcher is gone
    #[error("store queue closed")]
    QueueClosed,

    /// The connection mutex was poisoned by a panicking operation
    #[error("store connection poisoned")]
    Poisoned,

    /// An external signal source failed or timed out
    #[error("signal {signal} unavailable: {message}")]
    SignalUnavailable { signal: String, message: String },
}

impl Error {
    /// Whether this error means the store did not answer in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::StoreTimeout { .. })
    }
}

/// Result type alias for ctxpack-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::SessionNotFound(42);
        assert_eq!(err.to_string(), "session not found: 42");

        let err = Error::StoreTimeout {
            operation: "get_session".to_string(),
            timeout_ms: 5000,
        };
        assert_eq!(
            err.to_string(),
            "store operation get_session timed out after 5000ms"
        );
        assert!(err.is_timeout());
    }

    #[test]
    fn test_error_conversion() {
        let json_err = serde_json::from_str::<Vec<String>>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(!err.is_timeout());
    }
}
