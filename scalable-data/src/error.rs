//! Error types for the data layer
//!
//! `DataError` is `Clone` so that a single upstream failure can be handed to
//! every caller waiting on the same deduplicated request.

use thiserror::Error;

/// Result type for data layer operations
pub type DataResult<T> = Result<T, DataError>;

/// Errors that can occur in the data layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    /// The remote store reported a failure while reading
    #[error("Upstream fetch failed: {0}")]
    Upstream(String),

    /// The remote store rejected a write
    #[error("Store write failed on '{table}': {reason}")]
    Store { table: String, reason: String },

    /// Requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Query descriptor could not be executed
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DataError {
    /// Whether retrying the same call may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DataError::Upstream(_) | DataError::Store { .. } | DataError::Io(_))
    }

    /// Stable error code for logging and programmatic handling
    pub fn error_code(&self) -> &'static str {
        match self {
            DataError::Upstream(_) => "UPSTREAM_FAILED",
            DataError::Store { .. } => "STORE_WRITE_FAILED",
            DataError::NotFound(_) => "NOT_FOUND",
            DataError::InvalidQuery(_) => "INVALID_QUERY",
            DataError::Serialization(_) => "SERIALIZATION_ERROR",
            DataError::Config(_) => "INVALID_CONFIG",
            DataError::Io(_) => "IO_ERROR",
            DataError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for DataError {
    fn from(err: serde_json::Error) -> Self {
        DataError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for DataError {
    fn from(err: std::io::Error) -> Self {
        DataError::Io(err.to_string())
    }
}
