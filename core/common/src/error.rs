//! Common error types for LedgerSync.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Top-level error type for LedgerSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage or transaction failure. Fatal to the current call; the whole
    /// call is safe to retry.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// I/O operation failed outside of SQLite.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Referenced resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Downgrade requested, missing migration step or failed migration step.
    #[error("Schema version error: {0}")]
    SchemaVersion(String),

    /// A remote batch was rejected by the conflict resolver.
    #[error("Conflict aborted: remote operation {remote_id} rejected the batch")]
    ConflictAborted {
        /// Remote id of the operation whose resolution aborted the batch.
        remote_id: String,
    },

    /// Invalid input provided.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A remote operation is missing a required identity field.
    #[error("Malformed operation: {0}")]
    MalformedOperation(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Push or pull transport supplied by the caller failed.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Stable numeric code for this error, for callers that marshal errors
    /// across a language boundary.
    pub fn code(&self) -> i32 {
        match self {
            Error::Storage(_) | Error::Io(_) => 1,
            Error::NotFound(_) => 2,
            Error::SchemaVersion(_) => 3,
            Error::ConflictAborted { .. } => 4,
            Error::InvalidArgument(_) => 5,
            Error::MalformedOperation(_) => 6,
            Error::Serialization(_) => 7,
            Error::Transport(_) => 8,
        }
    }

    /// Whether retrying the whole call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Storage(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            Error::Io(_) | Error::Transport(_) => true,
            _ => false,
        }
    }

    /// Create an invalid argument error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    /// Create a malformed operation error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedOperation(message.into())
    }

    /// Create a schema version error.
    pub fn schema(message: impl Into<String>) -> Self {
        Error::SchemaVersion(message.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
