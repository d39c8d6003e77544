//! Relay error types.

use synclog_storage::JournalError;
use synclog_sync::SyncError;
use thiserror::Error;

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Missing or wrong credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A client session misbehaved or is gone.
    #[error("session error: {0}")]
    Session(String),

    /// A change handed to the relay does not decode.
    #[error("decode error: {0}")]
    Decode(#[from] synclog_types::Error),

    /// The sync backend failed.
    #[error("backend error: {0}")]
    Backend(#[from] SyncError),

    /// Durable actor storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Actor state could not be (de)serialized.
    #[error("state encoding error: {0}")]
    State(#[from] serde_json::Error),

    /// A journal-backed backend could not be opened.
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
