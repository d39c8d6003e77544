//! Error types for the journal.

use thiserror::Error;

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors that can occur in journal operations.
///
/// Any of these aborts the in-flight write; the entry being written is
/// never partially committed.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Payload could not be sealed or opened.
    #[error("encryption error: {0}")]
    Encryption(#[from] synclog_crypto::EncryptorError),

    /// Stored row does not decode into an entry.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The blocking storage task failed.
    #[error("storage task failed: {0}")]
    Task(String),

    /// The journal has been shut down.
    #[error("journal closed")]
    Closed,
}
