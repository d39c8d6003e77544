//! Error types for the sync layer.

use synclog_model::{HandlerError, RegistryError};
use synclog_storage::JournalError;
use synclog_types::RemoteId;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport I/O failed. Sync loops log this and retry.
    #[error("transport error: {0}")]
    Transport(String),

    /// Protocol error (malformed or unexpected frame).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote answered a request with an error frame.
    #[error("remote error: {0}")]
    Remote(String),

    /// Entry or frame encoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] synclog_types::Error),

    /// Journal storage failed.
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    /// The application handler failed.
    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Registry initialization failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,

    #[error("remote already registered: {0}")]
    RemoteExists(RemoteId),

    #[error("remote not registered: {0}")]
    RemoteNotFound(RemoteId),
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}
