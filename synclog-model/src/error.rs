use thiserror::Error;

/// Errors raised while setting up a registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A deferred initializer failed. Resolution is not retried.
    #[error("registry initializer failed: {0}")]
    Init(String),

    /// Initializers can no longer be deferred.
    #[error("registry already resolved")]
    AlreadyResolved,
}

/// Errors raised while applying an event.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// No handler is registered for the tag.
    #[error("no handler registered for event {0:?}")]
    Unhandled(String),

    /// The payload does not decode (or encode) as the event's payload type.
    #[error("malformed {tag} payload: {message}")]
    Payload { tag: String, message: String },

    /// The handler refused the event.
    #[error("event rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Rejected`].
    pub fn rejected(reason: impl std::fmt::Display) -> Self {
        HandlerError::Rejected(reason.to_string())
    }
}

pub type HandlerResult<T> = Result<T, HandlerError>;
