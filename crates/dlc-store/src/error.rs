//! Error types for the ticket store and queue backends.

use thiserror::Error;

/// Result type alias for store and queue operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to a backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached. Transient: retried by [`crate::RetryPolicy`].
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error for {key}: {reason}")]
    Deserialize { key: String, reason: String },

    #[error("illegal pool transition for {ticket}: {from} -> {to}")]
    InvalidTransition {
        ticket: String,
        from: dlc_core::PoolStatus,
        to: dlc_core::PoolStatus,
    },
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}
