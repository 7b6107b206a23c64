//! Executor error types.

use std::time::Duration;

use dlc_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The launch environment is incomplete or malformed.
    #[error("bad launch environment: {0}")]
    Launch(String),

    #[error("ticket {ticket} cannot be decoded: {reason}")]
    InvalidTicket { ticket: String, reason: String },

    /// Launched for a ticket the scheduler never admitted.
    #[error("ticket {ticket} has no pool entry")]
    NotAdmitted { ticket: String },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("failed to spawn test command: {0}")]
    Spawn(String),

    /// The test command outlived its budget and was killed. `log` holds
    /// whatever it printed before that.
    #[error("test command for ticket {ticket} killed after {after:?}")]
    CommandTimeout {
        ticket: String,
        after: Duration,
        log: String,
    },

    #[error("failed to publish response for ticket {ticket}: {reason}")]
    Publish { ticket: String, reason: String },

    /// Someone else kept moving the pool entry while we tried to close it.
    #[error("pool entry of ticket {ticket} kept changing")]
    EntryContended { ticket: String },
}

impl From<StoreError> for ExecutorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => ExecutorError::BackendUnavailable(msg),
            other => ExecutorError::Store(other),
        }
    }
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
