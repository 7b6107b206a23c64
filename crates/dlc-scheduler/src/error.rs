//! Scheduler error types.

use std::time::Duration;

use dlc_core::FailureReason;
use dlc_store::StoreError;
use thiserror::Error;

/// Errors that can occur during a scheduler tick.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The store stayed unreachable for the whole retry budget. The tick is
    /// abandoned and retried on the next one.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("store error: {0}")]
    Store(StoreError),

    /// Another replica admitted the ticket first. Logged, never surfaced.
    #[error("admission race lost for ticket {ticket}")]
    AdmissionRace { ticket: String },

    /// A running entry outlived the executor deadline.
    #[error("executor for ticket {ticket} lost after {elapsed:?}")]
    ExecutorLost { ticket: String, elapsed: Duration },

    #[error("invalid ticket {ticket}: {reason}")]
    InvalidTicket {
        ticket: String,
        reason: FailureReason,
    },

    #[error("dispatch of ticket {ticket} rejected: {reason}")]
    DispatchRejected { ticket: String, reason: String },

    #[error("tick exceeded its deadline of {0:?}")]
    TickDeadline(Duration),
}

impl From<StoreError> for SchedulerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => SchedulerError::BackendUnavailable(msg),
            other => SchedulerError::Store(other),
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
