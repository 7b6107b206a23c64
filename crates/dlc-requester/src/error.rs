//! Requester error types.

use std::time::Duration;

use dlc_core::{ImageRefError, LogBundle};
use dlc_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RequesterError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid image reference: {0}")]
    InvalidImage(#[from] ImageRefError),

    /// The store or queue stayed unreachable for the whole retry budget.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("store error: {0}")]
    Store(StoreError),

    /// No response arrived in time. The handle stays valid.
    #[error("no response for ticket {ticket} within {waited:?}")]
    Timeout { ticket: String, waited: Duration },

    /// The test ran (or was given up on) and failed. The bundle is still
    /// available to the caller.
    #[error("test run for ticket {ticket} ended in runtimeError")]
    TestRuntime { ticket: String, bundle: LogBundle },

    #[error("log bundle for ticket {ticket} missing at {key}")]
    BundleMissing { ticket: String, key: String },
}

impl From<StoreError> for RequesterError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => RequesterError::BackendUnavailable(msg),
            other => RequesterError::Store(other),
        }
    }
}

pub type RequesterResult<T> = Result<T, RequesterError>;
