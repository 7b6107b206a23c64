//! dlc-executor: runs one dispatched test and reports the outcome.
//!
//! # Architecture
//!
//! ```text
//! provisioner ── env (TICKET_KEY, ...) ──► LaunchSpec
//!                                             │
//!                                          Executor
//!                                             ├── TestRunner (ShellRunner: sh -c <command>)
//!                                             ├── TicketStore (ticket, bundle, pool entry)
//!                                             └── MessageQueue (response message)
//! ```

pub mod error;
pub mod executor;
pub mod launch;
pub mod runner;

pub use error::{ExecutorError, ExecutorResult};
pub use executor::{ExecutionOutcome, Executor};
pub use launch::LaunchSpec;
pub use runner::{RunOutput, ShellRunner, TestJob, TestRunner};
