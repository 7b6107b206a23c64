//! dlc-scheduler: admission control for the DLC test pool.
//!
//! Watches the ticket bucket, enforces the per-resource-class concurrency
//! caps and hands admitted tickets to an external provisioner.
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── LeaderLease      (leases/scheduler; only the holder acts)
//!   ├── TicketStore      (tickets/, pool/, claims/, logs/)
//!   ├── DispatchSink     (ChannelDispatcher | QueueDispatcher)
//!   └── MessageQueue     (runtimeError notices for lost executors)
//! ```
//!
//! Cap safety rests on three things: a single acting leader, per-ticket
//! create-only claims, and accounting that counts only the most advanced
//! pool entry of each ticket.

pub mod dispatch;
pub mod error;
pub mod lease;
pub mod scheduler;

pub use dispatch::{ChannelDispatcher, DispatchSink, QueueDispatcher};
pub use error::{SchedulerError, SchedulerResult};
pub use lease::{LeaderLease, LeaseRecord};
pub use scheduler::{Scheduler, TickReport};
