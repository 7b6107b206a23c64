//! dlc-core: shared schema of the DLC test scheduler.
//!
//! Requesters, the scheduler daemon and executors only ever talk through the
//! ticket bucket and the response queues. This crate defines what they put
//! there: record types, the key schema, image classification and the
//! configuration document.

pub mod config;
pub mod image;
pub mod keys;
pub mod ticket_name;
pub mod types;

pub use config::{BackendConfig, ConfigError, DlcConfig};
pub use image::{Device, ImageRef, ImageRefError, ImageRule, Placement, ResourceClassTable};
pub use keys::{FailureReason, KeyError, PoolKey};
pub use types::*;
