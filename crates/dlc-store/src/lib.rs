//! dlc-store: backends and the typed ticket-bucket façade.
//!
//! # Architecture
//!
//! ```text
//! TicketStore (keys, JSON, retries, pool replace protocol)
//!   └── dyn ObjectStore
//!         ├── MemoryObjectStore   (tests, embedded)
//!         └── FsObjectStore       (shared directory, multi-process)
//!
//! dyn MessageQueue
//!   ├── MemoryQueue
//!   └── FsQueue
//! ```
//!
//! Backends provide primitives only: conditional puts, prefix listing and
//! at-least-once queues with visibility timeouts. Everything the scheduler,
//! requesters and executors agree on lives in [`TicketStore`].

pub mod error;
pub mod fs;
pub mod memory;
pub mod object;
pub mod pool;
pub mod retry;
pub mod ticket_store;

use std::sync::Arc;

use dlc_core::{BackendConfig, DlcConfig};
use tracing::info;

pub use error::{StoreError, StoreResult};
pub use fs::{FsObjectStore, FsQueue};
pub use memory::{MemoryObjectStore, MemoryQueue};
pub use object::{MessageQueue, Object, ObjectMeta, ObjectStore, ReceivedMessage};
pub use pool::{PoolRecord, PoolView};
pub use retry::RetryPolicy;
pub use ticket_store::TicketStore;

/// An object store and a queue service opened from one backend config.
#[derive(Clone)]
pub struct Backends {
    pub objects: Arc<dyn ObjectStore>,
    pub queues: Arc<dyn MessageQueue>,
}

impl Backends {
    pub fn open(config: &BackendConfig) -> StoreResult<Self> {
        match config {
            BackendConfig::Memory => {
                info!("using in-memory backends");
                Ok(Self::memory(MemoryObjectStore::new(), MemoryQueue::new()))
            }
            BackendConfig::Fs { root } => {
                info!(root = %root.display(), "using filesystem backends");
                Ok(Self {
                    objects: Arc::new(FsObjectStore::open(root)?),
                    queues: Arc::new(FsQueue::open(root)?),
                })
            }
        }
    }

    /// Wrap existing in-memory backends (shared with test code).
    pub fn memory(objects: MemoryObjectStore, queues: MemoryQueue) -> Self {
        Self {
            objects: Arc::new(objects),
            queues: Arc::new(queues),
        }
    }

    /// Ticket-bucket façade configured from `config`.
    pub fn ticket_store(&self, config: &DlcConfig) -> TicketStore {
        TicketStore::new(
            self.objects.clone(),
            config.ticket_bucket.clone(),
            RetryPolicy::from(&config.retry),
        )
    }
}
