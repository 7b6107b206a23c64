//! Object-store and message-queue contracts.
//!
//! Backends only need to provide these primitives; ticket, pool and bundle
//! semantics are layered on top by [`crate::TicketStore`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreResult;

/// Listing/`head` view of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    /// Monotonically increasing per key; used for compare-and-swap.
    pub version: u64,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub meta: ObjectMeta,
    pub data: Vec<u8>,
}

/// Flat key/value object store with prefix listing and conditional puts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Unconditional write.
    async fn put(&self, key: &str, data: Vec<u8>) -> StoreResult<ObjectMeta>;

    /// Create-only write. Returns `None` when the key already exists.
    async fn put_if_absent(&self, key: &str, data: Vec<u8>) -> StoreResult<Option<ObjectMeta>>;

    /// Compare-and-swap on the object version. Returns `None` when the
    /// stored version differs (or the object is gone).
    async fn put_if_version(
        &self,
        key: &str,
        data: Vec<u8>,
        version: u64,
    ) -> StoreResult<Option<ObjectMeta>>;

    async fn get(&self, key: &str) -> StoreResult<Option<Object>>;

    async fn head(&self, key: &str) -> StoreResult<Option<ObjectMeta>>;

    /// All objects whose key starts with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectMeta>>;

    /// Idempotent delete. Returns true if the object existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;
}

/// A message taken off a queue. It stays invisible to other consumers
/// until deleted, released, or its visibility timeout expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub receipt: String,
    pub body: String,
}

/// At-least-once message queue with visibility timeouts.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Idempotent; returns the queue URL.
    async fn create_queue(&self, name: &str) -> StoreResult<String>;

    async fn delete_queue(&self, url: &str) -> StoreResult<()>;

    async fn send(&self, url: &str, body: String) -> StoreResult<()>;

    /// Long-poll for up to `wait`, returning at most `max` messages.
    async fn receive(
        &self,
        url: &str,
        max: usize,
        wait: Duration,
        visibility: Duration,
    ) -> StoreResult<Vec<ReceivedMessage>>;

    /// Acknowledge a message. Stale receipts return `false`.
    async fn delete_message(&self, url: &str, receipt: &str) -> StoreResult<bool>;

    /// Make a received message visible again immediately.
    async fn release(&self, url: &str, receipt: &str) -> StoreResult<bool>;
}
