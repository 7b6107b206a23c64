//! Dispatch sinks: how the scheduler hands tickets to the provisioner.
//!
//! The scheduler never launches compute itself. It emits one
//! [`DispatchEvent`] per admitted ticket into a sink and moves the ticket to
//! `running` once the sink has accepted the event.

use std::sync::Arc;

use async_trait::async_trait;
use dlc_core::DispatchEvent;
use dlc_store::{MessageQueue, RetryPolicy};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};

#[async_trait]
pub trait DispatchSink: Send + Sync {
    /// Hand one event to the provisioner. An error leaves the ticket in
    /// `preparing` so it is dispatched again on a later tick.
    async fn dispatch(&self, event: &DispatchEvent) -> SchedulerResult<()>;
}

/// In-process sink backed by a bounded `tokio::mpsc` channel.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<DispatchEvent>,
}

impl ChannelDispatcher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DispatchEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl DispatchSink for ChannelDispatcher {
    async fn dispatch(&self, event: &DispatchEvent) -> SchedulerResult<()> {
        // A full channel means the provisioner is behind; try again next tick.
        self.tx
            .try_send(event.clone())
            .map_err(|e| SchedulerError::DispatchRejected {
                ticket: event.ticket_name.clone(),
                reason: e.to_string(),
            })?;
        debug!(ticket = %event.ticket_name, "dispatch event queued in-process");
        Ok(())
    }
}

/// Sink that serialises events onto the `dispatch_channel` queue.
#[derive(Clone)]
pub struct QueueDispatcher {
    queues: Arc<dyn MessageQueue>,
    url: String,
    retry: RetryPolicy,
}

impl QueueDispatcher {
    /// Create (if needed) the dispatch queue named `channel`.
    pub async fn open(
        queues: Arc<dyn MessageQueue>,
        channel: &str,
        retry: RetryPolicy,
    ) -> SchedulerResult<Self> {
        let url = queues.create_queue(channel).await?;
        Ok(Self { queues, url, retry })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DispatchSink for QueueDispatcher {
    async fn dispatch(&self, event: &DispatchEvent) -> SchedulerResult<()> {
        let body = serde_json::to_string(event).map_err(|e| SchedulerError::DispatchRejected {
            ticket: event.ticket_name.clone(),
            reason: e.to_string(),
        })?;
        let queues = self.queues.as_ref();
        let url = self.url.as_str();
        self.retry
            .run("dispatch", || queues.send(url, body.clone()))
            .await?;
        debug!(ticket = %event.ticket_name, queue = %self.url, "dispatch event sent");
        Ok(())
    }
}
