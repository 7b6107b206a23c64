//! JobRequester: the library a CI build embeds to run tests on the pool.
//!
//! # Architecture
//!
//! ```text
//!   send_request ──► tickets/{t}                      (ticket store)
//!                       │
//!                 scheduler + executor
//!                       │
//!   receive_logs ◄── response queue ◄── ResponseMessage
//!        │
//!        └─► logs/{t}/bundle
//! ```
//!
//! One response queue is shared by every ticket this requester files.
//! Concurrent `receive_logs` calls poll the same queue: a message for a
//! ticket another call is waiting on is parked in a shared mailbox, a
//! message for a ticket this process does not know is released back to the
//! queue for whoever does.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use dlc_core::keys;
use dlc_core::ticket_name::generate_ticket_name;
use dlc_core::{
    BuildContext, DlcConfig, FailureReason, FinalStatus, ImageRef, JobType, LogBundle, PoolStatus,
    RequestTicket, ResourceClassTable, ResponseMessage,
};
use dlc_store::{MessageQueue, PoolView, RetryPolicy, TicketStore};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::env::BuildEnv;
use crate::error::{RequesterError, RequesterResult};

/// Pause after handing a foreign message back, so the same message is not
/// received again in a tight loop.
const RELEASE_BACKOFF: Duration = Duration::from_millis(50);
const RECEIVE_BATCH: usize = 10;

/// Everything needed to follow up on a request. Serializable, so a
/// restarted build can pick up where it left off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketHandle {
    pub ticket_name: String,
    pub resource_class: String,
    pub job_type: JobType,
    pub response_queue_url: String,
}

/// Where a ticket currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketStatus {
    /// Waiting for admission; `position` tickets are ahead in its bucket.
    Queuing { position: usize },
    Preparing,
    Running,
    Completed,
    RuntimeError,
    /// Set aside by the scheduler and never going to run.
    Failed { reason: FailureReason },
    Unknown,
}

impl From<PoolStatus> for TicketStatus {
    fn from(status: PoolStatus) -> Self {
        match status {
            PoolStatus::Preparing => TicketStatus::Preparing,
            PoolStatus::Running => TicketStatus::Running,
            PoolStatus::Completed => TicketStatus::Completed,
            PoolStatus::RuntimeError => TicketStatus::RuntimeError,
        }
    }
}

struct Parked {
    message: ResponseMessage,
    receipt: String,
}

#[derive(Default)]
struct Mailbox {
    /// Tickets filed or awaited by this process.
    outstanding: HashSet<String>,
    /// Responses picked up by one waiter on behalf of another.
    parked: HashMap<String, Parked>,
    /// Tickets whose response was already consumed; redeliveries are dropped.
    finished: HashSet<String>,
}

pub struct JobRequester {
    store: TicketStore,
    queues: Arc<dyn MessageQueue>,
    config: DlcConfig,
    table: ResourceClassTable,
    env: BuildEnv,
    retry: RetryPolicy,
    queue_url: String,
    timeout_limit: Duration,
    mailbox: Mutex<Mailbox>,
}

impl JobRequester {
    /// Create the requester and its response queue.
    pub async fn new(
        store: TicketStore,
        queues: Arc<dyn MessageQueue>,
        config: DlcConfig,
        env: BuildEnv,
    ) -> RequesterResult<Self> {
        let retry = RetryPolicy::from(&config.retry);
        let queue_name = config.response_queue_name(&env.requester_id());
        let queue_url = {
            let queues = queues.as_ref();
            let name = queue_name.as_str();
            retry
                .run("create_queue", || queues.create_queue(name))
                .await?
        };
        info!(queue = %queue_url, bucket = %store.bucket(), "requester ready");
        Ok(Self {
            table: config.resource_table(),
            timeout_limit: config.requester.max_timeout,
            store,
            queues,
            config,
            env,
            retry,
            queue_url,
            mailbox: Mutex::new(Mailbox::default()),
        })
    }

    /// How long a ticket may wait for admission. Capped at
    /// `requester.max_timeout`.
    pub fn with_timeout_limit(mut self, limit: Duration) -> Self {
        self.timeout_limit = limit.min(self.config.requester.max_timeout);
        self
    }

    pub fn response_queue_url(&self) -> &str {
        &self.queue_url
    }

    pub fn env(&self) -> &BuildEnv {
        &self.env
    }

    fn mailbox(&self) -> MutexGuard<'_, Mailbox> {
        self.mailbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Submit ─────────────────────────────────────────────────────

    /// File a request ticket for one test run.
    pub async fn send_request(
        &self,
        image_ref: &str,
        context: BuildContext,
        num_instances: u32,
    ) -> RequesterResult<TicketHandle> {
        if num_instances == 0 {
            return Err(RequesterError::InvalidRequest(
                "num_instances must be at least 1".to_string(),
            ));
        }
        let image = ImageRef::parse(image_ref)?;
        let placement = self.table.classify(&image)?;

        let now = Utc::now();
        let ticket = RequestTicket {
            response_queue_url: self.queue_url.clone(),
            bucket: self.store.bucket().to_string(),
            ticket_name: generate_ticket_name(&self.env.ticket_prefix(), now),
            image_ref: image.to_string(),
            context,
            resource_class: placement.resource_class,
            job_type: placement.job_type,
            num_instances,
            created_at: now,
            timeout_limit: Some(self.timeout_limit.as_secs()),
            commit: self.env.commit.clone(),
        };
        self.store.put_ticket(&ticket).await?;
        self.mailbox().outstanding.insert(ticket.ticket_name.clone());

        info!(
            ticket = %ticket.ticket_name,
            resource_class = %ticket.resource_class,
            job_type = %ticket.job_type,
            num_instances,
            "request ticket filed"
        );
        Ok(TicketHandle {
            ticket_name: ticket.ticket_name,
            resource_class: ticket.resource_class,
            job_type: ticket.job_type,
            response_queue_url: self.queue_url.clone(),
        })
    }

    // ── Receive ────────────────────────────────────────────────────

    /// Wait up to `timeout` for the ticket's response and fetch its bundle.
    ///
    /// On `Timeout` nothing has been consumed and the call may be repeated.
    pub async fn receive_logs(
        &self,
        handle: &TicketHandle,
        timeout: Duration,
    ) -> RequesterResult<LogBundle> {
        let ticket = handle.ticket_name.as_str();
        self.mailbox().outstanding.insert(ticket.to_string());
        let deadline = Instant::now() + timeout;

        let (message, receipt) = loop {
            let parked = self.mailbox().parked.remove(ticket);
            if let Some(parked) = parked {
                break (parked.message, parked.receipt);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RequesterError::Timeout {
                    ticket: ticket.to_string(),
                    waited: timeout,
                });
            }
            let wait = remaining.min(self.config.requester.poll_wait);
            if let Some(found) = self.poll_once(&handle.response_queue_url, ticket, wait).await? {
                break found;
            }
        };

        self.ack(&handle.response_queue_url, ticket, &receipt).await;
        {
            let mut mailbox = self.mailbox();
            mailbox.outstanding.remove(ticket);
            mailbox.finished.insert(ticket.to_string());
        }

        let bundle = self
            .store
            .get_bundle(&message.bundle_pointer)
            .await?
            .ok_or_else(|| RequesterError::BundleMissing {
                ticket: ticket.to_string(),
                key: message.bundle_pointer.key.clone(),
            })?;

        match message.status {
            FinalStatus::Completed => {
                info!(ticket, "test run completed");
                Ok(bundle)
            }
            FinalStatus::RuntimeError => {
                warn!(ticket, "test run ended in runtimeError");
                Err(RequesterError::TestRuntime {
                    ticket: ticket.to_string(),
                    bundle,
                })
            }
        }
    }

    /// One receive round. Returns the response for `ticket` if it arrived;
    /// everything else is parked, dropped or released.
    async fn poll_once(
        &self,
        url: &str,
        ticket: &str,
        wait: Duration,
    ) -> RequesterResult<Option<(ResponseMessage, String)>> {
        let visibility = self.config.requester.visibility_timeout;
        let received = {
            let queues = self.queues.as_ref();
            self.retry
                .run("receive", || queues.receive(url, RECEIVE_BATCH, wait, visibility))
                .await?
        };

        let mut mine = None;
        let mut released = false;
        for msg in received {
            let message: ResponseMessage = match serde_json::from_str(&msg.body) {
                Ok(m) => m,
                Err(e) => {
                    warn!(queue = %url, error = %e, "dropping undecodable response message");
                    self.ack(url, "<undecodable>", &msg.receipt).await;
                    continue;
                }
            };
            let name = message.ticket_name.clone();

            if name == ticket && mine.is_none() {
                mine = Some((message, msg.receipt));
                continue;
            }

            enum Route {
                Duplicate,
                Park,
                Release,
            }
            let route = {
                let mut mailbox = self.mailbox();
                if name == ticket || mailbox.finished.contains(&name) {
                    Route::Duplicate
                } else if mailbox.outstanding.contains(&name) {
                    // A redelivery replaces the parked copy; only the newest
                    // receipt can delete the message.
                    mailbox.parked.insert(
                        name.clone(),
                        Parked {
                            message,
                            receipt: msg.receipt.clone(),
                        },
                    );
                    Route::Park
                } else {
                    Route::Release
                }
            };
            match route {
                Route::Duplicate => {
                    debug!(ticket = %name, "dropping duplicate response");
                    self.ack(url, &name, &msg.receipt).await;
                }
                Route::Park => debug!(ticket = %name, "parked response for another waiter"),
                Route::Release => {
                    debug!(ticket = %name, "releasing response for unknown ticket");
                    if let Err(e) = self.queues.release(url, &msg.receipt).await {
                        warn!(ticket = %name, error = %e, "release failed; message reappears after its visibility timeout");
                    }
                    released = true;
                }
            }
        }

        if mine.is_none() && released {
            tokio::time::sleep(RELEASE_BACKOFF).await;
        }
        Ok(mine)
    }

    /// Delete a received message. A stale receipt means the message was
    /// redelivered meanwhile; that copy is dropped when it shows up.
    async fn ack(&self, url: &str, ticket: &str, receipt: &str) {
        let queues = self.queues.as_ref();
        match self
            .retry
            .run("delete_message", || queues.delete_message(url, receipt))
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(ticket, "not the latest receipt; response was redelivered"),
            Err(e) => warn!(ticket, error = %e, "failed to delete response message"),
        }
    }

    // ── Status and cleanup ─────────────────────────────────────────

    /// Current state of a ticket, from one pool listing and one ticket
    /// listing.
    pub async fn query_status(&self, handle: &TicketHandle) -> RequesterResult<TicketStatus> {
        let ticket = handle.ticket_name.as_str();
        let view = self.store.pool_view().await?;
        if let Some(record) = view.current(ticket) {
            return Ok(record.key.status.into());
        }

        let names = self.store.list_ticket_names().await?;
        if names.iter().any(|n| n == ticket) {
            let bucket = keys::bucket_id(&handle.resource_class, handle.job_type);
            let mut waiting = Vec::new();
            for name in names.iter().filter(|n| !view.contains(n)) {
                if let Some(t) = self.store.get_ticket(name).await?
                    && t.bucket_id() == bucket
                {
                    waiting.push((t.created_at, t.ticket_name));
                }
            }
            waiting.sort();
            if let Some(position) = waiting.iter().position(|(_, n)| n == ticket) {
                return Ok(TicketStatus::Queuing { position });
            }
            // Admitted between the two listings.
            if let Some(record) = self
                .store
                .current_pool_entry(&handle.resource_class, handle.job_type, ticket)
                .await?
            {
                return Ok(record.key.status.into());
            }
        }

        match self.store.find_failure(ticket).await? {
            Some(reason) => Ok(TicketStatus::Failed { reason }),
            None => Ok(TicketStatus::Unknown),
        }
    }

    /// Withdraw a ticket that has not been admitted yet. Returns `false`
    /// once the ticket has a pool entry (or no longer exists).
    pub async fn cancel_request(&self, handle: &TicketHandle) -> RequesterResult<bool> {
        let ticket = handle.ticket_name.as_str();
        if let Some(record) = self
            .store
            .current_pool_entry(&handle.resource_class, handle.job_type, ticket)
            .await?
        {
            info!(ticket, status = %record.key.status, "ticket already admitted; not cancelled");
            return Ok(false);
        }
        let removed = self.store.delete_ticket(ticket).await?;
        if removed {
            self.mailbox().outstanding.remove(ticket);
            info!(ticket, "request cancelled");
        } else {
            info!(ticket, "ticket no longer queued; nothing to cancel");
        }
        Ok(removed)
    }

    /// Delete the ticket and everything the run left behind. Entries still
    /// in flight are left to the scheduler, which withdraws or expires them
    /// once it sees the ticket is gone. Safe to call repeatedly.
    pub async fn dispose(&self, handle: &TicketHandle) -> RequesterResult<()> {
        let ticket = handle.ticket_name.as_str();
        self.store.delete_ticket(ticket).await?;

        let view = PoolView::build(
            self.store
                .ticket_pool_entries(&handle.resource_class, handle.job_type, ticket)
                .await?,
        );
        let in_flight = view
            .current(ticket)
            .is_some_and(|record| record.key.status.is_in_flight());
        if in_flight {
            warn!(ticket, "disposed while still in flight; scheduler will clean up");
        } else {
            // Superseded leftovers go too once the ticket is terminal.
            for record in view.entries().chain(view.superseded()) {
                self.store.delete_pool_entry(&record.key).await?;
            }
            self.store.release_claim(ticket).await?;
            self.store.delete_bundle(ticket).await?;
        }

        let mut mailbox = self.mailbox();
        mailbox.outstanding.remove(ticket);
        mailbox.parked.remove(ticket);
        debug!(ticket, "ticket disposed");
        Ok(())
    }

    /// Delete the response queue. Outstanding handles can no longer receive.
    pub async fn shutdown(self) -> RequesterResult<()> {
        let queues = self.queues.as_ref();
        let url = self.queue_url.as_str();
        self.retry
            .run("delete_queue", || queues.delete_queue(url))
            .await?;
        info!(queue = %self.queue_url, "requester shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use dlc_core::{BundlePointer, PoolEntry, PoolKey};
    use dlc_store::{MemoryObjectStore, MemoryQueue};

    use super::*;

    const GPU_TRAINING: &str =
        "123.dkr.ecr.us-west-2.amazonaws.com/pytorch-training:1.13-gpu-py39";
    const CPU_INFERENCE: &str =
        "123.dkr.ecr.us-west-2.amazonaws.com/mxnet-inference:1.9-cpu-py38";

    struct Harness {
        objects: MemoryObjectStore,
        queues: MemoryQueue,
        store: TicketStore,
        config: DlcConfig,
    }

    impl Harness {
        fn new() -> Self {
            let objects = MemoryObjectStore::new();
            let queues = MemoryQueue::new();
            let mut config = DlcConfig::default().with_retry(1, Duration::ZERO);
            config.requester.poll_wait = Duration::from_millis(20);
            let store = TicketStore::new(
                Arc::new(objects.clone()),
                config.ticket_bucket.clone(),
                RetryPolicy::none(),
            );
            Self {
                objects,
                queues,
                store,
                config,
            }
        }

        async fn requester(&self) -> JobRequester {
            JobRequester::new(
                self.store.clone(),
                Arc::new(self.queues.clone()),
                self.config.clone(),
                BuildEnv::default(),
            )
            .await
            .unwrap()
        }

        /// Act as scheduler and executor: admit, run and report a ticket.
        async fn finish(&self, handle: &TicketHandle, status: FinalStatus, report: &str) {
            let ticket = self.store.get_ticket(&handle.ticket_name).await.unwrap().unwrap();
            let now = Utc::now();
            let preparing = PoolEntry::preparing(&ticket, now);
            let key = PoolKey {
                resource_class: ticket.resource_class.clone(),
                job_type: ticket.job_type,
                ticket_name: ticket.ticket_name.clone(),
                num_instances: ticket.num_instances,
                status: PoolStatus::Preparing,
            };
            self.store.create_pool_entry(&key, &preparing).await.unwrap();
            self.store.claim(&ticket.ticket_name, "test").await.unwrap();
            let bundle = LogBundle::new(report, "log line\n");
            let pointer = self
                .store
                .put_bundle(&ticket.ticket_name, &bundle)
                .await
                .unwrap();
            let terminal = preparing.terminal(status, bundle, pointer.clone(), now);
            self.store.replace_pool_entry(&key, &terminal).await.unwrap();
            self.respond(handle, status, pointer).await;
        }

        async fn respond(&self, handle: &TicketHandle, status: FinalStatus, pointer: BundlePointer) {
            let msg = ResponseMessage {
                ticket_name: handle.ticket_name.clone(),
                bundle_pointer: pointer,
                status,
            };
            self.queues
                .send(&handle.response_queue_url, serde_json::to_string(&msg).unwrap())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn send_request_writes_classified_ticket() {
        let h = Harness::new();
        let requester = h.requester().await.with_timeout_limit(Duration::from_secs(600));
        let handle = requester
            .send_request(GPU_TRAINING, BuildContext::Pr, 2)
            .await
            .unwrap();

        assert_eq!(handle.resource_class, "ml.p2.8xlarge");
        assert_eq!(handle.job_type, JobType::Training);
        assert_eq!(handle.response_queue_url, requester.response_queue_url());

        let ticket = h.store.get_ticket(&handle.ticket_name).await.unwrap().unwrap();
        assert_eq!(ticket.num_instances, 2);
        assert_eq!(ticket.timeout_limit, Some(600));
        assert_eq!(ticket.response_queue_url, handle.response_queue_url);
        assert!(ticket.ticket_name.starts_with("default-"));
    }

    #[tokio::test]
    async fn timeout_limit_is_capped() {
        let h = Harness::new();
        let requester = h
            .requester()
            .await
            .with_timeout_limit(Duration::from_secs(10 * 24 * 3600));
        let handle = requester
            .send_request(CPU_INFERENCE, BuildContext::Mainline, 1)
            .await
            .unwrap();
        let ticket = h.store.get_ticket(&handle.ticket_name).await.unwrap().unwrap();
        assert_eq!(ticket.timeout_limit, Some(4 * 3600));
    }

    #[tokio::test]
    async fn rejects_bad_input() {
        let h = Harness::new();
        let requester = h.requester().await;
        assert!(matches!(
            requester.send_request(GPU_TRAINING, BuildContext::Pr, 0).await,
            Err(RequesterError::InvalidRequest(_))
        ));
        assert!(matches!(
            requester.send_request("not-an-image", BuildContext::Pr, 1).await,
            Err(RequesterError::InvalidImage(_))
        ));
        assert!(h.store.list_tickets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn backend_outage_surfaces_as_unavailable() {
        let h = Harness::new();
        let requester = h.requester().await;
        h.objects.set_offline(true);
        assert!(matches!(
            requester.send_request(GPU_TRAINING, BuildContext::Pr, 1).await,
            Err(RequesterError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn receive_logs_returns_completed_bundle() {
        let h = Harness::new();
        let requester = h.requester().await;
        let handle = requester
            .send_request(GPU_TRAINING, BuildContext::Pr, 1)
            .await
            .unwrap();
        h.finish(&handle, FinalStatus::Completed, "<testsuite/>").await;

        let bundle = requester
            .receive_logs(&handle, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(bundle.xml_report, "<testsuite/>");
        assert_eq!(h.queues.depth(&handle.response_queue_url), 0);
        assert_eq!(
            requester.query_status(&handle).await.unwrap(),
            TicketStatus::Completed
        );
    }

    #[tokio::test]
    async fn runtime_error_carries_bundle() {
        let h = Harness::new();
        let requester = h.requester().await;
        let handle = requester
            .send_request(GPU_TRAINING, BuildContext::Pr, 1)
            .await
            .unwrap();
        h.finish(&handle, FinalStatus::RuntimeError, "").await;

        match requester.receive_logs(&handle, Duration::from_secs(2)).await {
            Err(RequesterError::TestRuntime { ticket, bundle }) => {
                assert_eq!(ticket, handle.ticket_name);
                assert_eq!(bundle.log_stream, "log line\n");
            }
            other => panic!("expected TestRuntime, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn times_out_without_consuming() {
        let h = Harness::new();
        let requester = h.requester().await;
        let handle = requester
            .send_request(GPU_TRAINING, BuildContext::Pr, 1)
            .await
            .unwrap();

        let err = requester
            .receive_logs(&handle, Duration::from_millis(60))
            .await
            .unwrap_err();
        assert!(matches!(err, RequesterError::Timeout { .. }));

        // The handle is still good.
        h.finish(&handle, FinalStatus::Completed, "<ok/>").await;
        let bundle = requester
            .receive_logs(&handle, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(bundle.xml_report, "<ok/>");
    }

    #[tokio::test]
    async fn concurrent_waiters_each_get_their_own_response() {
        let h = Harness::new();
        let requester = Arc::new(h.requester().await);
        let mut handles = Vec::new();
        for _ in 0..4 {
            handles.push(
                requester
                    .send_request(GPU_TRAINING, BuildContext::Pr, 1)
                    .await
                    .unwrap(),
            );
        }
        // Responses arrive in reverse order of the waiters.
        for (i, handle) in handles.iter().enumerate().rev() {
            h.finish(handle, FinalStatus::Completed, &format!("<r{i}/>")).await;
        }

        let mut tasks = Vec::new();
        for (i, handle) in handles.iter().cloned().enumerate() {
            let requester = requester.clone();
            tasks.push(tokio::spawn(async move {
                let bundle = requester
                    .receive_logs(&handle, Duration::from_secs(5))
                    .await
                    .unwrap();
                assert_eq!(bundle.xml_report, format!("<r{i}/>"));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(h.queues.depth(requester.response_queue_url()), 0);
    }

    #[tokio::test]
    async fn foreign_responses_are_left_for_their_owner() {
        let h = Harness::new();
        let requester = h.requester().await;
        let mine = requester
            .send_request(GPU_TRAINING, BuildContext::Pr, 1)
            .await
            .unwrap();
        let stranger = TicketHandle {
            ticket_name: "other-ticket".to_string(),
            ..mine.clone()
        };
        h.respond(&stranger, FinalStatus::Completed, BundlePointer::empty("b"))
            .await;

        assert!(matches!(
            requester.receive_logs(&mine, Duration::from_millis(80)).await,
            Err(RequesterError::Timeout { .. })
        ));
        assert_eq!(h.queues.depth(&mine.response_queue_url), 1);
    }

    #[tokio::test]
    async fn duplicate_response_is_dropped() {
        let h = Harness::new();
        let requester = h.requester().await;
        let handle = requester
            .send_request(GPU_TRAINING, BuildContext::Pr, 1)
            .await
            .unwrap();
        h.finish(&handle, FinalStatus::Completed, "<ok/>").await;
        requester
            .receive_logs(&handle, Duration::from_secs(2))
            .await
            .unwrap();

        // A second notification for the same ticket (scheduler expiry racing
        // the executor) is discarded by the next poll.
        h.respond(&handle, FinalStatus::RuntimeError, BundlePointer::empty("b"))
            .await;
        let other = requester
            .send_request(GPU_TRAINING, BuildContext::Pr, 1)
            .await
            .unwrap();
        let _ = requester
            .receive_logs(&other, Duration::from_millis(60))
            .await;
        assert_eq!(h.queues.depth(&handle.response_queue_url), 0);
    }

    #[tokio::test]
    async fn query_status_reports_queue_position() {
        let h = Harness::new();
        let requester = h.requester().await;
        let first = requester
            .send_request(GPU_TRAINING, BuildContext::Pr, 1)
            .await
            .unwrap();
        let other_bucket = requester
            .send_request(CPU_INFERENCE, BuildContext::Pr, 1)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = requester
            .send_request(GPU_TRAINING, BuildContext::Pr, 1)
            .await
            .unwrap();

        assert_eq!(
            requester.query_status(&first).await.unwrap(),
            TicketStatus::Queuing { position: 0 }
        );
        assert_eq!(
            requester.query_status(&second).await.unwrap(),
            TicketStatus::Queuing { position: 1 }
        );
        assert_eq!(
            requester.query_status(&other_bucket).await.unwrap(),
            TicketStatus::Queuing { position: 0 }
        );
    }

    #[tokio::test]
    async fn query_status_reports_failures_and_unknown() {
        let h = Harness::new();
        let requester = h.requester().await;
        let handle = requester
            .send_request(GPU_TRAINING, BuildContext::Pr, 1)
            .await
            .unwrap();
        let raw = h.store.get_ticket_raw(&handle.ticket_name).await.unwrap().unwrap();
        h.store
            .dead_letter(&handle.ticket_name, raw.data, FailureReason::Timeout)
            .await
            .unwrap();
        assert_eq!(
            requester.query_status(&handle).await.unwrap(),
            TicketStatus::Failed {
                reason: FailureReason::Timeout
            }
        );

        let ghost = TicketHandle {
            ticket_name: "never-filed".to_string(),
            ..handle
        };
        assert_eq!(
            requester.query_status(&ghost).await.unwrap(),
            TicketStatus::Unknown
        );
    }

    #[tokio::test]
    async fn cancel_only_while_queued() {
        let h = Harness::new();
        let requester = h.requester().await;
        let queued = requester
            .send_request(GPU_TRAINING, BuildContext::Pr, 1)
            .await
            .unwrap();
        assert!(requester.cancel_request(&queued).await.unwrap());
        assert!(!requester.cancel_request(&queued).await.unwrap());
        assert!(h.store.get_ticket(&queued.ticket_name).await.unwrap().is_none());

        let admitted = requester
            .send_request(GPU_TRAINING, BuildContext::Pr, 1)
            .await
            .unwrap();
        h.finish(&admitted, FinalStatus::Completed, "<ok/>").await;
        assert!(!requester.cancel_request(&admitted).await.unwrap());
        assert!(h.store.get_ticket(&admitted.ticket_name).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dispose_removes_everything_and_is_idempotent() {
        let h = Harness::new();
        let requester = h.requester().await;
        let handle = requester
            .send_request(GPU_TRAINING, BuildContext::Pr, 1)
            .await
            .unwrap();
        h.finish(&handle, FinalStatus::Completed, "<ok/>").await;
        requester
            .receive_logs(&handle, Duration::from_secs(2))
            .await
            .unwrap();

        requester.dispose(&handle).await.unwrap();
        requester.dispose(&handle).await.unwrap();

        assert!(h.store.list_tickets().await.unwrap().is_empty());
        assert!(h.store.pool_view().await.unwrap().is_empty());
        assert!(h.store.list_claims().await.unwrap().is_empty());
        assert!(h.objects.is_empty());
        assert_eq!(
            requester.query_status(&handle).await.unwrap(),
            TicketStatus::Unknown
        );
    }

    #[tokio::test]
    async fn dispose_leaves_in_flight_entries() {
        let h = Harness::new();
        let requester = h.requester().await;
        let handle = requester
            .send_request(GPU_TRAINING, BuildContext::Pr, 1)
            .await
            .unwrap();
        let ticket = h.store.get_ticket(&handle.ticket_name).await.unwrap().unwrap();
        let key = PoolKey {
            resource_class: ticket.resource_class.clone(),
            job_type: ticket.job_type,
            ticket_name: ticket.ticket_name.clone(),
            num_instances: 1,
            status: PoolStatus::Running,
        };
        h.store
            .create_pool_entry(&key, &PoolEntry::preparing(&ticket, Utc::now()))
            .await
            .unwrap();

        requester.dispose(&handle).await.unwrap();
        assert!(h.store.get_ticket(&handle.ticket_name).await.unwrap().is_none());
        assert_eq!(h.store.pool_view().await.unwrap().in_flight(&ticket.bucket_id()), 1);
    }

    #[tokio::test]
    async fn shutdown_deletes_queue() {
        let h = Harness::new();
        let requester = h.requester().await;
        let url = requester.response_queue_url().to_string();
        requester.shutdown().await.unwrap();
        assert!(h.queues.send(&url, "x".to_string()).await.is_err());
    }
}
