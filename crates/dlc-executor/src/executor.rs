//! Executor: run one dispatched ticket and report how it went.
//!
//! # Reporting order
//!
//! ```text
//!   run test ──► logs/{t}/bundle ──► response queue ──► pool entry terminal
//!                     (1)                (2)                  (3)
//! ```
//!
//! The bundle is always written before anything points at it. If (1) or
//! (2) fails for good, the pool entry is still closed as `runtimeError` with
//! whatever pointer is available and the executor exits non-zero.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dlc_core::{BundlePointer, FinalStatus, JobType, LogBundle, PoolStatus, RequestTicket, ResponseMessage};
use dlc_store::{MessageQueue, RetryPolicy, StoreError, TicketStore};
use tracing::{debug, error, info, warn};

use crate::error::{ExecutorError, ExecutorResult};
use crate::launch::LaunchSpec;
use crate::runner::{TestJob, TestRunner};

/// Attempts at closing a pool entry that keeps moving underneath us.
const CLOSE_ATTEMPTS: usize = 3;

/// How an executor run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The test ran and its outcome was published.
    Reported(FinalStatus),
    /// The entry was already terminal, either on arrival (duplicate
    /// dispatch) or by the time the run finished (expired by the scheduler).
    AlreadyTerminal(PoolStatus),
    /// The ticket was withdrawn; nothing ran.
    Withdrawn,
}

pub struct Executor {
    store: TicketStore,
    queues: Arc<dyn MessageQueue>,
    runner: Arc<dyn TestRunner>,
    work_root: PathBuf,
    retry: RetryPolicy,
}

impl Executor {
    pub fn new(
        store: TicketStore,
        queues: Arc<dyn MessageQueue>,
        runner: Arc<dyn TestRunner>,
        work_root: impl Into<PathBuf>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            queues,
            runner,
            work_root: work_root.into(),
            retry,
        }
    }

    pub async fn run(&self, launch: &LaunchSpec) -> ExecutorResult<ExecutionOutcome> {
        let name = launch.ticket_name()?.to_string();
        let Some(ticket) = self.load_ticket(&name).await? else {
            return self.close_withdrawn(launch, &name).await;
        };

        match self
            .store
            .current_pool_entry(&ticket.resource_class, ticket.job_type, &name)
            .await?
        {
            None => return Err(ExecutorError::NotAdmitted { ticket: name }),
            Some(record) if record.key.status.is_terminal() => {
                info!(ticket = %name, status = %record.key.status, "entry already terminal, not running again");
                return Ok(ExecutionOutcome::AlreadyTerminal(record.key.status));
            }
            Some(_) => {}
        }

        info!(
            ticket = %name,
            executor_id = %launch.executor_id,
            image = %ticket.image_ref,
            num_instances = ticket.num_instances,
            "starting test run"
        );
        let (status, bundle) = self.execute(&ticket).await;
        self.report(launch, &ticket, status, bundle).await
    }

    async fn load_ticket(&self, name: &str) -> ExecutorResult<Option<RequestTicket>> {
        match self.store.get_ticket(name).await {
            Ok(ticket) => Ok(ticket),
            Err(StoreError::Deserialize { reason, .. }) => Err(ExecutorError::InvalidTicket {
                ticket: name.to_string(),
                reason,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Run the test command; every way it can end becomes a status and a
    /// bundle.
    async fn execute(&self, ticket: &RequestTicket) -> (FinalStatus, LogBundle) {
        let job = TestJob {
            ticket_name: ticket.ticket_name.clone(),
            image_ref: ticket.image_ref.clone(),
            work_dir: self.work_root.join(&ticket.ticket_name),
        };
        match self.runner.run(&job).await {
            Ok(out) => {
                let status = if out.passed() {
                    FinalStatus::Completed
                } else {
                    FinalStatus::RuntimeError
                };
                info!(
                    ticket = %ticket.ticket_name,
                    exit_code = ?out.exit_code,
                    has_report = !out.xml_report.trim().is_empty(),
                    status = %PoolStatus::from(status),
                    "test command finished"
                );
                (status, LogBundle::new(out.xml_report, out.log_stream))
            }
            Err(ExecutorError::CommandTimeout { after, mut log, .. }) => {
                log.push_str(&format!(
                    "test command killed after {}\n",
                    humantime::format_duration(after)
                ));
                (FinalStatus::RuntimeError, LogBundle::new("", log))
            }
            Err(e) => {
                error!(ticket = %ticket.ticket_name, error = %e, "could not run test command");
                (
                    FinalStatus::RuntimeError,
                    LogBundle::new("", format!("executor could not run the test command: {e}\n")),
                )
            }
        }
    }

    async fn report(
        &self,
        launch: &LaunchSpec,
        ticket: &RequestTicket,
        status: FinalStatus,
        bundle: LogBundle,
    ) -> ExecutorResult<ExecutionOutcome> {
        let name = ticket.ticket_name.as_str();

        let pointer = match self.store.put_bundle(name, &bundle).await {
            Ok(pointer) => pointer,
            Err(e) => {
                error!(ticket = %name, error = %e, "log bundle upload failed");
                let empty = BundlePointer::empty(self.store.bucket());
                return self.fail(ticket, bundle, empty, e.into()).await;
            }
        };

        // The scheduler may have given up on us while the test ran.
        if let Some(record) = self
            .store
            .current_pool_entry(&ticket.resource_class, ticket.job_type, name)
            .await?
            && record.key.status.is_terminal()
        {
            warn!(ticket = %name, status = %record.key.status, "entry closed while running, not reporting");
            return Ok(ExecutionOutcome::AlreadyTerminal(record.key.status));
        }

        let url = if launch.response_queue_url.is_empty() {
            ticket.response_queue_url.as_str()
        } else {
            launch.response_queue_url.as_str()
        };
        let message = ResponseMessage {
            ticket_name: name.to_string(),
            bundle_pointer: pointer.clone(),
            status,
        };
        if let Err(e) = self.publish(url, &message).await {
            error!(ticket = %name, queue = %url, error = %e, "response publish failed");
            return self.fail(ticket, bundle, pointer, e).await;
        }

        if let Some(existing) = self.close_entry(ticket, status, bundle, pointer).await? {
            warn!(ticket = %name, status = %existing, "entry closed by someone else after publish");
        }
        info!(ticket = %name, status = %PoolStatus::from(status), "test run reported");
        Ok(ExecutionOutcome::Reported(status))
    }

    async fn publish(&self, url: &str, message: &ResponseMessage) -> ExecutorResult<()> {
        let body = serde_json::to_string(message).map_err(|e| ExecutorError::Publish {
            ticket: message.ticket_name.clone(),
            reason: e.to_string(),
        })?;
        let queues = self.queues.as_ref();
        self.retry
            .run("send", || queues.send(url, body.clone()))
            .await
            .map_err(|e| ExecutorError::Publish {
                ticket: message.ticket_name.clone(),
                reason: e.to_string(),
            })?;
        debug!(ticket = %message.ticket_name, queue = %url, "response published");
        Ok(())
    }

    /// Close the entry as `runtimeError` after a reporting failure, then
    /// surface the original error.
    async fn fail(
        &self,
        ticket: &RequestTicket,
        bundle: LogBundle,
        pointer: BundlePointer,
        cause: ExecutorError,
    ) -> ExecutorResult<ExecutionOutcome> {
        if let Err(e) = self
            .close_entry(ticket, FinalStatus::RuntimeError, bundle, pointer)
            .await
        {
            error!(ticket = %ticket.ticket_name, error = %e, "could not close pool entry; scheduler deadline will");
        }
        Err(cause)
    }

    /// Replace the ticket's in-flight entry with a terminal one. Returns the
    /// existing status if the entry was already terminal.
    async fn close_entry(
        &self,
        ticket: &RequestTicket,
        status: FinalStatus,
        bundle: LogBundle,
        pointer: BundlePointer,
    ) -> ExecutorResult<Option<PoolStatus>> {
        let name = ticket.ticket_name.as_str();
        for _ in 0..CLOSE_ATTEMPTS {
            let Some(record) = self
                .store
                .current_pool_entry(&ticket.resource_class, ticket.job_type, name)
                .await?
            else {
                return Err(ExecutorError::NotAdmitted {
                    ticket: name.to_string(),
                });
            };
            if record.key.status.is_terminal() {
                return Ok(Some(record.key.status));
            }
            let Some((entry, _)) = self.store.get_pool_entry(&record.key).await? else {
                debug!(key = %record.key, "entry moved on since listing");
                continue;
            };
            let terminal = entry.terminal(status, bundle.clone(), pointer.clone(), Utc::now());
            match self.store.replace_pool_entry(&record.key, &terminal).await {
                Ok(_) => return Ok(None),
                Err(StoreError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ExecutorError::EntryContended {
            ticket: name.to_string(),
        })
    }

    /// The ticket is gone. Close any in-flight entry so its instances are
    /// released without waiting for the executor deadline.
    async fn close_withdrawn(&self, launch: &LaunchSpec, name: &str) -> ExecutorResult<ExecutionOutcome> {
        for job_type in [JobType::Training, JobType::Inference] {
            let Some(record) = self
                .store
                .current_pool_entry(&launch.resource_class, job_type, name)
                .await?
            else {
                continue;
            };
            if record.key.status.is_terminal() {
                return Ok(ExecutionOutcome::AlreadyTerminal(record.key.status));
            }
            if let Some((entry, _)) = self.store.get_pool_entry(&record.key).await? {
                let terminal = entry.terminal(
                    FinalStatus::RuntimeError,
                    LogBundle::new("", "ticket withdrawn before the test started"),
                    BundlePointer::empty(self.store.bucket()),
                    Utc::now(),
                );
                self.store.replace_pool_entry(&record.key, &terminal).await?;
            }
        }
        info!(ticket = %name, "ticket withdrawn, nothing to run");
        Ok(ExecutionOutcome::Withdrawn)
    }
}
