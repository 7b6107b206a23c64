//! Scheduler: the tick loop that owns the resource pool.
//!
//! Each tick, while holding the leader lease:
//!
//! ```text
//!   list tickets/ + pool/            (read only; a failure abandons the tick)
//!        │
//!        ├── classify   malformed / no cap / over cap → tickets-bad/
//!        │              waited past timeout_limit     → dead-letter/
//!        ├── admit      FIFO per bucket, claim + preparing entry
//!        ├── dispatch   preparing → event → running
//!        ├── expire     running past executor_deadline → runtimeError
//!        └── reap       old terminal entries without a ticket,
//!                       superseded entries, orphaned claims
//! ```
//!
//! Time is passed in explicitly (`tick_at`) so every age comparison is
//! deterministic under test.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dlc_core::keys::{self, FailureReason};
use dlc_core::{
    BundlePointer, DispatchEvent, DlcConfig, FinalStatus, LogBundle, PoolEntry, PoolKey,
    PoolStatus, RequestTicket, ResponseMessage,
};
use dlc_store::{MessageQueue, ObjectMeta, PoolRecord, PoolView, RetryPolicy, TicketStore};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatch::DispatchSink;
use crate::error::{SchedulerError, SchedulerResult};
use crate::lease::LeaderLease;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// False when another replica holds the lease; nothing else is set then.
    pub leader: bool,
    pub admitted: usize,
    pub dispatched: usize,
    pub expired: usize,
    pub withdrawn: usize,
    pub reaped: usize,
    pub quarantined: usize,
    pub dead_lettered: usize,
    pub superseded_removed: usize,
    pub claims_removed: usize,
    /// Admissible tickets left waiting for capacity.
    pub waiting: usize,
}

impl TickReport {
    fn changed_anything(&self) -> bool {
        self.admitted
            + self.dispatched
            + self.expired
            + self.withdrawn
            + self.reaped
            + self.quarantined
            + self.dead_lettered
            + self.superseded_removed
            + self.claims_removed
            > 0
    }

    pub fn log(&self) {
        if !self.leader {
            debug!("not the leader, tick skipped");
        } else if self.changed_anything() {
            info!(
                admitted = self.admitted,
                dispatched = self.dispatched,
                expired = self.expired,
                withdrawn = self.withdrawn,
                reaped = self.reaped,
                quarantined = self.quarantined,
                dead_lettered = self.dead_lettered,
                superseded_removed = self.superseded_removed,
                claims_removed = self.claims_removed,
                waiting = self.waiting,
                "tick complete"
            );
        } else {
            debug!(waiting = self.waiting, "tick complete, nothing to do");
        }
    }
}

/// Snapshot of the bucket taken at the start of a tick.
struct Snapshot {
    /// Ticket names present under `tickets/`, with listing metadata.
    tickets: BTreeMap<String, ObjectMeta>,
    view: PoolView,
}

/// The scheduler daemon core.
pub struct Scheduler {
    store: TicketStore,
    queues: Arc<dyn MessageQueue>,
    dispatcher: Arc<dyn DispatchSink>,
    config: DlcConfig,
    lease: LeaderLease,
    retry: RetryPolicy,
}

fn age(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or_default()
}

impl Scheduler {
    pub fn new(
        store: TicketStore,
        queues: Arc<dyn MessageQueue>,
        dispatcher: Arc<dyn DispatchSink>,
        config: DlcConfig,
    ) -> Self {
        let replica_id = format!("scheduler-{}", &Uuid::new_v4().simple().to_string()[..12]);
        Self::with_replica_id(store, queues, dispatcher, config, replica_id)
    }

    pub fn with_replica_id(
        store: TicketStore,
        queues: Arc<dyn MessageQueue>,
        dispatcher: Arc<dyn DispatchSink>,
        config: DlcConfig,
        replica_id: impl Into<String>,
    ) -> Self {
        let lease = LeaderLease::new(store.clone(), replica_id, config.scheduler.lease_ttl);
        let retry = RetryPolicy::from(&config.retry);
        Self {
            store,
            queues,
            dispatcher,
            config,
            lease,
            retry,
        }
    }

    pub fn replica_id(&self) -> &str {
        self.lease.holder()
    }

    pub fn config(&self) -> &DlcConfig {
        &self.config
    }

    /// Run one tick against the wall clock.
    pub async fn tick(&mut self) -> SchedulerResult<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick as of `now`, bounded by the per-tick deadline. Work
    /// left undone when the deadline fires is picked up by the next tick.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> SchedulerResult<TickReport> {
        let deadline = self.config.scheduler.tick_deadline;
        match tokio::time::timeout(deadline, self.tick_inner(now)).await {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::TickDeadline(deadline)),
        }
    }

    /// Run the tick loop until `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            replica = %self.replica_id(),
            tick_interval = ?self.config.tick_interval,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(report) => report.log(),
                        Err(e) => error!(error = %e, "tick abandoned"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }

        if let Err(e) = self.lease.release().await {
            warn!(error = %e, "failed to release scheduler lease");
        }
    }

    async fn tick_inner(&mut self, now: DateTime<Utc>) -> SchedulerResult<TickReport> {
        let mut report = TickReport::default();
        if !self.lease.acquire(now).await? {
            return Ok(report);
        }
        report.leader = true;

        let snapshot = self.snapshot().await?;
        let mut payloads: HashMap<String, RequestTicket> = HashMap::new();

        let pending = self
            .classify(&snapshot, now, &mut payloads, &mut report)
            .await?;
        let admitted = self
            .admit(&snapshot.view, pending, now, &mut report)
            .await?;
        self.dispatch(&snapshot, &admitted, &mut payloads, now, &mut report)
            .await?;
        self.expire(&snapshot, &mut payloads, now, &mut report).await?;
        self.reap(&snapshot, &admitted, now, &mut report).await?;

        Ok(report)
    }

    // ── Enumerate ──────────────────────────────────────────────────

    async fn snapshot(&self) -> SchedulerResult<Snapshot> {
        let listing = self.store.list_tickets().await?;
        let view = self.store.pool_view().await?;
        let tickets = listing
            .into_iter()
            .filter_map(|meta| {
                let name = keys::ticket_name_from_key(&meta.key).ok()?.to_string();
                Some((name, meta))
            })
            .collect();
        Ok(Snapshot { tickets, view })
    }

    /// Decode unaccounted tickets and set aside the ones that can never run.
    /// Returns admissible tickets grouped by bucket.
    async fn classify(
        &self,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
        payloads: &mut HashMap<String, RequestTicket>,
        report: &mut TickReport,
    ) -> SchedulerResult<BTreeMap<String, Vec<RequestTicket>>> {
        let mut pending: BTreeMap<String, Vec<RequestTicket>> = BTreeMap::new();

        for name in snapshot.tickets.keys() {
            let needs_payload = match snapshot.view.current(name) {
                None => true,
                Some(record) => record.key.status == PoolStatus::Preparing,
            };
            if !needs_payload {
                continue;
            }

            // Vanished between listing and fetch: withdrawn by its requester.
            let Some(raw) = self.store.get_ticket_raw(name).await? else {
                continue;
            };
            let ticket = match serde_json::from_slice::<RequestTicket>(&raw.data) {
                Ok(ticket) if ticket.ticket_name == *name && ticket.num_instances > 0 => ticket,
                Ok(_) => {
                    self.set_aside(name, raw.data, FailureReason::Malformed, report)
                        .await?;
                    continue;
                }
                Err(e) => {
                    debug!(ticket = %name, error = %e, "ticket payload does not parse");
                    self.set_aside(name, raw.data, FailureReason::Malformed, report)
                        .await?;
                    continue;
                }
            };

            if snapshot.view.contains(name) {
                payloads.insert(name.clone(), ticket);
                continue;
            }

            match self.config.cap_for(&ticket.resource_class) {
                None => {
                    self.set_aside(name, raw.data, FailureReason::UnknownResourceClass, report)
                        .await?;
                    continue;
                }
                Some(cap) if ticket.num_instances > cap => {
                    self.set_aside(name, raw.data, FailureReason::ExceedsCap, report)
                        .await?;
                    continue;
                }
                Some(_) => {}
            }

            if let Some(limit) = ticket.timeout_limit
                && age(now, ticket.created_at) > Duration::from_secs(limit)
            {
                self.store
                    .dead_letter(name, raw.data, FailureReason::Timeout)
                    .await?;
                report.dead_lettered += 1;
                continue;
            }

            pending.entry(ticket.bucket_id()).or_default().push(ticket);
        }

        Ok(pending)
    }

    async fn set_aside(
        &self,
        name: &str,
        raw: Vec<u8>,
        reason: FailureReason,
        report: &mut TickReport,
    ) -> SchedulerResult<()> {
        let err = SchedulerError::InvalidTicket {
            ticket: name.to_string(),
            reason,
        };
        warn!(error = %err, "quarantining ticket");
        self.store.quarantine(name, raw, reason).await?;
        report.quarantined += 1;
        Ok(())
    }

    // ── Admit ──────────────────────────────────────────────────────

    /// Strict FIFO per bucket: the first ticket that does not fit blocks
    /// the ones behind it, so a large ticket cannot be starved by small ones.
    async fn admit(
        &self,
        view: &PoolView,
        pending: BTreeMap<String, Vec<RequestTicket>>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> SchedulerResult<Vec<(PoolKey, PoolEntry, RequestTicket)>> {
        let mut in_flight = view.in_flight_by_bucket();
        let mut admitted = Vec::new();

        for (bucket, mut tickets) in pending {
            tickets.sort_by(|a, b| a.fifo_key().cmp(&b.fifo_key()));
            let used = in_flight.entry(bucket.clone()).or_insert(0);

            for (position, ticket) in tickets.iter().enumerate() {
                // Present for every ticket that survived classification.
                let cap = self.config.cap_for(&ticket.resource_class).unwrap_or(0);
                if *used + ticket.num_instances > cap {
                    report.waiting += tickets.len() - position;
                    debug!(
                        %bucket,
                        in_flight = *used,
                        cap,
                        head = %ticket.ticket_name,
                        "bucket saturated"
                    );
                    break;
                }

                match self.admit_one(ticket, now).await? {
                    Some((key, entry)) => {
                        *used += ticket.num_instances;
                        report.admitted += 1;
                        admitted.push((key, entry, ticket.clone()));
                    }
                    None => {
                        // Someone else's admission is not in our view yet;
                        // stop so this tick cannot overshoot the cap.
                        report.waiting += tickets.len() - position;
                        break;
                    }
                }
            }
        }

        Ok(admitted)
    }

    async fn admit_one(
        &self,
        ticket: &RequestTicket,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<(PoolKey, PoolEntry)>> {
        let name = &ticket.ticket_name;
        if !self.store.claim(name, self.replica_id()).await? {
            let race = SchedulerError::AdmissionRace {
                ticket: name.clone(),
            };
            warn!(error = %race, "ticket already claimed");
            return Ok(None);
        }

        let key = PoolKey {
            resource_class: ticket.resource_class.clone(),
            job_type: ticket.job_type,
            ticket_name: name.clone(),
            num_instances: ticket.num_instances,
            status: PoolStatus::Preparing,
        };
        let entry = PoolEntry::preparing(ticket, now);
        if !self.store.create_pool_entry(&key, &entry).await? {
            let race = SchedulerError::AdmissionRace {
                ticket: name.clone(),
            };
            warn!(error = %race, "pool entry already present");
            return Ok(None);
        }

        info!(
            ticket = %name,
            bucket = %ticket.bucket_id(),
            num_instances = ticket.num_instances,
            "ticket admitted"
        );
        Ok(Some((key, entry)))
    }

    // ── Dispatch ───────────────────────────────────────────────────

    async fn dispatch(
        &self,
        snapshot: &Snapshot,
        admitted: &[(PoolKey, PoolEntry, RequestTicket)],
        payloads: &mut HashMap<String, RequestTicket>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> SchedulerResult<()> {
        let mut work: Vec<(PoolKey, PoolEntry)> = Vec::new();

        for record in snapshot
            .view
            .entries()
            .filter(|r| r.key.status == PoolStatus::Preparing)
        {
            match self.store.get_pool_entry(&record.key).await? {
                Some((entry, _)) => work.push((record.key.clone(), entry)),
                None => debug!(key = %record.key, "preparing entry moved on since listing"),
            }
        }
        for (key, entry, ticket) in admitted {
            payloads.insert(ticket.ticket_name.clone(), ticket.clone());
            work.push((key.clone(), entry.clone()));
        }

        for (key, entry) in work {
            let Some(ticket) = payloads.get(&key.ticket_name) else {
                self.withdraw(&key, &entry, now).await?;
                report.withdrawn += 1;
                continue;
            };

            let event = DispatchEvent::for_ticket(ticket, Uuid::new_v4().to_string());
            if let Err(e) = self.dispatcher.dispatch(&event).await {
                warn!(ticket = %key.ticket_name, error = %e, "dispatch failed, will retry");
                continue;
            }

            let mut running = entry.advanced(PoolStatus::Running, now);
            running.executor_id = event.dispatch_id.clone();
            self.store.replace_pool_entry(&key, &running).await?;
            report.dispatched += 1;
            info!(
                ticket = %key.ticket_name,
                dispatch_id = %event.dispatch_id,
                "ticket dispatched"
            );
        }
        Ok(())
    }

    /// The ticket disappeared before dispatch; close the entry without
    /// launching anything.
    async fn withdraw(&self, key: &PoolKey, entry: &PoolEntry, now: DateTime<Utc>) -> SchedulerResult<()> {
        let bundle = LogBundle::new("", "ticket withdrawn before dispatch");
        let terminal = entry.terminal(
            FinalStatus::RuntimeError,
            bundle,
            BundlePointer::empty(self.store.bucket()),
            now,
        );
        self.store.replace_pool_entry(key, &terminal).await?;
        info!(ticket = %key.ticket_name, "ticket withdrawn before dispatch");
        Ok(())
    }

    // ── Expire ─────────────────────────────────────────────────────

    async fn expire(
        &self,
        snapshot: &Snapshot,
        payloads: &mut HashMap<String, RequestTicket>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> SchedulerResult<()> {
        let deadline = self.config.executor_deadline;
        let overdue: Vec<&PoolRecord> = snapshot
            .view
            .entries()
            .filter(|r| r.key.status == PoolStatus::Running)
            .filter(|r| age(now, r.meta.last_modified) > deadline)
            .collect();

        for record in overdue {
            let elapsed = age(now, record.meta.last_modified);
            let lost = SchedulerError::ExecutorLost {
                ticket: record.key.ticket_name.clone(),
                elapsed,
            };
            error!(error = %lost, "expiring running entry");
            self.expire_one(record, payloads, now).await?;
            report.expired += 1;
        }
        Ok(())
    }

    async fn expire_one(
        &self,
        record: &PoolRecord,
        payloads: &mut HashMap<String, RequestTicket>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let name = &record.key.ticket_name;
        let Some((entry, _)) = self.store.get_pool_entry(&record.key).await? else {
            debug!(key = %record.key, "running entry moved on since listing");
            return Ok(());
        };

        // Bundle first so a reader that sees the terminal entry can fetch it.
        // An executor that already uploaded its own bundle keeps it.
        let timed_out = LogBundle::new(
            "",
            format!(
                "executor timed out: no terminal status within {}",
                humantime::format_duration(self.config.executor_deadline)
            ),
        );
        let (pointer, bundle) = self.store.put_bundle_if_absent(name, &timed_out).await?;
        if bundle != timed_out {
            warn!(ticket = %name, "executor uploaded its bundle but never closed the entry");
        }
        let terminal = entry.terminal(FinalStatus::RuntimeError, bundle, pointer.clone(), now);
        self.store.replace_pool_entry(&record.key, &terminal).await?;

        let ticket = match payloads.get(name) {
            Some(ticket) => Some(ticket.clone()),
            None => match self.store.get_ticket(name).await {
                Ok(ticket) => ticket,
                Err(e) => {
                    warn!(ticket = %name, error = %e, "could not read ticket to notify requester of expiry");
                    None
                }
            },
        };
        let Some(ticket) = ticket else {
            debug!(ticket = %name, "no ticket left to notify");
            return Ok(());
        };

        let message = ResponseMessage {
            ticket_name: name.clone(),
            bundle_pointer: pointer,
            status: FinalStatus::RuntimeError,
        };
        match serde_json::to_string(&message) {
            Ok(body) => {
                let queues = self.queues.as_ref();
                let url = ticket.response_queue_url.as_str();
                if let Err(e) = self.retry.run("send", || queues.send(url, body.clone())).await {
                    warn!(ticket = %name, error = %e, "could not notify requester of expiry");
                }
            }
            Err(e) => warn!(ticket = %name, error = %e, "could not encode response message"),
        }
        payloads.remove(name);
        Ok(())
    }

    // ── Reap ───────────────────────────────────────────────────────

    async fn reap(
        &self,
        snapshot: &Snapshot,
        admitted: &[(PoolKey, PoolEntry, RequestTicket)],
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> SchedulerResult<()> {
        let retention = self.config.retention_window;
        let grace = self.config.scheduler.stale_entry_grace;

        for record in snapshot.view.entries().filter(|r| r.key.status.is_terminal()) {
            let name = &record.key.ticket_name;
            if snapshot.tickets.contains_key(name) || age(now, record.meta.last_modified) <= retention {
                continue;
            }
            self.store.delete_pool_entry(&record.key).await?;
            self.store.release_claim(name).await?;
            self.store.delete_bundle(name).await?;
            report.reaped += 1;
            info!(ticket = %name, status = %record.key.status, "terminal entry reaped");
        }

        for record in snapshot.view.superseded() {
            if age(now, record.meta.last_modified) > grace {
                self.store.delete_pool_entry(&record.key).await?;
                report.superseded_removed += 1;
                debug!(key = %record.key, "superseded entry removed");
            }
        }

        let fresh: HashSet<&str> = admitted
            .iter()
            .map(|(key, _, _)| key.ticket_name.as_str())
            .collect();
        for (name, meta) in self.store.list_claims().await? {
            if fresh.contains(name.as_str())
                || snapshot.view.contains(&name)
                || age(now, meta.last_modified) <= grace
            {
                continue;
            }
            // Either the admission crashed before its pool entry was written
            // or the ticket is gone entirely. In both cases the claim blocks
            // nothing useful.
            self.store.release_claim(&name).await?;
            report.claims_removed += 1;
            debug!(ticket = %name, "orphaned claim removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use dlc_core::{BuildContext, JobType};
    use dlc_store::{MemoryObjectStore, MemoryQueue, ObjectStore};
    use tokio::sync::mpsc;

    use super::*;
    use crate::dispatch::ChannelDispatcher;

    struct Harness {
        mem: MemoryObjectStore,
        queues: MemoryQueue,
        store: TicketStore,
        scheduler: Scheduler,
        events: mpsc::Receiver<DispatchEvent>,
        response_url: String,
        base: DateTime<Utc>,
    }

    fn config() -> DlcConfig {
        DlcConfig::default()
            .with_cap("gpu", 2)
            .with_executor_deadline(Duration::from_secs(600))
            .with_retention_window(Duration::from_secs(3600))
            .with_retry(1, Duration::ZERO)
    }

    async fn harness_with(config: DlcConfig, channel_capacity: usize) -> Harness {
        let mem = MemoryObjectStore::new();
        let queues = MemoryQueue::new();
        let store = TicketStore::new(Arc::new(mem.clone()), "bucket", RetryPolicy::none());
        let (sink, events) = ChannelDispatcher::new(channel_capacity);
        let response_url = queues.create_queue("responses").await.unwrap();
        let scheduler = Scheduler::with_replica_id(
            store.clone(),
            Arc::new(queues.clone()),
            Arc::new(sink),
            config,
            "replica-a",
        );
        Harness {
            mem,
            queues,
            store,
            scheduler,
            events,
            response_url,
            base: Utc::now(),
        }
    }

    async fn harness() -> Harness {
        harness_with(config(), 64).await
    }

    impl Harness {
        fn ticket(&self, name: &str, n: u32, offset_ms: i64) -> RequestTicket {
            RequestTicket {
                response_queue_url: self.response_url.clone(),
                bucket: "bucket".to_string(),
                ticket_name: name.to_string(),
                image_ref: "r/pytorch-training:1.0-gpu".to_string(),
                context: BuildContext::Pr,
                resource_class: "gpu".to_string(),
                job_type: JobType::Training,
                num_instances: n,
                created_at: self.base + chrono::Duration::milliseconds(offset_ms),
                timeout_limit: None,
                commit: None,
            }
        }

        async fn submit(&self, name: &str, n: u32, offset_ms: i64) {
            self.store.put_ticket(&self.ticket(name, n, offset_ms)).await.unwrap();
        }

        async fn status_of(&self, name: &str) -> Option<PoolStatus> {
            self.store
                .current_pool_entry("gpu", JobType::Training, name)
                .await
                .unwrap()
                .map(|r| r.key.status)
        }

        /// Play the executor: move a running ticket to a terminal status.
        async fn finish(&self, name: &str, status: FinalStatus) {
            let record = self
                .store
                .current_pool_entry("gpu", JobType::Training, name)
                .await
                .unwrap()
                .unwrap();
            let (entry, _) = self.store.get_pool_entry(&record.key).await.unwrap().unwrap();
            let bundle = LogBundle::new("<r/>", "ok");
            let pointer = self.store.put_bundle(name, &bundle).await.unwrap();
            let terminal = entry.terminal(status, bundle, pointer, Utc::now());
            self.store.replace_pool_entry(&record.key, &terminal).await.unwrap();
        }

        fn drain_events(&mut self) -> Vec<String> {
            let mut names = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                names.push(event.ticket_name);
            }
            names
        }
    }

    #[tokio::test]
    async fn saturation_admits_up_to_cap_in_fifo_order() {
        let mut h = harness().await;
        h.submit("t3", 1, 2).await;
        h.submit("t1", 1, 0).await;
        h.submit("t2", 1, 1).await;

        let report = h.scheduler.tick_at(Utc::now()).await.unwrap();
        assert!(report.leader);
        assert_eq!(report.admitted, 2);
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.waiting, 1);
        assert_eq!(h.drain_events(), vec!["t1", "t2"]);
        assert_eq!(h.status_of("t1").await, Some(PoolStatus::Running));
        assert_eq!(h.status_of("t2").await, Some(PoolStatus::Running));
        assert_eq!(h.status_of("t3").await, None);

        // Nothing changes while the bucket is full.
        let report = h.scheduler.tick_at(Utc::now()).await.unwrap();
        assert_eq!(report.admitted, 0);
        assert_eq!(h.status_of("t3").await, None);

        h.finish("t1", FinalStatus::Completed).await;
        let report = h.scheduler.tick_at(Utc::now()).await.unwrap();
        assert_eq!(report.admitted, 1);
        assert_eq!(h.drain_events(), vec!["t3"]);
        assert_eq!(h.store.pool_view().await.unwrap().in_flight("gpu-training"), 2);
    }

    #[tokio::test]
    async fn equal_creation_times_admit_in_name_order() {
        let mut h = harness().await;
        h.submit("t-c", 1, 0).await;
        h.submit("t-b", 1, 0).await;
        h.submit("t-a", 1, 0).await;

        let report = h.scheduler.tick_at(Utc::now()).await.unwrap();
        assert_eq!(report.admitted, 2);
        assert_eq!(h.drain_events(), vec!["t-a", "t-b"]);
        assert_eq!(h.status_of("t-c").await, None);

        h.finish("t-b", FinalStatus::Completed).await;
        h.scheduler.tick_at(Utc::now()).await.unwrap();
        assert_eq!(h.drain_events(), vec!["t-c"]);
    }

    #[tokio::test]
    async fn oversize_head_blocks_smaller_tickets_behind_it() {
        let mut h = harness().await;
        h.submit("t0", 1, 0).await;
        h.submit("t1", 2, 1).await;
        h.submit("t2", 1, 2).await;

        h.scheduler.tick_at(Utc::now()).await.unwrap();
        assert_eq!(h.drain_events(), vec!["t0"]);
        // t1 needs 2 but only 1 is free; t2 would fit but must not overtake.
        assert_eq!(h.status_of("t1").await, None);
        assert_eq!(h.status_of("t2").await, None);

        h.finish("t0", FinalStatus::Completed).await;
        h.scheduler.tick_at(Utc::now()).await.unwrap();
        assert_eq!(h.drain_events(), vec!["t1"]);
        assert_eq!(h.status_of("t2").await, None);

        h.finish("t1", FinalStatus::RuntimeError).await;
        h.scheduler.tick_at(Utc::now()).await.unwrap();
        assert_eq!(h.drain_events(), vec!["t2"]);
    }

    #[tokio::test]
    async fn unadmittable_tickets_are_quarantined() {
        let mut h = harness().await;
        h.mem
            .put("tickets/garbled", b"{not json".to_vec())
            .await
            .unwrap();
        h.submit("too-big", 3, 0).await;
        let mut odd = h.ticket("odd-class", 1, 0);
        odd.resource_class = "tpu".to_string();
        h.store.put_ticket(&odd).await.unwrap();

        let report = h.scheduler.tick_at(Utc::now()).await.unwrap();
        assert_eq!(report.quarantined, 3);
        assert_eq!(report.admitted, 0);
        assert!(h.drain_events().is_empty());
        assert!(h.store.list_ticket_names().await.unwrap().is_empty());
        assert_eq!(
            h.store.find_failure("garbled").await.unwrap(),
            Some(FailureReason::Malformed)
        );
        assert_eq!(
            h.store.find_failure("too-big").await.unwrap(),
            Some(FailureReason::ExceedsCap)
        );
        assert_eq!(
            h.store.find_failure("odd-class").await.unwrap(),
            Some(FailureReason::UnknownResourceClass)
        );
    }

    #[tokio::test]
    async fn stale_unaccounted_ticket_is_dead_lettered() {
        let mut h = harness_with(config().with_cap("gpu", 1), 64).await;
        h.submit("runner", 1, 0).await;
        let mut waiting = h.ticket("waiter", 1, 1);
        waiting.timeout_limit = Some(60);
        h.store.put_ticket(&waiting).await.unwrap();

        h.scheduler.tick_at(h.base).await.unwrap();
        assert_eq!(h.drain_events(), vec!["runner"]);

        let later = h.base + chrono::Duration::seconds(120);
        let report = h.scheduler.tick_at(later).await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert!(h.store.get_ticket("waiter").await.unwrap().is_none());
        assert_eq!(
            h.store.find_failure("waiter").await.unwrap(),
            Some(FailureReason::Timeout)
        );
    }

    #[tokio::test]
    async fn lost_executor_is_expired_and_requester_notified() {
        let mut h = harness().await;
        h.submit("t1", 1, 0).await;
        h.scheduler.tick_at(Utc::now()).await.unwrap();
        assert_eq!(h.status_of("t1").await, Some(PoolStatus::Running));

        let report = h.scheduler.tick_at(Utc::now()).await.unwrap();
        assert_eq!(report.expired, 0);

        let later = Utc::now() + chrono::Duration::seconds(601);
        let report = h.scheduler.tick_at(later).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(h.status_of("t1").await, Some(PoolStatus::RuntimeError));

        let record = h
            .store
            .current_pool_entry("gpu", JobType::Training, "t1")
            .await
            .unwrap()
            .unwrap();
        let (entry, _) = h.store.get_pool_entry(&record.key).await.unwrap().unwrap();
        let pointer = entry.bundle.unwrap();
        let bundle = h.store.get_bundle(&pointer).await.unwrap().unwrap();
        assert_eq!(bundle.xml_report, "");
        assert!(bundle.log_stream.contains("executor timed out"));

        let msgs = h
            .queues
            .receive(&h.response_url, 10, Duration::ZERO, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(msgs.len(), 1);
        let msg: ResponseMessage = serde_json::from_str(&msgs[0].body).unwrap();
        assert_eq!(msg.ticket_name, "t1");
        assert_eq!(msg.status, FinalStatus::RuntimeError);
        assert_eq!(msg.bundle_pointer, pointer);
    }

    #[tokio::test]
    async fn expiry_keeps_a_bundle_the_executor_already_uploaded() {
        let mut h = harness().await;
        h.submit("t1", 1, 0).await;
        h.scheduler.tick_at(Utc::now()).await.unwrap();
        assert_eq!(h.drain_events(), vec!["t1"]);

        // The executor uploaded and published, then stalled before closing
        // its entry.
        let real = LogBundle::new("<r/>", "real log\n");
        let uploaded = h.store.put_bundle("t1", &real).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(601);
        let report = h.scheduler.tick_at(later).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(h.status_of("t1").await, Some(PoolStatus::RuntimeError));

        assert_eq!(h.store.get_bundle(&uploaded).await.unwrap().unwrap(), real);
        let record = h
            .store
            .current_pool_entry("gpu", JobType::Training, "t1")
            .await
            .unwrap()
            .unwrap();
        let (entry, _) = h.store.get_pool_entry(&record.key).await.unwrap().unwrap();
        assert_eq!(entry.bundle, Some(uploaded.clone()));
        assert_eq!(entry.logs, Some(real));

        let msgs = h
            .queues
            .receive(&h.response_url, 10, Duration::ZERO, Duration::from_secs(30))
            .await
            .unwrap();
        let msg: ResponseMessage = serde_json::from_str(&msgs[0].body).unwrap();
        assert_eq!(msg.bundle_pointer, uploaded);
    }

    #[tokio::test]
    async fn unreadable_ticket_does_not_block_expiry() {
        let mut h = harness().await;
        h.submit("t1", 1, 0).await;
        h.scheduler.tick_at(Utc::now()).await.unwrap();
        assert_eq!(h.drain_events(), vec!["t1"]);
        h.mem.put("tickets/t1", b"{garbled".to_vec()).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(601);
        let report = h.scheduler.tick_at(later).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(h.status_of("t1").await, Some(PoolStatus::RuntimeError));
        // Nowhere to send the notification.
        assert_eq!(h.queues.depth(&h.response_url), 0);
    }

    #[tokio::test]
    async fn terminal_entries_are_reaped_once_ticket_is_gone() {
        let mut h = harness().await;
        h.submit("t1", 1, 0).await;
        h.scheduler.tick_at(Utc::now()).await.unwrap();
        h.finish("t1", FinalStatus::Completed).await;

        // Requester crashed: ticket still there, entry kept.
        let later = Utc::now() + chrono::Duration::seconds(7200);
        assert_eq!(h.scheduler.tick_at(later).await.unwrap().reaped, 0);

        h.store.delete_ticket("t1").await.unwrap();
        // Inside the retention window: kept.
        assert_eq!(h.scheduler.tick_at(Utc::now()).await.unwrap().reaped, 0);
        let report = h.scheduler.tick_at(later).await.unwrap();
        assert_eq!(report.reaped, 1);
        assert_eq!(h.status_of("t1").await, None);
        assert!(h.store.list_claims().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn preparing_entry_without_ticket_is_withdrawn() {
        let mut h = harness().await;
        let ticket = h.ticket("ghost", 1, 0);
        let key = PoolKey {
            resource_class: "gpu".to_string(),
            job_type: JobType::Training,
            ticket_name: "ghost".to_string(),
            num_instances: 1,
            status: PoolStatus::Preparing,
        };
        h.store
            .create_pool_entry(&key, &PoolEntry::preparing(&ticket, Utc::now()))
            .await
            .unwrap();

        let report = h.scheduler.tick_at(Utc::now()).await.unwrap();
        assert_eq!(report.withdrawn, 1);
        assert!(h.drain_events().is_empty());
        assert_eq!(h.status_of("ghost").await, Some(PoolStatus::RuntimeError));
    }

    #[tokio::test]
    async fn rejected_dispatch_is_retried_next_tick() {
        let mut h = harness_with(config(), 1).await;
        h.submit("t1", 1, 0).await;
        h.submit("t2", 1, 1).await;

        let report = h.scheduler.tick_at(Utc::now()).await.unwrap();
        assert_eq!(report.admitted, 2);
        assert_eq!(report.dispatched, 1);
        assert_eq!(h.status_of("t2").await, Some(PoolStatus::Preparing));

        assert_eq!(h.drain_events(), vec!["t1"]);
        let report = h.scheduler.tick_at(Utc::now()).await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(h.drain_events(), vec!["t2"]);
        assert_eq!(h.status_of("t2").await, Some(PoolStatus::Running));
    }

    #[tokio::test]
    async fn only_the_lease_holder_acts() {
        let mut h = harness().await;
        let (sink, mut other_events) = ChannelDispatcher::new(8);
        let mut other = Scheduler::with_replica_id(
            h.store.clone(),
            Arc::new(h.queues.clone()),
            Arc::new(sink),
            config(),
            "replica-b",
        );
        h.submit("t1", 1, 0).await;

        assert!(h.scheduler.tick_at(Utc::now()).await.unwrap().leader);
        h.submit("t2", 1, 1).await;
        let report = other.tick_at(Utc::now()).await.unwrap();
        assert!(!report.leader);
        assert_eq!(report.admitted, 0);
        assert!(other_events.try_recv().is_err());
        assert_eq!(h.status_of("t2").await, None);
    }

    #[tokio::test]
    async fn backend_outage_abandons_tick_without_changes() {
        let mut h = harness().await;
        h.submit("t1", 1, 0).await;
        h.mem.set_offline(true);
        let err = h.scheduler.tick_at(Utc::now()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::BackendUnavailable(_)));
        h.mem.set_offline(false);

        assert_eq!(h.status_of("t1").await, None);
        let report = h.scheduler.tick_at(Utc::now()).await.unwrap();
        assert_eq!(report.admitted, 1);
    }

    #[tokio::test]
    async fn superseded_entries_are_ignored_then_removed() {
        let mut h = harness().await;
        h.submit("t1", 1, 0).await;
        h.scheduler.tick_at(Utc::now()).await.unwrap();
        h.drain_events();

        // Leave a stale preparing key behind, as a crashed replace would.
        let ticket = h.ticket("t1", 1, 0);
        let key = PoolKey {
            resource_class: "gpu".to_string(),
            job_type: JobType::Training,
            ticket_name: "t1".to_string(),
            num_instances: 1,
            status: PoolStatus::Preparing,
        };
        h.store
            .create_pool_entry(&key, &PoolEntry::preparing(&ticket, Utc::now()))
            .await
            .unwrap();
        assert_eq!(h.store.pool_view().await.unwrap().in_flight("gpu-training"), 1);

        let report = h.scheduler.tick_at(Utc::now()).await.unwrap();
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.superseded_removed, 0);

        let later = Utc::now() + chrono::Duration::seconds(120);
        let report = h.scheduler.tick_at(later).await.unwrap();
        assert_eq!(report.superseded_removed, 1);
        let entries = h
            .store
            .ticket_pool_entries("gpu", JobType::Training, "t1")
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(h.drain_events().is_empty());
    }
}
