//! Scheduler mode: the admission loop.
//!
//! In this mode, the daemon:
//! 1. Opens the configured object store and queue backends
//! 2. Creates the dispatch queue the provisioner consumes
//! 3. Ticks until Ctrl-C, then releases its leader lease

use std::sync::Arc;

use dlc_core::DlcConfig;
use dlc_scheduler::{QueueDispatcher, Scheduler};
use dlc_store::{Backends, RetryPolicy};
use tokio::sync::watch;
use tracing::info;

pub async fn run_scheduler(
    config: DlcConfig,
    replica_id: Option<String>,
    once: bool,
) -> anyhow::Result<()> {
    info!(bucket = %config.ticket_bucket, caps = ?config.resource_caps, "scheduler starting");

    // ── Backends ─────────────────────────────────────────────────
    let backends = Backends::open(&config.backend)?;
    let store = backends.ticket_store(&config);

    // ── Dispatch sink ────────────────────────────────────────────
    let dispatcher = QueueDispatcher::open(
        backends.queues.clone(),
        &config.dispatch_channel,
        RetryPolicy::from(&config.retry),
    )
    .await?;
    info!(queue = %dispatcher.url(), "dispatch queue ready");

    let mut scheduler = match replica_id {
        Some(id) => Scheduler::with_replica_id(
            store,
            backends.queues.clone(),
            Arc::new(dispatcher),
            config,
            id,
        ),
        None => Scheduler::new(store, backends.queues.clone(), Arc::new(dispatcher), config),
    };

    if once {
        let report = scheduler.tick().await?;
        report.log();
        return Ok(());
    }

    // ── Tick loop until Ctrl-C ───────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown_tx.send(true)?;
    handle.await?;

    info!("scheduler stopped");
    Ok(())
}
