//! Provision mode: the reference compute provisioner.
//!
//! Consumes dispatch events from the dispatch queue and starts one
//! `dlcd executor` child per event, with the launch contract in its
//! environment. A semaphore bounds how many run at once.
//!
//! Events are acknowledged once the child has started. A provisioner that
//! dies before that leaves the event to reappear after its visibility
//! timeout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dlc_core::{DispatchEvent, DlcConfig};
use dlc_executor::LaunchSpec;
use dlc_store::{Backends, MessageQueue};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Dispatch events stay invisible this long while a child is being started.
const LAUNCH_VISIBILITY: Duration = Duration::from_secs(60);

pub async fn run_provisioner(
    config: DlcConfig,
    config_path: PathBuf,
    max_parallel: usize,
) -> anyhow::Result<()> {
    let max_parallel = max_parallel.max(1);
    let backends = Backends::open(&config.backend)?;
    let queues = backends.queues.clone();
    let url = queues.create_queue(&config.dispatch_channel).await?;
    let exe = std::env::current_exe()?;
    let slots = Arc::new(Semaphore::new(max_parallel));
    info!(queue = %url, max_parallel, "provisioner started");

    loop {
        // Only take as many events as there are free slots.
        let free = slots.available_permits();
        if free == 0 {
            tokio::select! {
                permit = slots.clone().acquire_owned() => drop(permit?),
                _ = tokio::signal::ctrl_c() => break,
            }
            continue;
        }

        let received = tokio::select! {
            received = queues.receive(&url, free, config.requester.poll_wait, LAUNCH_VISIBILITY) => received,
            _ = tokio::signal::ctrl_c() => break,
        };
        let messages = match received {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "dispatch queue receive failed");
                tokio::time::sleep(config.tick_interval).await;
                continue;
            }
        };

        for msg in messages {
            let event: DispatchEvent = match serde_json::from_str(&msg.body) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable dispatch event");
                    ack(queues.as_ref(), &url, &msg.receipt).await;
                    continue;
                }
            };
            let permit = slots.clone().acquire_owned().await?;
            let launch = LaunchSpec::for_event(&event);

            let mut cmd = Command::new(&exe);
            cmd.arg("--config").arg(&config_path).arg("executor");
            for (key, value) in launch.to_env() {
                cmd.env(key, value);
            }
            match cmd.spawn() {
                Ok(mut child) => {
                    info!(
                        ticket = %event.ticket_name,
                        dispatch_id = %event.dispatch_id,
                        pid = ?child.id(),
                        "executor launched"
                    );
                    ack(queues.as_ref(), &url, &msg.receipt).await;
                    let ticket = event.ticket_name.clone();
                    tokio::spawn(async move {
                        match child.wait().await {
                            Ok(status) if status.success() => {
                                debug!(%ticket, "executor exited")
                            }
                            Ok(status) => warn!(%ticket, %status, "executor failed"),
                            Err(e) => error!(%ticket, error = %e, "lost track of executor"),
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    // Leave the event in the queue; it reappears after the
                    // visibility timeout.
                    error!(ticket = %event.ticket_name, error = %e, "failed to launch executor");
                }
            }
        }
    }

    info!("provisioner stopping; running executors continue on their own");
    Ok(())
}

async fn ack(queues: &dyn MessageQueue, url: &str, receipt: &str) {
    match queues.delete_message(url, receipt).await {
        Ok(true) => {}
        Ok(false) => warn!("stale dispatch receipt; event may be delivered again"),
        Err(e) => warn!(error = %e, "failed to delete dispatch event"),
    }
}
