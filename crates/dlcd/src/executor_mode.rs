//! Executor mode: one test run per process.

use std::sync::Arc;

use dlc_core::DlcConfig;
use dlc_executor::{ExecutionOutcome, Executor, LaunchSpec, ShellRunner};
use dlc_store::{Backends, RetryPolicy};
use tracing::info;

/// Run the assigned ticket. Returns an error (non-zero exit) when the
/// outcome could not be reported.
pub async fn run_executor(config: DlcConfig) -> anyhow::Result<()> {
    let launch = LaunchSpec::from_env()?;
    info!(
        ticket_key = %launch.ticket_key,
        executor_id = %launch.executor_id,
        resource_class = %launch.resource_class,
        "executor starting"
    );

    let backends = Backends::open(&config.backend)?;
    let executor = Executor::new(
        backends.ticket_store(&config),
        backends.queues.clone(),
        Arc::new(ShellRunner::from_config(&config.executor)),
        config.executor.work_root.clone(),
        RetryPolicy::from(&config.retry),
    );

    match executor.run(&launch).await? {
        ExecutionOutcome::Reported(status) => info!(?status, "executor finished"),
        ExecutionOutcome::AlreadyTerminal(status) => {
            info!(%status, "ticket already terminal, executor exits")
        }
        ExecutionOutcome::Withdrawn => info!("ticket withdrawn, executor exits"),
    }
    Ok(())
}
