//! Requester-side commands: `submit` and `status`.

use std::collections::BTreeMap;
use std::time::Duration;

use dlc_core::{BuildContext, DlcConfig, keys};
use dlc_requester::{BuildEnv, JobRequester, RequesterError};
use dlc_store::Backends;
use tracing::info;

pub async fn run_submit(
    config: DlcConfig,
    image: &str,
    context: BuildContext,
    num_instances: u32,
    wait: Option<Duration>,
    keep: bool,
) -> anyhow::Result<()> {
    let backends = Backends::open(&config.backend)?;
    let store = backends.ticket_store(&config);
    let requester = JobRequester::new(store, backends.queues.clone(), config, BuildEnv::from_env()).await?;

    let handle = requester.send_request(image, context, num_instances).await?;
    println!("{}", serde_json::to_string_pretty(&handle)?);

    let Some(wait) = wait else {
        // The queue outlives this process so the response can still be
        // collected later.
        return Ok(());
    };

    info!(ticket = %handle.ticket_name, wait = %humantime::format_duration(wait), "waiting for result");
    let result = requester.receive_logs(&handle, wait).await;
    let (bundle, failed) = match result {
        Ok(bundle) => (bundle, false),
        Err(RequesterError::TestRuntime { bundle, .. }) => (bundle, true),
        Err(e) => return Err(e.into()),
    };
    print!("{}", bundle.log_stream);
    if bundle.has_report() {
        println!("{}", bundle.xml_report);
    }

    if !keep {
        requester.dispose(&handle).await?;
    }
    requester.shutdown().await?;

    if failed {
        anyhow::bail!("test run for ticket {} ended in runtimeError", handle.ticket_name);
    }
    Ok(())
}

/// Print in-flight instances against caps, plus queued and failed counts.
pub async fn run_status(config: DlcConfig) -> anyhow::Result<()> {
    let backends = Backends::open(&config.backend)?;
    let store = backends.ticket_store(&config);

    let view = store.pool_view().await?;
    let mut queued: BTreeMap<String, usize> = BTreeMap::new();
    for name in store.list_ticket_names().await? {
        if view.contains(&name) {
            continue;
        }
        if let Some(ticket) = store.get_ticket(&name).await? {
            *queued.entry(ticket.bucket_id()).or_default() += 1;
        }
    }

    let in_flight = view.in_flight_by_bucket();
    let mut buckets: Vec<&String> = in_flight.keys().chain(queued.keys()).collect();
    buckets.sort();
    buckets.dedup();

    println!("{:<32} {:>10} {:>6} {:>8}", "BUCKET", "IN-FLIGHT", "CAP", "QUEUED");
    for bucket in buckets {
        let cap = bucket
            .rsplit_once('-')
            .and_then(|(class, _)| config.cap_for(class))
            .map(|cap| cap.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<32} {:>10} {:>6} {:>8}",
            bucket,
            in_flight.get(bucket).copied().unwrap_or(0),
            cap,
            queued.get(bucket).copied().unwrap_or(0)
        );
    }

    let quarantined = store.objects().list(keys::QUARANTINE_PREFIX).await?.len();
    let dead_lettered = store.objects().list(keys::DEAD_LETTER_PREFIX).await?.len();
    println!();
    println!("terminal entries: {}", view.entries().filter(|r| r.key.status.is_terminal()).count());
    println!("quarantined:      {quarantined}");
    println!("dead-lettered:    {dead_lettered}");
    Ok(())
}
