//! dlcd: the DLC test scheduler binary.
//!
//! One binary for every role:
//! - `scheduler`: the admission loop over the shared ticket bucket
//! - `executor`: run the ticket named by the launch environment
//! - `provision`: turn dispatch events into local executor processes
//! - `submit` / `status`: requester side, for humans and scripts
//!
//! # Usage
//!
//! ```text
//! dlcd init-config --root /var/lib/dlc > dlc.toml
//! dlcd --config dlc.toml scheduler
//! dlcd --config dlc.toml provision --max-parallel 8
//! dlcd --config dlc.toml submit 123.dkr.ecr.../pytorch-training:1.13-gpu --wait 2h
//! ```

mod executor_mode;
mod provision;
mod scheduler_mode;
mod submit;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use dlc_core::{BuildContext, DlcConfig};

#[derive(Parser)]
#[command(name = "dlcd", about = "DLC test scheduler")]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = "dlc.toml")]
    config: PathBuf,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop.
    Scheduler {
        /// Replica id used for the leader lease (random when omitted).
        #[arg(long)]
        replica_id: Option<String>,

        /// Run a single tick and exit.
        #[arg(long)]
        once: bool,
    },

    /// Run the test for the ticket named by TICKET_KEY and exit.
    Executor,

    /// Launch one executor process per dispatch event.
    Provision {
        /// Upper bound on concurrently running executors.
        #[arg(long, default_value = "4")]
        max_parallel: usize,
    },

    /// File a request ticket, optionally waiting for its logs.
    Submit {
        /// Image under test, `{registry}/{repo}:{tag}`.
        image: String,

        #[arg(long, default_value = "PR")]
        context: BuildContext,

        #[arg(long, default_value = "1")]
        num_instances: u32,

        /// Wait this long for the result (e.g. `90m`); return right away
        /// when omitted.
        #[arg(long, value_parser = humantime::parse_duration)]
        wait: Option<Duration>,

        /// Keep the ticket and its pool entry after receiving the result.
        #[arg(long)]
        keep: bool,
    },

    /// Show pool usage per bucket.
    Status,

    /// Print an example configuration document.
    InitConfig {
        /// Backend root written into the document.
        #[arg(long, default_value = "/var/lib/dlc-scheduler")]
        root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::InitConfig { root } => {
            print!("{}", DlcConfig::scaffold(&root).to_toml_string()?);
            Ok(())
        }
        Command::Scheduler { replica_id, once } => {
            let config = load_config(&cli.config)?;
            scheduler_mode::run_scheduler(config, replica_id, once).await
        }
        Command::Executor => {
            let config = load_config(&cli.config)?;
            executor_mode::run_executor(config).await
        }
        Command::Provision { max_parallel } => {
            let config = load_config(&cli.config)?;
            provision::run_provisioner(config, cli.config, max_parallel).await
        }
        Command::Submit {
            image,
            context,
            num_instances,
            wait,
            keep,
        } => {
            let config = load_config(&cli.config)?;
            submit::run_submit(config, &image, context, num_instances, wait, keep).await
        }
        Command::Status => {
            let config = load_config(&cli.config)?;
            submit::run_status(config).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,dlcd=debug,dlc=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: &Path) -> anyhow::Result<DlcConfig> {
    DlcConfig::from_file(path).with_context(|| format!("loading config {}", path.display()))
}
