//! Test runners: the opaque test command behind a trait.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use dlc_core::config::ExecutorConfig;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ExecutorError, ExecutorResult};

/// How long to keep reading output after the command has exited. Background
/// processes it left behind may hold the pipes open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// One test run to perform.
#[derive(Debug, Clone)]
pub struct TestJob {
    pub ticket_name: String,
    pub image_ref: String,
    /// Working directory; created if missing.
    pub work_dir: PathBuf,
}

/// What a finished test command left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    /// `None` when the command was terminated by a signal.
    pub exit_code: Option<i32>,
    pub log_stream: String,
    /// Contents of the report file; empty if none was written.
    pub xml_report: String,
}

impl RunOutput {
    /// A run passes only if it exited zero and left a report behind.
    pub fn passed(&self) -> bool {
        self.exit_code == Some(0) && !self.xml_report.trim().is_empty()
    }
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run the test to natural termination. Only failures to run at all,
    /// and `CommandTimeout`, are errors.
    async fn run(&self, job: &TestJob) -> ExecutorResult<RunOutput>;
}

/// Runs the configured command line with `sh -c`.
///
/// `{image_ref}` in the command is substituted, and `IMAGE_REF`,
/// `REPORT_PATH` and `TICKET_NAME` are exported. Stdout and stderr are
/// merged line by line in arrival order.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    command: String,
    report_path: PathBuf,
    timeout: Duration,
}

impl ShellRunner {
    pub fn new(command: impl Into<String>, report_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            report_path: report_path.into(),
            timeout,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(
            config.command.clone(),
            config.report_path.clone(),
            config.command_timeout,
        )
    }
}

#[async_trait]
impl TestRunner for ShellRunner {
    async fn run(&self, job: &TestJob) -> ExecutorResult<RunOutput> {
        tokio::fs::create_dir_all(&job.work_dir)
            .await
            .map_err(|e| ExecutorError::Spawn(format!("{}: {e}", job.work_dir.display())))?;
        let report = job.work_dir.join(&self.report_path);
        // Never pick up a report left by an earlier attempt.
        match tokio::fs::remove_file(&report).await {
            Ok(()) => debug!(path = %report.display(), "removed stale report"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ExecutorError::Spawn(format!("{}: {e}", report.display()))),
        }

        let command = self.command.replace("{image_ref}", &job.image_ref);
        debug!(ticket = %job.ticket_name, %command, "spawning test command");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&job.work_dir)
            .env("IMAGE_REF", &job.image_ref)
            .env("REPORT_PATH", &report)
            .env("TICKET_NAME", &job.ticket_name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Spawn(e.to_string()))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, tx.clone()));
        }
        drop(tx);

        let mut log = String::new();
        let mut streams_open = true;
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let status = loop {
            tokio::select! {
                line = rx.recv(), if streams_open => match line {
                    Some(line) => push_line(&mut log, &line),
                    None => streams_open = false,
                },
                status = child.wait() => {
                    break status.map_err(|e| ExecutorError::Spawn(e.to_string()))?;
                }
                _ = &mut deadline => {
                    warn!(ticket = %job.ticket_name, timeout = ?self.timeout, "test command overran, killing it");
                    if let Err(e) = child.kill().await {
                        warn!(ticket = %job.ticket_name, error = %e, "kill failed");
                    }
                    drain(&mut rx, &mut log).await;
                    return Err(ExecutorError::CommandTimeout {
                        ticket: job.ticket_name.clone(),
                        after: self.timeout,
                        log,
                    });
                }
            }
        };
        drain(&mut rx, &mut log).await;

        let xml_report = read_report(&job.ticket_name, &report).await;
        debug!(
            ticket = %job.ticket_name,
            exit_code = ?status.code(),
            report_bytes = xml_report.len(),
            "test command finished"
        );
        Ok(RunOutput {
            exit_code: status.code(),
            log_stream: log,
            xml_report,
        })
    }
}

/// Forward output line by line until EOF. Bytes that are not UTF-8 are
/// replaced rather than ending the stream, so the child never sees a closed
/// pipe.
async fn pump<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                // Keep reading even if nobody listens any more.
                let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
            }
            Err(e) => {
                warn!(error = %e, "reading test output failed");
                break;
            }
        }
    }
}

async fn drain(rx: &mut mpsc::UnboundedReceiver<String>, log: &mut String) {
    let collect = async {
        while let Some(line) = rx.recv().await {
            push_line(log, &line);
        }
    };
    if tokio::time::timeout(DRAIN_GRACE, collect).await.is_err() {
        debug!("output pipes still open after exit; log truncated");
    }
}

/// The report the command left behind, or empty when there is none.
async fn read_report(ticket: &str, path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            warn!(ticket, path = %path.display(), error = %e, "could not read report");
            String::new()
        }
    }
}

fn push_line(log: &mut String, line: &str) {
    log.push_str(line);
    log.push('\n');
}
