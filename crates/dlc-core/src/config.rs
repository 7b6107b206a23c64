//! dlc.toml configuration parser.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::image::{ImageRule, ResourceClassTable};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("ticket_bucket must not be empty")]
    EmptyBucket,

    #[error("resource cap for {0} must be positive")]
    ZeroCap(String),

    #[error("duration {0} must be non-zero")]
    ZeroDuration(&'static str),

    #[error("response_queue_template must contain {{requester}}: {0}")]
    BadQueueTemplate(String),

    #[error("retry.attempts must be at least 1")]
    NoRetryAttempts,

    #[error("executor.command must not be empty")]
    EmptyCommand,

    #[error("scheduler.tick_deadline ({tick:?}) must be shorter than scheduler.lease_ttl ({lease:?})")]
    TickOutlivesLease { tick: Duration, lease: Duration },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlcConfig {
    pub ticket_bucket: String,
    #[serde(with = "duration_str")]
    pub tick_interval: Duration,
    #[serde(with = "duration_str")]
    pub executor_deadline: Duration,
    #[serde(with = "duration_str")]
    pub retention_window: Duration,
    pub dispatch_channel: String,
    pub response_queue_template: String,
    pub backend: BackendConfig,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub requester: RequesterConfig,
    pub executor: ExecutorConfig,
    pub resource_caps: BTreeMap<String, u32>,
    pub image_rules: Vec<ImageRule>,
}

/// Where tickets, pool entries and queues live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Process-local; only useful for tests and embedded setups.
    Memory,
    /// Directory tree shared by every process on the host (or mount).
    Fs { root: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    #[serde(with = "duration_str")]
    pub base_delay: Duration,
    #[serde(with = "duration_str")]
    pub max_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Work left unfinished after this long is retried next tick. Must be
    /// shorter than `lease_ttl` so a tick never runs past its lease.
    #[serde(with = "duration_str")]
    pub tick_deadline: Duration,
    #[serde(with = "duration_str")]
    pub lease_ttl: Duration,
    /// Age after which a superseded pool entry is deleted.
    #[serde(with = "duration_str")]
    pub stale_entry_grace: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequesterConfig {
    /// Upper bound for a ticket's timeout limit.
    #[serde(with = "duration_str")]
    pub max_timeout: Duration,
    /// Long-poll wait per receive call.
    #[serde(with = "duration_str")]
    pub poll_wait: Duration,
    #[serde(with = "duration_str")]
    pub visibility_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Shell command line; `{image_ref}` is substituted.
    pub command: String,
    /// Report location relative to the working directory.
    pub report_path: PathBuf,
    pub work_root: PathBuf,
    #[serde(with = "duration_str")]
    pub command_timeout: Duration,
}

impl Default for DlcConfig {
    fn default() -> Self {
        Self {
            ticket_bucket: "dlc-test-tickets".to_string(),
            tick_interval: Duration::from_secs(5),
            executor_deadline: Duration::from_secs(4 * 3600),
            retention_window: Duration::from_secs(24 * 3600),
            dispatch_channel: "dlc-dispatch".to_string(),
            response_queue_template: "dlc-responses-{requester}".to_string(),
            backend: BackendConfig::default(),
            retry: RetryConfig::default(),
            scheduler: SchedulerConfig::default(),
            requester: RequesterConfig::default(),
            executor: ExecutorConfig::default(),
            resource_caps: BTreeMap::new(),
            image_rules: Vec::new(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Fs {
            root: PathBuf::from("/var/lib/dlc-scheduler"),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_deadline: Duration::from_secs(10),
            lease_ttl: Duration::from_secs(30),
            stale_entry_grace: Duration::from_secs(60),
        }
    }
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            max_timeout: Duration::from_secs(4 * 3600),
            poll_wait: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: "python -m pytest --junitxml=report.xml test/dlc_tests --image {image_ref}"
                .to_string(),
            report_path: PathBuf::from("report.xml"),
            work_root: std::env::temp_dir().join("dlc-executor"),
            command_timeout: Duration::from_secs(4 * 3600),
        }
    }
}

impl DlcConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: DlcConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ticket_bucket.trim().is_empty() {
            return Err(ConfigError::EmptyBucket);
        }
        if let Some((class, _)) = self.resource_caps.iter().find(|(_, cap)| **cap == 0) {
            return Err(ConfigError::ZeroCap(class.clone()));
        }
        let durations = [
            ("tick_interval", self.tick_interval),
            ("executor_deadline", self.executor_deadline),
            ("retention_window", self.retention_window),
            ("scheduler.tick_deadline", self.scheduler.tick_deadline),
            ("scheduler.lease_ttl", self.scheduler.lease_ttl),
            ("requester.max_timeout", self.requester.max_timeout),
            ("requester.visibility_timeout", self.requester.visibility_timeout),
            ("executor.command_timeout", self.executor.command_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::ZeroDuration(*name));
        }
        if self.scheduler.tick_deadline >= self.scheduler.lease_ttl {
            return Err(ConfigError::TickOutlivesLease {
                tick: self.scheduler.tick_deadline,
                lease: self.scheduler.lease_ttl,
            });
        }
        if !self.response_queue_template.contains("{requester}") {
            return Err(ConfigError::BadQueueTemplate(
                self.response_queue_template.clone(),
            ));
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::NoRetryAttempts);
        }
        if self.executor.command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        Ok(())
    }

    /// Concurrency cap of a resource class, if one is configured.
    pub fn cap_for(&self, resource_class: &str) -> Option<u32> {
        self.resource_caps.get(resource_class).copied()
    }

    /// Image table; the built-in defaults apply when no rules are configured.
    pub fn resource_table(&self) -> ResourceClassTable {
        if self.image_rules.is_empty() {
            ResourceClassTable::default()
        } else {
            ResourceClassTable::new(self.image_rules.clone())
        }
    }

    /// Queue name for a requester id, rendered through the template.
    pub fn response_queue_name(&self, requester: &str) -> String {
        self.response_queue_template.replace("{requester}", requester)
    }

    // ── Builder-style setters (mostly for tests) ────────────────────

    pub fn with_cap(mut self, resource_class: &str, cap: u32) -> Self {
        self.resource_caps.insert(resource_class.to_string(), cap);
        self
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_executor_deadline(mut self, deadline: Duration) -> Self {
        self.executor_deadline = deadline;
        self
    }

    pub fn with_retention_window(mut self, window: Duration) -> Self {
        self.retention_window = window;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_retry(mut self, attempts: u32, base_delay: Duration) -> Self {
        self.retry.attempts = attempts;
        self.retry.base_delay = base_delay;
        self
    }

    /// Example document written by `dlcd init-config`.
    pub fn scaffold(root: &Path) -> Self {
        Self::default()
            .with_backend(BackendConfig::Fs {
                root: root.to_path_buf(),
            })
            .with_cap("ml.p3.8xlarge", 4)
            .with_cap("ml.c4.4xlarge", 8)
            .with_cap("ml.p2.8xlarge", 4)
            .with_cap("ml.c4.8xlarge", 8)
    }
}

/// Durations as human-readable strings (`"5s"`, `"4h"`, `"1day"`).
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobType;

    #[test]
    fn parse_minimal_uses_defaults() {
        let config = DlcConfig::from_toml_str(
            r#"
ticket_bucket = "bucket"

[resource_caps]
"ml.p3.8xlarge" = 2
"#,
        )
        .unwrap();
        assert_eq!(config.ticket_bucket, "bucket");
        assert_eq!(config.tick_interval, Duration::from_secs(5));
        assert_eq!(config.cap_for("ml.p3.8xlarge"), Some(2));
        assert_eq!(config.cap_for("ml.c4.4xlarge"), None);
        assert_eq!(config.resource_table(), ResourceClassTable::default());
    }

    #[test]
    fn parse_full_document() {
        let config = DlcConfig::from_toml_str(
            r#"
tick_interval = "2s"
executor_deadline = "90m"
retention_window = "2h"
dispatch_channel = "dispatch"
response_queue_template = "resp-{requester}"

[backend]
kind = "fs"
root = "/tmp/dlc"

[retry]
attempts = 3
base_delay = "50ms"

[scheduler]
tick_deadline = "5s"
lease_ttl = "20s"

[executor]
command = "run-tests {image_ref}"
command_timeout = "1h"

[resource_caps]
gpu = 4

[[image_rules]]
framework = "pytorch"
job_type = "inference"
resource_class = "gpu"
"#,
        )
        .unwrap();
        assert_eq!(config.tick_interval, Duration::from_secs(2));
        assert_eq!(config.executor_deadline, Duration::from_secs(90 * 60));
        assert_eq!(
            config.backend,
            BackendConfig::Fs {
                root: PathBuf::from("/tmp/dlc")
            }
        );
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_millis(50));
        assert_eq!(config.scheduler.tick_deadline, Duration::from_secs(5));
        assert_eq!(config.scheduler.lease_ttl, Duration::from_secs(20));
        assert_eq!(config.image_rules.len(), 1);
        assert_eq!(config.image_rules[0].job_type, Some(JobType::Inference));
        assert_eq!(config.response_queue_name("build-7"), "resp-build-7");
    }

    #[test]
    fn validation_rejects_bad_values() {
        let bad_cap = DlcConfig::default().with_cap("a", 0);
        assert_eq!(bad_cap.validate(), Err(ConfigError::ZeroCap("a".to_string())));

        let bad_tick = DlcConfig::default().with_tick_interval(Duration::ZERO);
        assert_eq!(
            bad_tick.validate(),
            Err(ConfigError::ZeroDuration("tick_interval"))
        );

        let mut bad_template = DlcConfig::default();
        bad_template.response_queue_template = "static".to_string();
        assert!(matches!(
            bad_template.validate(),
            Err(ConfigError::BadQueueTemplate(_))
        ));

        assert!(DlcConfig::from_toml_str("tick_interval = \"soon\"").is_err());
    }

    #[test]
    fn tick_deadline_must_stay_inside_the_lease() {
        let defaults = DlcConfig::default();
        assert!(defaults.scheduler.tick_deadline < defaults.scheduler.lease_ttl);

        let mut equal = DlcConfig::default();
        equal.scheduler.tick_deadline = equal.scheduler.lease_ttl;
        assert!(matches!(
            equal.validate(),
            Err(ConfigError::TickOutlivesLease { .. })
        ));

        let err = DlcConfig::from_toml_str(
            r#"
[scheduler]
tick_deadline = "45s"
lease_ttl = "30s"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("tick_deadline"));
    }

    #[test]
    fn scaffold_round_trips_through_toml() {
        let config = DlcConfig::scaffold(Path::new("/srv/dlc"));
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("ml.p3.8xlarge"));
        let parsed = DlcConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
