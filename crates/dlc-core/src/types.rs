//! Shared record types exchanged between requesters, the scheduler and
//! executors.
//!
//! Every record is a small self-describing JSON document. Field names follow
//! the wire schema used by the existing ticket bucket, which is why several
//! structs carry explicit `serde(rename)` attributes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Requester-generated correlation id of a single test run.
pub type TicketName = String;

/// Named hardware family subject to a global concurrency cap.
pub type ResourceClass = String;

/// Error returned when parsing one of the enumerated tags fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseTagError {
    pub kind: &'static str,
    pub value: String,
}

// ── Enumerated tags ─────────────────────────────────────────────────

/// Job family of the image under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Training,
    Inference,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Training => "training",
            JobType::Inference => "inference",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "training" => Ok(JobType::Training),
            "inference" => Ok(JobType::Inference),
            other => Err(ParseTagError {
                kind: "job type",
                value: other.to_string(),
            }),
        }
    }
}

/// Build context the request originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BuildContext {
    /// Pre-merge pull request build.
    Pr,
    Mainline,
    Nightly,
    Dev,
}

impl BuildContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildContext::Pr => "PR",
            BuildContext::Mainline => "MAINLINE",
            BuildContext::Nightly => "NIGHTLY",
            BuildContext::Dev => "DEV",
        }
    }
}

impl fmt::Display for BuildContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildContext {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PR" => Ok(BuildContext::Pr),
            "MAINLINE" => Ok(BuildContext::Mainline),
            "NIGHTLY" => Ok(BuildContext::Nightly),
            "DEV" => Ok(BuildContext::Dev),
            _ => Err(ParseTagError {
                kind: "build context",
                value: s.to_string(),
            }),
        }
    }
}

/// Lifecycle status of a pool entry.
///
/// Statuses form a lattice `preparing < running < {completed, runtimeError}`.
/// A reader that observes two entries for one ticket keeps the higher rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolStatus {
    #[serde(rename = "preparing")]
    Preparing,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "runtimeError")]
    RuntimeError,
}

impl PoolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolStatus::Preparing => "preparing",
            PoolStatus::Running => "running",
            PoolStatus::Completed => "completed",
            PoolStatus::RuntimeError => "runtimeError",
        }
    }

    /// Position in the status lattice. Both terminal statuses share a rank.
    pub fn rank(&self) -> u8 {
        match self {
            PoolStatus::Preparing => 0,
            PoolStatus::Running => 1,
            PoolStatus::Completed | PoolStatus::RuntimeError => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    /// Whether the entry counts against its bucket's concurrency cap.
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether moving from `self` to `next` respects the lattice.
    pub fn can_advance_to(&self, next: PoolStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolStatus {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preparing" => Ok(PoolStatus::Preparing),
            "running" => Ok(PoolStatus::Running),
            "completed" => Ok(PoolStatus::Completed),
            "runtimeError" => Ok(PoolStatus::RuntimeError),
            other => Err(ParseTagError {
                kind: "pool status",
                value: other.to_string(),
            }),
        }
    }
}

/// Final outcome of a test run as carried by a response message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalStatus {
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "runtimeError")]
    RuntimeError,
}

impl From<FinalStatus> for PoolStatus {
    fn from(status: FinalStatus) -> Self {
        match status {
            FinalStatus::Completed => PoolStatus::Completed,
            FinalStatus::RuntimeError => PoolStatus::RuntimeError,
        }
    }
}

// ── Request ticket ──────────────────────────────────────────────────

/// A request for one test run, stored at `tickets/{ticket_name}`.
///
/// Written once by the requester and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTicket {
    /// The requester's private response queue.
    #[serde(rename = "SQS_URL")]
    pub response_queue_url: String,
    #[serde(rename = "S3_bucket")]
    pub bucket: String,
    #[serde(rename = "S3_ticket_name")]
    pub ticket_name: TicketName,
    pub image_ref: String,
    pub context: BuildContext,
    pub resource_class: ResourceClass,
    pub job_type: JobType,
    pub num_instances: u32,
    pub created_at: DateTime<Utc>,
    /// Seconds the ticket may wait unaccounted before it is dead-lettered.
    #[serde(default)]
    pub timeout_limit: Option<u64>,
    /// Source revision of the build that filed the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

impl RequestTicket {
    /// FIFO ordering key within a bucket: creation time, then name.
    pub fn fifo_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.ticket_name.as_str())
    }

    /// Bucket identifier `{resource_class}-{job_type}`.
    pub fn bucket_id(&self) -> String {
        crate::keys::bucket_id(&self.resource_class, self.job_type)
    }
}

// ── Log bundle ──────────────────────────────────────────────────────

/// Location of an uploaded log bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundlePointer {
    pub bucket: String,
    pub key: String,
}

impl BundlePointer {
    /// An empty pointer, used when nothing could be uploaded.
    pub fn empty(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

/// Artifact produced by one executor: machine-readable report plus the
/// captured text log.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogBundle {
    #[serde(rename = "XML_REPORT")]
    pub xml_report: String,
    #[serde(rename = "LOG_STREAM")]
    pub log_stream: String,
}

impl LogBundle {
    pub fn new(xml_report: impl Into<String>, log_stream: impl Into<String>) -> Self {
        Self {
            xml_report: xml_report.into(),
            log_stream: log_stream.into(),
        }
    }

    pub fn has_report(&self) -> bool {
        !self.xml_report.trim().is_empty()
    }
}

// ── Pool entry ──────────────────────────────────────────────────────

/// Payload of a pool entry. The status is duplicated in the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    #[serde(rename = "REQUEST_TICKET_KEY")]
    pub request_ticket_key: String,
    #[serde(rename = "STATUS")]
    pub status: PoolStatus,
    #[serde(rename = "INSTANCE_TYPE")]
    pub resource_class: ResourceClass,
    #[serde(rename = "JOB_TYPE")]
    pub job_type: JobType,
    #[serde(rename = "EXECUTOR_ID", default)]
    pub executor_id: String,
    #[serde(rename = "INSTANCES_NUM")]
    pub num_instances: u32,
    #[serde(rename = "UPDATED_AT")]
    pub updated_at: DateTime<Utc>,
    /// Inline copy of the bundle; only present in terminal states.
    #[serde(rename = "LOGS", default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<LogBundle>,
    /// Where the bundle was uploaded; only present in terminal states.
    #[serde(rename = "LOG_BUNDLE", default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<BundlePointer>,
}

impl PoolEntry {
    /// Build the initial `preparing` entry for a ticket.
    pub fn preparing(ticket: &RequestTicket, now: DateTime<Utc>) -> Self {
        Self {
            request_ticket_key: crate::keys::ticket_key(&ticket.ticket_name),
            status: PoolStatus::Preparing,
            resource_class: ticket.resource_class.clone(),
            job_type: ticket.job_type,
            executor_id: String::new(),
            num_instances: ticket.num_instances,
            updated_at: now,
            logs: None,
            bundle: None,
        }
    }

    /// Copy of this entry moved to `status`.
    pub fn advanced(&self, status: PoolStatus, now: DateTime<Utc>) -> Self {
        Self {
            status,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Copy of this entry moved to a terminal status with its bundle.
    pub fn terminal(
        &self,
        status: FinalStatus,
        bundle: LogBundle,
        pointer: BundlePointer,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status: status.into(),
            updated_at: now,
            logs: Some(bundle),
            bundle: Some(pointer),
            ..self.clone()
        }
    }
}

// ── Messages ────────────────────────────────────────────────────────

/// Completion pointer posted by an executor to the requester's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub ticket_name: TicketName,
    pub bundle_pointer: BundlePointer,
    pub status: FinalStatus,
}

/// Request for the external provisioner to launch one executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub ticket_name: TicketName,
    pub ticket_key: String,
    pub resource_class: ResourceClass,
    pub job_type: JobType,
    pub num_instances: u32,
    pub image_ref: String,
    pub response_queue_url: String,
    /// Opaque id the provisioner hands to the executor as `EXECUTOR_ID`.
    pub dispatch_id: String,
}

impl DispatchEvent {
    pub fn for_ticket(ticket: &RequestTicket, dispatch_id: String) -> Self {
        Self {
            ticket_name: ticket.ticket_name.clone(),
            ticket_key: crate::keys::ticket_key(&ticket.ticket_name),
            resource_class: ticket.resource_class.clone(),
            job_type: ticket.job_type,
            num_instances: ticket.num_instances,
            image_ref: ticket.image_ref.clone(),
            response_queue_url: ticket.response_queue_url.clone(),
            dispatch_id,
        }
    }
}
