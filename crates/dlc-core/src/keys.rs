//! Object-key schema of the ticket bucket.
//!
//! ```text
//! tickets/{ticket}                              request ticket
//! pool/{class}-{job_type}/{ticket}#{n}-{status} pool entry
//! logs/{ticket}/bundle                          log bundle
//! claims/{ticket}                               admission claim
//! tickets-bad/{ticket}-{reason}                 quarantined ticket
//! dead-letter/{ticket}-{reason}                 ticket never admitted in time
//! leases/scheduler                              scheduler leader lease
//! ```
//!
//! Pool keys encode the whole accounting state so a single prefix listing
//! answers "what is the status of ticket T" without fetching objects.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::types::{JobType, PoolStatus};

pub const TICKETS_PREFIX: &str = "tickets/";
pub const POOL_PREFIX: &str = "pool/";
pub const LOGS_PREFIX: &str = "logs/";
pub const CLAIMS_PREFIX: &str = "claims/";
pub const QUARANTINE_PREFIX: &str = "tickets-bad/";
pub const DEAD_LETTER_PREFIX: &str = "dead-letter/";
pub const LEASE_KEY: &str = "leases/scheduler";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key {key} is not under {prefix}")]
    WrongPrefix { key: String, prefix: &'static str },

    #[error("malformed pool key: {0}")]
    MalformedPoolKey(String),

    #[error("invalid ticket name: {0:?}")]
    InvalidTicketName(String),
}

/// Check that a ticket name is safe to embed in every key family.
pub fn validate_ticket_name(name: &str) -> Result<(), KeyError> {
    let ok = !name.is_empty()
        && name.len() <= 200
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(KeyError::InvalidTicketName(name.to_string()))
    }
}

pub fn ticket_key(ticket_name: &str) -> String {
    format!("{TICKETS_PREFIX}{ticket_name}")
}

/// Extract the ticket name from a `tickets/{name}` key.
pub fn ticket_name_from_key(key: &str) -> Result<&str, KeyError> {
    key.strip_prefix(TICKETS_PREFIX)
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
        .ok_or_else(|| KeyError::WrongPrefix {
            key: key.to_string(),
            prefix: TICKETS_PREFIX,
        })
}

pub fn bucket_id(resource_class: &str, job_type: JobType) -> String {
    format!("{resource_class}-{job_type}")
}

pub fn pool_bucket_prefix(resource_class: &str, job_type: JobType) -> String {
    format!("{POOL_PREFIX}{}/", bucket_id(resource_class, job_type))
}

/// Prefix matching every pool entry of one ticket (any status).
pub fn pool_ticket_prefix(resource_class: &str, job_type: JobType, ticket_name: &str) -> String {
    format!("{}{ticket_name}#", pool_bucket_prefix(resource_class, job_type))
}

pub fn bundle_key(ticket_name: &str) -> String {
    format!("{LOGS_PREFIX}{ticket_name}/bundle")
}

pub fn claim_key(ticket_name: &str) -> String {
    format!("{CLAIMS_PREFIX}{ticket_name}")
}

pub fn quarantine_key(ticket_name: &str, reason: FailureReason) -> String {
    format!("{QUARANTINE_PREFIX}{ticket_name}-{reason}")
}

pub fn dead_letter_key(ticket_name: &str, reason: FailureReason) -> String {
    format!("{DEAD_LETTER_PREFIX}{ticket_name}-{reason}")
}

/// Parse `{prefix}{ticket}-{reason}` into its parts.
pub fn parse_failure_key(key: &str) -> Option<(&str, FailureReason)> {
    let rest = key
        .strip_prefix(QUARANTINE_PREFIX)
        .or_else(|| key.strip_prefix(DEAD_LETTER_PREFIX))?;
    let (name, reason) = rest.rsplit_once('-')?;
    Some((name, reason.parse().ok()?))
}

// ── Failure reasons ─────────────────────────────────────────────────

/// Why a ticket left the queue without being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// The ticket payload could not be parsed.
    Malformed,
    /// `num_instances` exceeds the cap of its resource class.
    ExceedsCap,
    /// No cap is configured for the resource class.
    UnknownResourceClass,
    /// The ticket waited longer than its timeout limit.
    Timeout,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Malformed => "malformed",
            FailureReason::ExceedsCap => "exceedsCap",
            FailureReason::UnknownResourceClass => "unknownResourceClass",
            FailureReason::Timeout => "timeout",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "malformed" => Ok(FailureReason::Malformed),
            "exceedsCap" => Ok(FailureReason::ExceedsCap),
            "unknownResourceClass" => Ok(FailureReason::UnknownResourceClass),
            "timeout" => Ok(FailureReason::Timeout),
            other => Err(KeyError::MalformedPoolKey(other.to_string())),
        }
    }
}

// ── Pool keys ───────────────────────────────────────────────────────

/// Decoded form of `pool/{class}-{job_type}/{ticket}#{n}-{status}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub resource_class: String,
    pub job_type: JobType,
    pub ticket_name: String,
    pub num_instances: u32,
    pub status: PoolStatus,
}

impl PoolKey {
    pub fn bucket_id(&self) -> String {
        bucket_id(&self.resource_class, self.job_type)
    }

    /// Same ticket and consumption, different status.
    pub fn with_status(&self, status: PoolStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    pub fn to_key(&self) -> String {
        format!(
            "{}{}#{}-{}",
            pool_bucket_prefix(&self.resource_class, self.job_type),
            self.ticket_name,
            self.num_instances,
            self.status
        )
    }

    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let malformed = || KeyError::MalformedPoolKey(key.to_string());

        let rest = key.strip_prefix(POOL_PREFIX).ok_or(KeyError::WrongPrefix {
            key: key.to_string(),
            prefix: POOL_PREFIX,
        })?;
        let (bucket, entry) = rest.split_once('/').ok_or_else(malformed)?;
        // Resource classes may contain '-', job types never do.
        let (resource_class, job_type) = bucket.rsplit_once('-').ok_or_else(malformed)?;
        let job_type: JobType = job_type.parse().map_err(|_| malformed())?;
        let (ticket_name, tail) = entry.rsplit_once('#').ok_or_else(malformed)?;
        let (num, status) = tail.split_once('-').ok_or_else(malformed)?;
        let num_instances: u32 = num.parse().map_err(|_| malformed())?;
        let status: PoolStatus = status.parse().map_err(|_| malformed())?;

        if resource_class.is_empty() || ticket_name.is_empty() || num_instances == 0 {
            return Err(malformed());
        }

        Ok(Self {
            resource_class: resource_class.to_string(),
            job_type,
            ticket_name: ticket_name.to_string(),
            num_instances,
            status,
        })
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_key_round_trips_through_string() {
        let key = PoolKey {
            resource_class: "ml.p3.8xlarge".to_string(),
            job_type: JobType::Training,
            ticket_name: "pr00042-0a1b_20240101T000000000Z".to_string(),
            num_instances: 2,
            status: PoolStatus::RuntimeError,
        };
        let s = key.to_key();
        assert_eq!(
            s,
            "pool/ml.p3.8xlarge-training/pr00042-0a1b_20240101T000000000Z#2-runtimeError"
        );
        assert_eq!(PoolKey::parse(&s).unwrap(), key);
    }

    #[test]
    fn pool_key_allows_hyphenated_resource_class() {
        let parsed = PoolKey::parse("pool/gpu-a100-inference/t1#1-running").unwrap();
        assert_eq!(parsed.resource_class, "gpu-a100");
        assert_eq!(parsed.job_type, JobType::Inference);
        assert_eq!(parsed.status, PoolStatus::Running);
    }

    #[test]
    fn pool_key_rejects_garbage() {
        assert!(PoolKey::parse("tickets/t1").is_err());
        assert!(PoolKey::parse("pool/a-training/t1").is_err());
        assert!(PoolKey::parse("pool/a-training/t1#x-running").is_err());
        assert!(PoolKey::parse("pool/a-training/t1#0-running").is_err());
        assert!(PoolKey::parse("pool/a-cooking/t1#1-running").is_err());
        assert!(PoolKey::parse("pool/a-training/t1#1-failed").is_err());
    }

    #[test]
    fn ticket_prefix_does_not_match_longer_names() {
        let prefix = pool_ticket_prefix("a", JobType::Training, "t1");
        assert!(PoolKey {
            resource_class: "a".to_string(),
            job_type: JobType::Training,
            ticket_name: "t1".to_string(),
            num_instances: 1,
            status: PoolStatus::Preparing,
        }
        .to_key()
        .starts_with(&prefix));
        assert!(!"pool/a-training/t10#1-preparing".starts_with(&prefix));
    }

    #[test]
    fn failure_keys_parse_back() {
        let key = quarantine_key("pr1-abc_2024", FailureReason::ExceedsCap);
        assert_eq!(key, "tickets-bad/pr1-abc_2024-exceedsCap");
        assert_eq!(
            parse_failure_key(&key),
            Some(("pr1-abc_2024", FailureReason::ExceedsCap))
        );
        let key = dead_letter_key("t9", FailureReason::Timeout);
        assert_eq!(parse_failure_key(&key), Some(("t9", FailureReason::Timeout)));
        assert_eq!(parse_failure_key("tickets/t9"), None);
    }

    #[test]
    fn ticket_names_are_validated() {
        assert!(validate_ticket_name("pr00001-ab_2024").is_ok());
        assert!(validate_ticket_name("").is_err());
        assert!(validate_ticket_name("a/b").is_err());
        assert!(validate_ticket_name("a#1").is_err());
        assert!(ticket_name_from_key("tickets/x").is_ok());
        assert!(ticket_name_from_key("tickets/").is_err());
        assert!(ticket_name_from_key("pool/x").is_err());
    }
}
