//! Launch contract between the provisioner and an executor.
//!
//! The provisioner starts one executor per dispatch event and passes the
//! assignment through environment variables:
//!
//! | Variable             | Meaning                                    |
//! |----------------------|--------------------------------------------|
//! | `TICKET_KEY`         | `tickets/{ticket_name}`                    |
//! | `RESPONSE_QUEUE_URL` | where the response message goes            |
//! | `RESOURCE_CLASS`     | resource class the ticket was admitted to  |
//! | `EXECUTOR_ID`        | optional; a random id is used when absent  |

use dlc_core::{DispatchEvent, keys};
use uuid::Uuid;

use crate::error::{ExecutorError, ExecutorResult};

pub const TICKET_KEY: &str = "TICKET_KEY";
pub const RESPONSE_QUEUE_URL: &str = "RESPONSE_QUEUE_URL";
pub const RESOURCE_CLASS: &str = "RESOURCE_CLASS";
pub const EXECUTOR_ID: &str = "EXECUTOR_ID";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub ticket_key: String,
    pub response_queue_url: String,
    pub resource_class: String,
    pub executor_id: String,
}

impl LaunchSpec {
    pub fn from_env() -> ExecutorResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ExecutorResult<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ExecutorError::Launch(format!("{key} is not set")))
        };
        let spec = Self {
            ticket_key: required(TICKET_KEY)?,
            response_queue_url: required(RESPONSE_QUEUE_URL)?,
            resource_class: required(RESOURCE_CLASS)?,
            executor_id: lookup(EXECUTOR_ID)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| format!("executor-{}", Uuid::new_v4().simple())),
        };
        spec.ticket_name()?;
        Ok(spec)
    }

    /// Assignment for one dispatch event; the dispatch id doubles as the
    /// executor id.
    pub fn for_event(event: &DispatchEvent) -> Self {
        Self {
            ticket_key: event.ticket_key.clone(),
            response_queue_url: event.response_queue_url.clone(),
            resource_class: event.resource_class.clone(),
            executor_id: event.dispatch_id.clone(),
        }
    }

    /// Variables to set on a child executor process.
    pub fn to_env(&self) -> [(&'static str, &str); 4] {
        [
            (TICKET_KEY, self.ticket_key.as_str()),
            (RESPONSE_QUEUE_URL, self.response_queue_url.as_str()),
            (RESOURCE_CLASS, self.resource_class.as_str()),
            (EXECUTOR_ID, self.executor_id.as_str()),
        ]
    }

    pub fn ticket_name(&self) -> ExecutorResult<&str> {
        let name = keys::ticket_name_from_key(&self.ticket_key)
            .map_err(|e| ExecutorError::Launch(e.to_string()))?;
        keys::validate_ticket_name(name).map_err(|e| ExecutorError::Launch(e.to_string()))?;
        if name.starts_with('.') {
            return Err(ExecutorError::Launch(format!("invalid ticket name: {name:?}")));
        }
        Ok(name)
    }
}
