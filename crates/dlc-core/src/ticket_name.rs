//! Ticket-name generation.
//!
//! Names look like `{prefix}-{token}_{timestamp}`: a short build-derived
//! prefix, a random 128-bit token and the creation time in UTC with
//! millisecond precision. Every character is valid in all key families.

use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";
const PREFIX_LEN: usize = 7;

/// Derive the ticket prefix from the build's source version.
///
/// `pr/1234` becomes `pr01234` (PR number modulo 100000, zero padded);
/// anything else is truncated to seven characters. Characters that are not
/// valid in keys are replaced with `_`.
pub fn ticket_name_prefix(source_version: Option<&str>) -> String {
    let source_version = source_version
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("default");

    if let Some((_, number)) = source_version.rsplit_once("pr/")
        && let Ok(n) = number.parse::<u64>()
    {
        return format!("pr{:05}", n % 100_000);
    }

    source_version
        .chars()
        .take(PREFIX_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Generate a fresh ticket name.
pub fn generate_ticket_name(prefix: &str, now: DateTime<Utc>) -> String {
    format!(
        "{prefix}-{}_{}",
        Uuid::new_v4().simple(),
        now.format(TIMESTAMP_FORMAT)
    )
}

/// Recover the creation time embedded in a ticket name.
pub fn ticket_name_timestamp(ticket_name: &str) -> Option<DateTime<Utc>> {
    let (_, stamp) = ticket_name.rsplit_once('_')?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
