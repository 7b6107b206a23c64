//! Reader-side view of the resource pool.
//!
//! A pool listing may show two entries for one ticket while a replace is in
//! progress (new key written, old key not yet deleted). [`PoolView`] keeps
//! the most advanced entry per ticket as authoritative and sets the others
//! aside as superseded; only authoritative entries count against caps.

use std::collections::BTreeMap;

use dlc_core::PoolKey;

use crate::object::ObjectMeta;

/// A pool key together with the listing metadata of its object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolRecord {
    pub key: PoolKey,
    pub meta: ObjectMeta,
}

impl PoolRecord {
    /// Ordering used to pick the authoritative entry of a ticket.
    fn precedence(&self) -> (u8, chrono::DateTime<chrono::Utc>, u64) {
        (self.key.status.rank(), self.meta.last_modified, self.meta.version)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoolView {
    current: BTreeMap<String, PoolRecord>,
    superseded: Vec<PoolRecord>,
}

impl PoolView {
    pub fn build(records: impl IntoIterator<Item = PoolRecord>) -> Self {
        let mut view = PoolView::default();
        for record in records {
            match view.current.remove(&record.key.ticket_name) {
                None => {
                    view.current.insert(record.key.ticket_name.clone(), record);
                }
                Some(existing) => {
                    let (winner, loser) = if record.precedence() > existing.precedence() {
                        (record, existing)
                    } else {
                        (existing, record)
                    };
                    view.superseded.push(loser);
                    view.current.insert(winner.key.ticket_name.clone(), winner);
                }
            }
        }
        view
    }

    /// Authoritative entry of a ticket.
    pub fn current(&self, ticket_name: &str) -> Option<&PoolRecord> {
        self.current.get(ticket_name)
    }

    pub fn contains(&self, ticket_name: &str) -> bool {
        self.current.contains_key(ticket_name)
    }

    /// Authoritative entries, one per ticket, ordered by ticket name.
    pub fn entries(&self) -> impl Iterator<Item = &PoolRecord> {
        self.current.values()
    }

    /// Entries shadowed by a more advanced entry of the same ticket.
    pub fn superseded(&self) -> &[PoolRecord] {
        &self.superseded
    }

    /// Sum of `num_instances` over in-flight entries of one bucket.
    pub fn in_flight(&self, bucket_id: &str) -> u32 {
        self.entries()
            .filter(|r| r.key.status.is_in_flight() && r.key.bucket_id() == bucket_id)
            .map(|r| r.key.num_instances)
            .sum()
    }

    /// In-flight sums for every bucket that has any.
    pub fn in_flight_by_bucket(&self) -> BTreeMap<String, u32> {
        let mut sums = BTreeMap::new();
        for record in self.entries().filter(|r| r.key.status.is_in_flight()) {
            *sums.entry(record.key.bucket_id()).or_insert(0) += record.key.num_instances;
        }
        sums
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use dlc_core::{JobType, PoolStatus};

    use super::*;

    fn record(ticket: &str, class: &str, n: u32, status: PoolStatus, age_secs: i64) -> PoolRecord {
        let key = PoolKey {
            resource_class: class.to_string(),
            job_type: JobType::Training,
            ticket_name: ticket.to_string(),
            num_instances: n,
            status,
        };
        PoolRecord {
            meta: ObjectMeta {
                key: key.to_key(),
                version: 1,
                size: 0,
                last_modified: Utc::now() - Duration::seconds(age_secs),
            },
            key,
        }
    }

    #[test]
    fn more_advanced_entry_wins() {
        let view = PoolView::build([
            record("t1", "a", 1, PoolStatus::Running, 0),
            record("t1", "a", 1, PoolStatus::Preparing, 5),
        ]);
        assert_eq!(view.current("t1").unwrap().key.status, PoolStatus::Running);
        assert_eq!(view.superseded().len(), 1);
        assert_eq!(view.superseded()[0].key.status, PoolStatus::Preparing);
        assert_eq!(view.in_flight("a-training"), 1);
    }

    #[test]
    fn terminal_shadow_does_not_count() {
        let view = PoolView::build([
            record("t1", "a", 2, PoolStatus::Running, 10),
            record("t1", "a", 2, PoolStatus::Completed, 0),
            record("t2", "a", 1, PoolStatus::Preparing, 0),
            record("t3", "b", 4, PoolStatus::Running, 0),
        ]);
        assert_eq!(view.len(), 3);
        assert_eq!(view.in_flight("a-training"), 1);
        assert_eq!(view.in_flight("b-training"), 4);
        assert_eq!(view.in_flight("c-training"), 0);
        let sums = view.in_flight_by_bucket();
        assert_eq!(sums.get("a-training"), Some(&1));
        assert_eq!(sums.len(), 2);
    }

    #[test]
    fn equal_rank_prefers_newer_object() {
        let view = PoolView::build([
            record("t1", "a", 1, PoolStatus::RuntimeError, 0),
            record("t1", "a", 1, PoolStatus::Completed, 30),
        ]);
        assert_eq!(view.current("t1").unwrap().key.status, PoolStatus::RuntimeError);
    }
}
