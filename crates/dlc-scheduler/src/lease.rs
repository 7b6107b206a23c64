//! Leader lease stored at `leases/scheduler`.
//!
//! Only the holder runs admission, dispatch, expiry and reaping. The lease
//! is taken with a create-only put and renewed or stolen (once expired) with
//! a compare-and-swap on the object version, so two replicas can never both
//! believe they hold an unexpired lease written by the same store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dlc_core::keys::LEASE_KEY;
use dlc_store::{StoreError, TicketStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::SchedulerResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LeaderLease {
    store: TicketStore,
    holder: String,
    ttl: Duration,
    held: bool,
}

impl LeaderLease {
    pub fn new(store: TicketStore, holder: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            holder: holder.into(),
            ttl,
            held: false,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Whether the last acquire attempt succeeded.
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Acquire or renew the lease as of `now`.
    pub async fn acquire(&mut self, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let record = LeaseRecord {
            holder: self.holder.clone(),
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        let current = match self.store.get_json::<LeaseRecord>(LEASE_KEY).await {
            Ok(current) => current,
            Err(StoreError::Deserialize { reason, .. }) => {
                warn!(%reason, "lease record unreadable, overwriting");
                let version = self.store.objects().head(LEASE_KEY).await?.map(|m| m.version);
                return self.write(&record, version).await;
            }
            Err(e) => return Err(e.into()),
        };

        match current {
            None => self.write(&record, None).await,
            Some((existing, meta)) => {
                if existing.holder == self.holder || existing.expires_at <= now {
                    if existing.holder != self.holder {
                        info!(
                            previous = %existing.holder,
                            holder = %self.holder,
                            "taking over expired scheduler lease"
                        );
                    }
                    self.write(&record, Some(meta.version)).await
                } else {
                    if self.held {
                        warn!(holder = %existing.holder, "scheduler lease lost");
                    }
                    debug!(holder = %existing.holder, "scheduler lease held elsewhere");
                    self.held = false;
                    Ok(false)
                }
            }
        }
    }

    async fn write(&mut self, record: &LeaseRecord, version: Option<u64>) -> SchedulerResult<bool> {
        let written = match version {
            None => self.store.put_json_if_absent(LEASE_KEY, record).await?,
            Some(v) => self.store.put_json_if_version(LEASE_KEY, record, v).await?,
        };
        let won = written.is_some();
        if won && !self.held {
            info!(holder = %self.holder, "scheduler lease acquired");
        }
        self.held = won;
        Ok(won)
    }

    /// Give the lease up so another replica can take over immediately.
    pub async fn release(&mut self) -> SchedulerResult<()> {
        if !self.held {
            return Ok(());
        }
        if let Some((existing, meta)) = self.store.get_json::<LeaseRecord>(LEASE_KEY).await?
            && existing.holder == self.holder
        {
            let expired = LeaseRecord {
                holder: self.holder.clone(),
                expires_at: DateTime::<Utc>::default(),
            };
            self.store
                .put_json_if_version(LEASE_KEY, &expired, meta.version)
                .await?;
            info!(holder = %self.holder, "scheduler lease released");
        }
        self.held = false;
        Ok(())
    }
}
