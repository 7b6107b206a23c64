//! TicketStore: typed access to the ticket bucket.
//!
//! Wraps a raw [`ObjectStore`] with the key schema from `dlc_core::keys`,
//! JSON (de)serialization and the retry policy. Every role goes through
//! this façade; none of them builds keys by hand.
//!
//! # Pool replace protocol
//!
//! ```text
//!   pool/{bucket}/{t}#{n}-preparing      (old)
//!            │  put new key
//!            ▼
//!   pool/{bucket}/{t}#{n}-running        (new)   ← both visible briefly
//!            │  delete old key
//!            ▼
//!   pool/{bucket}/{t}#{n}-running
//! ```
//!
//! There is never a window in which neither key is visible.

use std::sync::Arc;

use chrono::Utc;
use dlc_core::keys::{self, FailureReason};
use dlc_core::{BundlePointer, JobType, LogBundle, PoolEntry, PoolKey, RequestTicket};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::object::{Object, ObjectMeta, ObjectStore};
use crate::pool::{PoolRecord, PoolView};
use crate::retry::RetryPolicy;

#[derive(Clone)]
pub struct TicketStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    retry: RetryPolicy,
}

impl std::fmt::Debug for TicketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketStore")
            .field("bucket", &self.bucket)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn to_json<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialize(e.to_string()))
}

fn from_json<T: DeserializeOwned>(key: &str, data: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(data).map_err(|e| StoreError::Deserialize {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

impl TicketStore {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            retry,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    // ── Raw access with retries ────────────────────────────────────

    async fn get_raw(&self, key: &str) -> StoreResult<Option<Object>> {
        let store = self.store.as_ref();
        self.retry.run("get", || store.get(key)).await
    }

    async fn list_raw(&self, prefix: &str) -> StoreResult<Vec<ObjectMeta>> {
        let store = self.store.as_ref();
        self.retry.run("list", || store.list(prefix)).await
    }

    async fn put_raw(&self, key: &str, data: Vec<u8>) -> StoreResult<ObjectMeta> {
        let store = self.store.as_ref();
        self.retry.run("put", || store.put(key, data.clone())).await
    }

    async fn put_if_absent_raw(&self, key: &str, data: Vec<u8>) -> StoreResult<Option<ObjectMeta>> {
        let store = self.store.as_ref();
        self.retry
            .run("put_if_absent", || store.put_if_absent(key, data.clone()))
            .await
    }

    async fn delete_raw(&self, key: &str) -> StoreResult<bool> {
        let store = self.store.as_ref();
        self.retry.run("delete", || store.delete(key)).await
    }

    // ── Generic JSON records ───────────────────────────────────────

    /// Fetch and decode a JSON object together with its metadata.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> StoreResult<Option<(T, ObjectMeta)>> {
        match self.get_raw(key).await? {
            Some(obj) => Ok(Some((from_json(key, &obj.data)?, obj.meta))),
            None => Ok(None),
        }
    }

    pub async fn put_json_if_absent<T: Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> StoreResult<Option<ObjectMeta>> {
        self.put_if_absent_raw(key, to_json(value)?).await
    }

    pub async fn put_json_if_version<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        version: u64,
    ) -> StoreResult<Option<ObjectMeta>> {
        let data = to_json(value)?;
        let store = self.store.as_ref();
        self.retry
            .run("put_if_version", || {
                store.put_if_version(key, data.clone(), version)
            })
            .await
    }

    // ── Tickets ────────────────────────────────────────────────────

    /// Publish a new request ticket. Ticket names are never reused.
    pub async fn put_ticket(&self, ticket: &RequestTicket) -> StoreResult<()> {
        keys::validate_ticket_name(&ticket.ticket_name)
            .map_err(|e| StoreError::InvalidKey(e.to_string()))?;
        let key = keys::ticket_key(&ticket.ticket_name);
        match self.put_if_absent_raw(&key, to_json(ticket)?).await? {
            Some(_) => {
                debug!(%key, "ticket stored");
                Ok(())
            }
            None => Err(StoreError::AlreadyExists(key)),
        }
    }

    pub async fn get_ticket(&self, ticket_name: &str) -> StoreResult<Option<RequestTicket>> {
        Ok(self
            .get_json(&keys::ticket_key(ticket_name))
            .await?
            .map(|(ticket, _)| ticket))
    }

    /// Ticket payload as stored, without decoding.
    pub async fn get_ticket_raw(&self, ticket_name: &str) -> StoreResult<Option<Object>> {
        self.get_raw(&keys::ticket_key(ticket_name)).await
    }

    /// Metadata of every object under `tickets/`.
    pub async fn list_tickets(&self) -> StoreResult<Vec<ObjectMeta>> {
        self.list_raw(keys::TICKETS_PREFIX).await
    }

    pub async fn list_ticket_names(&self) -> StoreResult<Vec<String>> {
        Ok(self
            .list_tickets()
            .await?
            .into_iter()
            .filter_map(|meta| {
                keys::ticket_name_from_key(&meta.key)
                    .ok()
                    .map(str::to_string)
            })
            .collect())
    }

    pub async fn delete_ticket(&self, ticket_name: &str) -> StoreResult<bool> {
        self.delete_raw(&keys::ticket_key(ticket_name)).await
    }

    // ── Quarantine and dead letter ─────────────────────────────────

    /// Move a ticket that can never be admitted to `tickets-bad/`.
    pub async fn quarantine(
        &self,
        ticket_name: &str,
        raw: Vec<u8>,
        reason: FailureReason,
    ) -> StoreResult<()> {
        let key = keys::quarantine_key(ticket_name, reason);
        self.put_raw(&key, raw).await?;
        self.delete_ticket(ticket_name).await?;
        info!(ticket = %ticket_name, %reason, "ticket quarantined");
        Ok(())
    }

    /// Move a ticket that waited too long to `dead-letter/`.
    pub async fn dead_letter(
        &self,
        ticket_name: &str,
        raw: Vec<u8>,
        reason: FailureReason,
    ) -> StoreResult<()> {
        let key = keys::dead_letter_key(ticket_name, reason);
        self.put_raw(&key, raw).await?;
        self.delete_ticket(ticket_name).await?;
        info!(ticket = %ticket_name, %reason, "ticket dead-lettered");
        Ok(())
    }

    /// Why a ticket was set aside, if it was.
    pub async fn find_failure(&self, ticket_name: &str) -> StoreResult<Option<FailureReason>> {
        for prefix in [keys::QUARANTINE_PREFIX, keys::DEAD_LETTER_PREFIX] {
            let listing = self.list_raw(&format!("{prefix}{ticket_name}-")).await?;
            for meta in listing {
                if let Some((name, reason)) = keys::parse_failure_key(&meta.key)
                    && name == ticket_name
                {
                    return Ok(Some(reason));
                }
            }
        }
        Ok(None)
    }

    // ── Pool ───────────────────────────────────────────────────────

    /// Decoded pool keys under `prefix`. Keys that do not parse are skipped.
    pub async fn list_pool(&self, prefix: &str) -> StoreResult<Vec<PoolRecord>> {
        let listing = self.list_raw(prefix).await?;
        Ok(listing
            .into_iter()
            .filter_map(|meta| match PoolKey::parse(&meta.key) {
                Ok(key) => Some(PoolRecord { key, meta }),
                Err(e) => {
                    warn!(key = %meta.key, error = %e, "ignoring malformed pool key");
                    None
                }
            })
            .collect())
    }

    pub async fn pool_view(&self) -> StoreResult<PoolView> {
        Ok(PoolView::build(self.list_pool(keys::POOL_PREFIX).await?))
    }

    /// Every pool entry of one ticket, any status.
    pub async fn ticket_pool_entries(
        &self,
        resource_class: &str,
        job_type: JobType,
        ticket_name: &str,
    ) -> StoreResult<Vec<PoolRecord>> {
        self.list_pool(&keys::pool_ticket_prefix(resource_class, job_type, ticket_name))
            .await
    }

    /// The authoritative (most advanced) pool entry of one ticket.
    pub async fn current_pool_entry(
        &self,
        resource_class: &str,
        job_type: JobType,
        ticket_name: &str,
    ) -> StoreResult<Option<PoolRecord>> {
        let records = self
            .ticket_pool_entries(resource_class, job_type, ticket_name)
            .await?;
        Ok(PoolView::build(records).current(ticket_name).cloned())
    }

    pub async fn get_pool_entry(&self, key: &PoolKey) -> StoreResult<Option<(PoolEntry, ObjectMeta)>> {
        self.get_json(&key.to_key()).await
    }

    /// Create-only write of a pool entry. Returns false if the key exists.
    pub async fn create_pool_entry(&self, key: &PoolKey, entry: &PoolEntry) -> StoreResult<bool> {
        let created = self.put_json_if_absent(&key.to_key(), entry).await?.is_some();
        if created {
            debug!(key = %key, "pool entry created");
        }
        Ok(created)
    }

    /// Move a pool entry to `entry.status`: put the new key, then delete the
    /// old one. Back-transitions are refused.
    pub async fn replace_pool_entry(&self, old: &PoolKey, entry: &PoolEntry) -> StoreResult<PoolKey> {
        if !old.status.can_advance_to(entry.status) {
            return Err(StoreError::InvalidTransition {
                ticket: old.ticket_name.clone(),
                from: old.status,
                to: entry.status,
            });
        }
        let new = old.with_status(entry.status);
        self.put_raw(&new.to_key(), to_json(entry)?).await?;
        self.delete_raw(&old.to_key()).await?;
        info!(
            ticket = %old.ticket_name,
            from = %old.status,
            to = %new.status,
            "pool entry replaced"
        );
        Ok(new)
    }

    pub async fn delete_pool_entry(&self, key: &PoolKey) -> StoreResult<bool> {
        self.delete_raw(&key.to_key()).await
    }

    // ── Admission claims ───────────────────────────────────────────

    /// Claim a ticket for admission. Exactly one caller wins per ticket.
    pub async fn claim(&self, ticket_name: &str, holder: &str) -> StoreResult<bool> {
        let body = serde_json::json!({ "holder": holder, "claimed_at": Utc::now() });
        Ok(self
            .put_json_if_absent(&keys::claim_key(ticket_name), &body)
            .await?
            .is_some())
    }

    pub async fn release_claim(&self, ticket_name: &str) -> StoreResult<bool> {
        self.delete_raw(&keys::claim_key(ticket_name)).await
    }

    /// Outstanding claims as `(ticket_name, meta)`.
    pub async fn list_claims(&self) -> StoreResult<Vec<(String, ObjectMeta)>> {
        let listing = self.list_raw(keys::CLAIMS_PREFIX).await?;
        Ok(listing
            .into_iter()
            .filter_map(|meta| {
                let name = meta.key.strip_prefix(keys::CLAIMS_PREFIX)?.to_string();
                Some((name, meta))
            })
            .collect())
    }

    // ── Log bundles ────────────────────────────────────────────────

    pub async fn put_bundle(&self, ticket_name: &str, bundle: &LogBundle) -> StoreResult<BundlePointer> {
        let key = keys::bundle_key(ticket_name);
        self.put_raw(&key, to_json(bundle)?).await?;
        debug!(%key, "log bundle uploaded");
        Ok(BundlePointer {
            bucket: self.bucket.clone(),
            key,
        })
    }

    /// Upload `bundle` unless the ticket already has one. Returns the pointer
    /// and whichever bundle ends up stored.
    pub async fn put_bundle_if_absent(
        &self,
        ticket_name: &str,
        bundle: &LogBundle,
    ) -> StoreResult<(BundlePointer, LogBundle)> {
        let key = keys::bundle_key(ticket_name);
        let pointer = BundlePointer {
            bucket: self.bucket.clone(),
            key: key.clone(),
        };
        if self.put_json_if_absent(&key, bundle).await?.is_some() {
            debug!(%key, "log bundle uploaded");
            return Ok((pointer, bundle.clone()));
        }
        match self.get_json::<LogBundle>(&key).await? {
            Some((existing, _)) => {
                debug!(%key, "log bundle already present, keeping it");
                Ok((pointer, existing))
            }
            // Deleted between the two calls; nothing left to protect.
            None => Ok((self.put_bundle(ticket_name, bundle).await?, bundle.clone())),
        }
    }

    /// Fetch a bundle. An empty pointer resolves to an empty bundle.
    pub async fn get_bundle(&self, pointer: &BundlePointer) -> StoreResult<Option<LogBundle>> {
        if pointer.is_empty() {
            return Ok(Some(LogBundle::default()));
        }
        Ok(self.get_json(&pointer.key).await?.map(|(bundle, _)| bundle))
    }

    pub async fn delete_bundle(&self, ticket_name: &str) -> StoreResult<bool> {
        self.delete_raw(&keys::bundle_key(ticket_name)).await
    }
}
