//! In-memory backends.
//!
//! Both backends are `Clone` (shared state behind `Arc`) so tests can hand
//! the same store to a requester, a scheduler and an executor. They also
//! support fault injection to exercise the retry and abandon-tick paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::object::{MessageQueue, Object, ObjectMeta, ObjectStore, ReceivedMessage};

const URL_SCHEME: &str = "memory://queues/";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared switch used by both backends to simulate outages.
#[derive(Debug, Default)]
struct Faults {
    offline: AtomicBool,
    fail_next: AtomicU32,
}

impl Faults {
    fn check(&self, op: &str) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{op}: backend offline")));
        }
        let took = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(StoreError::Unavailable(format!("{op}: injected failure")));
        }
        Ok(())
    }
}

// ── Object store ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    version: u64,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, key: &str) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            version: self.version,
            size: self.data.len() as u64,
            last_modified: self.last_modified,
        }
    }
}

/// Object store kept in a `BTreeMap`; listing order is key order.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<BTreeMap<String, StoredObject>>>,
    next_version: Arc<AtomicU64>,
    faults: Arc<Faults>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.faults.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of stored objects (test helper).
    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite an object's modification time (test helper for ageing).
    pub fn set_last_modified(&self, key: &str, at: DateTime<Utc>) -> bool {
        match lock(&self.objects).get_mut(key) {
            Some(obj) => {
                obj.last_modified = at;
                true
            }
            None => false,
        }
    }

    fn store(&self, map: &mut BTreeMap<String, StoredObject>, key: &str, data: Vec<u8>) -> ObjectMeta {
        let obj = StoredObject {
            data,
            version: self.next_version.fetch_add(1, Ordering::SeqCst) + 1,
            last_modified: Utc::now(),
        };
        let meta = obj.meta(key);
        map.insert(key.to_string(), obj);
        meta
    }
}

fn check_key(key: &str) -> StoreResult<()> {
    if key.is_empty() || key.starts_with('/') {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> StoreResult<ObjectMeta> {
        self.faults.check("put")?;
        check_key(key)?;
        let mut map = lock(&self.objects);
        Ok(self.store(&mut map, key, data))
    }

    async fn put_if_absent(&self, key: &str, data: Vec<u8>) -> StoreResult<Option<ObjectMeta>> {
        self.faults.check("put_if_absent")?;
        check_key(key)?;
        let mut map = lock(&self.objects);
        if map.contains_key(key) {
            return Ok(None);
        }
        Ok(Some(self.store(&mut map, key, data)))
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: Vec<u8>,
        version: u64,
    ) -> StoreResult<Option<ObjectMeta>> {
        self.faults.check("put_if_version")?;
        check_key(key)?;
        let mut map = lock(&self.objects);
        match map.get(key) {
            Some(current) if current.version == version => Ok(Some(self.store(&mut map, key, data))),
            _ => Ok(None),
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Object>> {
        self.faults.check("get")?;
        let map = lock(&self.objects);
        Ok(map.get(key).map(|obj| Object {
            meta: obj.meta(key),
            data: obj.data.clone(),
        }))
    }

    async fn head(&self, key: &str) -> StoreResult<Option<ObjectMeta>> {
        self.faults.check("head")?;
        Ok(lock(&self.objects).get(key).map(|obj| obj.meta(key)))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectMeta>> {
        self.faults.check("list")?;
        let map = lock(&self.objects);
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, obj)| obj.meta(k))
            .collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.faults.check("delete")?;
        Ok(lock(&self.objects).remove(key).is_some())
    }
}

// ── Message queue ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct QueuedMessage {
    body: String,
}

#[derive(Debug, Default)]
struct QueueState {
    visible: VecDeque<QueuedMessage>,
    in_flight: HashMap<String, (QueuedMessage, Instant)>,
}

impl QueueState {
    /// Return messages whose visibility timeout has lapsed.
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some((msg, _)) = self.in_flight.remove(&receipt) {
                self.visible.push_front(msg);
            }
        }
    }
}

/// Message queue kept in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
    notify: Arc<Notify>,
    faults: Arc<Faults>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fail_next(&self, n: u32) {
        self.faults.fail_next.store(n, Ordering::SeqCst);
    }

    /// Visible plus in-flight messages of a queue (test helper).
    pub fn depth(&self, url: &str) -> usize {
        lock(&self.queues)
            .get(url)
            .map(|q| q.visible.len() + q.in_flight.len())
            .unwrap_or(0)
    }

    fn try_take(
        &self,
        url: &str,
        max: usize,
        visibility: Duration,
    ) -> StoreResult<Vec<ReceivedMessage>> {
        let mut queues = lock(&self.queues);
        let queue = queues
            .get_mut(url)
            .ok_or_else(|| StoreError::QueueNotFound(url.to_string()))?;
        let now = Instant::now();
        queue.requeue_expired(now);

        let mut taken = Vec::new();
        while taken.len() < max {
            let Some(msg) = queue.visible.pop_front() else {
                break;
            };
            let receipt = Uuid::new_v4().to_string();
            taken.push(ReceivedMessage {
                receipt: receipt.clone(),
                body: msg.body.clone(),
            });
            queue.in_flight.insert(receipt, (msg, now + visibility));
        }
        Ok(taken)
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn create_queue(&self, name: &str) -> StoreResult<String> {
        self.faults.check("create_queue")?;
        crate::fs::check_queue_name(name)?;
        let url = format!("{URL_SCHEME}{name}");
        lock(&self.queues).entry(url.clone()).or_default();
        debug!(%url, "queue ready");
        Ok(url)
    }

    async fn delete_queue(&self, url: &str) -> StoreResult<()> {
        self.faults.check("delete_queue")?;
        lock(&self.queues).remove(url);
        Ok(())
    }

    async fn send(&self, url: &str, body: String) -> StoreResult<()> {
        self.faults.check("send")?;
        {
            let mut queues = lock(&self.queues);
            let queue = queues
                .get_mut(url)
                .ok_or_else(|| StoreError::QueueNotFound(url.to_string()))?;
            queue.visible.push_back(QueuedMessage { body });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        url: &str,
        max: usize,
        wait: Duration,
        visibility: Duration,
    ) -> StoreResult<Vec<ReceivedMessage>> {
        self.faults.check("receive")?;
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before checking so a concurrent send is not missed.
            let notified = self.notify.notified();
            let taken = self.try_take(url, max, visibility)?;
            if !taken.is_empty() {
                return Ok(taken);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            // Wake periodically so expired in-flight messages are noticed.
            let nap = (deadline - now).min(Duration::from_millis(50));
            let _ = tokio::time::timeout(nap, notified).await;
        }
    }

    async fn delete_message(&self, url: &str, receipt: &str) -> StoreResult<bool> {
        self.faults.check("delete_message")?;
        let mut queues = lock(&self.queues);
        let queue = queues
            .get_mut(url)
            .ok_or_else(|| StoreError::QueueNotFound(url.to_string()))?;
        Ok(queue.in_flight.remove(receipt).is_some())
    }

    async fn release(&self, url: &str, receipt: &str) -> StoreResult<bool> {
        self.faults.check("release")?;
        let released = {
            let mut queues = lock(&self.queues);
            let queue = queues
                .get_mut(url)
                .ok_or_else(|| StoreError::QueueNotFound(url.to_string()))?;
            match queue.in_flight.remove(receipt) {
                Some((msg, _)) => {
                    queue.visible.push_back(msg);
                    true
                }
                None => false,
            }
        };
        if released {
            self.notify.notify_waiters();
        }
        Ok(released)
    }
}
