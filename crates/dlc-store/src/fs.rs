//! Directory-tree backends shared by every process that mounts the root.
//!
//! # Layout
//!
//! ```text
//! {root}/objects/{key}                    "v{version}\n" + payload
//! {root}/objects/{key}.lock               writer lock (create_new)
//! {root}/queues/{name}/ready/{seq}.json   visible messages
//! {root}/queues/{name}/inflight/{deadline_ms}~{seq}.json
//! ```
//!
//! Conditional writes hold the per-key lock file while they compare and
//! write; the payload is written to a temp file and renamed into place so
//! readers never observe a partial object. Queue receives claim a message
//! by renaming it into `inflight/`, which is atomic on a single filesystem.

use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{StoreError, StoreResult};
use crate::object::{MessageQueue, Object, ObjectMeta, ObjectStore, ReceivedMessage};

const LOCK_SUFFIX: &str = ".lock";
const TMP_MARKER: &str = ".tmp-";
const STALE_LOCK: Duration = Duration::from_secs(10);
const LOCK_RETRY: Duration = Duration::from_millis(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const URL_SCHEME: &str = "fs://";

/// Run blocking filesystem work off the async runtime.
async fn blocking<T, F>(f: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StoreResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

fn now_millis() -> u64 {
    now_nanos() / 1_000_000
}

fn is_internal_file(name: &str) -> bool {
    name.ends_with(LOCK_SUFFIX) || name.contains(TMP_MARKER)
}

fn check_key(key: &str) -> StoreResult<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|seg| {
            seg.is_empty() || seg == "." || seg == ".." || is_internal_file(seg)
        });
    if bad {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Queue names double as directory names.
pub(crate) fn check_queue_name(name: &str) -> StoreResult<()> {
    let ok = !name.is_empty()
        && name.len() <= 80
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(name.to_string()))
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Write `data` to a temp file next to `dest` and rename it into place.
fn write_atomic(dest: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = sibling(dest, &format!("{TMP_MARKER}{}", Uuid::new_v4().simple()));
    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, dest)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

// ── Key lock ────────────────────────────────────────────────────────

struct KeyLock {
    path: PathBuf,
}

impl KeyLock {
    fn acquire(target: &Path) -> io::Result<Self> {
        let path = sibling(target, LOCK_SUFFIX);
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        warn!(lock = %path.display(), "breaking stale object lock");
                        let _ = fs::remove_file(&path);
                    } else {
                        std::thread::sleep(LOCK_RETRY);
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .is_some_and(|age| age > STALE_LOCK)
}

// ── Object store ────────────────────────────────────────────────────

/// Object store rooted at `{root}/objects`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    objects: Arc<PathBuf>,
}

struct StoredFile {
    version: u64,
    data: Vec<u8>,
    last_modified: DateTime<Utc>,
}

impl FsObjectStore {
    pub fn open(root: &Path) -> StoreResult<Self> {
        let objects = root.join("objects");
        fs::create_dir_all(&objects)?;
        debug!(root = %root.display(), "filesystem object store opened");
        Ok(Self {
            objects: Arc::new(objects),
        })
    }

    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        check_key(key)?;
        Ok(self.objects.join(key))
    }

    fn read_file(path: &Path, key: &str) -> StoreResult<Option<StoredFile>> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let last_modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let corrupt = |reason: &str| StoreError::Deserialize {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        let newline = raw
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| corrupt("missing version header"))?;
        let header = std::str::from_utf8(&raw[..newline]).map_err(|_| corrupt("bad header"))?;
        let version = header
            .strip_prefix('v')
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| corrupt("bad version header"))?;

        Ok(Some(StoredFile {
            version,
            data: raw[newline + 1..].to_vec(),
            last_modified,
        }))
    }

    /// Write under an already-held lock.
    fn write_locked(
        path: &Path,
        key: &str,
        previous: Option<u64>,
        data: &[u8],
    ) -> StoreResult<ObjectMeta> {
        let version = now_nanos().max(previous.map_or(0, |v| v + 1));
        let mut buf = format!("v{version}\n").into_bytes();
        buf.extend_from_slice(data);
        write_atomic(path, &buf)?;
        Ok(ObjectMeta {
            key: key.to_string(),
            version,
            size: data.len() as u64,
            last_modified: Utc::now(),
        })
    }

    fn conditional_put(
        &self,
        key: &str,
        data: Vec<u8>,
        condition: Condition,
    ) -> StoreResult<Option<ObjectMeta>> {
        let path = self.path_for(key)?;
        let _lock = KeyLock::acquire(&path)?;
        let current = Self::read_file(&path, key)?.map(|f| f.version);
        let allowed = match condition {
            Condition::Always => true,
            Condition::Absent => current.is_none(),
            Condition::Version(v) => current == Some(v),
        };
        if !allowed {
            return Ok(None);
        }
        Self::write_locked(&path, key, current, &data).map(Some)
    }

    fn list_blocking(&self, prefix: &str) -> StoreResult<Vec<ObjectMeta>> {
        // Only walk the directory the prefix can possibly live in.
        let dir_part = prefix.rfind('/').map_or("", |i| &prefix[..=i]);
        if dir_part.split('/').any(|seg| seg == "..") {
            return Err(StoreError::InvalidKey(prefix.to_string()));
        }
        let start = self.objects.join(dir_part);
        if !start.is_dir() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for entry in WalkDir::new(&start).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                // A directory removed mid-walk by a concurrent delete.
                Err(e) if e.io_error().is_some_and(|io| io.kind() == ErrorKind::NotFound) => {
                    continue;
                }
                Err(e) => return Err(StoreError::Unavailable(e.to_string())),
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if is_internal_file(&name) {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(self.objects.as_path()) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !key.starts_with(prefix) {
                continue;
            }
            if let Some(file) = Self::read_file(entry.path(), &key)? {
                out.push(ObjectMeta {
                    key,
                    version: file.version,
                    size: file.data.len() as u64,
                    last_modified: file.last_modified,
                });
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    fn delete_blocking(&self, key: &str) -> StoreResult<bool> {
        let path = self.path_for(key)?;
        let existed = {
            let _lock = KeyLock::acquire(&path)?;
            match fs::remove_file(&path) {
                Ok(()) => true,
                Err(e) if e.kind() == ErrorKind::NotFound => false,
                Err(e) => return Err(e.into()),
            }
        };
        // Prune now-empty directories; fails harmlessly when not empty.
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.objects.as_path() || fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
        Ok(existed)
    }
}

#[derive(Debug, Clone, Copy)]
enum Condition {
    Always,
    Absent,
    Version(u64),
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> StoreResult<ObjectMeta> {
        let this = self.clone();
        let key = key.to_string();
        blocking(move || {
            this.conditional_put(&key, data, Condition::Always)?
                .ok_or_else(|| StoreError::Unavailable(format!("put {key}: write skipped")))
        })
        .await
    }

    async fn put_if_absent(&self, key: &str, data: Vec<u8>) -> StoreResult<Option<ObjectMeta>> {
        let this = self.clone();
        let key = key.to_string();
        blocking(move || this.conditional_put(&key, data, Condition::Absent)).await
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: Vec<u8>,
        version: u64,
    ) -> StoreResult<Option<ObjectMeta>> {
        let this = self.clone();
        let key = key.to_string();
        blocking(move || this.conditional_put(&key, data, Condition::Version(version))).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Object>> {
        let path = self.path_for(key)?;
        let key = key.to_string();
        blocking(move || {
            Ok(Self::read_file(&path, &key)?.map(|file| Object {
                meta: ObjectMeta {
                    key,
                    version: file.version,
                    size: file.data.len() as u64,
                    last_modified: file.last_modified,
                },
                data: file.data,
            }))
        })
        .await
    }

    async fn head(&self, key: &str) -> StoreResult<Option<ObjectMeta>> {
        Ok(self.get(key).await?.map(|obj| obj.meta))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectMeta>> {
        let this = self.clone();
        let prefix = prefix.to_string();
        blocking(move || this.list_blocking(&prefix)).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let this = self.clone();
        let key = key.to_string();
        blocking(move || this.delete_blocking(&key)).await
    }
}

// ── Message queue ───────────────────────────────────────────────────

/// Message queues rooted at `{root}/queues`.
#[derive(Debug, Clone)]
pub struct FsQueue {
    queues: Arc<PathBuf>,
}

struct QueueDirs {
    ready: PathBuf,
    inflight: PathBuf,
}

impl FsQueue {
    pub fn open(root: &Path) -> StoreResult<Self> {
        let queues = root.join("queues");
        fs::create_dir_all(&queues)?;
        Ok(Self {
            queues: Arc::new(queues),
        })
    }

    fn dirs(&self, url: &str) -> StoreResult<QueueDirs> {
        let name = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| StoreError::QueueNotFound(url.to_string()))?;
        check_queue_name(name).map_err(|_| StoreError::QueueNotFound(url.to_string()))?;
        let base = self.queues.join(name);
        let dirs = QueueDirs {
            ready: base.join("ready"),
            inflight: base.join("inflight"),
        };
        if !dirs.ready.is_dir() {
            return Err(StoreError::QueueNotFound(url.to_string()));
        }
        Ok(dirs)
    }

    /// Move in-flight messages whose deadline has passed back to `ready/`.
    fn requeue_expired(dirs: &QueueDirs) -> StoreResult<()> {
        let now = now_millis();
        for name in sorted_names(&dirs.inflight)? {
            let Some((deadline, original)) = name.split_once('~') else {
                continue;
            };
            let Ok(deadline) = deadline.parse::<u64>() else {
                continue;
            };
            if deadline <= now {
                match fs::rename(dirs.inflight.join(&name), dirs.ready.join(original)) {
                    Ok(()) => debug!(message = %original, "visibility timeout lapsed"),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    fn try_take(
        &self,
        url: &str,
        max: usize,
        visibility: Duration,
    ) -> StoreResult<Vec<ReceivedMessage>> {
        let dirs = self.dirs(url)?;
        Self::requeue_expired(&dirs)?;

        let deadline = now_millis() + visibility.as_millis() as u64;
        let mut taken = Vec::new();
        for name in sorted_names(&dirs.ready)? {
            if taken.len() >= max {
                break;
            }
            let receipt = format!("{deadline:020}~{name}");
            let claimed = dirs.inflight.join(&receipt);
            match fs::rename(dirs.ready.join(&name), &claimed) {
                Ok(()) => {}
                // Another consumer got there first.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
            let body = match fs::read_to_string(&claimed) {
                Ok(body) => body,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            taken.push(ReceivedMessage { receipt, body });
        }
        Ok(taken)
    }
}

fn sorted_names(dir: &Path) -> StoreResult<Vec<String>> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| !is_internal_file(n))
            .collect(),
        Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    names.sort();
    Ok(names)
}

fn check_receipt(receipt: &str) -> bool {
    !receipt.is_empty() && !receipt.contains('/') && receipt.contains('~')
}

#[async_trait]
impl MessageQueue for FsQueue {
    async fn create_queue(&self, name: &str) -> StoreResult<String> {
        check_queue_name(name)?;
        let base = self.queues.join(name);
        blocking(move || {
            fs::create_dir_all(base.join("ready"))?;
            fs::create_dir_all(base.join("inflight"))?;
            Ok(())
        })
        .await?;
        Ok(format!("{URL_SCHEME}{name}"))
    }

    async fn delete_queue(&self, url: &str) -> StoreResult<()> {
        let Some(name) = url.strip_prefix(URL_SCHEME) else {
            return Ok(());
        };
        if check_queue_name(name).is_err() {
            return Ok(());
        }
        let base = self.queues.join(name);
        blocking(move || match fs::remove_dir_all(&base) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn send(&self, url: &str, body: String) -> StoreResult<()> {
        let dirs = self.dirs(url)?;
        blocking(move || {
            let name = format!("{:020}-{}.json", now_nanos(), Uuid::new_v4().simple());
            write_atomic(&dirs.ready.join(name), body.as_bytes())?;
            Ok(())
        })
        .await
    }

    async fn receive(
        &self,
        url: &str,
        max: usize,
        wait: Duration,
        visibility: Duration,
    ) -> StoreResult<Vec<ReceivedMessage>> {
        let deadline = Instant::now() + wait;
        loop {
            let this = self.clone();
            let url_owned = url.to_string();
            let taken = blocking(move || this.try_take(&url_owned, max, visibility)).await?;
            if !taken.is_empty() {
                return Ok(taken);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep((deadline - now).min(POLL_INTERVAL)).await;
        }
    }

    async fn delete_message(&self, url: &str, receipt: &str) -> StoreResult<bool> {
        let dirs = self.dirs(url)?;
        if !check_receipt(receipt) {
            return Ok(false);
        }
        let path = dirs.inflight.join(receipt);
        blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn release(&self, url: &str, receipt: &str) -> StoreResult<bool> {
        let dirs = self.dirs(url)?;
        let Some((_, original)) = receipt.split_once('~').filter(|_| check_receipt(receipt))
        else {
            return Ok(false);
        };
        let from = dirs.inflight.join(receipt);
        let to = dirs.ready.join(original);
        blocking(move || match fs::rename(&from, &to) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        })
        .await
    }
}
