//! Partitioned response store.
//!
//! A store holds named partitions, each mapping a request key (method + URL)
//! to one cached response. The store is either purely in-memory or backed by
//! a directory:
//!
//! ```text
//! <dir>/<partition>/partition.json     {"name": "<partition>"}
//! <dir>/<partition>/<sha256>.json      one file per entry
//! ```
//!
//! Reads never touch the disk. Writes update memory and queue a disk
//! operation for the store's writer task while still holding the partition
//! lock, so the disk sees operations in the same order memory did and the
//! last `put` for a key wins. [`PartitionStore::flush`] waits for the queue
//! to drain.
//!
//! Deleting a partition leaves a tombstone stamped with a new
//! [`StoreEpoch`]. Writers that started before the delete pass the epoch they
//! observed to [`PartitionStore::put_unless_deleted`] and are dropped instead
//! of bringing the partition back.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use skincache_net::{Request, Response, Url};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, trace, warn};

/// Header carrying the time an entry was written, in epoch milliseconds.
pub const CACHED_AT_HEADER: &str = "sw-cached-at";

const PARTITION_INDEX: &str = "partition.json";

/// Errors from the partition store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Store writer has stopped")]
    WriterStopped,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ==================== Entries ====================

/// Identity of a stored response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        Self {
            method: method.as_str().to_string(),
            url: url.as_str().to_string(),
        }
    }

    pub fn of(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    /// File name of this key's entry inside a partition directory.
    fn file_name(&self) -> String {
        let digest = Sha256::digest(self.to_string().as_bytes());
        format!("{}.json", hex::encode(digest))
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A response header with its raw value bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHeader {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub value: Bytes,
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntry {
    pub key: RequestKey,
    pub status: u16,
    pub headers: Vec<StoredHeader>,
    #[serde(with = "base64_bytes")]
    pub body: Bytes,
}

impl CachedEntry {
    /// Materialize an entry, taking ownership of the response body.
    pub fn from_response(key: RequestKey, response: Response) -> Self {
        let status = response.status.as_u16();
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| StoredHeader {
                name: name.as_str().to_string(),
                value: Bytes::copy_from_slice(value.as_bytes()),
            })
            .collect();

        Self {
            key,
            status,
            headers,
            body: response.bytes(),
        }
    }

    /// A fresh response for the caller.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for header in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(header.name.as_bytes()),
                HeaderValue::from_bytes(&header.value),
            ) {
                headers.append(name, value);
            }
        }

        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let response = Response::from_parts(status, headers, self.body.clone());
        match Url::parse(&self.key.url) {
            Ok(url) => response.with_url(url),
            Err(_) => response,
        }
    }

    /// Header value as text, compared case-insensitively. `None` when the
    /// header is missing or its value is not UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .and_then(|h| std::str::from_utf8(&h.value).ok())
    }

    /// When the entry was written, if stamped.
    pub fn cached_at(&self) -> Option<u64> {
        self.header(CACHED_AT_HEADER)?.trim().parse().ok()
    }

    /// Whether the entry is younger than `fresh_for`. Unstamped entries are
    /// stale.
    pub fn is_fresh(&self, now_millis: u64, fresh_for: Duration) -> bool {
        match self.cached_at() {
            Some(at) => u128::from(now_millis.saturating_sub(at)) < fresh_for.as_millis(),
            None => false,
        }
    }

    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

/// Set the `sw-cached-at` header.
pub fn stamp_cached_at(response: Response, at_millis: u64) -> Response {
    response.with_header(
        HeaderName::from_static(CACHED_AT_HEADER),
        HeaderValue::from(at_millis),
    )
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// ==================== Partitions ====================

#[derive(Debug, Default)]
struct Partition {
    entries: HashMap<RequestKey, CachedEntry>,
}

/// Index file of one partition directory.
#[derive(Serialize, Deserialize)]
struct PartitionIndex {
    name: String,
}

/// Usage of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStatus {
    pub name: String,
    pub count: usize,
    pub size: u64,
}

/// A point in the store's delete history.
///
/// Capture it with [`PartitionStore::epoch`] before starting work whose
/// result will be written back later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StoreEpoch(u64);

#[derive(Debug, Default)]
struct Partitions {
    live: HashMap<String, Partition>,
    /// Epoch at which each missing partition was last deleted.
    tombstones: HashMap<String, StoreEpoch>,
}

// ==================== Disk writer ====================

#[derive(Debug)]
enum DiskOp {
    CreatePartition { name: String },
    WriteEntry { partition: String, entry: CachedEntry },
    RemovePartition { name: String },
    Flush(oneshot::Sender<()>),
}

fn partition_dir(root: &Path, partition: &str) -> PathBuf {
    let safe: String = partition
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    root.join(safe)
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents).await.map_err(io_error(&tmp))?;
    fs::rename(&tmp, path).await.map_err(io_error(path))
}

async fn apply(root: &Path, op: DiskOp) -> Result<(), StoreError> {
    match op {
        DiskOp::CreatePartition { name } => {
            let dir = partition_dir(root, &name);
            fs::create_dir_all(&dir).await.map_err(io_error(&dir))?;
            let index = serde_json::to_vec(&PartitionIndex { name })?;
            write_atomic(&dir.join(PARTITION_INDEX), &index).await
        }
        DiskOp::WriteEntry { partition, entry } => {
            let dir = partition_dir(root, &partition);
            fs::create_dir_all(&dir).await.map_err(io_error(&dir))?;
            let path = dir.join(entry.key.file_name());
            trace!(partition = %partition, key = %entry.key, path = %path.display(), "Writing entry");
            write_atomic(&path, &serde_json::to_vec(&entry)?).await
        }
        DiskOp::RemovePartition { name } => {
            let dir = partition_dir(root, &name);
            match fs::remove_dir_all(&dir).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(source) => Err(StoreError::Io { path: dir, source }),
            }
        }
        DiskOp::Flush(done) => {
            let _ = done.send(());
            Ok(())
        }
    }
}

async fn run_writer(root: PathBuf, mut ops: mpsc::UnboundedReceiver<DiskOp>) {
    while let Some(op) = ops.recv().await {
        if let Err(e) = apply(&root, op).await {
            warn!(dir = %root.display(), error = %e, "Partition write failed");
        }
    }
    debug!(dir = %root.display(), "Store writer stopped");
}

/// Read one partition directory. `None` when it has no readable index.
async fn load_partition(dir: &Path) -> Result<Option<(String, Partition)>, StoreError> {
    let index_path = dir.join(PARTITION_INDEX);
    let index: PartitionIndex = match fs::read(&index_path).await {
        Ok(raw) => match serde_json::from_slice(&raw) {
            Ok(index) => index,
            Err(e) => {
                warn!(path = %index_path.display(), error = %e, "Skipping unreadable partition");
                return Ok(None);
            }
        },
        Err(e) => {
            warn!(path = %index_path.display(), error = %e, "Skipping directory without partition index");
            return Ok(None);
        }
    };

    let mut partition = Partition::default();
    let mut listing = fs::read_dir(dir).await.map_err(io_error(dir))?;
    while let Some(item) = listing.next_entry().await.map_err(io_error(dir))? {
        let path = item.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json")
            || path.file_name().and_then(|n| n.to_str()) == Some(PARTITION_INDEX)
        {
            continue;
        }

        let raw = fs::read(&path).await.map_err(io_error(&path))?;
        match serde_json::from_slice::<CachedEntry>(&raw) {
            Ok(entry) => {
                partition.entries.insert(entry.key.clone(), entry);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable entry"),
        }
    }
    Ok(Some((index.name, partition)))
}

// ==================== Store ====================

#[derive(Debug, Default)]
struct StoreInner {
    partitions: RwLock<Partitions>,
    epoch: AtomicU64,
    dir: Option<PathBuf>,
    writer: Option<mpsc::UnboundedSender<DiskOp>>,
}

impl StoreInner {
    /// Queue a disk operation. Call with the partition lock held.
    fn queue(&self, op: DiskOp) -> Result<(), StoreError> {
        match &self.writer {
            Some(writer) => writer.send(op).map_err(|_| StoreError::WriterStopped),
            None => Ok(()),
        }
    }
}

/// Shared handle to the partition store.
#[derive(Debug, Clone, Default)]
pub struct PartitionStore {
    inner: Arc<StoreInner>,
}

impl PartitionStore {
    /// Create an in-memory store.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a directory-backed store, loading every partition in it, and
    /// start its writer task.
    pub async fn open_dir(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(io_error(&dir))?;

        let mut live = HashMap::new();
        let mut listing = fs::read_dir(&dir).await.map_err(io_error(&dir))?;
        while let Some(item) = listing.next_entry().await.map_err(io_error(&dir))? {
            let path = item.path();
            let is_dir = item.file_type().await.map_err(io_error(&path))?.is_dir();
            if !is_dir {
                continue;
            }
            if let Some((name, partition)) = load_partition(&path).await? {
                live.insert(name, partition);
            }
        }

        info!(dir = %dir.display(), partitions = live.len(), "Opened partition store");

        let (writer, ops) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(dir.clone(), ops));

        Ok(Self {
            inner: Arc::new(StoreInner {
                partitions: RwLock::new(Partitions {
                    live,
                    tombstones: HashMap::new(),
                }),
                epoch: AtomicU64::new(0),
                dir: Some(dir),
                writer: Some(writer),
            }),
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.inner.dir.is_some()
    }

    /// The current delete epoch.
    pub fn epoch(&self) -> StoreEpoch {
        StoreEpoch(self.inner.epoch.load(Ordering::SeqCst))
    }

    /// Open a partition, creating it if needed.
    pub async fn open(&self, name: &str) -> Result<PartitionHandle, StoreError> {
        let mut partitions = self.inner.partitions.write().await;
        if !partitions.live.contains_key(name) {
            partitions.live.insert(name.to_string(), Partition::default());
            partitions.tombstones.remove(name);
            debug!(partition = name, "Created partition");
            self.inner.queue(DiskOp::CreatePartition {
                name: name.to_string(),
            })?;
        }

        Ok(PartitionHandle {
            store: self.clone(),
            name: name.to_string(),
        })
    }

    pub async fn has(&self, name: &str) -> bool {
        self.inner.partitions.read().await.live.contains_key(name)
    }

    /// Look up a request in one partition.
    pub async fn get(&self, name: &str, request: &Request) -> Option<CachedEntry> {
        let key = RequestKey::of(request);
        let partitions = self.inner.partitions.read().await;
        partitions.live.get(name)?.entries.get(&key).cloned()
    }

    /// Store a response, replacing any entry for the same request. A missing
    /// partition is created.
    pub async fn put(&self, name: &str, request: &Request, response: Response) -> Result<(), StoreError> {
        self.insert(name, request, response, None).await.map(|_| ())
    }

    /// Like [`PartitionStore::put`], but drops the write when the partition
    /// was deleted after `since`. Returns whether the entry was stored.
    pub async fn put_unless_deleted(
        &self,
        name: &str,
        request: &Request,
        response: Response,
        since: StoreEpoch,
    ) -> Result<bool, StoreError> {
        self.insert(name, request, response, Some(since)).await
    }

    async fn insert(
        &self,
        name: &str,
        request: &Request,
        response: Response,
        since: Option<StoreEpoch>,
    ) -> Result<bool, StoreError> {
        let key = RequestKey::of(request);
        let entry = CachedEntry::from_response(key.clone(), response);

        let mut partitions = self.inner.partitions.write().await;
        if !partitions.live.contains_key(name) {
            if let (Some(since), Some(deleted)) = (since, partitions.tombstones.get(name)) {
                if *deleted > since {
                    debug!(partition = name, key = %key, "Dropping write to deleted partition");
                    return Ok(false);
                }
            }
            partitions.live.insert(name.to_string(), Partition::default());
            partitions.tombstones.remove(name);
            debug!(partition = name, "Created partition");
            self.inner.queue(DiskOp::CreatePartition {
                name: name.to_string(),
            })?;
        }

        if self.is_persistent() {
            self.inner.queue(DiskOp::WriteEntry {
                partition: name.to_string(),
                entry: entry.clone(),
            })?;
        }
        if let Some(partition) = partitions.live.get_mut(name) {
            partition.entries.insert(key, entry);
        }
        Ok(true)
    }

    /// Look up a request in every partition, in name order.
    pub async fn match_any(&self, request: &Request) -> Option<CachedEntry> {
        let key = RequestKey::of(request);
        let partitions = self.inner.partitions.read().await;
        let mut names: Vec<&String> = partitions.live.keys().collect();
        names.sort();
        names
            .into_iter()
            .find_map(|name| partitions.live.get(name)?.entries.get(&key).cloned())
    }

    /// Delete a partition. Returns whether it existed.
    pub async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let mut partitions = self.inner.partitions.write().await;
        if partitions.live.remove(name).is_none() {
            return Ok(false);
        }

        let epoch = StoreEpoch(self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1);
        partitions.tombstones.insert(name.to_string(), epoch);
        debug!(partition = name, ?epoch, "Deleted partition");
        self.inner.queue(DiskOp::RemovePartition {
            name: name.to_string(),
        })?;
        Ok(true)
    }

    /// Delete every partition whose name is not in `valid`. Returns the
    /// deleted names.
    pub async fn delete_entries_not_in(&self, valid: &[String]) -> Result<Vec<String>, StoreError> {
        let stale: Vec<String> = self
            .keys()
            .await
            .into_iter()
            .filter(|name| !valid.contains(name))
            .collect();

        for name in &stale {
            info!(partition = %name, "Deleting old partition");
            self.delete(name).await?;
        }
        Ok(stale)
    }

    /// Delete every partition. Returns how many were deleted.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let names = self.keys().await;
        for name in &names {
            self.delete(name).await?;
        }
        Ok(names.len())
    }

    /// Partition names, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.partitions.read().await.live.keys().cloned().collect();
        names.sort();
        names
    }

    /// Entry count and body bytes of every partition, sorted by name.
    pub async fn enumerate(&self) -> Vec<PartitionStatus> {
        let partitions = self.inner.partitions.read().await;
        let mut statuses: Vec<PartitionStatus> = partitions
            .live
            .iter()
            .map(|(name, partition)| PartitionStatus {
                name: name.clone(),
                count: partition.entries.len(),
                size: partition.entries.values().map(CachedEntry::size).sum(),
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Wait until every queued disk write has been applied.
    pub async fn flush(&self) -> Result<(), StoreError> {
        if self.inner.writer.is_none() {
            return Ok(());
        }
        let (done, applied) = oneshot::channel();
        self.inner.queue(DiskOp::Flush(done))?;
        applied.await.map_err(|_| StoreError::WriterStopped)
    }
}

/// A named partition within a [`PartitionStore`].
#[derive(Debug, Clone)]
pub struct PartitionHandle {
    store: PartitionStore,
    name: String,
}

impl PartitionHandle {
    pub async fn get(&self, request: &Request) -> Option<CachedEntry> {
        self.store.get(&self.name, request).await
    }

    pub async fn put(&self, request: &Request, response: Response) -> Result<(), StoreError> {
        self.store.put(&self.name, request, response).await
    }

    pub async fn len(&self) -> usize {
        let partitions = self.store.inner.partitions.read().await;
        partitions.live.get(&self.name).map_or(0, |p| p.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONTENT_TYPE;

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    fn json_response(body: &'static str) -> Response {
        Response::new(StatusCode::OK, body)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
    }

    fn entry_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.file_name().and_then(|n| n.to_str()) != Some(PARTITION_INDEX))
            .collect();
        files.sort();
        files
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let store = PartitionStore::in_memory();
        let partition = store.open("dynamic-v1").await.unwrap();
        let request = get("https://example.com/a.json");

        assert!(partition.get(&request).await.is_none());

        partition
            .put(&request, json_response(r#"{"a":1}"#))
            .await
            .unwrap();

        let entry = partition.get(&request).await.unwrap();
        assert_eq!(entry.status, 200);
        assert_eq!(entry.header("Content-Type"), Some("application/json"));

        let response = entry.to_response();
        assert_eq!(response.url.as_ref().map(Url::as_str), Some("https://example.com/a.json"));
        assert_eq!(response.text().unwrap(), r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_put_overwrites_and_method_is_part_of_key() {
        let store = PartitionStore::in_memory();
        let request = get("https://example.com/a.json");
        store.put("p", &request, json_response("1")).await.unwrap();
        store.put("p", &request, json_response("2")).await.unwrap();

        let post = Request::parse("POST", "https://example.com/a.json").unwrap();
        assert!(store.get("p", &post).await.is_none());

        let entry = store.get("p", &request).await.unwrap();
        assert_eq!(entry.body, Bytes::from_static(b"2"));
        assert_eq!(store.open("p").await.unwrap().len().await, 1);
    }

    #[tokio::test]
    async fn test_match_any_searches_all_partitions() {
        let store = PartitionStore::in_memory();
        let request = get("https://example.com/page");
        store.open("a").await.unwrap();
        store.put("b", &request, json_response("b")).await.unwrap();

        assert_eq!(store.match_any(&request).await.unwrap().body, Bytes::from_static(b"b"));
        assert!(store.match_any(&get("https://example.com/other")).await.is_none());
    }

    #[tokio::test]
    async fn test_delete_entries_not_in_is_idempotent() {
        let store = PartitionStore::in_memory();
        for name in ["old-static-v0", "static-v1", "dynamic-v1"] {
            store.open(name).await.unwrap();
        }
        let valid = vec!["static-v1".to_string(), "dynamic-v1".to_string()];

        let deleted = store.delete_entries_not_in(&valid).await.unwrap();
        assert_eq!(deleted, vec!["old-static-v0".to_string()]);

        let deleted = store.delete_entries_not_in(&valid).await.unwrap();
        assert!(deleted.is_empty());
        assert_eq!(store.keys().await, vec!["dynamic-v1".to_string(), "static-v1".to_string()]);
    }

    #[tokio::test]
    async fn test_enumerate_counts_body_bytes() {
        let store = PartitionStore::in_memory();
        store.put("p", &get("https://example.com/1"), json_response("abc")).await.unwrap();
        store.put("p", &get("https://example.com/2"), json_response("de")).await.unwrap();
        store.open("empty").await.unwrap();

        let statuses = store.enumerate().await;
        assert_eq!(
            statuses,
            vec![
                PartitionStatus { name: "empty".into(), count: 0, size: 0 },
                PartitionStatus { name: "p".into(), count: 2, size: 5 },
            ]
        );
    }

    #[tokio::test]
    async fn test_clear() {
        let store = PartitionStore::in_memory();
        store.open("a").await.unwrap();
        store.open("b").await.unwrap();

        assert_eq!(store.clear().await.unwrap(), 2);
        assert!(store.keys().await.is_empty());
        assert!(!store.delete("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_started_before_delete_is_dropped() {
        let store = PartitionStore::in_memory();
        let request = get("https://example.com/api/versions.json");
        store.put("dynamic-v1", &request, json_response("[]")).await.unwrap();

        let before_delete = store.epoch();
        store.delete("dynamic-v1").await.unwrap();

        let stored = store
            .put_unless_deleted("dynamic-v1", &request, json_response(r#"["2"]"#), before_delete)
            .await
            .unwrap();
        assert!(!stored);
        assert!(!store.has("dynamic-v1").await);
    }

    #[tokio::test]
    async fn test_write_started_after_delete_recreates() {
        let store = PartitionStore::in_memory();
        let request = get("https://example.com/api/versions.json");
        store.open("dynamic-v1").await.unwrap();
        store.clear().await.unwrap();

        let after_delete = store.epoch();
        assert!(store
            .put_unless_deleted("dynamic-v1", &request, json_response("[]"), after_delete)
            .await
            .unwrap());
        assert!(store.get("dynamic-v1", &request).await.is_some());

        // Never-deleted partitions are created regardless of epoch
        assert!(store
            .put_unless_deleted("images-v1", &request, json_response("[]"), StoreEpoch(0))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_reopened_partition_accepts_late_writes() {
        let store = PartitionStore::in_memory();
        let request = get("https://example.com/page");
        let before_delete = store.epoch();
        store.open("static-v1").await.unwrap();
        store.delete("static-v1").await.unwrap();
        store.open("static-v1").await.unwrap();

        assert!(store
            .put_unless_deleted("static-v1", &request, json_response("{}"), before_delete)
            .await
            .unwrap());
    }

    #[test]
    fn test_cached_at_and_freshness() {
        let response = stamp_cached_at(json_response("{}"), 1_000);
        let entry = CachedEntry::from_response(RequestKey::of(&get("https://example.com/")), response);

        assert_eq!(entry.cached_at(), Some(1_000));
        assert!(entry.is_fresh(1_000 + 299_999, Duration::from_secs(300)));
        assert!(!entry.is_fresh(1_000 + 300_000, Duration::from_secs(300)));

        let unstamped = CachedEntry::from_response(
            RequestKey::of(&get("https://example.com/")),
            json_response("{}"),
        );
        assert_eq!(unstamped.cached_at(), None);
        assert!(!unstamped.is_fresh(0, Duration::from_secs(300)));
    }

    #[test]
    fn test_non_utf8_header_survives_serialization() {
        let raw = [0xFF, b'a'];
        let response = Response::new(StatusCode::OK, "x").with_header(
            HeaderName::from_static("x-legacy"),
            HeaderValue::from_bytes(&raw).unwrap(),
        );
        let entry = CachedEntry::from_response(RequestKey::of(&get("https://example.com/")), response);
        assert_eq!(entry.header("x-legacy"), None);

        let json = serde_json::to_vec(&entry).unwrap();
        let decoded: CachedEntry = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded, entry);

        let restored = decoded.to_response();
        assert_eq!(restored.headers.get("x-legacy").unwrap().as_bytes(), &raw);
    }

    #[tokio::test]
    async fn test_persistent_store_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let request = get("https://example.com/img.png");

        {
            let store = PartitionStore::open_dir(dir.path()).await.unwrap();
            assert!(store.is_persistent());
            store
                .put("images-v1", &request, Response::new(StatusCode::OK, vec![0u8, 159, 146, 150]))
                .await
                .unwrap();
            store.open("static-v1").await.unwrap();
            store.flush().await.unwrap();
        }

        let reopened = PartitionStore::open_dir(dir.path()).await.unwrap();
        assert_eq!(reopened.keys().await, vec!["images-v1".to_string(), "static-v1".to_string()]);
        let entry = reopened.get("images-v1", &request).await.unwrap();
        assert_eq!(entry.body, Bytes::from_static(&[0, 159, 146, 150]));
    }

    #[tokio::test]
    async fn test_put_writes_one_file_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionStore::open_dir(dir.path()).await.unwrap();
        let first = get("https://example.com/1.png");
        let second = get("https://example.com/2.png");

        store.put("images-v1", &first, json_response("one")).await.unwrap();
        store.flush().await.unwrap();
        let partition_dir = dir.path().join("images-v1");
        let first_file = partition_dir.join(RequestKey::of(&first).file_name());
        let written = std::fs::metadata(&first_file).unwrap().modified().unwrap();

        store.put("images-v1", &second, json_response("two")).await.unwrap();
        store.flush().await.unwrap();

        assert_eq!(entry_files(&partition_dir).len(), 2);
        assert_eq!(std::fs::metadata(&first_file).unwrap().modified().unwrap(), written);
        let index: PartitionIndex =
            serde_json::from_slice(&std::fs::read(partition_dir.join(PARTITION_INDEX)).unwrap()).unwrap();
        assert_eq!(index.name, "images-v1");
    }

    #[tokio::test]
    async fn test_persistent_delete_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionStore::open_dir(dir.path()).await.unwrap();
        store.put("static-v1", &get("https://example.com/"), json_response("{}")).await.unwrap();
        store.flush().await.unwrap();
        assert!(dir.path().join("static-v1").join(PARTITION_INDEX).exists());

        store.delete("static-v1").await.unwrap();
        store.flush().await.unwrap();
        assert!(!dir.path().join("static-v1").exists());

        let reopened = PartitionStore::open_dir(dir.path()).await.unwrap();
        assert!(reopened.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::create_dir(dir.path().join("no-index")).unwrap();
        let broken = dir.path().join("broken");
        std::fs::create_dir(&broken).unwrap();
        std::fs::write(broken.join(PARTITION_INDEX), "{not json").unwrap();

        let good = dir.path().join("static-v1");
        std::fs::create_dir(&good).unwrap();
        std::fs::write(good.join(PARTITION_INDEX), r#"{"name":"static-v1"}"#).unwrap();
        std::fs::write(good.join("deadbeef.json"), "{not json").unwrap();

        let store = PartitionStore::open_dir(dir.path()).await.unwrap();
        assert_eq!(store.keys().await, vec!["static-v1".to_string()]);
        assert_eq!(store.enumerate().await[0].count, 0);
    }
}
