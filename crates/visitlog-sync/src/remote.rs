//! Remote mirroring of dataset files, gated by content checksum.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use visitlog_storage::{sha256_hex, write_atomic, PersistenceError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid remote target `{0}`")]
    InvalidTarget(String),
    #[error("local file {} has no usable name", .0.display())]
    InvalidName(PathBuf),
    #[error("reading local file {}: {source}", path.display())]
    ReadLocal {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("remote request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("remote backend answered {status} to {operation}")]
    Backend { status: u16, operation: &'static str },
    #[error("remote directory i/o at {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("writing mirrored copy")]
    Persist(#[from] PersistenceError),
    #[error("remote object `{0}` does not exist")]
    MissingObject(String),
    #[error("remote backend unavailable")]
    Unavailable,
}

/// Minimal object-store surface the sync client needs.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn describe(&self) -> String;

    async fn find_by_name(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<Vec<RemoteObject>, SyncError>;

    async fn create(
        &self,
        name: &str,
        content: &[u8],
        parent: Option<&str>,
    ) -> Result<RemoteObject, SyncError>;

    async fn update(&self, object: &RemoteObject, content: &[u8]) -> Result<RemoteObject, SyncError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteTarget {
    Http { base_url: String },
    Directory { path: PathBuf },
}

impl RemoteTarget {
    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(SyncError::InvalidTarget(raw.to_string()));
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Ok(RemoteTarget::Http {
                base_url: raw.trim_end_matches('/').to_string(),
            });
        }
        if let Some(rest) = raw.strip_prefix("file://") {
            if rest.trim().is_empty() {
                return Err(SyncError::InvalidTarget(raw.to_string()));
            }
            return Ok(RemoteTarget::Directory {
                path: PathBuf::from(rest),
            });
        }
        if raw.contains("://") {
            return Err(SyncError::InvalidTarget(raw.to_string()));
        }
        Ok(RemoteTarget::Directory {
            path: PathBuf::from(raw),
        })
    }
}

/// REST object store: `GET/POST {base}/objects`, `PUT {base}/objects/{id}`.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building remote store client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn expect_success(
        resp: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, SyncError> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            Err(SyncError::Backend {
                status: status.as_u16(),
                operation,
            })
        }
    }
}

#[async_trait]
impl RemoteStore for HttpObjectStore {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    async fn find_by_name(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<Vec<RemoteObject>, SyncError> {
        let mut query = vec![("name", name)];
        if let Some(parent) = parent {
            query.push(("parent", parent));
        }
        let req = self
            .client
            .get(format!("{}/objects", self.base_url))
            .query(&query);
        let resp = self.authorize(req).send().await?;
        let resp = Self::expect_success(resp, "find_by_name")?;
        Ok(resp.json::<Vec<RemoteObject>>().await?)
    }

    async fn create(
        &self,
        name: &str,
        content: &[u8],
        parent: Option<&str>,
    ) -> Result<RemoteObject, SyncError> {
        let mut query = vec![("name", name)];
        if let Some(parent) = parent {
            query.push(("parent", parent));
        }
        let req = self
            .client
            .post(format!("{}/objects", self.base_url))
            .query(&query)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(content.to_vec());
        let resp = self.authorize(req).send().await?;
        let resp = Self::expect_success(resp, "create")?;
        Ok(resp.json::<RemoteObject>().await?)
    }

    async fn update(&self, object: &RemoteObject, content: &[u8]) -> Result<RemoteObject, SyncError> {
        let req = self
            .client
            .put(format!("{}/objects/{}", self.base_url, object.id))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(content.to_vec());
        let resp = self.authorize(req).send().await?;
        let resp = Self::expect_success(resp, "update")?;
        Ok(resp.json::<RemoteObject>().await?)
    }
}

/// Mirrors objects into a directory tree, e.g. a mounted shared drive.
/// Object ids are paths relative to the root.
#[derive(Debug, Clone)]
pub struct DirectoryObjectStore {
    root: PathBuf,
}

impl DirectoryObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_id(name: &str, parent: Option<&str>) -> String {
        match parent {
            Some(parent) if !parent.is_empty() => format!("{}/{name}", parent.trim_matches('/')),
            _ => name.to_string(),
        }
    }

    async fn describe_object(
        &self,
        id: &str,
        name: &str,
        parent: Option<&str>,
    ) -> Result<RemoteObject, SyncError> {
        let path = self.root.join(id);
        let meta = fs::metadata(&path)
            .await
            .map_err(|source| SyncError::Directory {
                path: path.clone(),
                source,
            })?;
        Ok(RemoteObject {
            id: id.to_string(),
            name: name.to_string(),
            parent: parent.map(ToString::to_string),
            modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    async fn write(&self, id: &str, content: &[u8]) -> Result<(), SyncError> {
        write_atomic(&self.root.join(id), content).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for DirectoryObjectStore {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn find_by_name(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<Vec<RemoteObject>, SyncError> {
        let id = Self::object_id(name, parent);
        let path = self.root.join(&id);
        match fs::try_exists(&path).await {
            Ok(true) => Ok(vec![self.describe_object(&id, name, parent).await?]),
            Ok(false) => Ok(Vec::new()),
            Err(source) => Err(SyncError::Directory { path, source }),
        }
    }

    async fn create(
        &self,
        name: &str,
        content: &[u8],
        parent: Option<&str>,
    ) -> Result<RemoteObject, SyncError> {
        let id = Self::object_id(name, parent);
        self.write(&id, content).await?;
        self.describe_object(&id, name, parent).await
    }

    async fn update(&self, object: &RemoteObject, content: &[u8]) -> Result<RemoteObject, SyncError> {
        if !fs::try_exists(self.root.join(&object.id)).await.unwrap_or(false) {
            return Err(SyncError::MissingObject(object.id.clone()));
        }
        self.write(&object.id, content).await?;
        self.describe_object(&object.id, &object.name, object.parent.as_deref())
            .await
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    meta: RemoteObject,
    content: Vec<u8>,
}

/// Process-local store that counts calls; backs tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<Vec<StoredObject>>,
    next_id: AtomicUsize,
    finds: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    failing: AtomicBool,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn find_calls(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn object_count(&self) -> usize {
        self.lock().len()
    }

    /// Latest content written under `id`.
    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.lock()
            .iter()
            .find(|o| o.meta.id == id)
            .map(|o| o.content.clone())
    }

    /// Seed an object as if another writer had created it.
    pub fn seed(&self, object: RemoteObject, content: &[u8]) {
        self.lock().push(StoredObject {
            meta: object,
            content: content.to_vec(),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StoredObject>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), SyncError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(SyncError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryObjectStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn find_by_name(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<Vec<RemoteObject>, SyncError> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self
            .lock()
            .iter()
            .filter(|o| o.meta.name == name && (parent.is_none() || o.meta.parent.as_deref() == parent))
            .map(|o| o.meta.clone())
            .collect())
    }

    async fn create(
        &self,
        name: &str,
        content: &[u8],
        parent: Option<&str>,
    ) -> Result<RemoteObject, SyncError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let id = format!("obj-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let meta = RemoteObject {
            id,
            name: name.to_string(),
            parent: parent.map(ToString::to_string),
            modified_at: Some(Utc::now()),
        };
        self.lock().push(StoredObject {
            meta: meta.clone(),
            content: content.to_vec(),
        });
        Ok(meta)
    }

    async fn update(&self, object: &RemoteObject, content: &[u8]) -> Result<RemoteObject, SyncError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut objects = self.lock();
        let stored = objects
            .iter_mut()
            .find(|o| o.meta.id == object.id)
            .ok_or_else(|| SyncError::MissingObject(object.id.clone()))?;
        stored.content = content.to_vec();
        stored.meta.modified_at = Some(Utc::now());
        Ok(stored.meta.clone())
    }
}

/// Remote name + folder → hash of the content last mirrored successfully.
#[derive(Debug, Clone, Default)]
pub struct ChecksumCache {
    entries: HashMap<String, String>,
}

impl ChecksumCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_key(name: &str, folder: Option<&str>) -> String {
        match folder {
            Some(folder) => format!("{folder}/{name}"),
            None => name.to_string(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn record(&mut self, key: String, checksum: String) {
        self.entries.insert(key, checksum);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncResult {
    Uploaded,
    Updated,
    Skipped,
    Failed,
}

/// Pick the object to overwrite when a lookup returns several: the most
/// recently modified wins, ties go to the first listed.
pub fn pick_match(name: &str, matches: Vec<RemoteObject>) -> Option<RemoteObject> {
    if matches.len() > 1 {
        warn!(
            name,
            matches = matches.len(),
            "remote lookup returned several objects; updating the most recently modified"
        );
    }
    let mut best: Option<RemoteObject> = None;
    for candidate in matches {
        let replace = match &best {
            None => true,
            Some(current) => candidate.modified_at > current.modified_at,
        };
        if replace {
            best = Some(candidate);
        }
    }
    best
}

/// Mirrors local files to a [`RemoteStore`].
///
/// Delivery is at-least-once: the checksum is only recorded after the
/// backend accepted the write, so a failed upload is retried the next time
/// the same file is offered.
#[derive(Clone)]
pub struct SyncClient {
    store: Arc<dyn RemoteStore>,
    default_folder: Option<String>,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("store", &self.store.describe())
            .field("default_folder", &self.default_folder)
            .finish()
    }
}

impl SyncClient {
    pub fn new(store: Arc<dyn RemoteStore>, default_folder: Option<String>) -> Self {
        Self {
            store,
            default_folder,
        }
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    /// Mirror one file. `folder` overrides the client's default folder.
    pub async fn sync(
        &self,
        cache: &mut ChecksumCache,
        local_path: &Path,
        folder: Option<&str>,
    ) -> SyncResult {
        match self.try_sync(cache, local_path, folder).await {
            Ok(result) => result,
            Err(err) => {
                warn!(path = %local_path.display(), error = %err, "remote sync failed; will retry next cycle");
                SyncResult::Failed
            }
        }
    }

    pub async fn try_sync(
        &self,
        cache: &mut ChecksumCache,
        local_path: &Path,
        folder: Option<&str>,
    ) -> Result<SyncResult, SyncError> {
        let name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SyncError::InvalidName(local_path.to_path_buf()))?;
        let folder = folder.or(self.default_folder.as_deref());

        let content = fs::read(local_path)
            .await
            .map_err(|source| SyncError::ReadLocal {
                path: local_path.to_path_buf(),
                source,
            })?;
        let checksum = sha256_hex(&content);
        let key = ChecksumCache::cache_key(name, folder);

        if cache.get(&key) == Some(checksum.as_str()) {
            debug!(name, "remote copy already current");
            return Ok(SyncResult::Skipped);
        }

        let matches = self.store.find_by_name(name, folder).await?;
        let result = match pick_match(name, matches) {
            Some(existing) => {
                self.store.update(&existing, &content).await?;
                SyncResult::Updated
            }
            None => {
                self.store.create(name, &content, folder).await?;
                SyncResult::Uploaded
            }
        };

        cache.record(key, checksum);
        info!(name, ?result, bytes = content.len(), "remote copy refreshed");
        Ok(result)
    }
}
