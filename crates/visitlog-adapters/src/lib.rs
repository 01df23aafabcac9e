//! Record source adapters + batch normalization for visitlog.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use tracing::debug;
use uuid::Uuid;
use visitlog_core::{
    normalize_timestamp, Record, RecordParseError, TargetZone, UserRecord, VisitRecord,
    DEFAULT_EMAIL,
};
use visitlog_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "visitlog-adapters";

/// Conversion from one loosely shaped JSON object into a canonical record.
pub trait Normalize: Record {
    fn from_raw(value: &JsonValue, zone: &TargetZone) -> Result<Self, RecordParseError>;
}

fn as_object(value: &JsonValue) -> Result<&Map<String, JsonValue>, RecordParseError> {
    value.as_object().ok_or(RecordParseError::NotAnObject)
}

/// Best-effort string extraction; scalars are rendered, null and nested
/// values count as missing.
fn json_text(obj: &Map<String, JsonValue>, key: &str) -> Option<String> {
    match obj.get(key)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl Normalize for VisitRecord {
    fn from_raw(value: &JsonValue, zone: &TargetZone) -> Result<Self, RecordParseError> {
        let obj = as_object(value)?;
        let raw_timestamp =
            json_text(obj, "timestamp").ok_or(RecordParseError::MissingField("timestamp"))?;
        let timestamp = normalize_timestamp(&raw_timestamp, zone)?;
        let email = json_text(obj, "email")
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_EMAIL.to_string());

        Ok(Self {
            email,
            ip: json_text(obj, "ip").unwrap_or_default(),
            timestamp,
            user_agent: json_text(obj, "user_agent").unwrap_or_default(),
        })
    }
}

impl Normalize for UserRecord {
    fn from_raw(value: &JsonValue, zone: &TargetZone) -> Result<Self, RecordParseError> {
        let obj = as_object(value)?;
        // Accounts are kept even when created_at is unusable; the partition
        // step skips them and logs instead.
        let created_at = match json_text(obj, "created_at") {
            Some(raw) => normalize_timestamp(&raw, zone).unwrap_or(raw),
            None => String::new(),
        };

        Ok(Self {
            email: json_text(obj, "email").unwrap_or_default(),
            name: json_text(obj, "name").unwrap_or_default(),
            phone: json_text(obj, "phone").unwrap_or_default(),
            role: json_text(obj, "role").unwrap_or_default(),
            created_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBatch<R> {
    pub records: Vec<R>,
    pub rejected: Vec<RecordParseError>,
    pub duplicates: usize,
}

/// Canonicalize a fetched array and drop repeated identity keys, keeping the
/// first occurrence.
pub fn normalize_batch<R: Normalize>(raw: &[JsonValue], zone: &TargetZone) -> NormalizedBatch<R> {
    let mut seen: HashSet<R::Key> = HashSet::with_capacity(raw.len());
    let mut records = Vec::with_capacity(raw.len());
    let mut rejected = Vec::new();
    let mut duplicates = 0usize;

    for value in raw {
        match R::from_raw(value, zone) {
            Ok(record) => {
                if seen.insert(record.identity_key()) {
                    records.push(record);
                } else {
                    duplicates += 1;
                }
            }
            Err(err) => rejected.push(err),
        }
    }

    if duplicates > 0 {
        let kind = R::KIND;
        debug!(%kind, duplicates, "dropped duplicate records from batch");
    }

    NormalizedBatch {
        records,
        rejected,
        duplicates,
    }
}

/// Anything that can hand the pipeline one raw JSON array per dataset.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_raw(
        &self,
        run_id: Uuid,
        dataset: &str,
        url: &str,
    ) -> Result<Vec<JsonValue>, FetchError>;
}

/// Pulls from the analytics endpoint; `file://` URLs replay a captured
/// response from disk.
#[derive(Debug, Clone)]
pub struct EndpointSource {
    http: HttpFetcher,
}

impl EndpointSource {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl RecordSource for EndpointSource {
    async fn fetch_raw(
        &self,
        run_id: Uuid,
        dataset: &str,
        url: &str,
    ) -> Result<Vec<JsonValue>, FetchError> {
        if let Some(path) = url.strip_prefix("file://") {
            let path = PathBuf::from(path);
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|source| FetchError::Fixture {
                    path: path.clone(),
                    source,
                })?;
            return serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            });
        }
        self.http.fetch_json(run_id, dataset, url).await
    }
}

#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Rows(Vec<JsonValue>),
    Status(u16),
}

/// In-process source that replays queued responses per dataset. The last
/// queued response repeats once the queue is drained.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    responses: Mutex<HashMap<String, Vec<ScriptedResponse>>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, dataset: &str, response: ScriptedResponse) {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(dataset.to_string())
            .or_default()
            .push(response);
    }

    pub fn with_rows(self, dataset: &str, rows: Vec<JsonValue>) -> Self {
        self.push(dataset, ScriptedResponse::Rows(rows));
        self
    }
}

#[async_trait]
impl RecordSource for ScriptedSource {
    async fn fetch_raw(
        &self,
        _run_id: Uuid,
        dataset: &str,
        url: &str,
    ) -> Result<Vec<JsonValue>, FetchError> {
        let next = {
            let mut map = self
                .responses
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match map.get_mut(dataset) {
                Some(queue) if queue.len() > 1 => Some(queue.remove(0)),
                Some(queue) => queue.first().cloned(),
                None => None,
            }
        };
        match next {
            Some(ScriptedResponse::Rows(rows)) => Ok(rows),
            Some(ScriptedResponse::Status(status)) => Err(FetchError::HttpStatus {
                status,
                url: url.to_string(),
            }),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}
