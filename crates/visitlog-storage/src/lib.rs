//! Dataset file storage + HTTP fetch utilities for visitlog.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;
use visitlog_core::{PartitionKey, Record, RecordParseError};

pub const CRATE_NAME: &str = "visitlog-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("creating directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serializing rows for {}: {source}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing temp file {}: {source}", path.display())]
    WriteTemp {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("replacing {} with staged content: {source}", path.display())]
    Replace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Bytes written to a sibling temp file, waiting to replace their target.
///
/// Dropping an uncommitted write removes the temp file and leaves the target
/// exactly as it was.
#[derive(Debug)]
pub struct StagedWrite {
    temp_path: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedWrite {
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Atomically rename the temp file over the target.
    pub async fn commit(mut self) -> Result<(), PersistenceError> {
        match fs::rename(&self.temp_path, &self.target).await {
            Ok(()) => {
                self.committed = true;
                Ok(())
            }
            Err(source) => Err(PersistenceError::Replace {
                path: self.target.clone(),
                source,
            }),
        }
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// Write `bytes` into a fresh temp file next to `target` without touching it.
pub async fn stage_bytes(target: &Path, bytes: &[u8]) -> Result<StagedWrite, PersistenceError> {
    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|source| PersistenceError::CreateDir {
            path: parent.clone(),
            source,
        })?;

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|source| PersistenceError::WriteTemp {
            path: temp_path.clone(),
            source,
        })?;
    let staged = StagedWrite {
        temp_path,
        target: target.to_path_buf(),
        committed: false,
    };

    let write_err = |source| PersistenceError::WriteTemp {
        path: staged.temp_path.clone(),
        source,
    };
    file.write_all(bytes).await.map_err(write_err)?;
    file.flush().await.map_err(write_err)?;
    file.sync_all().await.map_err(write_err)?;
    drop(file);

    Ok(staged)
}

/// Replace `target` with `bytes` so readers only ever see old or new content.
pub async fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    stage_bytes(target, bytes).await?.commit().await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Missing,
    Valid,
    Corrupt,
}

#[derive(Debug, Clone)]
pub struct ExistingRows<R> {
    pub rows: Vec<R>,
    pub state: FileState,
}

/// Load a dataset file; unreadable or malformed content counts as empty.
pub async fn read_existing<R: DeserializeOwned>(path: &Path) -> ExistingRows<R> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return ExistingRows {
                rows: Vec::new(),
                state: FileState::Missing,
            }
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "dataset file unreadable; treating as empty");
            return ExistingRows {
                rows: Vec::new(),
                state: FileState::Corrupt,
            };
        }
    };

    match serde_json::from_slice::<Vec<R>>(&bytes) {
        Ok(rows) => ExistingRows {
            rows,
            state: FileState::Valid,
        },
        Err(err) => {
            warn!(path = %path.display(), error = %err, "dataset file malformed; treating as empty");
            ExistingRows {
                rows: Vec::new(),
                state: FileState::Corrupt,
            }
        }
    }
}

/// Union of `existing` and `incoming` with full-row duplicates removed.
/// Existing rows keep their order and come first.
pub fn merge_rows<R: Record>(existing: &[R], incoming: &[R]) -> Vec<R> {
    let mut seen: HashSet<&R> = HashSet::with_capacity(existing.len() + incoming.len());
    let mut merged = Vec::with_capacity(existing.len() + incoming.len());
    for row in existing.iter().chain(incoming) {
        if seen.insert(row) {
            merged.push(row.clone());
        }
    }
    merged
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub path: PathBuf,
    pub changed: bool,
    pub total_rows: usize,
    pub added_rows: usize,
}

#[derive(Debug)]
pub struct FailedWrite {
    pub path: PathBuf,
    pub error: PersistenceError,
}

/// Result of writing one batch to the flat file and its partitions.
#[derive(Debug, Default)]
pub struct PersistReport {
    pub written: Vec<MergeOutcome>,
    pub failed: Vec<FailedWrite>,
    pub unpartitioned_records: usize,
}

impl PersistReport {
    pub fn changed_paths(&self) -> impl Iterator<Item = &Path> {
        self.written
            .iter()
            .filter(|o| o.changed)
            .map(|o| o.path.as_path())
    }

    /// Every file the batch maps to, written or not.
    pub fn touched_paths(&self) -> Vec<PathBuf> {
        self.written
            .iter()
            .map(|o| o.path.clone())
            .chain(self.failed.iter().map(|f| f.path.clone()))
            .collect()
    }
}

/// Split a batch by day. Records whose timestamp cannot be resolved are
/// returned as errors instead of landing in any partition.
pub fn partition_records<R: Record>(
    records: &[R],
) -> (BTreeMap<PartitionKey, Vec<R>>, Vec<RecordParseError>) {
    let mut groups: BTreeMap<PartitionKey, Vec<R>> = BTreeMap::new();
    let mut rejected = Vec::new();
    for record in records {
        match PartitionKey::from_canonical(record.partition_timestamp()) {
            Ok(key) => groups.entry(key).or_default().push(record.clone()),
            Err(err) => rejected.push(err),
        }
    }
    (groups, rejected)
}

/// Flat dataset files plus the `<dataset>/<year>/<month>/` partition tree.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
}

impl DatasetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn flat_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub fn partition_dir(&self, dataset: &str, key: &PartitionKey) -> PathBuf {
        self.root
            .join(dataset)
            .join(format!("{:04}", key.year))
            .join(format!("{:02}", key.month))
    }

    pub fn partition_file_name(dataset: &str, key: &PartitionKey) -> String {
        format!("{dataset}_{}.json", key.date_stamp())
    }

    pub fn partition_path(&self, dataset: &str, key: &PartitionKey) -> PathBuf {
        self.partition_dir(dataset, key)
            .join(Self::partition_file_name(dataset, key))
    }

    /// Create the year/month levels for a partition if they are missing.
    pub async fn ensure_partition_dir(
        &self,
        dataset: &str,
        key: &PartitionKey,
    ) -> Result<PathBuf, PersistenceError> {
        let dir = self.partition_dir(dataset, key);
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| PersistenceError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        Ok(dir.join(Self::partition_file_name(dataset, key)))
    }

    /// Merge `incoming` into the file at `path` and atomically replace it.
    /// Nothing is written when the merged rows equal what is already there.
    pub async fn merge_and_write<R: Record>(
        &self,
        path: &Path,
        incoming: &[R],
    ) -> Result<MergeOutcome, PersistenceError> {
        let existing = read_existing::<R>(path).await;
        let merged = merge_rows(&existing.rows, incoming);
        let changed = existing.state != FileState::Valid || merged != existing.rows;
        let added_rows = merged.len().saturating_sub(existing.rows.len());

        if changed {
            let bytes =
                serde_json::to_vec_pretty(&merged).map_err(|source| PersistenceError::Serialize {
                    path: path.to_path_buf(),
                    source,
                })?;
            write_atomic(path, &bytes).await?;
            debug!(path = %path.display(), rows = merged.len(), added_rows, "dataset file replaced");
        }

        Ok(MergeOutcome {
            path: path.to_path_buf(),
            changed,
            total_rows: merged.len(),
            added_rows,
        })
    }

    /// Write one batch into the flat file and every day partition it touches.
    /// Each file is independent; a failure is recorded and the rest proceed.
    pub async fn persist_batch<R: Record>(
        &self,
        dataset: &str,
        flat_file: &str,
        batch: &[R],
    ) -> PersistReport {
        let span = info_span!("persist_batch", dataset, rows = batch.len());
        async move {
            let mut report = PersistReport::default();

            let flat_path = self.flat_path(flat_file);
            match self.merge_and_write(&flat_path, batch).await {
                Ok(outcome) => report.written.push(outcome),
                Err(error) => {
                    warn!(path = %flat_path.display(), error = %error, "flat dataset write failed");
                    report.failed.push(FailedWrite {
                        path: flat_path,
                        error,
                    });
                }
            }

            let (groups, rejected) = partition_records(batch);
            for err in &rejected {
                warn!(dataset, error = %err, "record skipped for partitioning");
            }
            report.unpartitioned_records = rejected.len();

            for (key, rows) in groups {
                let path = match self.ensure_partition_dir(dataset, &key).await {
                    Ok(path) => path,
                    Err(error) => {
                        warn!(dataset, partition = %key, error = %error, "partition directory unavailable");
                        report.failed.push(FailedWrite {
                            path: self.partition_path(dataset, &key),
                            error,
                        });
                        continue;
                    }
                };
                match self.merge_and_write(&path, &rows).await {
                    Ok(outcome) => report.written.push(outcome),
                    Err(error) => {
                        warn!(dataset, partition = %key, error = %error, "partition write failed");
                        report.failed.push(FailedWrite { path, error });
                    }
                }
            }

            report
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading fixture {}: {source}", path.display())]
    Fixture {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Bounded-timeout GET client with retry on transient failures.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        dataset: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, dataset);
        self.get_with_retry(url).instrument(span).await
    }

    async fn get_with_retry(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, error = %err, "retrying fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        dataset: &str,
        url: &str,
    ) -> Result<T, FetchError> {
        let response = self.fetch_bytes(run_id, dataset, url).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.final_url,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use visitlog_core::VisitRecord;

    fn visit(email: &str, timestamp: &str) -> VisitRecord {
        VisitRecord {
            email: email.to_string(),
            ip: "1.1.1.1".to_string(),
            timestamp: timestamp.to_string(),
            user_agent: "Mozilla/5.0 (Linux; Android 14) Mobile".to_string(),
        }
    }

    async fn rows_in(path: &Path) -> Vec<VisitRecord> {
        let existing = read_existing::<VisitRecord>(path).await;
        assert_eq!(existing.state, FileState::Valid, "{}", path.display());
        existing.rows
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn partition_layout_is_year_month_day() {
        let store = DatasetStore::new("/data");
        let key = PartitionKey::from_canonical("2024-03-05 10:00:00").unwrap();
        assert_eq!(
            store.partition_path("visits", &key),
            PathBuf::from("/data/visits/2024/03/visits_2024-03-05.json")
        );
        assert_eq!(store.flat_path("visitor_data.json"), PathBuf::from("/data/visitor_data.json"));
    }

    #[tokio::test]
    async fn merge_dedupes_against_existing_rows() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path());
        let path = store.flat_path("visitor_data.json");

        let first = store
            .merge_and_write(&path, &[visit("a@x.com", "2024-03-05 10:00:00")])
            .await
            .expect("first merge");
        assert!(first.changed);
        assert_eq!(first.total_rows, 1);

        let second = store
            .merge_and_write(
                &path,
                &[
                    visit("a@x.com", "2024-03-05 10:00:00"),
                    visit("b@x.com", "2024-03-05 11:00:00"),
                ],
            )
            .await
            .expect("second merge");
        assert!(second.changed);
        assert_eq!(second.added_rows, 1);

        let third = store
            .merge_and_write(&path, &[visit("b@x.com", "2024-03-05 11:00:00")])
            .await
            .expect("third merge");
        assert!(!third.changed);

        let rows = rows_in(&path).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].email, "a@x.com");
    }

    #[tokio::test]
    async fn corrupt_file_is_replaced_not_fatal() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path());
        let path = store.flat_path("visitor_data.json");
        std::fs::write(&path, b"{not json").expect("seed corrupt file");

        let outcome = store
            .merge_and_write(&path, &[visit("a@x.com", "2024-03-05 10:00:00")])
            .await
            .expect("merge over corrupt file");
        assert!(outcome.changed);
        assert_eq!(rows_in(&path).await.len(), 1);
    }

    #[tokio::test]
    async fn uncommitted_stage_leaves_original_untouched() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("visitor_data.json");
        std::fs::write(&target, b"[]original").expect("seed");

        let staged = stage_bytes(&target, b"replacement").await.expect("stage");
        let temp_path = staged.temp_path().to_path_buf();
        assert!(temp_path.exists());
        assert_eq!(temp_path.parent(), target.parent());
        drop(staged);

        assert!(!temp_path.exists());
        assert_eq!(std::fs::read(&target).expect("read"), b"[]original");
    }

    #[tokio::test]
    async fn failed_replace_discards_temp_and_keeps_original() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("visitor_data.json");
        std::fs::write(&target, b"original").expect("seed");

        let staged = stage_bytes(&target, b"replacement").await.expect("stage");
        let temp_path = staged.temp_path().to_path_buf();
        // Swap the target for a non-empty directory so the rename itself fails.
        std::fs::remove_file(&target).expect("remove");
        std::fs::create_dir(&target).expect("dir");
        std::fs::write(target.join("keep"), b"x").expect("occupy");

        let err = staged.commit().await.expect_err("rename onto directory");
        assert!(matches!(err, PersistenceError::Replace { .. }));
        assert!(!temp_path.exists());
        assert!(target.join("keep").exists());
    }

    #[tokio::test]
    async fn record_lands_only_in_its_day_partition() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path());
        let batch = vec![
            visit("a@x.com", "2024-03-05 10:00:00"),
            visit("b@x.com", "2024-03-06 00:00:00"),
        ];

        let report = store
            .persist_batch("visits", "visitor_data.json", &batch)
            .await;
        assert!(report.failed.is_empty());
        assert_eq!(report.written.len(), 3);

        let day5 = rows_in(&dir.path().join("visits/2024/03/visits_2024-03-05.json")).await;
        let day6 = rows_in(&dir.path().join("visits/2024/03/visits_2024-03-06.json")).await;
        assert_eq!(day5, vec![batch[0].clone()]);
        assert_eq!(day6, vec![batch[1].clone()]);
        assert_eq!(rows_in(&store.flat_path("visitor_data.json")).await, batch);
    }

    #[tokio::test]
    async fn malformed_partition_timestamp_skips_only_that_record() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path());
        let batch = vec![
            visit("a@x.com", "2024-03-05 10:00:00"),
            visit("b@x.com", "not a time"),
        ];

        let report = store
            .persist_batch("visits", "visitor_data.json", &batch)
            .await;
        assert_eq!(report.unpartitioned_records, 1);
        assert!(report.failed.is_empty());
        assert_eq!(report.written.len(), 2);
        assert_eq!(
            rows_in(&dir.path().join("visits/2024/03/visits_2024-03-05.json"))
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn flat_and_partition_writes_commute() {
        let batch = vec![
            visit("a@x.com", "2024-03-05 10:00:00"),
            visit("b@x.com", "2024-03-05 12:00:00"),
        ];
        let key = PartitionKey::from_canonical("2024-03-05 10:00:00").unwrap();

        let flat_first = tempdir().expect("tempdir");
        let store_a = DatasetStore::new(flat_first.path());
        store_a
            .merge_and_write(&store_a.flat_path("all.json"), &batch)
            .await
            .expect("flat");
        let part_a = store_a.ensure_partition_dir("visits", &key).await.expect("dir");
        store_a.merge_and_write(&part_a, &batch).await.expect("partition");

        let partition_first = tempdir().expect("tempdir");
        let store_b = DatasetStore::new(partition_first.path());
        let part_b = store_b.ensure_partition_dir("visits", &key).await.expect("dir");
        store_b.merge_and_write(&part_b, &batch).await.expect("partition");
        store_b
            .merge_and_write(&store_b.flat_path("all.json"), &batch)
            .await
            .expect("flat");

        assert_eq!(
            std::fs::read(store_a.flat_path("all.json")).unwrap(),
            std::fs::read(store_b.flat_path("all.json")).unwrap()
        );
        assert_eq!(std::fs::read(part_a).unwrap(), std::fs::read(part_b).unwrap());
    }

    #[tokio::test]
    async fn ensure_partition_dir_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path());
        let key = PartitionKey::from_canonical("2024-12-31 23:59:59").unwrap();
        let first = store.ensure_partition_dir("users", &key).await.expect("first");
        let second = store.ensure_partition_dir("users", &key).await.expect("second");
        assert_eq!(first, second);
        assert!(dir.path().join("users/2024/12").is_dir());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn only_transient_statuses_retry() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn blocked_partition_does_not_stop_siblings_or_flat_file() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("visits/2024")).expect("year dir");
        std::fs::write(dir.path().join("visits/2024/03"), b"not a directory").expect("blocker");

        let batch = vec![
            visit("a@x.com", "2024-03-05 10:00:00"),
            visit("b@x.com", "2024-04-01 09:30:00"),
        ];
        let report = store
            .persist_batch("visits", "visitor_data.json", &batch)
            .await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(
            report.failed[0].path,
            dir.path().join("visits/2024/03/visits_2024-03-05.json")
        );
        assert!(matches!(
            report.failed[0].error,
            PersistenceError::CreateDir { .. }
        ));
        assert_eq!(rows_in(&dir.path().join("visitor_data.json")).await, batch);
        assert_eq!(
            rows_in(&dir.path().join("visits/2024/04/visits_2024-04-01.json")).await,
            vec![batch[1].clone()]
        );
        assert_eq!(report.written.len(), 2);
    }
}
