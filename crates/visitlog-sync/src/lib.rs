//! Collector pipeline orchestration: fetch → normalize → persist → mirror.

pub mod remote;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use visitlog_adapters::{normalize_batch, EndpointSource, Normalize, RecordSource};
use visitlog_core::{DatasetKind, TargetZone, UserRecord, VisitRecord};
use visitlog_storage::{partition_records, DatasetStore, HttpClientConfig, HttpFetcher};

pub use remote::{
    ChecksumCache, DirectoryObjectStore, HttpObjectStore, InMemoryObjectStore, RemoteObject,
    RemoteStore, RemoteTarget, SyncClient, SyncError, SyncResult,
};

pub const CRATE_NAME: &str = "visitlog-sync";

pub const DATASETS_FILE: &str = "datasets.yaml";

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub poll_interval: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub target_zone: TargetZone,
    pub remote: Option<String>,
    pub remote_token: Option<String>,
    pub remote_folder: Option<String>,
}

impl CollectorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let positive_secs = |key: &str, default: u64| {
            get(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(default)
        };

        let target_zone = match get("VISITLOG_UTC_OFFSET") {
            Some(raw) => TargetZone::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "VISITLOG_UTC_OFFSET not understood; using host zone");
                TargetZone::Local
            }),
            None => TargetZone::Local,
        };

        Self {
            workspace_root: get("VISITLOG_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            data_dir: get("VISITLOG_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            poll_interval: Duration::from_secs(positive_secs("VISITLOG_POLL_INTERVAL_SECS", 60)),
            http_timeout_secs: positive_secs("VISITLOG_HTTP_TIMEOUT_SECS", 20),
            user_agent: get("VISITLOG_USER_AGENT")
                .unwrap_or_else(|| "visitlog-collector/0.1".to_string()),
            target_zone,
            remote: get("VISITLOG_REMOTE"),
            remote_token: get("VISITLOG_REMOTE_TOKEN"),
            remote_folder: get("VISITLOG_REMOTE_FOLDER"),
        }
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    pub kind: DatasetKind,
    pub url: String,
    pub flat_file: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub remote_folder: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetRegistry {
    pub datasets: Vec<DatasetConfig>,
}

impl DatasetRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing dataset registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(DATASETS_FILE);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut flat_files = HashSet::new();
        for dataset in &self.datasets {
            if dataset.name.is_empty() || dataset.name.contains(['/', '\\']) || dataset.name == ".." {
                bail!("dataset name `{}` is not a plain directory name", dataset.name);
            }
            if dataset.flat_file.is_empty() || dataset.flat_file.contains(['/', '\\']) {
                bail!(
                    "dataset `{}` flat_file `{}` must be a bare file name",
                    dataset.name,
                    dataset.flat_file
                );
            }
            if !names.insert(dataset.name.as_str()) {
                bail!("dataset `{}` is declared twice", dataset.name);
            }
            if !flat_files.insert(dataset.flat_file.as_str()) {
                bail!("flat file `{}` is shared by two datasets", dataset.flat_file);
            }
        }
        Ok(())
    }

    /// Enabled datasets with `${VAR}` placeholders in their URLs resolved.
    pub fn resolved(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<Vec<DatasetConfig>> {
        self.datasets
            .iter()
            .filter(|d| d.enabled)
            .map(|d| {
                let url = expand_placeholders(&d.url, &lookup)
                    .with_context(|| format!("resolving url for dataset `{}`", d.name))?;
                Ok(DatasetConfig {
                    url,
                    ..d.clone()
                })
            })
            .collect()
    }
}

/// Replace every `${NAME}` in `raw` using `lookup`.
pub fn expand_placeholders(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            bail!("unterminated placeholder in `{raw}`");
        };
        let name = &after[..end];
        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => bail!("environment variable `{name}` is not set"),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Latest canonical batch seen per dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "records", rename_all = "snake_case")]
pub enum Snapshot {
    Visits(Vec<VisitRecord>),
    Users(Vec<UserRecord>),
}

impl Snapshot {
    pub fn len(&self) -> usize {
        match self {
            Snapshot::Visits(rows) => rows.len(),
            Snapshot::Users(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Records that can be held as a [`Snapshot`].
pub trait SnapshotRecord: Normalize {
    fn into_snapshot(records: Vec<Self>) -> Snapshot;
}

impl SnapshotRecord for VisitRecord {
    fn into_snapshot(records: Vec<Self>) -> Snapshot {
        Snapshot::Visits(records)
    }
}

impl SnapshotRecord for UserRecord {
    fn into_snapshot(records: Vec<Self>) -> Snapshot {
        Snapshot::Users(records)
    }
}

/// All state that survives from one cycle to the next. Owned by whoever
/// drives the cycles and passed in by `&mut`.
#[derive(Debug, Default)]
pub struct PipelineContext {
    snapshots: HashMap<String, Snapshot>,
    pub checksums: ChecksumCache,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, dataset: &str) -> Option<&Snapshot> {
        self.snapshots.get(dataset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    Persisted,
    Unchanged,
    Empty,
    FetchFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSync {
    pub path: String,
    pub result: SyncResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetCycleSummary {
    pub dataset: String,
    pub status: DatasetStatus,
    pub fetched: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub files_changed: usize,
    pub write_failures: usize,
    pub unpartitioned: usize,
    pub synced: Vec<FileSync>,
}

impl DatasetCycleSummary {
    fn new(dataset: &str, status: DatasetStatus) -> Self {
        Self {
            dataset: dataset.to_string(),
            status,
            fetched: 0,
            accepted: 0,
            rejected: 0,
            duplicates: 0,
            files_changed: 0,
            write_failures: 0,
            unpartitioned: 0,
            synced: Vec::new(),
        }
    }

    pub fn sync_count(&self, result: SyncResult) -> usize {
        self.synced.iter().filter(|s| s.result == result).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub datasets: Vec<DatasetCycleSummary>,
}

impl CycleSummary {
    pub fn dataset(&self, name: &str) -> Option<&DatasetCycleSummary> {
        self.datasets.iter().find(|d| d.dataset == name)
    }

    /// Files that are out of step with their siblings until a later cycle.
    pub fn needs_attention(&self) -> bool {
        self.datasets.iter().any(|d| {
            d.write_failures > 0 || d.synced.iter().any(|s| s.result == SyncResult::Failed)
        })
    }
}

pub struct CollectorPipeline {
    datasets: Vec<DatasetConfig>,
    source: Box<dyn RecordSource>,
    store: DatasetStore,
    sync: Option<SyncClient>,
    target_zone: TargetZone,
}

impl CollectorPipeline {
    pub fn new(
        datasets: Vec<DatasetConfig>,
        source: Box<dyn RecordSource>,
        store: DatasetStore,
        sync: Option<SyncClient>,
        target_zone: TargetZone,
    ) -> Self {
        Self {
            datasets,
            source,
            store,
            sync,
            target_zone,
        }
    }

    /// Wire the HTTP source, data directory and remote target from config.
    pub fn from_config(config: &CollectorConfig) -> Result<Self> {
        let registry = DatasetRegistry::load(&config.workspace_root)?;
        let datasets = registry.resolved(|name| std::env::var(name).ok())?;
        if datasets.is_empty() {
            warn!("no enabled datasets; cycles will be no-ops");
        }

        let timeout = Duration::from_secs(config.http_timeout_secs);
        let http = HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let sync = build_sync_client(config, timeout)?;

        Ok(Self::new(
            datasets,
            Box::new(EndpointSource::new(http)),
            DatasetStore::new(config.data_dir.clone()),
            sync,
            config.target_zone,
        ))
    }

    pub fn datasets(&self) -> &[DatasetConfig] {
        &self.datasets
    }

    pub fn store(&self) -> &DatasetStore {
        &self.store
    }

    /// One fetch → normalize → persist → sync pass over every dataset.
    /// Failures stay local to the dataset or file they hit.
    pub async fn run_cycle(&self, ctx: &mut PipelineContext) -> CycleSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("collector_cycle", %run_id);

        let datasets = async {
            let mut summaries = Vec::with_capacity(self.datasets.len());
            for dataset in &self.datasets {
                let summary = match dataset.kind {
                    DatasetKind::Visits => {
                        self.run_dataset::<VisitRecord>(run_id, dataset, ctx).await
                    }
                    DatasetKind::Users => self.run_dataset::<UserRecord>(run_id, dataset, ctx).await,
                };
                summaries.push(summary);
            }
            summaries
        }
        .instrument(span)
        .await;

        let summary = CycleSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            datasets,
        };
        if summary.needs_attention() {
            warn!(%run_id, "cycle finished with files pending; they are retried next cycle");
        } else {
            info!(%run_id, datasets = summary.datasets.len(), "cycle finished");
        }
        summary
    }

    async fn run_dataset<R: SnapshotRecord>(
        &self,
        run_id: Uuid,
        dataset: &DatasetConfig,
        ctx: &mut PipelineContext,
    ) -> DatasetCycleSummary {
        let raw = match self.source.fetch_raw(run_id, &dataset.name, &dataset.url).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(dataset = %dataset.name, error = %err, "fetch failed; skipping dataset this cycle");
                return DatasetCycleSummary::new(&dataset.name, DatasetStatus::FetchFailed);
            }
        };

        let batch = normalize_batch::<R>(&raw, &self.target_zone);
        for err in &batch.rejected {
            warn!(dataset = %dataset.name, error = %err, "record dropped");
        }

        let mut summary = DatasetCycleSummary::new(&dataset.name, DatasetStatus::Persisted);
        summary.fetched = raw.len();
        summary.accepted = batch.records.len();
        summary.rejected = batch.rejected.len();
        summary.duplicates = batch.duplicates;

        if batch.records.is_empty() {
            summary.status = DatasetStatus::Empty;
            return summary;
        }

        let snapshot = R::into_snapshot(batch.records.clone());
        let offered = if ctx.snapshots.get(&dataset.name) == Some(&snapshot) {
            summary.status = DatasetStatus::Unchanged;
            self.batch_paths(dataset, &batch.records)
        } else {
            let report = self
                .store
                .persist_batch(&dataset.name, &dataset.flat_file, &batch.records)
                .await;
            summary.files_changed = report.changed_paths().count();
            summary.write_failures = report.failed.len();
            summary.unpartitioned = report.unpartitioned_records;
            // Any failed write forgets the snapshot so the next batch, even an
            // earlier one, is merged again.
            if report.failed.is_empty() {
                ctx.snapshots.insert(dataset.name.clone(), snapshot);
            } else {
                ctx.snapshots.remove(&dataset.name);
            }
            report.written.into_iter().map(|o| o.path).collect()
        };

        if let Some(sync) = &self.sync {
            let folder = dataset.remote_folder.as_deref();
            for path in offered {
                let result = sync.sync(&mut ctx.checksums, &path, folder).await;
                summary.synced.push(FileSync {
                    path: path.display().to_string(),
                    result,
                });
            }
        }

        info!(
            dataset = %dataset.name,
            status = ?summary.status,
            accepted = summary.accepted,
            files_changed = summary.files_changed,
            uploaded = summary.sync_count(SyncResult::Uploaded) + summary.sync_count(SyncResult::Updated),
            "dataset processed"
        );
        summary
    }

    /// Flat file plus the partition files a batch maps to, without writing.
    fn batch_paths<R: SnapshotRecord>(&self, dataset: &DatasetConfig, records: &[R]) -> Vec<PathBuf> {
        let (groups, _rejected) = partition_records(records);
        std::iter::once(self.store.flat_path(&dataset.flat_file))
            .chain(
                groups
                    .keys()
                    .map(|key| self.store.partition_path(&dataset.name, key)),
            )
            .collect()
    }
}

pub fn build_sync_client(config: &CollectorConfig, timeout: Duration) -> Result<Option<SyncClient>> {
    let Some(raw) = &config.remote else {
        return Ok(None);
    };
    let target = RemoteTarget::parse(raw).with_context(|| format!("parsing VISITLOG_REMOTE `{raw}`"))?;
    let store: Arc<dyn RemoteStore> = match target {
        RemoteTarget::Http { base_url } => Arc::new(HttpObjectStore::new(
            &base_url,
            config.remote_token.clone(),
            timeout,
        )?),
        RemoteTarget::Directory { path } => Arc::new(DirectoryObjectStore::new(path)),
    };
    Ok(Some(SyncClient::new(store, config.remote_folder.clone())))
}

/// Single cycle with a fresh context.
pub async fn run_once(config: &CollectorConfig) -> Result<CycleSummary> {
    let pipeline = CollectorPipeline::from_config(config)?;
    let mut ctx = PipelineContext::new();
    Ok(pipeline.run_cycle(&mut ctx).await)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Idle,
    Running,
}

/// Source of the delay between cycles.
#[async_trait]
pub trait Ticker: Send {
    async fn wait(&mut self, interval: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTicker;

#[async_trait]
impl Ticker for TokioTicker {
    async fn wait(&mut self, interval: Duration) {
        tokio::time::sleep(interval).await;
    }
}

/// Drives cycles forever with a fixed gap between the end of one cycle and
/// the start of the next.
#[derive(Debug)]
pub struct Poller<T: Ticker> {
    interval: Duration,
    ticker: T,
    state: PollerState,
    cycles: u64,
}

impl<T: Ticker> Poller<T> {
    pub fn new(interval: Duration, ticker: T) -> Self {
        Self {
            interval,
            ticker,
            state: PollerState::Idle,
            cycles: 0,
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles
    }

    pub fn ticker(&self) -> &T {
        &self.ticker
    }

    pub async fn run_cycle(
        &mut self,
        pipeline: &CollectorPipeline,
        ctx: &mut PipelineContext,
    ) -> CycleSummary {
        self.state = PollerState::Running;
        let summary = pipeline.run_cycle(ctx).await;
        self.state = PollerState::Idle;
        self.cycles += 1;
        summary
    }

    /// Wait one interval, then run a cycle.
    pub async fn step(
        &mut self,
        pipeline: &CollectorPipeline,
        ctx: &mut PipelineContext,
    ) -> CycleSummary {
        self.ticker.wait(self.interval).await;
        self.run_cycle(pipeline, ctx).await
    }

    /// Run a cycle now and keep going until `shutdown` resolves. Shutdown is
    /// only observed between cycles.
    pub async fn run_until<F>(
        &mut self,
        pipeline: &CollectorPipeline,
        ctx: &mut PipelineContext,
        shutdown: F,
    ) where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            self.run_cycle(pipeline, ctx).await;
            let interval = self.interval;
            let cycles = self.cycles;
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(cycles, "poller stopping");
                    return;
                }
                _ = self.ticker.wait(interval) => {}
            }
        }
    }
}
