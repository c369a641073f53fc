//! Run orchestration: directory lookup, per-store extraction, staging and
//! the end-of-run merge.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use rbetl_core::{
    DateWindow, MergeCounts, RunSummary, StoreConfig, StoreOutcome, StoreStatus, VENDOR,
};
use rbetl_normalize::codec;
use rbetl_normalize::{CodecError, KeyStrategy, Normalizer};
use rbetl_portal::{HttpPortalSession, PortalConfig, PortalError, ReservationPortal};
use rbetl_storage::{run_with_retry, LandingStore, RetryClass, RetryDisposition, RetryPolicy};
use rbetl_warehouse::{Warehouse, WarehouseError};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rbetl-sync";

/// Process-wide configuration, constructed once at startup and passed into
/// each component's constructor. No component reads ambient state directly.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub landing_dir: PathBuf,
    pub work_dir: PathBuf,
    pub stores_file: PathBuf,
    pub portal_base_url: String,
    pub user_agent: String,
    pub step_timeout: Duration,
    pub download_timeout: Duration,
    pub retry: RetryPolicy,
    pub key_strategy: KeyStrategy,
    pub staging_ttl_days: i64,
    pub landing_ttl_days: i64,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let key_strategy = match env_or("RBETL_KEY_STRATEGY", "auto").as_str() {
            "natural" => KeyStrategy::Natural,
            "composite" => KeyStrategy::Composite,
            _ => KeyStrategy::Auto,
        };
        Self {
            database_url: env_or("RBETL_DATABASE_URL", "sqlite:rbetl.db"),
            landing_dir: PathBuf::from(env_or("RBETL_LANDING_DIR", "./data")),
            work_dir: std::env::var("RBETL_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir()),
            stores_file: PathBuf::from(env_or("RBETL_STORES_FILE", "stores.yaml")),
            portal_base_url: env_or(
                "RBETL_PORTAL_BASE_URL",
                "https://manage.restaurant-board.example",
            ),
            user_agent: env_or("RBETL_USER_AGENT", "rbetl/0.1"),
            step_timeout: Duration::from_secs(env_parsed("RBETL_STEP_TIMEOUT_SECS", 30)),
            download_timeout: Duration::from_secs(env_parsed("RBETL_DOWNLOAD_TIMEOUT_SECS", 60)),
            retry: RetryPolicy {
                max_attempts: env_parsed("RBETL_MAX_ATTEMPTS", 3),
                base_delay: Duration::from_millis(env_parsed("RBETL_RETRY_BASE_DELAY_MS", 1000)),
            },
            key_strategy,
            staging_ttl_days: env_parsed("RBETL_STAGING_TTL_DAYS", 30),
            landing_ttl_days: env_parsed("RBETL_LANDING_TTL_DAYS", 30),
        }
    }

    pub fn portal_config(&self) -> PortalConfig {
        PortalConfig {
            base_url: self.portal_base_url.clone(),
            user_agent: self.user_agent.clone(),
            step_timeout: self.step_timeout,
            download_timeout: self.download_timeout,
            work_dir: self.work_dir.clone(),
            ..PortalConfig::default()
        }
    }
}

/// External store-directory collaborator, reduced to "returns credential
/// records". Invalid rows are skipped and logged, never fatal for the
/// lookup; a failing lookup itself is fatal for the run.
#[async_trait]
pub trait StoreDirectory: Send + Sync {
    async fn list_active_stores(&self) -> anyhow::Result<Vec<StoreConfig>>;
}

#[derive(Debug, Clone, Deserialize)]
struct StoresFile {
    stores: Vec<StoreRow>,
}

/// Permissive row shape so one malformed entry cannot fail the whole file.
#[derive(Debug, Clone, Deserialize)]
struct StoreRow {
    #[serde(default)]
    store_id: Option<String>,
    #[serde(default)]
    store_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    days_back: Option<i64>,
    #[serde(default)]
    from_date: Option<chrono::NaiveDate>,
    #[serde(default)]
    to_date: Option<chrono::NaiveDate>,
    #[serde(default = "default_true")]
    active: bool,
}

fn default_true() -> bool {
    true
}

impl StoreRow {
    fn validate(self) -> Option<StoreConfig> {
        let store_id = self.store_id.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let username = self.username.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let password = self.password.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        Some(StoreConfig {
            store_id: store_id.to_string(),
            store_name: self.store_name.clone().filter(|s| !s.trim().is_empty()),
            username: username.to_string(),
            password: password.to_string(),
            days_back: self.days_back.unwrap_or(7),
            from_date: self.from_date,
            to_date: self.to_date,
            active: self.active,
        })
    }
}

/// Store directory backed by a `stores.yaml` file.
#[derive(Debug, Clone)]
pub struct YamlStoreDirectory {
    path: PathBuf,
}

impl YamlStoreDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StoreDirectory for YamlStoreDirectory {
    async fn list_active_stores(&self) -> anyhow::Result<Vec<StoreConfig>> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let file: StoresFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", self.path.display()))?;

        let total = file.stores.len();
        let mut stores = Vec::new();
        for (idx, row) in file.stores.into_iter().enumerate() {
            if !row.active {
                continue;
            }
            match row.validate() {
                Some(store) => stores.push(store),
                None => {
                    tracing::warn!(row = idx + 1, "store row missing required fields, skipped");
                }
            }
        }
        tracing::info!(total, active = stores.len(), "store directory loaded");
        Ok(stores)
    }
}

/// Hands the orchestrator a fresh, exclusively-owned portal session per
/// store. Sessions are never shared between stores.
pub trait PortalConnector: Send + Sync {
    fn connect(&self) -> Box<dyn ReservationPortal>;
}

pub struct HttpPortalConnector {
    config: PortalConfig,
}

impl HttpPortalConnector {
    pub fn new(config: PortalConfig) -> Self {
        Self { config }
    }
}

impl PortalConnector for HttpPortalConnector {
    fn connect(&self) -> Box<dyn ReservationPortal> {
        Box::new(HttpPortalSession::new(self.config.clone()))
    }
}

/// Failure of one store's pipeline. Caught at the store boundary and turned
/// into a summary entry, never propagated past it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("extraction failed: {0}")]
    Portal(#[from] PortalError),
    #[error("normalization failed: {0}")]
    Codec(#[from] CodecError),
    #[error("landing write failed: {0}")]
    Landing(#[source] anyhow::Error),
    #[error("staging append failed: {0}")]
    Staging(#[from] WarehouseError),
}

impl RetryClass for StoreError {
    fn retry_disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Portal(err) => err.retry_disposition(),
            // A response the codec cannot parse will not parse next attempt.
            StoreError::Codec(_) => RetryDisposition::Terminal,
            StoreError::Landing(_) | StoreError::Staging(_) => RetryDisposition::Retryable,
        }
    }
}

/// Failure that aborts the whole run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("store directory lookup failed: {0}")]
    Directory(#[source] anyhow::Error),
    #[error("merge failed: {0}")]
    Merge(#[from] WarehouseError),
}

struct StorePass {
    records_normalized: usize,
    rows_skipped: usize,
    records_staged: usize,
}

pub struct SyncPipeline {
    config: SyncConfig,
    directory: Box<dyn StoreDirectory>,
    connector: Box<dyn PortalConnector>,
    landing: LandingStore,
    warehouse: Warehouse,
    normalizer: Normalizer,
}

impl SyncPipeline {
    /// Production wiring from configuration alone.
    pub async fn from_config(config: SyncConfig) -> anyhow::Result<Self> {
        let warehouse = Warehouse::connect(&config.database_url)
            .await
            .context("connecting warehouse")?;
        warehouse.migrate().await.context("migrating warehouse")?;
        let directory = Box::new(YamlStoreDirectory::new(config.stores_file.clone()));
        let connector = Box::new(HttpPortalConnector::new(config.portal_config()));
        Ok(Self::new(config, directory, connector, warehouse))
    }

    /// Explicit wiring; the seam the tests use to inject fakes.
    pub fn new(
        config: SyncConfig,
        directory: Box<dyn StoreDirectory>,
        connector: Box<dyn PortalConnector>,
        warehouse: Warehouse,
    ) -> Self {
        let landing = LandingStore::new(config.landing_dir.clone());
        let normalizer = Normalizer::new(config.key_strategy);
        Self {
            config,
            directory,
            connector,
            landing,
            warehouse,
            normalizer,
        }
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    pub async fn list_stores(&self) -> anyhow::Result<Vec<StoreConfig>> {
        self.directory.list_active_stores().await
    }

    /// One run: directory lookup, sequential per-store processing with
    /// failures isolated per store, then exactly one merge after the
    /// per-store barrier, only if at least one store succeeded.
    pub async fn run_once(&self) -> Result<RunSummary, RunError> {
        self.run_with_id(Uuid::new_v4()).await
    }

    /// Same as `run_once` with a caller-chosen run id, so a trigger surface
    /// can hand the id back before the run finishes.
    pub async fn run_with_id(&self, run_id: Uuid) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        let span = tracing::info_span!("run", %run_id);
        let _guard = span.enter();
        tracing::info!("run started");

        let stores = self
            .directory
            .list_active_stores()
            .await
            .map_err(RunError::Directory)?;
        if stores.is_empty() {
            tracing::warn!("no active stores to process");
            return Ok(RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                stores: Vec::new(),
                merge: None,
            });
        }

        let today = Utc::now().date_naive();
        let mut outcomes = Vec::with_capacity(stores.len());
        for store in &stores {
            let window = store.date_window(today);
            outcomes.push(self.process_store(store, window, run_id).await);
        }

        let merge = if outcomes.iter().any(StoreOutcome::succeeded) {
            Some(self.warehouse.merge_run(run_id).await?)
        } else {
            tracing::warn!("no store succeeded, skipping merge");
            None
        };

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            stores: outcomes,
            merge,
        };
        tracing::info!(
            attempted = summary.stores_attempted(),
            succeeded = summary.stores_succeeded(),
            failed = summary.stores_failed(),
            staged = summary.records_staged(),
            "run finalized"
        );
        Ok(summary)
    }

    /// The whole per-store pipeline is the retry unit; a failed store is
    /// recorded and the run moves on to the next one.
    async fn process_store(
        &self,
        store: &StoreConfig,
        window: DateWindow,
        run_id: Uuid,
    ) -> StoreOutcome {
        let result = run_with_retry(self.config.retry, &store.store_id, || {
            self.store_pipeline(store, window, run_id)
        })
        .await;

        match result {
            Ok(pass) => StoreOutcome {
                store_id: store.store_id.clone(),
                status: StoreStatus::Succeeded,
                records_normalized: pass.records_normalized,
                rows_skipped: pass.rows_skipped,
                records_staged: pass.records_staged,
            },
            Err(err) => {
                let reason = err.to_string();
                tracing::error!(store_id = %store.store_id, error = %reason, "store processing failed");
                StoreOutcome {
                    store_id: store.store_id.clone(),
                    status: StoreStatus::Failed { reason },
                    records_normalized: 0,
                    rows_skipped: 0,
                    records_staged: 0,
                }
            }
        }
    }

    async fn store_pipeline(
        &self,
        store: &StoreConfig,
        window: DateWindow,
        run_id: Uuid,
    ) -> Result<StorePass, StoreError> {
        let mut portal = self.connector.connect();
        let result = self
            .store_pipeline_with_session(portal.as_mut(), store, window, run_id)
            .await;
        // The session is released on every exit path.
        portal.close().await;
        result
    }

    async fn store_pipeline_with_session(
        &self,
        portal: &mut dyn ReservationPortal,
        store: &StoreConfig,
        window: DateWindow,
        run_id: Uuid,
    ) -> Result<StorePass, StoreError> {
        portal.open().await?;
        let raw = portal.extract(store, window).await?;

        let outcome = self
            .normalizer
            .normalize_extract(&raw, store, run_id, Utc::now())?;
        tracing::info!(
            store_id = %store.store_id,
            records = outcome.records.len(),
            skipped = outcome.skipped_rows,
            field_errors = outcome.field_errors,
            "extract normalized"
        );

        let csv_bytes = codec::write_normalized_csv(&outcome.records)?;
        let object_name = self.landing.landing_object_name(
            VENDOR,
            Utc::now().date_naive(),
            run_id,
            &store.store_id,
            &window.label(),
        );
        let metadata = HashMap::from([
            ("store_id".to_string(), store.store_id.clone()),
            ("run_id".to_string(), run_id.to_string()),
        ]);
        self.landing
            .put(&object_name, &csv_bytes, Some(&metadata))
            .await
            .map_err(StoreError::Landing)?;

        let receipt = self.warehouse.append_batch(run_id, &outcome.records).await?;

        // The raw download is ours to clean up once consumed.
        if let Some(path) = &raw.downloaded_path {
            let _ = tokio::fs::remove_file(path).await;
        }

        Ok(StorePass {
            records_normalized: outcome.records.len(),
            rows_skipped: outcome.skipped_rows,
            records_staged: receipt.rows_written,
        })
    }

    /// Operator backfill: an already-normalized CSV goes through the same
    /// staging append and the same merge as the automated path.
    pub async fn run_manual_backfill(&self, csv_path: &Path) -> anyhow::Result<BackfillSummary> {
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        let bytes = tokio::fs::read(csv_path)
            .await
            .with_context(|| format!("reading backfill csv {}", csv_path.display()))?;
        let records = codec::parse_normalized_csv(&bytes, run_id, now)
            .context("parsing backfill csv")?;

        let file_name = csv_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("backfill_{run_id}.csv"));
        let object_name = self
            .landing
            .manual_object_name(VENDOR, now.date_naive(), &file_name);
        self.landing
            .put(&object_name, &bytes, None)
            .await
            .context("landing backfill csv")?;

        let receipt = self
            .warehouse
            .append_batch(run_id, &records)
            .await
            .context("staging backfill rows")?;
        let merge = self
            .warehouse
            .merge_run(run_id)
            .await
            .context("merging backfill run")?;

        tracing::info!(%run_id, rows = receipt.rows_written, "manual backfill finished");
        Ok(BackfillSummary {
            run_id,
            rows_staged: receipt.rows_written,
            merge,
        })
    }

    /// TTL sweeps over staging rows and landing objects. Storage policy, not
    /// a correctness mechanism.
    pub async fn run_cleanup(&self) -> anyhow::Result<CleanupSummary> {
        let staging_deleted = self
            .warehouse
            .cleanup_staging(self.config.staging_ttl_days)
            .await
            .context("cleaning staging")?;
        let landing_deleted = self
            .landing
            .cleanup_older_than(Path::new("landing"), self.config.landing_ttl_days)
            .await
            .context("cleaning landing objects")?;
        Ok(CleanupSummary {
            staging_deleted,
            landing_deleted,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillSummary {
    pub run_id: Uuid,
    pub rows_staged: usize,
    pub merge: MergeCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupSummary {
    pub staging_deleted: u64,
    pub landing_deleted: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directory_filters_inactive_and_invalid_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stores.yaml");
        std::fs::write(
            &path,
            r#"
stores:
  - store_id: S1
    store_name: Sakura Tei
    username: owner1
    password: secret1
  - store_id: S2
    username: owner2
    password: secret2
    active: false
  - store_id: S3
    username: ""
    password: secret3
  - store_id: S4
    username: owner4
    password: secret4
    days_back: 3
"#,
        )
        .expect("write stores.yaml");

        let stores = YamlStoreDirectory::new(&path)
            .list_active_stores()
            .await
            .expect("list");
        let ids: Vec<_> = stores.iter().map(|s| s.store_id.as_str()).collect();
        assert_eq!(ids, ["S1", "S4"]);
        assert_eq!(stores[1].days_back, 3);
    }

    #[tokio::test]
    async fn directory_lookup_failure_is_an_error() {
        let missing = YamlStoreDirectory::new("/nonexistent/stores.yaml");
        assert!(missing.list_active_stores().await.is_err());
    }

    #[test]
    fn codec_errors_are_terminal_for_retry() {
        let err = StoreError::Codec(CodecError::MissingColumn("store_id"));
        assert_eq!(err.retry_disposition(), RetryDisposition::Terminal);
        let err = StoreError::Portal(PortalError::DownloadNotFound);
        assert_eq!(err.retry_disposition(), RetryDisposition::Retryable);
    }
}
