//! Core domain model for the Restaurant Board reservation ETL.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rbetl-core";

/// Fixed tag identifying the source portal for every record this pipeline
/// produces.
pub const VENDOR: &str = "restaurant_board";

/// One managed portal account, read fresh from the store directory at the
/// start of each run. Never mutated by this system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub store_id: String,
    #[serde(default)]
    pub store_name: Option<String>,
    pub username: String,
    pub password: String,
    #[serde(default = "default_days_back")]
    pub days_back: i64,
    #[serde(default)]
    pub from_date: Option<NaiveDate>,
    #[serde(default)]
    pub to_date: Option<NaiveDate>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_days_back() -> i64 {
    7
}

fn default_active() -> bool {
    true
}

impl StoreConfig {
    /// The extraction window for this store: an explicit override wins,
    /// otherwise yesterday minus the lookback through today.
    pub fn date_window(&self, today: NaiveDate) -> DateWindow {
        if let (Some(from), Some(to)) = (self.from_date, self.to_date) {
            return DateWindow { from, to };
        }
        DateWindow {
            from: today - Duration::days(1 + self.days_back),
            to: today,
        }
    }
}

/// Inclusive calendar window applied as the portal's reservation-date filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateWindow {
    /// Compact `YYYYMMDD-YYYYMMDD` label used in landing object names.
    pub fn label(&self) -> String {
        format!(
            "{}-{}",
            self.from.format("%Y%m%d"),
            self.to.format("%Y%m%d")
        )
    }
}

/// Raw bytes produced by the portal driver for one store and window.
/// Ephemeral: consumed by the codec immediately, never persisted as-is.
#[derive(Debug, Clone)]
pub struct RawExtract {
    pub bytes: Vec<u8>,
    pub downloaded_path: Option<std::path::PathBuf>,
}

/// Canonical unit of the domain. `record_hash` covers only the content
/// fields, so re-ingesting identical content under a different run yields
/// the same hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    // content fields
    pub store_id: String,
    pub store_name: Option<String>,
    pub reserve_date: NaiveDate,
    pub booking_date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub course_name: Option<String>,
    pub headcount: Option<u32>,
    pub channel: Option<String>,
    pub status: Option<String>,
    // metadata fields
    pub vendor: String,
    pub ingestion_ts: DateTime<Utc>,
    pub run_id: Uuid,
    pub record_key: String,
    pub record_hash: String,
}

/// Receipt returned by the staging loader for one appended batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingReceipt {
    pub job_id: Uuid,
    pub rows_written: usize,
}

/// Insert/update/no-op tallies reported by one merge invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCounts {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
}

impl MergeCounts {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.unchanged
    }
}

/// Terminal state of one store's processing within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreStatus {
    Succeeded,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOutcome {
    pub store_id: String,
    pub status: StoreStatus,
    pub records_normalized: usize,
    pub rows_skipped: usize,
    pub records_staged: usize,
}

impl StoreOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, StoreStatus::Succeeded)
    }
}

/// Final summary of one run, immutable once finalized. A failed run is
/// re-triggered externally under a new run id, never retried in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stores: Vec<StoreOutcome>,
    pub merge: Option<MergeCounts>,
}

impl RunSummary {
    pub fn stores_attempted(&self) -> usize {
        self.stores.len()
    }

    pub fn stores_succeeded(&self) -> usize {
        self.stores.iter().filter(|s| s.succeeded()).count()
    }

    pub fn stores_failed(&self) -> usize {
        self.stores.len() - self.stores_succeeded()
    }

    pub fn records_staged(&self) -> usize {
        self.stores.iter().map(|s| s.records_staged).sum()
    }

    pub fn partial_failure(&self) -> bool {
        self.stores_failed() > 0
    }
}
