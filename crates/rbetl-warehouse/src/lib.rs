//! Analytical store: append-only staging plus the hash-gated merge into the
//! production reservation table.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rbetl_core::{MergeCounts, NormalizedRecord, StagingReceipt};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rbetl-warehouse";

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// One production row as returned by the reservation query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReservationRow {
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
}

/// Full production record including bookkeeping, used by merge verification
/// and operational inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductionRecord {
    pub row: ReservationRow,
    pub vendor: String,
    pub record_key: String,
    pub record_hash: String,
    pub run_id: String,
    pub ingestion_ts: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Warehouse {
    pool: SqlitePool,
    // Two merges must never interleave; sqlite serializes writers but the
    // dedup read would otherwise race a concurrent merge's commit.
    merge_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Warehouse {
    pub async fn connect(url: &str) -> Result<Self, WarehouseError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // An in-memory sqlite database exists per connection; a wider pool
        // would hand each caller a different empty database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            merge_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), WarehouseError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stage_reservations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                store_id TEXT NOT NULL,
                store_name TEXT,
                reserve_date TEXT NOT NULL,
                booking_date TEXT,
                start_time TEXT,
                end_time TEXT,
                course_name TEXT,
                headcount INTEGER,
                channel TEXT,
                status TEXT,
                vendor TEXT NOT NULL,
                ingestion_ts TEXT NOT NULL,
                run_id TEXT NOT NULL,
                record_key TEXT NOT NULL,
                record_hash TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_stage_run ON stage_reservations(run_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_stage_ingestion ON stage_reservations(ingestion_ts)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reservations (
                vendor TEXT NOT NULL,
                store_id TEXT NOT NULL,
                record_key TEXT NOT NULL,
                store_name TEXT,
                reserve_date TEXT NOT NULL,
                booking_date TEXT,
                start_time TEXT,
                end_time TEXT,
                course_name TEXT,
                headcount INTEGER,
                channel TEXT,
                status TEXT,
                ingestion_ts TEXT NOT NULL,
                run_id TEXT NOT NULL,
                record_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (vendor, store_id, record_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_reservations_date ON reservations(reserve_date, store_id)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append one batch under `run_id`. Append-only by design: re-appending
    /// the same batch produces duplicate rows, and the merge's dedup step is
    /// the single place duplicates are resolved.
    pub async fn append_batch(
        &self,
        run_id: Uuid,
        records: &[NormalizedRecord],
    ) -> Result<StagingReceipt, WarehouseError> {
        let job_id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO stage_reservations
                    (store_id, store_name, reserve_date, booking_date, start_time, end_time,
                     course_name, headcount, channel, status, vendor, ingestion_ts, run_id,
                     record_key, record_hash)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.store_id)
            .bind(&record.store_name)
            .bind(record.reserve_date)
            .bind(record.booking_date)
            .bind(record.start_time)
            .bind(record.end_time)
            .bind(&record.course_name)
            .bind(record.headcount)
            .bind(&record.channel)
            .bind(&record.status)
            .bind(&record.vendor)
            .bind(record.ingestion_ts)
            .bind(run_id.to_string())
            .bind(&record.record_key)
            .bind(&record.record_hash)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        tracing::info!(%run_id, %job_id, rows = records.len(), "staging batch appended");
        Ok(StagingReceipt {
            job_id,
            rows_written: records.len(),
        })
    }

    /// Consolidate every staged row tagged with `run_id` into production:
    /// dedup per record key (latest ingestion wins, latest written row on
    /// ties), then insert / update / no-op gated by the content hash, all in
    /// one transaction so readers never observe a half-applied merge.
    /// Re-running with no new staged rows is a no-op.
    pub async fn merge_run(&self, run_id: Uuid) -> Result<MergeCounts, WarehouseError> {
        let _serialized = self.merge_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let staged = sqlx::query(
            r#"
            SELECT id, store_id, store_name, reserve_date, booking_date, start_time, end_time,
                   course_name, headcount, channel, status, vendor, ingestion_ts, record_key,
                   record_hash
              FROM stage_reservations
             WHERE run_id = ?
            "#,
        )
        .bind(run_id.to_string())
        .fetch_all(&mut *tx)
        .await?;

        // Latest ingestion per record key; row id breaks exact timestamp ties
        // deterministically in favor of the most recently written row.
        let mut latest: HashMap<String, StagedRow> = HashMap::new();
        for row in staged {
            let staged_row = StagedRow::from_row(&row)?;
            match latest.get(&staged_row.record_key) {
                Some(existing)
                    if (existing.ingestion_ts, existing.id)
                        >= (staged_row.ingestion_ts, staged_row.id) => {}
                _ => {
                    latest.insert(staged_row.record_key.clone(), staged_row);
                }
            }
        }

        let mut counts = MergeCounts::default();
        for staged_row in latest.values() {
            let existing = sqlx::query(
                r#"
                SELECT record_hash FROM reservations
                 WHERE vendor = ? AND store_id = ? AND record_key = ?
                "#,
            )
            .bind(&staged_row.vendor)
            .bind(&staged_row.store_id)
            .bind(&staged_row.record_key)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO reservations
                            (vendor, store_id, record_key, store_name, reserve_date, booking_date,
                             start_time, end_time, course_name, headcount, channel, status,
                             ingestion_ts, run_id, record_hash, created_at, updated_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(&staged_row.vendor)
                    .bind(&staged_row.store_id)
                    .bind(&staged_row.record_key)
                    .bind(&staged_row.store_name)
                    .bind(staged_row.reserve_date)
                    .bind(staged_row.booking_date)
                    .bind(staged_row.start_time)
                    .bind(staged_row.end_time)
                    .bind(&staged_row.course_name)
                    .bind(staged_row.headcount)
                    .bind(&staged_row.channel)
                    .bind(&staged_row.status)
                    .bind(staged_row.ingestion_ts)
                    .bind(run_id.to_string())
                    .bind(&staged_row.record_hash)
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    counts.inserted += 1;
                }
                Some(row) => {
                    let existing_hash: String = row.try_get("record_hash")?;
                    if existing_hash == staged_row.record_hash {
                        counts.unchanged += 1;
                        continue;
                    }
                    sqlx::query(
                        r#"
                        UPDATE reservations
                           SET store_name = ?, reserve_date = ?, booking_date = ?,
                               start_time = ?, end_time = ?, course_name = ?, headcount = ?,
                               channel = ?, status = ?, ingestion_ts = ?, run_id = ?,
                               record_hash = ?, updated_at = ?
                         WHERE vendor = ? AND store_id = ? AND record_key = ?
                        "#,
                    )
                    .bind(&staged_row.store_name)
                    .bind(staged_row.reserve_date)
                    .bind(staged_row.booking_date)
                    .bind(staged_row.start_time)
                    .bind(staged_row.end_time)
                    .bind(&staged_row.course_name)
                    .bind(staged_row.headcount)
                    .bind(&staged_row.channel)
                    .bind(&staged_row.status)
                    .bind(staged_row.ingestion_ts)
                    .bind(run_id.to_string())
                    .bind(&staged_row.record_hash)
                    .bind(now)
                    .bind(&staged_row.vendor)
                    .bind(&staged_row.store_id)
                    .bind(&staged_row.record_key)
                    .execute(&mut *tx)
                    .await?;
                    counts.updated += 1;
                }
            }
        }

        tx.commit().await?;
        tracing::info!(
            %run_id,
            inserted = counts.inserted,
            updated = counts.updated,
            unchanged = counts.unchanged,
            "merge finished"
        );
        Ok(counts)
    }

    /// Coarse staging TTL. Retention economics, not a correctness mechanism:
    /// merges only ever read rows for their own run id.
    pub async fn cleanup_staging(&self, days_to_keep: i64) -> Result<u64, WarehouseError> {
        let cutoff = Utc::now() - chrono::Duration::days(days_to_keep);
        let result = sqlx::query("DELETE FROM stage_reservations WHERE ingestion_ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        tracing::info!(deleted = result.rows_affected(), days_to_keep, "staging cleanup finished");
        Ok(result.rows_affected())
    }

    pub async fn query_reservations(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        store_ids: Option<&[String]>,
        limit: i64,
    ) -> Result<Vec<ReservationRow>, WarehouseError> {
        let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(
            "SELECT store_id, store_name, reserve_date, booking_date, start_time, end_time, \
             course_name, headcount, channel, status FROM reservations WHERE reserve_date BETWEEN ",
        );
        builder.push_bind(from);
        builder.push(" AND ");
        builder.push_bind(to);
        if let Some(store_ids) = store_ids.filter(|ids| !ids.is_empty()) {
            builder.push(" AND store_id IN (");
            let mut separated = builder.separated(", ");
            for store_id in store_ids {
                separated.push_bind(store_id);
            }
            builder.push(")");
        }
        builder.push(" ORDER BY reserve_date, store_id LIMIT ");
        builder.push_bind(limit);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(reservation_row).collect()
    }

    pub async fn production_record(
        &self,
        vendor: &str,
        store_id: &str,
        record_key: &str,
    ) -> Result<Option<ProductionRecord>, WarehouseError> {
        let row = sqlx::query(
            r#"
            SELECT store_id, store_name, reserve_date, booking_date, start_time, end_time,
                   course_name, headcount, channel, status, vendor, record_key, record_hash,
                   run_id, ingestion_ts, created_at, updated_at
              FROM reservations
             WHERE vendor = ? AND store_id = ? AND record_key = ?
            "#,
        )
        .bind(vendor)
        .bind(store_id)
        .bind(record_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(ProductionRecord {
                row: reservation_row(&row)?,
                vendor: row.try_get("vendor")?,
                record_key: row.try_get("record_key")?,
                record_hash: row.try_get("record_hash")?,
                run_id: row.try_get("run_id")?,
                ingestion_ts: row.try_get("ingestion_ts")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    pub async fn staged_row_count(&self, run_id: Uuid) -> Result<u64, WarehouseError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM stage_reservations WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    pub async fn production_row_count(&self) -> Result<u64, WarehouseError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM reservations")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }
}

fn reservation_row(row: &sqlx::sqlite::SqliteRow) -> Result<ReservationRow, WarehouseError> {
    Ok(ReservationRow {
        store_id: row.try_get("store_id")?,
        store_name: row.try_get("store_name")?,
        reserve_date: row.try_get("reserve_date")?,
        booking_date: row.try_get("booking_date")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        course_name: row.try_get("course_name")?,
        headcount: row.try_get("headcount")?,
        channel: row.try_get("channel")?,
        status: row.try_get("status")?,
    })
}

#[derive(Debug, Clone)]
struct StagedRow {
    id: i64,
    store_id: String,
    store_name: Option<String>,
    reserve_date: NaiveDate,
    booking_date: Option<NaiveDate>,
    start_time: Option<NaiveTime>,
    end_time: Option<NaiveTime>,
    course_name: Option<String>,
    headcount: Option<u32>,
    channel: Option<String>,
    status: Option<String>,
    vendor: String,
    ingestion_ts: DateTime<Utc>,
    record_key: String,
    record_hash: String,
}

impl StagedRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, WarehouseError> {
        Ok(Self {
            id: row.try_get("id")?,
            store_id: row.try_get("store_id")?,
            store_name: row.try_get("store_name")?,
            reserve_date: row.try_get("reserve_date")?,
            booking_date: row.try_get("booking_date")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            course_name: row.try_get("course_name")?,
            headcount: row.try_get("headcount")?,
            channel: row.try_get("channel")?,
            status: row.try_get("status")?,
            vendor: row.try_get("vendor")?,
            ingestion_ts: row.try_get("ingestion_ts")?,
            record_key: row.try_get("record_key")?,
            record_hash: row.try_get("record_hash")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rbetl_core::VENDOR;

    async fn warehouse() -> Warehouse {
        let warehouse = Warehouse::connect("sqlite::memory:").await.expect("connect");
        warehouse.migrate().await.expect("migrate");
        warehouse
    }

    fn record(key: &str, headcount: u32, run_id: Uuid, ingestion_ts: DateTime<Utc>) -> NormalizedRecord {
        let mut record = NormalizedRecord {
            store_id: "S1".into(),
            store_name: Some("Sakura Tei".into()),
            reserve_date: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
            booking_date: None,
            start_time: NaiveTime::from_hms_opt(18, 0, 0),
            end_time: None,
            course_name: Some("Omakase".into()),
            headcount: Some(headcount),
            channel: Some("phone".into()),
            status: Some("confirmed".into()),
            vendor: VENDOR.into(),
            ingestion_ts,
            run_id,
            record_key: key.into(),
            record_hash: String::new(),
        };
        // Content-derived stand-in: changes when headcount changes.
        record.record_hash = format!("hash-{key}-{headcount}");
        record
    }

    #[tokio::test]
    async fn merge_inserts_then_is_idempotent() {
        let warehouse = warehouse().await;
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        let batch = vec![record("k1", 2, run_id, now), record("k2", 4, run_id, now)];

        let receipt = warehouse.append_batch(run_id, &batch).await.expect("append");
        assert_eq!(receipt.rows_written, 2);
        assert_eq!(warehouse.staged_row_count(run_id).await.unwrap(), 2);

        let first = warehouse.merge_run(run_id).await.expect("merge");
        assert_eq!((first.inserted, first.updated, first.unchanged), (2, 0, 0));
        assert_eq!(first.total(), 2);

        let second = warehouse.merge_run(run_id).await.expect("re-merge");
        assert_eq!((second.inserted, second.updated, second.unchanged), (0, 0, 2));
        assert_eq!(warehouse.production_row_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn dedup_keeps_latest_ingestion_per_key() {
        let warehouse = warehouse().await;
        let run_id = Uuid::new_v4();
        let earlier = Utc::now() - Duration::seconds(60);
        let later = Utc::now();

        warehouse
            .append_batch(run_id, &[record("k1", 2, run_id, earlier)])
            .await
            .expect("append earlier");
        warehouse
            .append_batch(run_id, &[record("k1", 6, run_id, later)])
            .await
            .expect("append later");

        let counts = warehouse.merge_run(run_id).await.expect("merge");
        assert_eq!((counts.inserted, counts.updated, counts.unchanged), (1, 0, 0));

        let production = warehouse
            .production_record(VENDOR, "S1", "k1")
            .await
            .expect("fetch")
            .expect("present");
        assert_eq!(production.row.headcount, Some(6));
    }

    #[tokio::test]
    async fn three_way_classification_and_bookkeeping() {
        let warehouse = warehouse().await;

        let run1 = Uuid::new_v4();
        warehouse
            .append_batch(run1, &[record("k1", 2, run1, Utc::now())])
            .await
            .expect("append run1");
        warehouse.merge_run(run1).await.expect("merge run1");

        let inserted = warehouse
            .production_record(VENDOR, "S1", "k1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inserted.created_at, inserted.updated_at);

        // Same key, changed content: update with updated_at advanced.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let run2 = Uuid::new_v4();
        warehouse
            .append_batch(run2, &[record("k1", 5, run2, Utc::now())])
            .await
            .expect("append run2");
        let counts = warehouse.merge_run(run2).await.expect("merge run2");
        assert_eq!((counts.inserted, counts.updated, counts.unchanged), (0, 1, 0));

        let updated = warehouse
            .production_record(VENDOR, "S1", "k1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.row.headcount, Some(5));
        assert_eq!(updated.created_at, inserted.created_at);
        assert!(updated.updated_at > inserted.updated_at);

        // Same key, same content: no-op and updated_at untouched.
        let run3 = Uuid::new_v4();
        warehouse
            .append_batch(run3, &[record("k1", 5, run3, Utc::now())])
            .await
            .expect("append run3");
        let counts = warehouse.merge_run(run3).await.expect("merge run3");
        assert_eq!((counts.inserted, counts.updated, counts.unchanged), (0, 0, 1));
        let unchanged = warehouse
            .production_record(VENDOR, "S1", "k1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unchanged.updated_at, updated.updated_at);
    }

    #[tokio::test]
    async fn merge_never_deletes_production_rows() {
        let warehouse = warehouse().await;
        let run1 = Uuid::new_v4();
        warehouse
            .append_batch(run1, &[record("k1", 2, run1, Utc::now()), record("k2", 3, run1, Utc::now())])
            .await
            .expect("append");
        warehouse.merge_run(run1).await.expect("merge");

        // A later run where k2 disappeared from the source.
        let run2 = Uuid::new_v4();
        warehouse
            .append_batch(run2, &[record("k1", 2, run2, Utc::now())])
            .await
            .expect("append");
        warehouse.merge_run(run2).await.expect("merge");
        assert_eq!(warehouse.production_row_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn staging_ttl_removes_only_expired_rows() {
        let warehouse = warehouse().await;
        let run_id = Uuid::new_v4();
        let stale = Utc::now() - Duration::days(40);
        warehouse
            .append_batch(run_id, &[record("old", 1, run_id, stale), record("new", 1, run_id, Utc::now())])
            .await
            .expect("append");

        let deleted = warehouse.cleanup_staging(30).await.expect("cleanup");
        assert_eq!(deleted, 1);
        assert_eq!(warehouse.staged_row_count(run_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_filters_by_window_and_store() {
        let warehouse = warehouse().await;
        let run_id = Uuid::new_v4();
        let mut other_store = record("k9", 2, run_id, Utc::now());
        other_store.store_id = "S2".into();
        other_store.reserve_date = NaiveDate::from_ymd_opt(2026, 9, 15).unwrap();
        warehouse
            .append_batch(run_id, &[record("k1", 2, run_id, Utc::now()), other_store])
            .await
            .expect("append");
        warehouse.merge_run(run_id).await.expect("merge");

        let rows = warehouse
            .query_reservations(
                NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
                NaiveDate::from_ymd_opt(2026, 8, 31).unwrap(),
                None,
                100,
            )
            .await
            .expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].store_id, "S1");

        let filtered = warehouse
            .query_reservations(
                NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
                NaiveDate::from_ymd_opt(2026, 9, 30).unwrap(),
                Some(&["S2".to_string()]),
                100,
            )
            .await
            .expect("query");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].store_id, "S2");
    }
}
