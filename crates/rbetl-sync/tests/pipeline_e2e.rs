//! End-to-end pipeline scenarios against a scripted portal and an in-memory
//! warehouse.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rbetl_core::{DateWindow, RawExtract, StoreConfig, VENDOR};
use rbetl_normalize::KeyStrategy;
use rbetl_portal::{PortalError, ReservationPortal};
use rbetl_storage::RetryPolicy;
use rbetl_sync::{PortalConnector, StoreDirectory, SyncConfig, SyncPipeline};
use rbetl_warehouse::Warehouse;

#[derive(Clone)]
enum Scripted {
    Csv(&'static str),
    SecondFactor,
    Timeout,
}

#[derive(Clone, Default)]
struct PortalScript {
    responses: Arc<Mutex<HashMap<String, Scripted>>>,
    events: Arc<Mutex<Vec<String>>>,
}

impl PortalScript {
    fn set(&self, store_id: &str, response: Scripted) {
        self.responses
            .lock()
            .unwrap()
            .insert(store_id.to_string(), response);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }
}

struct ScriptedPortal {
    script: PortalScript,
    opened: bool,
}

#[async_trait]
impl ReservationPortal for ScriptedPortal {
    async fn open(&mut self) -> Result<(), PortalError> {
        self.script.events.lock().unwrap().push("open".into());
        self.opened = true;
        Ok(())
    }

    async fn extract(
        &mut self,
        store: &StoreConfig,
        _window: DateWindow,
    ) -> Result<RawExtract, PortalError> {
        self.script
            .events
            .lock()
            .unwrap()
            .push(format!("extract:{}", store.store_id));
        if !self.opened {
            return Err(PortalError::SessionNotOpen);
        }
        let response = self
            .script
            .responses
            .lock()
            .unwrap()
            .get(&store.store_id)
            .cloned();
        match response {
            Some(Scripted::Csv(text)) => Ok(RawExtract {
                bytes: text.as_bytes().to_vec(),
                downloaded_path: None,
            }),
            Some(Scripted::SecondFactor) => Err(PortalError::AuthenticationRequired),
            Some(Scripted::Timeout) | None => Err(PortalError::NavigationTimeout {
                step: "reservation_list",
                timeout_ms: 1,
            }),
        }
    }

    async fn close(&mut self) {
        self.script.events.lock().unwrap().push("close".into());
        self.opened = false;
    }
}

struct ScriptedConnector {
    script: PortalScript,
}

impl PortalConnector for ScriptedConnector {
    fn connect(&self) -> Box<dyn ReservationPortal> {
        Box::new(ScriptedPortal {
            script: self.script.clone(),
            opened: false,
        })
    }
}

struct StaticDirectory {
    stores: Vec<StoreConfig>,
}

#[async_trait]
impl StoreDirectory for StaticDirectory {
    async fn list_active_stores(&self) -> anyhow::Result<Vec<StoreConfig>> {
        Ok(self.stores.clone())
    }
}

fn store(store_id: &str) -> StoreConfig {
    StoreConfig {
        store_id: store_id.to_string(),
        store_name: None,
        username: "owner".into(),
        password: "secret".into(),
        days_back: 7,
        from_date: None,
        to_date: None,
        active: true,
    }
}

fn test_config(landing_dir: PathBuf) -> SyncConfig {
    SyncConfig {
        database_url: "sqlite::memory:".into(),
        landing_dir,
        work_dir: std::env::temp_dir(),
        stores_file: PathBuf::from("stores.yaml"),
        portal_base_url: "https://portal.invalid".into(),
        user_agent: "rbetl-test".into(),
        step_timeout: Duration::from_secs(5),
        download_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        },
        key_strategy: KeyStrategy::Auto,
        staging_ttl_days: 30,
        landing_ttl_days: 30,
    }
}

async fn pipeline(
    stores: Vec<StoreConfig>,
    script: PortalScript,
    landing_dir: PathBuf,
) -> SyncPipeline {
    let warehouse = Warehouse::connect("sqlite::memory:").await.expect("connect");
    warehouse.migrate().await.expect("migrate");
    SyncPipeline::new(
        test_config(landing_dir),
        Box::new(StaticDirectory { stores }),
        Box::new(ScriptedConnector { script }),
        warehouse,
    )
}

const THREE_ROW_EXTRACT: &str = "\
予約日,予約時間,コース名,人数,経路,予約番号
2026-08-01,18:00,Omakase,2,電話,R1
,19:00,Seasonal,4,電話,R2
2026-08-02,20:00,Kaiseki,3,ネット予約,R3
";

#[tokio::test]
async fn run_stages_valid_rows_and_merge_is_idempotent() {
    let landing = tempfile::tempdir().expect("tempdir");
    let script = PortalScript::default();
    script.set("S1", Scripted::Csv(THREE_ROW_EXTRACT));

    let pipeline = pipeline(vec![store("S1")], script, landing.path().to_path_buf()).await;
    let summary = pipeline.run_once().await.expect("run");

    assert_eq!(summary.stores_succeeded(), 1);
    assert_eq!(summary.stores[0].records_normalized, 2);
    assert_eq!(summary.stores[0].rows_skipped, 1);
    assert_eq!(summary.records_staged(), 2);

    let merge = summary.merge.expect("merge ran");
    assert_eq!((merge.inserted, merge.updated, merge.unchanged), (2, 0, 0));
    assert_eq!(merge.total(), 2);

    // Second merge for the same run with no new staged rows: pure no-op.
    let again = pipeline
        .warehouse()
        .merge_run(summary.run_id)
        .await
        .expect("re-merge");
    assert_eq!((again.inserted, again.updated, again.unchanged), (0, 0, 2));

    // The normalized artifact landed under the automated-run convention.
    let landed: Vec<_> = walkdir(landing.path());
    assert!(
        landed
            .iter()
            .any(|p| p.contains(&format!("landing/{VENDOR}")) && p.ends_with(".csv")),
        "expected landing object, found {landed:?}"
    );
}

#[tokio::test]
async fn later_run_updates_changed_reservation_in_place() {
    let landing = tempfile::tempdir().expect("tempdir");
    let script = PortalScript::default();
    script.set("S1", Scripted::Csv(THREE_ROW_EXTRACT));

    let pipeline = pipeline(vec![store("S1")], script.clone(), landing.path().to_path_buf()).await;
    pipeline.run_once().await.expect("first run");

    // Same reservations on a later day, R1's party grew from 2 to 5.
    script.set(
        "S1",
        Scripted::Csv(
            "予約日,予約時間,コース名,人数,経路,予約番号\n\
             2026-08-01,18:00,Omakase,5,電話,R1\n\
             2026-08-02,20:00,Kaiseki,3,ネット予約,R3\n",
        ),
    );
    let second = pipeline.run_once().await.expect("second run");
    let merge = second.merge.expect("merge ran");
    assert_eq!((merge.inserted, merge.updated, merge.unchanged), (0, 1, 1));

    let production = pipeline
        .warehouse()
        .production_record(VENDOR, "S1", "S1|R1")
        .await
        .expect("fetch")
        .expect("present");
    assert_eq!(production.row.headcount, Some(5));
    assert!(production.updated_at > production.created_at);
}

#[tokio::test]
async fn store_failures_are_isolated_and_sessions_released() {
    let landing = tempfile::tempdir().expect("tempdir");
    let script = PortalScript::default();
    script.set("S1", Scripted::SecondFactor);
    script.set("S2", Scripted::Csv(THREE_ROW_EXTRACT));

    let pipeline = pipeline(
        vec![store("S1"), store("S2")],
        script.clone(),
        landing.path().to_path_buf(),
    )
    .await;
    let summary = pipeline.run_once().await.expect("run");

    assert!(summary.partial_failure());
    assert_eq!(summary.stores_succeeded(), 1);
    assert_eq!(summary.stores_failed(), 1);
    // The second-factor gate is terminal: exactly one attempt for S1.
    assert_eq!(script.count("extract:S1"), 1);
    // Every opened session was closed, failure path included.
    assert_eq!(script.count("open"), script.count("close"));

    // The healthy store still merged.
    let merge = summary.merge.expect("merge ran");
    assert_eq!(merge.inserted, 2);
}

#[tokio::test]
async fn transient_failures_retry_to_the_attempt_cap() {
    let landing = tempfile::tempdir().expect("tempdir");
    let script = PortalScript::default();
    script.set("S1", Scripted::Timeout);

    let pipeline = pipeline(vec![store("S1")], script.clone(), landing.path().to_path_buf()).await;
    let summary = pipeline.run_once().await.expect("run");

    assert_eq!(summary.stores_failed(), 1);
    assert_eq!(script.count("extract:S1"), 3);
    // No store succeeded: merge must not run.
    assert!(summary.merge.is_none());
}

#[tokio::test]
async fn manual_backfill_reuses_staging_and_merge() {
    let landing = tempfile::tempdir().expect("tempdir");
    let work = tempfile::tempdir().expect("tempdir");
    let script = PortalScript::default();
    script.set("S1", Scripted::Csv(THREE_ROW_EXTRACT));

    let pipeline = pipeline(vec![store("S1")], script, landing.path().to_path_buf()).await;
    let summary = pipeline.run_once().await.expect("run");

    // Re-export the landed normalized CSV as an operator backfill into a
    // fresh warehouse-backed pipeline.
    let landed = walkdir(landing.path())
        .into_iter()
        .find(|p| p.contains("landing/") && p.ends_with(".csv"))
        .expect("landing object");
    let backfill_path = work.path().join("backfill.csv");
    std::fs::copy(&landed, &backfill_path).expect("copy");

    let second_landing = tempfile::tempdir().expect("tempdir");
    let empty_script = PortalScript::default();
    let fresh = pipeline_without_stores(empty_script, second_landing.path().to_path_buf()).await;
    let backfill = fresh
        .run_manual_backfill(&backfill_path)
        .await
        .expect("backfill");

    assert_eq!(backfill.rows_staged, summary.records_staged());
    assert_eq!(backfill.merge.inserted, 2);
    assert_eq!(
        fresh.warehouse().production_row_count().await.expect("count"),
        2
    );

    // Backfill landed under the manual convention, not the automated one.
    let manual_objects = walkdir(second_landing.path());
    assert!(
        manual_objects
            .iter()
            .any(|p| p.contains(&format!("manual/{VENDOR}"))),
        "expected manual object, found {manual_objects:?}"
    );
}

async fn pipeline_without_stores(script: PortalScript, landing_dir: PathBuf) -> SyncPipeline {
    pipeline(Vec::new(), script, landing_dir).await
}

#[tokio::test]
async fn empty_directory_finalizes_successfully_with_zero_stores() {
    let landing = tempfile::tempdir().expect("tempdir");
    let pipeline = pipeline_without_stores(PortalScript::default(), landing.path().to_path_buf()).await;
    let summary = pipeline.run_once().await.expect("run");
    assert_eq!(summary.stores_attempted(), 0);
    assert!(summary.merge.is_none());
    assert!(!summary.partial_failure());
}

fn walkdir(root: &std::path::Path) -> Vec<String> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path.to_string_lossy().into_owned());
            }
        }
    }
    out
}
