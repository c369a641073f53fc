//! Axum trigger/status surface for the ETL pipeline. Carries nothing beyond
//! "start now": every per-store parameter comes from the store directory.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use rbetl_sync::SyncPipeline;
use rbetl_warehouse::ReservationRow;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rbetl-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct StoreView {
    store_id: String,
    store_name: Option<String>,
    username: String,
    password: &'static str,
    days_back: i64,
    active: bool,
}

#[derive(Debug, Serialize)]
struct StoresResponse {
    stores: Vec<StoreView>,
    count: usize,
}

#[derive(Debug, Serialize)]
struct RunAccepted {
    run_id: Uuid,
    accepted: bool,
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    from_date: NaiveDate,
    to_date: NaiveDate,
    #[serde(default)]
    store_ids: Option<Vec<String>>,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    1000
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    success: bool,
    data: Vec<ReservationRow>,
    total_count: usize,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stores", get(stores_handler))
        .route("/etl/run", post(run_handler))
        .route("/query", post(query_handler))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "web surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    })
}

async fn stores_handler(State(state): State<AppState>) -> Response {
    match state.pipeline.list_stores().await {
        Ok(stores) => {
            let stores: Vec<StoreView> = stores
                .into_iter()
                .map(|s| StoreView {
                    store_id: s.store_id,
                    store_name: s.store_name,
                    username: s.username,
                    password: "***masked***",
                    days_back: s.days_back,
                    active: s.active,
                })
                .collect();
            let count = stores.len();
            Json(StoresResponse { stores, count }).into_response()
        }
        Err(err) => server_error(err),
    }
}

/// Kick off a run in the background and hand the run id back immediately;
/// the summary lands in the logs, not this response.
async fn run_handler(State(state): State<AppState>) -> Response {
    let run_id = Uuid::new_v4();
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        match pipeline.run_with_id(run_id).await {
            Ok(summary) => {
                tracing::info!(
                    %run_id,
                    succeeded = summary.stores_succeeded(),
                    failed = summary.stores_failed(),
                    "triggered run finished"
                );
            }
            Err(err) => {
                tracing::error!(%run_id, error = %err, "triggered run failed");
            }
        }
    });
    (
        StatusCode::ACCEPTED,
        Json(RunAccepted {
            run_id,
            accepted: true,
        }),
    )
        .into_response()
}

async fn query_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Response {
    let result = state
        .pipeline
        .warehouse()
        .query_reservations(
            request.from_date,
            request.to_date,
            request.store_ids.as_deref(),
            request.limit,
        )
        .await;
    match result {
        Ok(data) => {
            let total_count = data.len();
            Json(QueryResponse {
                success: true,
                data,
                total_count,
            })
            .into_response()
        }
        Err(err) => server_error(anyhow::Error::new(err)),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    tracing::error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}
