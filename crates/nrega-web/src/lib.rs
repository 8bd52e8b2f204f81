//! Axum surface for the pipeline: the manual re-run trigger and a health
//! probe. Reporting routes live elsewhere.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use nrega_adapters::{DataGovSource, UpstreamConfig};
use nrega_storage::{DatabaseConfig, PgStore, PipelineStore};
use nrega_sync::{IngestPath, IngestionPipeline, RunSummary, SyncConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "nrega-web";

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<IngestionPipeline>,
    run_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(pipeline: Arc<IngestionPipeline>) -> Self {
        Self {
            pipeline,
            run_lock: Arc::new(Mutex::new(())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TriggerQuery {
    mode: Option<String>,
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    success: bool,
    message: String,
    summary: RunSummary,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/run-ingestion", post(run_ingestion_handler))
        .route("/api/health", get(health_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("NREGA_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let source = DataGovSource::new(&UpstreamConfig::from_env())?;
    let store = PgStore::connect(&DatabaseConfig::from_env())
        .await
        .context("connecting to database")?;
    let pipeline = IngestionPipeline::new(Arc::new(store), Arc::new(source), SyncConfig::from_env());
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "manual trigger listening");
    axum::serve(listener, app(AppState::new(Arc::new(pipeline)))).await?;
    Ok(())
}

async fn run_ingestion_handler(
    State(state): State<AppState>,
    Query(query): Query<TriggerQuery>,
) -> Response {
    let path = match query.mode.as_deref() {
        None => IngestPath::FullResync,
        Some(mode) => match IngestPath::parse(mode) {
            Some(path) => path,
            None => {
                return failure(StatusCode::BAD_REQUEST, format!("unknown mode `{mode}`"));
            }
        },
    };

    let Ok(_guard) = state.run_lock.try_lock() else {
        warn!("manual trigger rejected; a run is already in progress");
        return failure(StatusCode::CONFLICT, "ingestion already running".to_string());
    };

    info!(?path, "manual ingestion triggered");
    match state.pipeline.run(path).await {
        Ok(summary) if summary.succeeded() => Json(TriggerResponse {
            success: true,
            message: "Manual ingestion completed.".to_string(),
            summary,
        })
        .into_response(),
        Ok(summary) => {
            error!(failed_pages = summary.failed_pages, "manual ingestion aborted");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "error": format!(
                        "ingestion aborted after {} failed page fetches",
                        summary.failed_pages
                    ),
                    "summary": summary,
                })),
            )
                .into_response()
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "manual ingestion failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> Response {
    match state.pipeline.store().table_counts().await {
        Ok(counts) => Json(json!({ "success": true, "counts": counts })).into_response(),
        Err(err) => failure(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
    }
}

fn failure(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "success": false, "error": message }))).into_response()
}
