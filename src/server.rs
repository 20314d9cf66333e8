//! HTTP surface
//!
//! Serves the artifacts straight from disk and exposes triggers for
//! aggregation, backup and restore. `/status` is answered from in-memory
//! state only, so it stays responsive while a run is busy with I/O.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::aggregate::artifacts::{self, HISTORICAL_FILE, INDEX_FILE, METADATA_FILE, RECENT_FILE};
use crate::aggregate::Metadata;
use crate::backup::{BackupStats, BackupTrigger, ProviderStatus};
use crate::error::{AggregateError, BackupError};
use crate::health::HealthSnapshot;
use crate::scheduler::Service;
use crate::RunOutcome;

#[derive(Clone)]
pub struct AppState {
    service: Arc<Service>,
}

pub fn router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/historical.json", get(|s: State<AppState>| serve_artifact(s, HISTORICAL_FILE)))
        .route("/recent.json", get(|s: State<AppState>| serve_artifact(s, RECENT_FILE)))
        .route("/metadata.json", get(|s: State<AppState>| serve_artifact(s, METADATA_FILE)))
        .route("/index.json", get(|s: State<AppState>| serve_artifact(s, INDEX_FILE)))
        .route("/output/:date", get(daily_archive))
        .route("/aggregate", post(trigger_aggregate))
        .route("/backup", post(trigger_backup))
        .route("/restore", post(trigger_restore))
        .route("/events/ingestion", post(ingestion_event))
        .route("/status", get(status))
        .route("/health", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { service })
}

/// Serve until `shutdown` is cancelled
pub async fn serve(service: Arc<Service>, port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let app = router(service);
    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Server running on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn serve_artifact(State(state): State<AppState>, name: &str) -> Result<Response, AppError> {
    let path = state.service.engine.artifact_dir().join(name);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(([(header::CONTENT_TYPE, "application/json")], bytes).into_response()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AppError::ArtifactNotFound(name.to_string())),
        Err(e) => {
            error!("Failed to read {:?}: {}", path, e);
            Err(AppError::Internal(format!("failed to read {}", name)))
        }
    }
}

async fn daily_archive(State(state): State<AppState>, Path(date): Path<String>) -> Result<Response, AppError> {
    let date = date.trim_end_matches(".json");
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| AppError::InvalidDate(date.to_string()))?;
    let name = artifacts::daily_file_name(date);
    serve_artifact(State(state), &name).await
}

#[derive(Serialize)]
struct AggregateResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Metadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    changed_files: Option<Vec<String>>,
}

async fn trigger_aggregate(State(state): State<AppState>) -> Result<Response, AppError> {
    match state.service.aggregate().await {
        Ok(RunOutcome::Completed(report)) => Ok(Json(AggregateResponse {
            status: "completed",
            metadata: Some(report.metadata),
            changed_files: Some(report.changed_files),
        })
        .into_response()),
        Ok(RunOutcome::Coalesced) => Ok(coalesced()),
        Err(AggregateError::NoDataAvailable { shards_seen }) => Err(AppError::NoDataAvailable(format!(
            "no readable data in {} shards; previous artifacts kept",
            shards_seen
        ))),
        Err(e) => Err(AppError::Internal(e.to_string())),
    }
}

#[derive(Serialize)]
struct BackupResponse {
    status: &'static str,
    success: bool,
    files_attempted: usize,
    files_succeeded: usize,
    files_failed: usize,
    bytes_uploaded: u64,
    manifest_key: Option<String>,
    manifest_stored_on: Vec<String>,
    pruned_objects: usize,
}

async fn trigger_backup(State(state): State<AppState>) -> Result<Response, AppError> {
    match state.service.backup(BackupTrigger::Manual).await {
        Ok(RunOutcome::Completed(report)) => Ok(Json(BackupResponse {
            status: "completed",
            success: report.success,
            files_attempted: report.manifest.files_attempted,
            files_succeeded: report.manifest.files_succeeded,
            files_failed: report.manifest.files_failed,
            bytes_uploaded: report.bytes_uploaded,
            manifest_key: report.manifest_key,
            manifest_stored_on: report.manifest_stored_on,
            pruned_objects: report.pruned_objects,
        })
        .into_response()),
        Ok(RunOutcome::Coalesced) => Ok(coalesced()),
        Err(BackupError::Disabled) => Err(AppError::BackupDisabled),
        Err(BackupError::NoProvidersAvailable) => Err(AppError::NoProvidersAvailable),
        Err(e) => Err(AppError::Internal(e.to_string())),
    }
}

async fn trigger_restore(State(state): State<AppState>) -> Result<Response, AppError> {
    match state.service.recovery.run(true).await {
        RunOutcome::Completed(report) => {
            if report.files_restored > 0 || report.shards_restored > 0 {
                state.service.triggers().aggregate();
            }
            Ok(Json(report).into_response())
        }
        RunOutcome::Coalesced => Ok(coalesced()),
    }
}

#[derive(Deserialize)]
struct IngestionEvent {
    ok: bool,
}

async fn ingestion_event(State(state): State<AppState>, Json(event): Json<IngestionEvent>) -> StatusCode {
    let triggers = state.service.triggers();
    if event.ok {
        triggers.ingestion_ok();
    } else {
        triggers.ingestion_error();
    }
    StatusCode::ACCEPTED
}

#[derive(Serialize)]
struct AggregationStatus {
    running: bool,
    last_metadata: Option<Metadata>,
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    started_at: DateTime<Utc>,
    uptime_seconds: i64,
    health: HealthSnapshot,
    providers: Vec<ProviderStatus>,
    backup_enabled: bool,
    backup: BackupStats,
    aggregation: AggregationStatus,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let service = &state.service;
    let health = service.health.snapshot().await;
    Json(StatusResponse {
        status: if health.degraded { "degraded" } else { "healthy" },
        started_at: service.started_at,
        uptime_seconds: (Utc::now() - service.started_at).num_seconds(),
        health,
        providers: service.registry.statuses(),
        backup_enabled: service.orchestrator.is_enabled(),
        backup: service.orchestrator.stats().await,
        aggregation: AggregationStatus {
            running: service.engine.is_running(),
            last_metadata: service.engine.last_metadata().await,
        },
    })
}

fn coalesced() -> Response {
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "coalesced",
            "message": "a run is already in progress and will cover this request"
        })),
    )
        .into_response()
}

#[derive(Debug)]
enum AppError {
    ArtifactNotFound(String),
    InvalidDate(String),
    NoDataAvailable(String),
    BackupDisabled,
    NoProvidersAvailable,
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::ArtifactNotFound(name) => (StatusCode::NOT_FOUND, format!("{} has not been generated yet", name)),
            AppError::InvalidDate(date) => (StatusCode::BAD_REQUEST, format!("invalid date {:?}, expected YYYY-MM-DD", date)),
            AppError::NoDataAvailable(message) => (StatusCode::SERVICE_UNAVAILABLE, message),
            AppError::BackupDisabled => (StatusCode::SERVICE_UNAVAILABLE, "backups are disabled".to_string()),
            AppError::NoProvidersAvailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "no backup providers available".to_string(),
            ),
            AppError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };

        error!("API Error: {} - {}", status, message);

        let body = Json(serde_json::json!({
            "error": message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}
