use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::models::{RunId, RunRequest};
use super::runner::PipelineRunner;
use super::scenarios::{self, ScenarioSummary};
use super::ws::{Keepalive, progress_ws_handler};
use crate::errors::PipelineError;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub runner: PipelineRunner,
    pub keepalive: Keepalive,
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCreated {
    pub run_id: RunId,
}

#[derive(Debug, Serialize)]
pub struct ScenarioCatalog {
    pub templates: Vec<ScenarioSummary>,
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    /// Rejected run configuration; no record was created.
    Configuration(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Configuration(msg) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": msg, "kind": "configuration"})),
            )
                .into_response(),
            ApiError::NotFound(msg) => error_body(StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => error_body(StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => error_body(StatusCode::INTERNAL_SERVER_ERROR, msg),
        }
    }
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({"error": message}))).into_response()
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::RunNotFound { .. } => ApiError::NotFound(err.to_string()),
            PipelineError::NotCancellable { .. } | PipelineError::OwnedElsewhere { .. } => {
                ApiError::Conflict(err.to_string())
            }
            PipelineError::InvalidConfig(e) => ApiError::Configuration(e.to_string()),
            PipelineError::Database(_) | PipelineError::Other(_) => {
                tracing::error!(error = %format!("{:#}", err), "Request failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/runs", get(list_runs).post(create_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/healing", get(get_healing))
        .route("/api/runs/{id}/logs", get(get_logs))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/runs/{id}/progress", get(progress_ws_handler))
        .route("/api/scenarios/templates", get(list_scenario_templates))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_run(
    State(state): State<SharedState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    // A malformed body is a configuration error like any other bad field.
    let Json(req) = payload.map_err(|e| ApiError::Configuration(e.body_text()))?;
    let run = state.runner.start(&req).await?;
    Ok((StatusCode::ACCEPTED, Json(RunCreated { run_id: run.id })))
}

async fn list_runs(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.runner.list(limit).await?))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<RunId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.runner.snapshot(id).await?))
}

async fn get_healing(
    State(state): State<SharedState>,
    Path(id): Path<RunId>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.runner.snapshot(id).await?;
    Ok(Json(run.healing_report()))
}

async fn get_logs(
    State(state): State<SharedState>,
    Path(id): Path<RunId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.runner.logs(id).await?))
}

async fn list_scenario_templates() -> Json<ScenarioCatalog> {
    Json(ScenarioCatalog {
        templates: scenarios::summaries(),
    })
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<RunId>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.runner.cancel(id).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}
