use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::db::DbHandle;
use crate::models::{PendingQuestion, QuestionState, RunRecord, StepResult};
use crate::router::{PipelineStartResponse, TriggerRouter};
use crate::runtime::Runtime;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub router: Arc<TriggerRouter>,
    pub runtime: Arc<Runtime>,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payload types ──────────────────────────────────

#[derive(Deserialize)]
pub struct QuestionsQuery {
    pub state: Option<String>,
}

#[derive(Serialize)]
pub struct RunDetail {
    pub run: RunRecord,
    pub steps: Vec<StepResult>,
    pub questions: Vec<PendingQuestion>,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
    pub run: RunRecord,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", e))
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/webhooks/tracker", post(receive_webhook))
        .route("/api/items/{id}", get(get_item))
        .route("/api/items/{id}/runs", get(list_item_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/questions", get(list_questions))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

/// Tracker webhook. Anything the router declines, malformed bodies
/// included, is a 200 with `accepted: false` so the tracker never retries it.
async fn receive_webhook(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Json<PipelineStartResponse>, ApiError> {
    let outcome = state.router.route_raw(&body).await.map_err(|e| {
        tracing::error!(error = %e, "webhook routing failed");
        ApiError::Internal(e.to_string())
    })?;
    Ok(Json(PipelineStartResponse::from(&outcome)))
}

async fn get_item(State(state): State<SharedState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let key = id.clone();
    let item = state
        .db
        .call(move |db| db.get_item(&key))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Item {} not found", id)))?;
    Ok(Json(item))
}

async fn list_item_runs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let key = id.clone();
    let runs = state
        .db
        .call(move |db| {
            if db.get_item(&key)?.is_none() {
                return Ok(None);
            }
            db.runs_for_item(&key).map(Some)
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Item {} not found", id)))?;
    Ok(Json(runs))
}

async fn get_run(State(state): State<SharedState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let key = id.clone();
    let detail = state
        .db
        .call(move |db| {
            let Some(run) = db.get_run(&key)? else {
                return Ok(None);
            };
            Ok(Some(RunDetail {
                steps: db.step_results(&key)?,
                questions: db.questions_for_run(&key)?,
                run,
            }))
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Run {} not found", id)))?;
    Ok(Json(detail))
}

async fn cancel_run(State(state): State<SharedState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let key = id.clone();
    let exists = state.db.call(move |db| db.get_run(&key)).await?.is_some();
    if !exists {
        return Err(ApiError::NotFound(format!("Run {} not found", id)));
    }

    let cancelled = state.runtime.cancel(&id).await?;
    let key = id.clone();
    let run = state
        .db
        .call(move |db| db.get_run(&key))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Run {} not found", id)))?;
    if !cancelled {
        return Err(ApiError::BadRequest(format!(
            "Run {} is {} and cannot be cancelled",
            id,
            run.state.as_str()
        )));
    }
    Ok(Json(CancelResponse { cancelled, run }))
}

async fn list_questions(
    State(state): State<SharedState>,
    Query(query): Query<QuestionsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let wanted = match query.state.as_deref() {
        None | Some("") => QuestionState::Pending,
        Some(s) => QuestionState::from_str(s).map_err(ApiError::BadRequest)?,
    };
    let questions = state.db.call(move |db| db.questions_in_state(wanted)).await?;
    Ok(Json(questions))
}
