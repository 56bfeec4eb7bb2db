//! # HTTP API
//!
//! Thin pass-through routes over [`UnlockService`]. Everything except the
//! subscription requires the configured access key, given either as
//! `Authorization: Bearer <key>` or as `X-Access-Key: <key>`.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use lib_unlock::checker::error::PersistenceError;
use lib_unlock::UnlockService;
use serde_json::json;
use tracing::{error, info, warn};

/// Header accepted as an alternative to bearer authentication.
pub const ACCESS_KEY_HEADER: &str = "x-access-key";

#[derive(Clone)]
pub struct ApiState {
    service: Arc<UnlockService>,
    access_key: Arc<str>,
}

impl ApiState {
    pub fn new(service: Arc<UnlockService>, access_key: &str) -> Self {
        Self {
            service,
            access_key: Arc::from(access_key),
        }
    }
}

/// # Application Error
///
/// Failures of the API, rendered as JSON bodies.
#[derive(Debug)]
pub enum AppError {
    /// Missing or wrong access key.
    Unauthorized,
    /// A run is already in progress; manual requests are not queued.
    RunInProgress,
    /// Nothing has been persisted yet.
    NotFound(&'static str),
    /// Reading a persisted artifact failed.
    Storage(PersistenceError),
}

impl From<PersistenceError> for AppError {
    fn from(e: PersistenceError) -> Self {
        AppError::Storage(e)
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Unauthorized => write!(f, "Missing or invalid access key"),
            AppError::RunInProgress => write!(f, "A run is already in progress"),
            AppError::NotFound(what) => write!(f, "No {} available yet", what),
            AppError::Storage(e) => write!(f, "Storage error: {}", e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            AppError::RunInProgress => (StatusCode::CONFLICT, "RunInProgress"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            AppError::Storage(e) => {
                error!("Storage error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "StorageError")
            }
        };
        let body = json!({
            "error_type": error_type,
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Key presented by the client, bearer first.
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    bearer.or_else(|| {
        headers
            .get(ACCESS_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
    })
}

async fn require_access_key(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let authorized = matches!(
        presented_key(request.headers()),
        Some(key) if !state.access_key.is_empty() && key.trim() == &*state.access_key
    );
    if !authorized {
        warn!("Rejected {} {}: bad access key", request.method(), request.uri());
        return Err(AppError::Unauthorized);
    }
    Ok(next.run(request).await)
}

async fn scheduler_status(State(state): State<ApiState>) -> Response {
    Json(state.service.get_status().await).into_response()
}

async fn scheduler_start(State(state): State<ApiState>) -> Response {
    let started = state.service.start_scheduler();
    info!("Scheduler start requested (started: {})", started);
    Json(json!({ "started": started })).into_response()
}

async fn scheduler_stop(State(state): State<ApiState>) -> Response {
    let stopped = state.service.stop_scheduler();
    info!("Scheduler stop requested (stopped: {})", stopped);
    Json(json!({ "stopped": stopped })).into_response()
}

async fn run_now(State(state): State<ApiState>) -> Result<Response, AppError> {
    if !state.service.run_now() {
        return Err(AppError::RunInProgress);
    }
    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": true }))).into_response())
}

async fn latest_results(State(state): State<ApiState>) -> Result<Response, AppError> {
    let run = state
        .service
        .latest_run()?
        .ok_or(AppError::NotFound("results"))?;
    Ok(Json(run).into_response())
}

async fn download_results(State(state): State<ApiState>) -> Result<Response, AppError> {
    let bytes = state
        .service
        .downloadable_snapshot()?
        .ok_or(AppError::NotFound("results"))?;
    let headers = [
        (header::CONTENT_TYPE, HeaderValue::from_static("application/json")),
        (
            header::CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=\"unlock_results.json\""),
        ),
    ];
    Ok((headers, bytes).into_response())
}

async fn subscription(State(state): State<ApiState>) -> Result<Response, AppError> {
    let yaml = state
        .service
        .subscription()?
        .ok_or(AppError::NotFound("subscription"))?;
    let headers = [(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/yaml; charset=utf-8"),
    )];
    Ok((headers, yaml).into_response())
}

/// Builds the API router.
pub fn router(state: ApiState) -> Router {
    let protected = Router::new()
        .route("/api/scheduler/status", get(scheduler_status))
        .route("/api/scheduler/start", post(scheduler_start))
        .route("/api/scheduler/stop", post(scheduler_stop))
        .route("/api/scheduler/run-now", post(run_now))
        .route("/api/results", get(latest_results))
        .route("/api/results/download", get(download_results))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_access_key,
        ));

    Router::new()
        .merge(protected)
        .route("/api/subscription", get(subscription))
        .with_state(state)
}
