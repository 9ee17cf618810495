//! HTTP request handlers

use super::types::{
    AckResponse, ErrorResponse, HealthResponse, JobStatusRequest, NotificationsResponse, ResetResponse,
};
use super::AppState;
use crate::backend::with_error;
use crate::error::CoreError;
use crate::jobs::JobStatus;
use crate::wire::{InboundEvent, ResponseDescriptor};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Transport ingress
        .route("/api/events", post(post_event))
        .route("/api/users/:user_id/notifications", get(drain_notifications))
        .route("/api/users/:user_id/session", delete(reset_session))
        // Backend push
        .route("/api/jobs/:job_id/status", post(push_job_status))
        .route("/api/health", get(health))
        .with_state(state)
}

async fn post_event(
    State(state): State<AppState>,
    Json(event): Json<InboundEvent>,
) -> Result<Json<ResponseDescriptor>, AppError> {
    if event.user_id.trim().is_empty() {
        return Err(AppError::BadRequest("user_id must not be empty".to_string()));
    }
    let reply = state.orchestrator.handle(event).await?;
    Ok(Json(reply))
}

async fn push_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(req): Json<JobStatusRequest>,
) -> Result<Json<AckResponse>, AppError> {
    let status = JobStatus::from_remote(&req.status);
    tracing::debug!(job_id = %job_id, reported = %req.status, status = %status, "Job status pushed");
    let result = with_error(req.result, req.error);
    state
        .orchestrator
        .job_callback(&job_id, status, req.progress, result)
        .await?;
    Ok(Json(AckResponse { ok: true }))
}

async fn drain_notifications(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<NotificationsResponse> {
    Json(NotificationsResponse {
        notifications: state.outbox.drain(&user_id),
    })
}

async fn reset_session(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<ResetResponse>, AppError> {
    let existed = state.orchestrator.reset_session(&user_id).await?;
    Ok(Json(ResetResponse { existed }))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String, &'static str),
    Conflict(String, &'static str),
    Unavailable(String, &'static str),
}

impl From<CoreError> for AppError {
    fn from(e: CoreError) -> Self {
        let kind = e.kind();
        match e {
            CoreError::JobNotFound(_) => AppError::NotFound(e.to_string(), kind),
            CoreError::InvalidStateTransition(_) => AppError::Conflict(e.to_string(), kind),
            CoreError::SessionStoreUnavailable(_) | CoreError::JobStoreUnavailable(_) => {
                tracing::error!(error_kind = kind, error = %e, "Request failed on store");
                AppError::Unavailable(e.to_string(), kind)
            }
            // handled inside the core as replies; never returned
            CoreError::AuthRejected(_) | CoreError::RateLimitExceeded { .. } | CoreError::Backend { .. } => {
                AppError::Conflict(e.to_string(), kind)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, kind) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, "bad_request"),
            AppError::NotFound(msg, kind) => (StatusCode::NOT_FOUND, msg, kind),
            AppError::Conflict(msg, kind) => (StatusCode::CONFLICT, msg, kind),
            AppError::Unavailable(msg, kind) => (StatusCode::SERVICE_UNAVAILABLE, msg, kind),
        };

        let body = Json(ErrorResponse::new(message, kind));
        (status, body).into_response()
    }
}
