//! API request handlers.
//!
//! Handlers return `Result<impl IntoResponse, StevedoreError>`; errors
//! map to status codes through the `IntoResponse` impl on the error
//! type. Bodies are read raw and decoded explicitly so malformed JSON
//! surfaces as 400 rather than an extractor-shaped rejection.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::api::AppState;
use crate::error::{ErrorCode, StevedoreError};
use crate::jobs::{CtlCommand, JobRequest};

/// Body of the job action endpoint.
#[derive(Debug, Deserialize)]
pub struct JobActionRequest {
    pub action: String,
}

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// `POST /api/v1/jobs` - accept a job submission.
pub async fn launch_job(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, StevedoreError> {
    let req: JobRequest = decode_body(&body)?;
    let stats = state.controller.launch_job(req).await?;
    Ok((StatusCode::ACCEPTED, Json(stats)))
}

/// `GET /api/v1/jobs/{job_id}` - stats record of one job.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, StevedoreError> {
    let stats = state.controller.get_job(&job_id).await?;
    Ok(Json(stats))
}

/// `POST /api/v1/jobs/{job_id}` - stop/cancel/retry.
pub async fn job_action(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, StevedoreError> {
    let req: JobActionRequest = decode_body(&body)?;

    match CtlCommand::parse(&req.action) {
        Some(CtlCommand::Stop) => state.controller.stop_job(&job_id).await?,
        Some(CtlCommand::Cancel) => state.controller.cancel_job(&job_id).await?,
        Some(CtlCommand::Retry) => state.controller.retry_job(&job_id).await?,
        None => {
            return Err(StevedoreError::new(
                ErrorCode::UnknownAction,
                format!("action '{}' is not supported", req.action),
            ))
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/v1/jobs/{job_id}/log` - log text of one job.
pub async fn job_log(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, StevedoreError> {
    let text = state.controller.get_job_log(&job_id)?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text))
}

/// `GET /api/v1/stats` - worker pool heartbeats.
pub async fn pool_stats(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, StevedoreError> {
    let stats = state.controller.check_status().await?;
    Ok(Json(stats))
}

fn decode_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, StevedoreError> {
    serde_json::from_slice(body)
        .map_err(|e| StevedoreError::validation(format!("malformed request body: {}", e)))
}
