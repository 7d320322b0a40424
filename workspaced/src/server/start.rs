use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{error, info};

use workspaced_protocol::{JobStatus, StartRequest, StartResponse};

use crate::identity::validate_request;
use crate::queue::StartJob;

use super::{error_response, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/workspace/start", post(submit_start))
        .route("/workspace/start/{id}", get(start_status))
}

async fn submit_start(State(state): State<AppState>, Json(request): Json<StartRequest>) -> Response {
    if let Err(e) = validate_request(&request) {
        return error_response(StatusCode::BAD_REQUEST, "invalid_request", e.to_string());
    }

    let job = StartJob::new(request, state.max_attempts);
    // Queued before enqueue so a fast worker's status is never overwritten.
    if let Err(e) = state
        .statuses
        .set(&job.start_id, JobStatus::Queued, 0, job.max_attempts, None)
        .await
    {
        error!(error = %e, "failed to record queued status");
        state.metrics.record_error("status_write");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable", e.to_string());
    }
    if let Err(e) = state.queue.enqueue(&job).await {
        error!(error = %e, "failed to enqueue start job");
        state.metrics.record_error("enqueue");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable", e.to_string());
    }

    info!(start_id = %job.start_id, user = %job.request.user_id, "workspace start submitted");
    (
        StatusCode::ACCEPTED,
        Json(StartResponse {
            start_id: job.start_id,
        }),
    )
        .into_response()
}

async fn start_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.statuses.get(&id).await {
        Ok(status) if status.status == JobStatus::Unknown => {
            (StatusCode::NOT_FOUND, Json(status)).into_response()
        }
        Ok(status) => Json(status).into_response(),
        Err(e) => {
            error!(start_id = %id, error = %e, "failed to read start status");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable", e.to_string())
        }
    }
}
