pub mod plugin;
pub mod start;
pub mod volume;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::metrics::{self, MetricsRegistry};
use crate::queue::StartQueue;
use crate::status::StatusStore;
use crate::volume::VolumeManager;

/// Shared state for the node's HTTP handlers, passed via axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub volumes: Arc<VolumeManager>,
    pub queue: StartQueue,
    pub statuses: StatusStore,
    pub metrics: MetricsRegistry,
    pub max_attempts: u32,
}

/// Response envelope for error API responses.
#[derive(Serialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

pub fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let body = ApiError {
        error: ApiErrorDetail {
            code: code.to_string(),
            message: message.into(),
        },
    };
    (status, Json(body)).into_response()
}

/// Replication, start submission and observability routes.
pub fn build_router(state: AppState) -> Router {
    let metrics = state.metrics.clone();
    let api = Router::new()
        .merge(volume::routes())
        .merge(start::routes())
        .with_state(state);

    Router::new()
        .merge(api)
        .merge(metrics::routes(metrics))
        .layer(TraceLayer::new_for_http())
}
