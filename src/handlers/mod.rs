//! HTTP request handlers for the atmofed API.
//!
//! This module contains all the endpoint handlers for the web server and
//! the shared mapping from [`FederationError`] to HTTP responses.

pub mod cache;
pub mod heartbeat;
pub mod payload;
pub mod query;
pub mod vocabulary;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::error::FederationError;
use crate::logging::{create_http_trace_layer, log_request_error};
use crate::state::AppState;

pub use cache::cache_evict_handler;
pub use heartbeat::heartbeat_handler;
pub use payload::payload_handler;
pub use query::{query_handler, stations_handler};
pub use vocabulary::vocabulary_handler;

/// Response header telling whether a result came from the cache
pub const CACHE_HEADER: &str = "x-atmofed-cache";

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/query", post(query_handler))
        .route("/stations", post(stations_handler))
        .route("/payload", post(payload_handler))
        .route("/cache", delete(cache_evict_handler))
        .route("/vocabulary", get(vocabulary_handler))
        .route("/heartbeat", get(heartbeat_handler))
        .layer(CorsLayer::permissive())
        .layer(create_http_trace_layer())
        .with_state(state)
}

/// HTTP status for a request-level error
pub fn status_for(error: &FederationError) -> StatusCode {
    match error {
        FederationError::InvalidQuery { .. } | FederationError::Json(_) => StatusCode::BAD_REQUEST,
        FederationError::UnknownSource { .. } => StatusCode::NOT_FOUND,
        FederationError::NoApplicableSource { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        FederationError::AllSourcesFailed { .. } | FederationError::Adapter(_) => {
            StatusCode::BAD_GATEWAY
        }
        FederationError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Log a failed request and render the error body
pub fn error_response(
    error: FederationError,
    endpoint: &str,
    request_id: &str,
    params: Option<&str>,
) -> Response {
    log_request_error(&error, endpoint, request_id, params);

    let mut body = serde_json::json!({
        "error": error.to_string(),
        "kind": error.kind(),
        "request_id": request_id,
    });
    if let FederationError::AllSourcesFailed { failures } = &error {
        body["failures"] = serde_json::to_value(failures).unwrap_or_default();
    }

    (status_for(&error), Json(body)).into_response()
}
