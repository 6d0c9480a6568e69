//! Cache eviction endpoint.

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use super::error_response;
use crate::error::FederationError;
use crate::logging::generate_request_id;
use crate::state::AppState;

/// Query parameters for DELETE /cache. Exactly one must be given.
#[derive(Debug, Deserialize)]
pub struct EvictParams {
    /// Key prefix, e.g. `payload/ICOS:HTM/`
    pub prefix: Option<String>,
    /// Station identifier; evicts its payloads and every catalog entry that may contain it
    pub station: Option<String>,
}

/// Handle DELETE /cache requests
pub async fn cache_evict_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EvictParams>,
) -> Response {
    let request_id = generate_request_id();

    let evicted = match (&params.prefix, &params.station) {
        (Some(prefix), None) => state.federation.evict(prefix).await,
        (None, Some(station)) => state.federation.evict_station(station).await,
        _ => {
            let error = FederationError::InvalidQuery {
                param: "prefix".to_string(),
                message: "exactly one of 'prefix' or 'station' is required".to_string(),
            };
            return error_response(error, "/cache", &request_id, None);
        }
    };

    Json(serde_json::json!({
        "evicted": evicted,
        "request_id": request_id,
    }))
    .into_response()
}
