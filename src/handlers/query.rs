//! Federated query endpoints.
//!
//! `POST /query` returns merged dataset records, `POST /stations` returns
//! reconciled stations only. Both accept the same [`QueryRequest`] body.

use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{error_response, CACHE_HEADER};
use crate::adapters::parse_time_str;
use crate::error::{FederationError, Result};
use crate::federation::FederationOptions;
use crate::logging::generate_request_id;
use crate::model::{BoundingBox, Query, TimeInterval};
use crate::state::AppState;

/// Body of a federated query
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct QueryRequest {
    /// Canonical variable or ECV group names; empty means all
    #[serde(default)]
    pub variables: Vec<String>,
    /// Station identifiers, RI-qualified (`ICOS:HTM`) or bare
    #[serde(default)]
    pub stations: Vec<String>,
    /// `min_lon,min_lat,max_lon,max_lat`
    #[serde(default)]
    pub bbox: Option<String>,
    /// Interval start, RFC 3339 or `YYYY-MM-DD`
    #[serde(default)]
    pub start: Option<String>,
    /// Interval end (exclusive)
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub no_cache: bool,
}

impl QueryRequest {
    pub fn to_query(&self) -> Result<Query> {
        let mut query = Query::new()
            .with_variables(self.variables.iter().map(|v| v.trim().to_string()))
            .with_stations(self.stations.iter().map(|s| s.trim().to_string()));

        if let Some(bbox) = &self.bbox {
            query = query.with_bbox(bbox.parse::<BoundingBox>()?);
        }

        match (&self.start, &self.end) {
            (None, None) => {}
            (Some(start), Some(end)) => {
                let interval = TimeInterval::new(parse_instant("start", start)?, parse_instant("end", end)?)?;
                query = query.with_interval(interval);
            }
            _ => {
                return Err(FederationError::InvalidQuery {
                    param: "time".to_string(),
                    message: "start and end must be given together".to_string(),
                })
            }
        }

        query.validate()?;
        Ok(query)
    }

    pub fn options(&self) -> FederationOptions {
        FederationOptions {
            deadline: self.deadline_ms.map(Duration::from_millis),
            ttl: self.ttl_secs.map(Duration::from_secs),
            bypass_cache: self.no_cache,
        }
    }

    fn summary(&self) -> String {
        format!(
            "variables={:?}, stations={:?}, bbox={:?}, start={:?}, end={:?}",
            self.variables, self.stations, self.bbox, self.start, self.end
        )
    }
}

pub(crate) fn parse_instant(param: &str, value: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    parse_time_str(value.trim()).ok_or_else(|| FederationError::InvalidQuery {
        param: param.to_string(),
        message: format!("'{}' is not an RFC 3339 timestamp or YYYY-MM-DD date", value),
    })
}

/// Serialize a result with the cache header set
pub(crate) fn cached_json<T: Serialize>(value: &T, cache_hit: bool) -> Response {
    let mut response = (StatusCode::OK, Json(value)).into_response();
    response.headers_mut().insert(
        CACHE_HEADER,
        HeaderValue::from_static(if cache_hit { "hit" } else { "miss" }),
    );
    response
}

/// Handle POST /query requests
pub async fn query_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Response {
    let request_id = generate_request_id();
    let start_time = Instant::now();
    debug!(endpoint = "/query", request_id = %request_id, params = %request.summary(), "Processing query");

    let query = match request.to_query() {
        Ok(query) => query,
        Err(e) => return error_response(e, "/query", &request_id, Some(&request.summary())),
    };

    match state.federation.submit(&query, &request.options()).await {
        Ok(response) => {
            info!(
                endpoint = "/query",
                request_id = %request_id,
                stations = response.result.stations.len(),
                records = response.result.record_count(),
                partial = response.result.partial,
                cache_hit = response.cache_hit,
                duration_ms = start_time.elapsed().as_secs_f64() * 1000.0,
                "Query successful"
            );
            cached_json(&response.result, response.cache_hit)
        }
        Err(e) => error_response(e, "/query", &request_id, Some(&request.summary())),
    }
}

/// Handle POST /stations requests
pub async fn stations_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Response {
    let request_id = generate_request_id();
    let start_time = Instant::now();
    debug!(endpoint = "/stations", request_id = %request_id, params = %request.summary(), "Processing station discovery");

    let query = match request.to_query() {
        Ok(query) => query,
        Err(e) => return error_response(e, "/stations", &request_id, Some(&request.summary())),
    };

    match state.federation.discover(&query, &request.options()).await {
        Ok(response) => {
            info!(
                endpoint = "/stations",
                request_id = %request_id,
                stations = response.result.stations.len(),
                partial = response.result.partial,
                cache_hit = response.cache_hit,
                duration_ms = start_time.elapsed().as_secs_f64() * 1000.0,
                "Station discovery successful"
            );
            cached_json(&response.result, response.cache_hit)
        }
        Err(e) => error_response(e, "/stations", &request_id, Some(&request.summary())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_request_to_query() {
        let request = QueryRequest {
            variables: vec![" O3 ".to_string()],
            stations: vec!["ICOS:FR001".to_string()],
            bbox: Some("-10,40,10,60".to_string()),
            start: Some("2020-01-01".to_string()),
            end: Some("2020-02-01T00:00:00Z".to_string()),
            ..Default::default()
        };
        let query = request.to_query().unwrap();

        assert!(query.variables.contains("O3"));
        assert!(query.stations.contains("ICOS:FR001"));
        assert!(query.bbox.is_some());
        let interval = query.interval.unwrap();
        assert_eq!(interval.start, Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(interval.end, Utc.with_ymd_and_hms(2020, 2, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_request_validation() {
        let reversed = QueryRequest {
            start: Some("2020-02-01".to_string()),
            end: Some("2020-01-01".to_string()),
            ..Default::default()
        };
        assert!(reversed.to_query().is_err());

        let half_open = QueryRequest {
            start: Some("2020-02-01".to_string()),
            ..Default::default()
        };
        assert!(half_open.to_query().is_err());

        let garbage_time = QueryRequest {
            start: Some("yesterday".to_string()),
            end: Some("today".to_string()),
            ..Default::default()
        };
        assert!(garbage_time.to_query().is_err());

        let bad_bbox = QueryRequest {
            bbox: Some("1,2,3".to_string()),
            ..Default::default()
        };
        assert!(bad_bbox.to_query().is_err());
    }

    #[test]
    fn test_request_options() {
        let request = QueryRequest {
            deadline_ms: Some(250),
            ttl_secs: Some(60),
            no_cache: true,
            ..Default::default()
        };
        let options = request.options();
        assert_eq!(options.deadline, Some(Duration::from_millis(250)));
        assert_eq!(options.ttl, Some(Duration::from_secs(60)));
        assert!(options.bypass_cache);
    }
}
