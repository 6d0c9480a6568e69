//! Handler for the /payload endpoint.
//!
//! Resolves a payload handle from a federated result into a normalized time
//! series, served as JSON or as an Apache Arrow IPC stream with the columns
//! `time_ms` (epoch milliseconds), `value` and `flag`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow_array::{ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_ipc::writer::StreamWriter;
use arrow_schema::{DataType, Field, Schema};
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, info};

use super::query::{cached_json, parse_instant};
use super::{error_response, CACHE_HEADER};
use crate::error::{FederationError, Result};
use crate::federation::FederationOptions;
use crate::logging::generate_request_id;
use crate::model::{PayloadHandle, TimeInterval, TimeSeries};
use crate::state::AppState;

/// Output encodings of a payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    Json,
    Arrow,
}

/// Body of a payload request
#[derive(Debug, Clone, Deserialize)]
pub struct PayloadRequest {
    pub handle: PayloadHandle,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub format: PayloadFormat,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub no_cache: bool,
}

impl PayloadRequest {
    fn interval(&self) -> Result<Option<TimeInterval>> {
        match (&self.start, &self.end) {
            (None, None) => Ok(None),
            (Some(start), Some(end)) => Ok(Some(TimeInterval::new(
                parse_instant("start", start)?,
                parse_instant("end", end)?,
            )?)),
            _ => Err(FederationError::InvalidQuery {
                param: "time".to_string(),
                message: "start and end must be given together".to_string(),
            }),
        }
    }

    fn options(&self) -> FederationOptions {
        FederationOptions {
            deadline: self.deadline_ms.map(Duration::from_millis),
            ttl: self.ttl_secs.map(Duration::from_secs),
            bypass_cache: self.no_cache,
        }
    }

    fn summary(&self) -> String {
        format!(
            "ri={}, station={}, variable={}, dataset={}, start={:?}, end={:?}",
            self.handle.ri,
            self.handle.station_id,
            self.handle.variable,
            self.handle.dataset_id,
            self.start,
            self.end
        )
    }
}

/// Handle POST /payload requests
pub async fn payload_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PayloadRequest>,
) -> Response {
    let request_id = generate_request_id();
    let start_time = Instant::now();
    debug!(
        endpoint = "/payload",
        request_id = %request_id,
        params = %request.summary(),
        format = ?request.format,
        "Processing payload request"
    );

    let interval = match request.interval() {
        Ok(interval) => interval,
        Err(e) => return error_response(e, "/payload", &request_id, Some(&request.summary())),
    };

    let response = match state
        .federation
        .fetch_payload(&request.handle, interval.as_ref(), &request.options())
        .await
    {
        Ok(response) => response,
        Err(e) => return error_response(e, "/payload", &request_id, Some(&request.summary())),
    };

    info!(
        endpoint = "/payload",
        request_id = %request_id,
        observations = response.result.observations.len(),
        format = ?request.format,
        cache_hit = response.cache_hit,
        duration_ms = start_time.elapsed().as_secs_f64() * 1000.0,
        "Payload request successful"
    );

    match request.format {
        PayloadFormat::Json => cached_json(&response.result, response.cache_hit),
        PayloadFormat::Arrow => match series_to_arrow(&response.result) {
            Ok(bytes) => (
                StatusCode::OK,
                [
                    (
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/vnd.apache.arrow.stream"),
                    ),
                    (
                        header::HeaderName::from_static(CACHE_HEADER),
                        HeaderValue::from_static(if response.cache_hit { "hit" } else { "miss" }),
                    ),
                ],
                bytes,
            )
                .into_response(),
            Err(e) => error_response(e, "/payload", &request_id, Some(&request.summary())),
        },
    }
}

/// Encode a time series as a single-batch Arrow IPC stream
pub fn series_to_arrow(series: &TimeSeries) -> Result<Bytes> {
    let metadata: HashMap<String, String> = [
        ("ri", series.ri.to_string()),
        ("station_id", series.station_id.clone()),
        ("dataset_id", series.dataset_id.clone()),
        ("variable", series.variable.clone()),
        ("unit", series.unit.clone()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    let schema = Arc::new(Schema::new_with_metadata(
        vec![
            Field::new("time_ms", DataType::Int64, false),
            Field::new("value", DataType::Float64, true),
            Field::new("flag", DataType::Utf8, false),
        ],
        metadata,
    ));

    let times: Int64Array = series
        .observations
        .iter()
        .map(|o| o.time.timestamp_millis())
        .collect::<Vec<i64>>()
        .into();
    let values: Float64Array = series.observations.iter().map(|o| o.value).collect();
    let flags: StringArray = series
        .observations
        .iter()
        .map(|o| Some(o.flag.as_str()))
        .collect();

    let columns: Vec<ArrayRef> = vec![Arc::new(times), Arc::new(values), Arc::new(flags)];
    let batch =
        RecordBatch::try_new(schema.clone(), columns).map_err(|e| FederationError::Conversion {
            message: format!("Failed to create Arrow record batch: {}", e),
        })?;

    let mut output = Vec::new();
    let mut writer =
        StreamWriter::try_new(&mut output, &schema).map_err(|e| FederationError::Conversion {
            message: format!("Failed to create Arrow IPC writer: {}", e),
        })?;
    writer.write(&batch).map_err(|e| FederationError::Conversion {
        message: format!("Failed to write Arrow record batch: {}", e),
    })?;
    writer.finish().map_err(|e| FederationError::Conversion {
        message: format!("Failed to finalize Arrow IPC stream: {}", e),
    })?;
    drop(writer);

    Ok(Bytes::from(output))
}
