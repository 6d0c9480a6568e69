//! Logging utilities for the atmofed server.
//!
//! Structured `tracing` helpers shared by the federation facade and the HTTP
//! handlers, so every federation call and request error produces searchable
//! fields rather than free text.

use std::time::Instant;
use tracing::{debug, error, info, warn, Level};

use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tower_http::LatencyUnit;
use uuid::Uuid;

use crate::error::FederationError;
use crate::model::{Manifest, SourceStatus};

/// Creates the tracing layer for HTTP request/response logging
pub fn create_http_trace_layer() -> TraceLayer<
    tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>,
    DefaultMakeSpan,
    DefaultOnRequest,
    DefaultOnResponse,
> {
    let response_formatter = DefaultOnResponse::new()
        .level(Level::DEBUG)
        .latency_unit(LatencyUnit::Millis);

    TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(response_formatter)
}

/// Initialize the tracing subscriber with the given log level.
/// `RUST_LOG` takes precedence when set.
pub fn init_tracing(log_level: &str) {
    let filter = match std::env::var("RUST_LOG") {
        Ok(val) => val,
        Err(_) => log_level.to_string(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Log a start message for a significant operation
pub fn log_operation_start(operation: &str, details: Option<&str>) {
    if let Some(details) = details {
        info!(
            operation = operation,
            details = details,
            "Starting operation"
        );
    } else {
        info!(operation = operation, "Starting operation");
    }
}

/// Log the completion of a significant operation
pub fn log_operation_end(operation: &str, start_time: Instant, success: bool) {
    let duration_ms = start_time.elapsed().as_secs_f64() * 1000.0;

    if success {
        info!(
            operation = operation,
            duration_ms = duration_ms,
            "Operation completed successfully"
        );
    } else {
        warn!(
            operation = operation,
            duration_ms = duration_ms,
            "Operation completed with warnings"
        );
    }
}

/// Log an operation with timing and result in a single statement
pub fn log_timed_operation<F, R>(operation: &str, f: F) -> R
where
    F: FnOnce() -> R,
{
    let start = Instant::now();
    let operation_id = Uuid::new_v4();

    debug!(
        operation = operation,
        operation_id = %operation_id,
        "Starting operation"
    );

    let result = f();

    info!(
        operation = operation,
        operation_id = %operation_id,
        duration_ms = start.elapsed().as_secs_f64() * 1000.0,
        "Operation completed"
    );

    result
}

/// One summary line per federation call.
pub fn log_federation_summary(
    operation: &str,
    fingerprint: &str,
    manifest: &Manifest,
    cache_hit: bool,
    start_time: Instant,
) {
    let failed: Vec<String> = manifest
        .entries
        .iter()
        .filter_map(|e| match &e.status {
            SourceStatus::Failed { failure } => Some(format!("{}:{}", e.ri, failure.kind)),
            _ => None,
        })
        .collect();
    let duration_ms = start_time.elapsed().as_secs_f64() * 1000.0;

    if failed.is_empty() {
        info!(
            operation = operation,
            fingerprint = fingerprint,
            contributed = manifest.contributed().len(),
            completed = manifest.completed().len(),
            skipped = manifest.skipped().len(),
            cache_hit = cache_hit,
            duration_ms = duration_ms,
            "Federation call completed"
        );
    } else {
        warn!(
            operation = operation,
            fingerprint = fingerprint,
            contributed = manifest.contributed().len(),
            completed = manifest.completed().len(),
            skipped = manifest.skipped().len(),
            failed = %failed.join(", "),
            partial = true,
            cache_hit = cache_hit,
            duration_ms = duration_ms,
            "Federation call completed with missing sources"
        );
    }
}

/// Log an error with context
pub fn log_error(error: &FederationError, context: &str) {
    error!(
        error = %error,
        context = context,
        error_kind = error.kind(),
        "Error occurred"
    );
}

/// Log an error that occurred during request processing
pub fn log_request_error(
    error: &FederationError,
    endpoint: &str,
    request_id: &str,
    params: Option<&str>,
) {
    error!(
        error = %error,
        endpoint = endpoint,
        request_id = request_id,
        params = params.unwrap_or("none"),
        error_kind = error.kind(),
        "Request processing error"
    );
}

/// Generate a unique request ID
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}
