//! Heartbeat endpoint handler.
//!
//! Returns server status information: uptime, memory usage, the registered
//! adapters, the vocabulary version and cache statistics.

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::cache::CacheStatsSnapshot;
use crate::model::Ri;
use crate::state::AppState;

/// Server ID, unique per process
static SERVER_ID: once_cell::sync::Lazy<String> =
    once_cell::sync::Lazy::new(|| Uuid::new_v4().to_string());

/// Server start time
static START_TIME: once_cell::sync::Lazy<SystemTime> = once_cell::sync::Lazy::new(SystemTime::now);

/// Heartbeat response structure
#[derive(Serialize)]
pub struct HeartbeatResponse {
    /// Server ID (unique per instance)
    pub server_id: String,
    /// Current timestamp (ISO 8601 format)
    pub timestamp: String,
    /// Server uptime in seconds
    pub uptime_seconds: u64,
    /// Process memory usage in bytes
    pub memory_usage_bytes: Option<u64>,
    pub adapters: Vec<AdapterInfo>,
    pub vocabulary_version: String,
    pub cache: CacheInfo,
    /// Server status
    pub status: String,
}

#[derive(Serialize)]
pub struct AdapterInfo {
    pub ri: Ri,
    pub name: String,
    pub max_concurrency: usize,
    /// Permits not held by in-flight calls
    pub available_permits: usize,
    pub known_variables: usize,
}

#[derive(Serialize)]
pub struct CacheInfo {
    pub enabled: bool,
    pub schema_tag: String,
    #[serde(flatten)]
    pub stats: CacheStatsSnapshot,
}

/// Touch the start time so uptime counts from server start rather than the
/// first heartbeat.
pub fn mark_start() {
    once_cell::sync::Lazy::force(&START_TIME);
}

/// Handle GET /heartbeat requests
pub async fn heartbeat_handler(State(state): State<Arc<AppState>>) -> Json<HeartbeatResponse> {
    let now = SystemTime::now();
    let timestamp = chrono::DateTime::<chrono::Utc>::from(now)
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let uptime = now
        .duration_since(*START_TIME)
        .unwrap_or(Duration::from_secs(0));

    let federation = &state.federation;
    let adapters = federation
        .registry()
        .iter()
        .map(|entry| AdapterInfo {
            ri: entry.adapter.ri(),
            name: entry.adapter.name().to_string(),
            max_concurrency: entry.max_concurrency,
            available_permits: entry.limiter.available_permits(),
            known_variables: entry.adapter.known_variables().len(),
        })
        .collect();

    let cache = federation.cache();
    let response = HeartbeatResponse {
        server_id: SERVER_ID.clone(),
        timestamp,
        uptime_seconds: uptime.as_secs(),
        memory_usage_bytes: get_memory_usage(),
        adapters,
        vocabulary_version: federation.vocabulary().version().to_string(),
        cache: CacheInfo {
            enabled: cache.is_enabled(),
            schema_tag: cache.schema_tag().to_string(),
            stats: cache.stats(),
        },
        status: "healthy".to_string(),
    };

    Json(response)
}

/// Resident set size of this process, where the platform exposes it cheaply
fn get_memory_usage() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        // Second field of /proc/self/statm is RSS in pages
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(pages * 4096)
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
