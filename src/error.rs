//! Error types for atmofed.
//!
//! Errors are split by blast radius: [`AdapterError`] is scoped to one
//! research infrastructure and is recorded in the result manifest,
//! [`CacheError`] never leaves the cache layer, and [`FederationError`] is
//! what a caller of the federation facade can actually see.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Ri;

/// Maximum number of bytes of a raw native response kept for diagnosis.
pub const RAW_CONTEXT_LIMIT: usize = 2048;

/// Errors raised by a single RI adapter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    /// Network, auth or rate-limit failure. Retryable.
    #[error("{ri} unavailable: {message}")]
    Unavailable { ri: Ri, message: String },

    /// The native response did not have the expected shape. Not retryable.
    #[error("{ri} schema error: {message}")]
    Schema {
        ri: Ri,
        message: String,
        /// Excerpt of the offending native response
        raw: String,
    },
}

impl AdapterError {
    /// Build a schema error, keeping a bounded excerpt of the raw response.
    pub fn schema(ri: Ri, message: impl Into<String>, raw: &str) -> Self {
        AdapterError::Schema {
            ri,
            message: message.into(),
            raw: truncate_raw(raw),
        }
    }

    pub fn unavailable(ri: Ri, message: impl Into<String>) -> Self {
        AdapterError::Unavailable {
            ri,
            message: message.into(),
        }
    }

    /// Whether the facade should retry the call that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Unavailable { .. })
    }

    pub fn ri(&self) -> Ri {
        match self {
            AdapterError::Unavailable { ri, .. } | AdapterError::Schema { ri, .. } => *ri,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            AdapterError::Unavailable { .. } => FailureKind::AdapterUnavailable,
            AdapterError::Schema { .. } => FailureKind::AdapterSchemaError,
        }
    }
}

fn truncate_raw(raw: &str) -> String {
    if raw.len() <= RAW_CONTEXT_LIMIT {
        return raw.to_string();
    }
    let mut end = RAW_CONTEXT_LIMIT;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &raw[..end])
}

/// Why a source did not contribute to a federated result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AdapterUnavailable,
    AdapterSchemaError,
    DeadlineExceeded,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::AdapterUnavailable => "adapter_unavailable",
            FailureKind::AdapterSchemaError => "adapter_schema_error",
            FailureKind::DeadlineExceeded => "deadline_exceeded",
        };
        f.write_str(s)
    }
}

/// A failed source, as reported in the manifest and in [`FederationError::AllSourcesFailed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub ri: Ri,
    pub kind: FailureKind,
    pub message: String,
    /// Raw native response excerpt, present for schema errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    /// Number of attempts made before giving up
    pub attempts: u32,
}

impl SourceFailure {
    pub fn from_adapter_error(error: &AdapterError, attempts: u32) -> Self {
        let raw = match error {
            AdapterError::Schema { raw, .. } => Some(raw.clone()),
            AdapterError::Unavailable { .. } => None,
        };
        let message = match error {
            AdapterError::Unavailable { message, .. } | AdapterError::Schema { message, .. } => {
                message.clone()
            }
        };
        Self {
            ri: error.ri(),
            kind: error.kind(),
            message,
            raw,
            attempts,
        }
    }

    pub fn deadline(ri: Ri, deadline_ms: u64, attempts: u32) -> Self {
        Self {
            ri,
            kind: FailureKind::DeadlineExceeded,
            message: format!("no response within {} ms", deadline_ms),
            raw: None,
            attempts,
        }
    }
}

/// Cache storage errors. Always degraded to a miss by the cache layer.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache storage unavailable: {message}")]
    Unavailable { message: String },

    #[error("corrupt cache entry {key}: {message}")]
    Corrupt { key: String, message: String },
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Unavailable {
            message: e.to_string(),
        }
    }
}

/// The main error type for federation requests.
#[derive(Error, Debug)]
pub enum FederationError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Controlled vocabulary could not be loaded or is inconsistent
    #[error("Vocabulary error: {message}")]
    Vocabulary { message: String },

    /// Malformed query
    #[error("Invalid query: {param} - {message}")]
    InvalidQuery { param: String, message: String },

    /// No enabled adapter can serve any of the requested variables
    #[error("No applicable source for variables: {}", requested.join(", "))]
    NoApplicableSource { requested: Vec<String> },

    /// Every applicable source failed
    #[error("All {} sources failed", failures.len())]
    AllSourcesFailed { failures: Vec<SourceFailure> },

    /// The deadline expired before any source completed
    #[error("Deadline of {deadline_ms} ms exceeded before any source completed")]
    DeadlineExceeded { deadline_ms: u64 },

    /// Request referenced an RI that is not in the registry
    #[error("Unknown or disabled source: {ri}")]
    UnknownSource { ri: String },

    /// A direct adapter call (payload retrieval) failed
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Encoding a response (Arrow IPC) failed
    #[error("Conversion error: {message}")]
    Conversion { message: String },

    /// Server errors
    #[error("Server error: {message}")]
    Server { message: String },
}

impl FederationError {
    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            FederationError::Io(_) => "io",
            FederationError::Json(_) => "json",
            FederationError::Config { .. } => "config",
            FederationError::Vocabulary { .. } => "vocabulary",
            FederationError::InvalidQuery { .. } => "invalid_query",
            FederationError::NoApplicableSource { .. } => "no_applicable_source",
            FederationError::AllSourcesFailed { .. } => "all_sources_failed",
            FederationError::DeadlineExceeded { .. } => "deadline_exceeded",
            FederationError::UnknownSource { .. } => "unknown_source",
            FederationError::Adapter(e) => match e.kind() {
                FailureKind::AdapterUnavailable => "adapter_unavailable",
                _ => "adapter_schema_error",
            },
            FederationError::Conversion { .. } => "conversion",
            FederationError::Server { .. } => "server",
        }
    }
}

/// Convenience type alias for Results with FederationError
pub type Result<T> = std::result::Result<T, FederationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_only_for_unavailable() {
        assert!(AdapterError::unavailable(Ri::Icos, "timeout").is_retryable());
        assert!(!AdapterError::schema(Ri::Icos, "missing id", "{}").is_retryable());
    }

    #[test]
    fn test_schema_error_raw_is_bounded() {
        let raw = "x".repeat(RAW_CONTEXT_LIMIT * 2);
        match AdapterError::schema(Ri::Actris, "bad", &raw) {
            AdapterError::Schema { raw, .. } => {
                assert_eq!(raw.len(), RAW_CONTEXT_LIMIT + 3);
                assert!(raw.ends_with("..."));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let raw = "é".repeat(RAW_CONTEXT_LIMIT);
        let truncated = truncate_raw(&raw);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn test_source_failure_keeps_raw_for_schema_errors() {
        let failure =
            SourceFailure::from_adapter_error(&AdapterError::schema(Ri::Iagos, "bad", "[1]"), 1);
        assert_eq!(failure.kind, FailureKind::AdapterSchemaError);
        assert_eq!(failure.raw.as_deref(), Some("[1]"));

        let failure =
            SourceFailure::from_adapter_error(&AdapterError::unavailable(Ri::Iagos, "503"), 3);
        assert_eq!(failure.kind, FailureKind::AdapterUnavailable);
        assert_eq!(failure.attempts, 3);
        assert!(failure.raw.is_none());
    }

    #[test]
    fn test_error_display() {
        let err = FederationError::NoApplicableSource {
            requested: vec!["O3".to_string(), "XYZ".to_string()],
        };
        assert_eq!(err.to_string(), "No applicable source for variables: O3, XYZ");
        assert_eq!(err.kind(), "no_applicable_source");
    }
}
