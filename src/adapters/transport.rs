//! HTTP transport used by the RI adapters.
//!
//! Adapters talk to their services through [`HttpTransport`] so tests can
//! replay canned native responses without a network.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

use crate::error::{AdapterError, FederationError, Result};
use crate::model::{NativeRequest, Ri};

/// Transport-level failure, before it is attributed to an RI.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}")]
    Status { status: u16, body: String },

    #[error("response is not JSON: {message}")]
    Decode { message: String, body: String },
}

impl TransportError {
    /// Attribute the failure to an RI. Anything that went wrong on the wire
    /// is retryable; a body that is not JSON is a schema problem.
    pub fn into_adapter_error(self, ri: Ri) -> AdapterError {
        match self {
            TransportError::Network(message) => AdapterError::unavailable(ri, message),
            TransportError::Status { status, body } => {
                let hint = match status {
                    401 | 403 => " (authentication refused)",
                    429 => " (rate limited)",
                    _ => "",
                };
                let excerpt: String = body.chars().take(200).collect();
                AdapterError::unavailable(ri, format!("HTTP {}{}: {}", status, hint, excerpt))
            }
            TransportError::Decode { message, body } => AdapterError::schema(ri, message, &body),
        }
    }
}

/// Sends a native request and returns the decoded JSON body.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// `GET` sends `params` as the query string, `POST` as a form body.
    async fn send(&self, request: &NativeRequest) -> std::result::Result<Value, TransportError>;
}

/// reqwest-backed transport.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("atmofed/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FederationError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &NativeRequest) -> std::result::Result<Value, TransportError> {
        debug!(method = %request.method, url = %request.url, "Sending native request");

        let builder = if request.method.eq_ignore_ascii_case("POST") {
            self.client.post(&request.url).form(&request.params)
        } else {
            self.client.get(&request.url).query(&request.params)
        };

        let response = builder
            .header(
                reqwest::header::ACCEPT,
                "application/json, application/sparql-results+json",
            )
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        trace!(status = status.as_u16(), bytes = body.len(), "Native response received");

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| TransportError::Decode {
            message: e.to_string(),
            body,
        })
    }
}
