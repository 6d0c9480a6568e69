//! Common test utilities for atmofed.
//!
//! Mock adapters with scripted behaviour, record fixtures and an HTTP client
//! for the spawned test server.

#![allow(dead_code)]

pub mod fixtures;
pub mod http_client;
pub mod mock_adapter;
