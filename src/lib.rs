//! # atmofed
//!
//! A federation layer over the ACTRIS, IAGOS and ICOS atmospheric research
//! infrastructure data services.
//!
//! One RI-agnostic query (variables or ECV groups, stations, bounding box,
//! time interval) is planned against the enabled adapters, fanned out
//! concurrently, normalized onto a controlled vocabulary, merged into one
//! deduplicated station catalog and cached. Bulk time series are only
//! downloaded when a payload handle is resolved.
//!
//! ## Architecture
//!
//! - **Adapters** ([`adapters`]): one per RI behind the [`adapters::Adapter`] trait
//! - **Schema Normalizer** ([`normalizer`]): native names, units and flags to the [`vocabulary`]
//! - **Query Planner** ([`planner`]): which adapters can serve a query
//! - **Merge Engine** ([`merge`]): dedupe, cross-RI station reconciliation, multi-provenance
//! - **Cache Layer** ([`cache`]): fingerprinted, TTL-bound, fail-open
//! - **Federation Facade** ([`federation`]): the entry point composing all of the above
//!
//! The [`handlers`] module exposes the facade over HTTP.

pub mod adapters;
pub mod cache;
pub mod config;
pub mod error;
pub mod federation;
pub mod geo;
pub mod handlers;
pub mod logging;
pub mod merge;
pub mod model;
pub mod normalizer;
pub mod planner;
pub mod state;
pub mod vocabulary;

pub use config::Config;
pub use error::{AdapterError, FederationError, Result};
pub use federation::{Federation, FederationOptions, FederationResponse, FederationSettings};
pub use logging::{
    create_http_trace_layer, generate_request_id, init_tracing, log_error,
    log_federation_summary, log_operation_end, log_operation_start, log_request_error,
    log_timed_operation,
};
pub use model::{FederatedResult, Manifest, Query, Ri, Station, StationCatalog, TimeInterval};
pub use state::AppState;
pub use vocabulary::Vocabulary;
