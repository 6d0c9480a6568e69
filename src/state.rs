//! Application state management for atmofed.
//!
//! The shared state passed to all handlers: the effective configuration and
//! the federation facade, which owns the adapters, vocabulary and cache.

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::federation::Federation;

/// The main application state shared across all handlers
#[derive(Debug, Clone)]
pub struct AppState {
    /// Configuration
    pub config: Config,
    /// Federation facade
    pub federation: Arc<Federation>,
}

impl AppState {
    /// Create a new AppState
    pub fn new(config: Config, federation: Federation) -> Self {
        Self {
            config,
            federation: Arc::new(federation),
        }
    }

    /// Create a new AppState wrapped in an Arc for shared ownership
    pub fn new_shared(config: Config, federation: Federation) -> Arc<Self> {
        Arc::new(Self::new(config, federation))
    }

    /// Build the federation from configuration and wrap it
    pub fn from_config(config: Config) -> Result<Arc<Self>> {
        let federation = Federation::from_config(&config)?;
        Ok(Self::new_shared(config, federation))
    }
}
