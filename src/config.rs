//! Configuration management for atmofed.
//!
//! This module handles the layered configuration system with the following precedence:
//! 1. Command-line arguments (highest priority)
//! 2. Environment variables
//! 3. JSON config file
//! 4. Default values (lowest priority)

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{FederationError, Result};
use crate::model::Ri;

/// Command-line arguments for atmofed
#[derive(Parser, Debug, Default)]
#[command(name = "atmofed")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Host address to bind to
    #[arg(short = 'H', long, env = "ATMOFED_HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "ATMOFED_PORT")]
    pub port: Option<u16>,

    /// Number of worker threads
    #[arg(short, long, env = "ATMOFED_WORKERS")]
    pub workers: Option<usize>,

    /// Path to JSON configuration file
    #[arg(short, long, env = "ATMOFED_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ATMOFED_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Comma-separated list of RIs to enable (e.g. "ICOS,ACTRIS")
    #[arg(long, env = "ATMOFED_ADAPTERS")]
    pub adapters: Option<String>,

    /// Default cache TTL in seconds
    #[arg(long, env = "ATMOFED_DEFAULT_TTL")]
    pub default_ttl: Option<u64>,

    /// Default federation deadline in milliseconds
    #[arg(long, env = "ATMOFED_DEADLINE_MS")]
    pub deadline_ms: Option<u64>,

    /// Directory for the on-disk cache (in-memory cache when unset)
    #[arg(long, env = "ATMOFED_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Path to a controlled vocabulary JSON file (built-in table when unset)
    #[arg(long, env = "ATMOFED_VOCABULARY")]
    pub vocabulary: Option<PathBuf>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of worker threads (None = number of CPU cores)
    #[serde(default)]
    pub workers: Option<usize>,
}

/// One research infrastructure backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub ri: Ri,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub base_url: String,

    /// Maximum in-flight native calls for this adapter
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Per-request HTTP timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Retry policy for retryable adapter failures
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Thresholds for cross-RI station reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    #[serde(default = "default_max_distance_km")]
    pub max_distance_km: f64,

    #[serde(default = "default_min_name_similarity")]
    pub min_name_similarity: f64,
}

/// Federation behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    #[serde(default = "default_adapters")]
    pub adapters: Vec<AdapterConfig>,

    /// Cache TTL used when a request does not specify one
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Deadline used when a request does not specify one
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub matching: MatchingConfig,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// On-disk cache directory; in-memory cache when None
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Upper bound on entries held by the in-memory cache
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
}

/// Controlled vocabulary source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VocabularyConfig {
    /// JSON vocabulary file; the built-in table when None
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Complete configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub federation: FederationConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub vocabulary: VocabularyConfig,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with proper precedence
    pub fn load() -> Result<Self> {
        Self::from_args(Args::parse())
    }

    /// Build the configuration from already-parsed arguments
    pub fn from_args(args: Args) -> Result<Self> {
        // Start with defaults
        let mut config = Config::default();

        // Load from JSON file if provided
        if let Some(config_path) = &args.config {
            let json_config = Self::load_from_file(config_path)?;
            config.merge(json_config);
        }

        // Override with command-line arguments
        if let Some(host) = args.host {
            config.server.host = host;
        }
        if let Some(port) = args.port {
            config.server.port = port;
        }
        if args.workers.is_some() {
            config.server.workers = args.workers;
        }
        if let Some(log_level) = args.log_level {
            config.log_level = log_level;
        }
        if let Some(list) = &args.adapters {
            config.enable_only(list)?;
        }
        if let Some(ttl) = args.default_ttl {
            config.federation.default_ttl_secs = ttl;
        }
        if let Some(deadline) = args.deadline_ms {
            config.federation.default_deadline_ms = deadline;
        }
        if args.cache_dir.is_some() {
            config.cache.directory = args.cache_dir;
        }
        if args.vocabulary.is_some() {
            config.vocabulary.path = args.vocabulary;
        }

        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Merge another config into this one (other takes precedence)
    fn merge(&mut self, other: Config) {
        self.server.host = other.server.host;
        self.server.port = other.server.port;
        if other.server.workers.is_some() {
            self.server.workers = other.server.workers;
        }
        self.federation = other.federation;
        self.cache = other.cache;
        if other.vocabulary.path.is_some() {
            self.vocabulary.path = other.vocabulary.path;
        }
        self.log_level = other.log_level;
    }

    /// Enable exactly the RIs named in a comma-separated list
    fn enable_only(&mut self, list: &str) -> Result<()> {
        let wanted = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse::<Ri>)
            .collect::<Result<Vec<Ri>>>()?;
        for adapter in &mut self.federation.adapters {
            adapter.enabled = wanted.contains(&adapter.ri);
        }
        Ok(())
    }

    pub fn enabled_adapters(&self) -> Vec<Ri> {
        self.federation
            .adapters
            .iter()
            .filter(|a| a.enabled)
            .map(|a| a.ri)
            .collect()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        // Validate server host (must be a valid IP or hostname)
        if self.server.host.is_empty() {
            return Err(config_error("Server host cannot be empty"));
        }

        // Validate port (0 is not a valid port for users)
        if self.server.port == 0 {
            return Err(config_error("Server port cannot be 0"));
        }

        // Validate log level
        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(config_error(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.log_level
                )));
            }
        }

        let federation = &self.federation;
        let mut seen = Vec::new();
        for adapter in &federation.adapters {
            if seen.contains(&adapter.ri) {
                return Err(config_error(format!(
                    "Adapter {} is configured more than once",
                    adapter.ri
                )));
            }
            seen.push(adapter.ri);

            if !adapter.enabled {
                continue;
            }
            if !(adapter.base_url.starts_with("http://") || adapter.base_url.starts_with("https://"))
            {
                return Err(config_error(format!(
                    "Adapter {} base_url must be an http(s) URL, got '{}'",
                    adapter.ri, adapter.base_url
                )));
            }
            if adapter.max_concurrency == 0 {
                return Err(config_error(format!(
                    "Adapter {} max_concurrency must be at least 1",
                    adapter.ri
                )));
            }
            if adapter.timeout_secs == 0 {
                return Err(config_error(format!(
                    "Adapter {} timeout_secs must be at least 1",
                    adapter.ri
                )));
            }
        }
        if self.enabled_adapters().is_empty() {
            return Err(config_error("At least one adapter must be enabled"));
        }

        if federation.default_deadline_ms == 0 {
            return Err(config_error("default_deadline_ms must be positive"));
        }

        let retry = &federation.retry;
        if retry.max_attempts == 0 {
            return Err(config_error("retry.max_attempts must be at least 1"));
        }
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            return Err(config_error(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms",
            ));
        }

        let matching = &federation.matching;
        if !(matching.max_distance_km.is_finite() && matching.max_distance_km >= 0.0) {
            return Err(config_error(
                "matching.max_distance_km must be a non-negative number",
            ));
        }
        if !(0.0..=1.0).contains(&matching.min_name_similarity) {
            return Err(config_error(
                "matching.min_name_similarity must be between 0 and 1",
            ));
        }

        Ok(())
    }
}

fn config_error(message: impl Into<String>) -> FederationError {
    FederationError::Config {
        message: message.into(),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            federation: FederationConfig::default(),
            cache: CacheConfig::default(),
            vocabulary: VocabularyConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: None,
        }
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            adapters: default_adapters(),
            default_ttl_secs: default_ttl_secs(),
            default_deadline_ms: default_deadline_ms(),
            retry: RetryConfig::default(),
            matching: MatchingConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_distance_km: default_max_distance_km(),
            min_name_similarity: default_min_name_similarity(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
            max_entries: default_max_entries(),
        }
    }
}

// Default value functions for serde
fn default_max_entries() -> u64 {
    crate::cache::DEFAULT_MAX_ENTRIES
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_concurrency() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_adapters() -> Vec<AdapterConfig> {
    let adapter = |ri, base_url: &str| AdapterConfig {
        ri,
        enabled: true,
        base_url: base_url.to_string(),
        max_concurrency: default_max_concurrency(),
        timeout_secs: default_timeout_secs(),
    };
    vec![
        adapter(Ri::Actris, "https://prod-actris-md2.nilu.no"),
        adapter(Ri::Iagos, "https://services.iagos-data.fr/prod/v2.0"),
        adapter(Ri::Icos, "https://meta.icos-cp.eu"),
    ]
}

// 36 hours
fn default_ttl_secs() -> u64 {
    36 * 3600
}

fn default_deadline_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_max_distance_km() -> f64 {
    2.0
}

fn default_min_name_similarity() -> f64 {
    0.7
}
