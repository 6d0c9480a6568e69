//! Cache layer.
//!
//! Memoizes federated results, station catalogs and payloads under a stable
//! fingerprint. Keys are laid out as `{kind}/{scope}/{sha256}` so entries can
//! be evicted by prefix, for example everything cached for one station:
//!
//! ```text
//! catalog/all/3f1c...          result of an unscoped query
//! stations/ICOS:HTM/9ab0...    station catalog scoped to one station
//! payload/ICOS:HTM/CO2/77de... one time series
//! ```
//!
//! The hash covers the normalised query, the resolved adapter set and the
//! schema tag, which embeds the vocabulary version. A table update therefore
//! changes every key and old entries are never served.
//!
//! Storage failures never fail a request: they are logged, counted and
//! treated as a miss.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use moka::future::Cache;
use moka::Expiry;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::model::{FederatedResult, PayloadHandle, Query, Ri, StationCatalog, TimeInterval, TimeSeries};

/// Version of the on-disk entry layout.
pub const CACHE_FORMAT: &str = "atmofed-cache-1";

/// Tag stored with every entry; entries carrying another tag are misses.
pub fn schema_tag(vocabulary_version: &str) -> String {
    format!("{}+vocab-{}", CACHE_FORMAT, vocabulary_version)
}

/// What a catalog-level entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogKind {
    Records,
    Stations,
}

impl CatalogKind {
    fn prefix(&self) -> &'static str {
        match self {
            CatalogKind::Records => "catalog",
            CatalogKind::Stations => "stations",
        }
    }
}

const ALL_STATIONS: &str = "all";

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Station scope segment of a catalog key: the station filter, or `all`.
fn station_scope(query: &Query) -> String {
    if query.stations.is_empty() {
        ALL_STATIONS.to_string()
    } else {
        query
            .stations
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("+")
    }
}

/// Fingerprint of a planned query against a resolved adapter set.
pub fn catalog_fingerprint(kind: CatalogKind, query: &Query, ris: &[Ri], schema_tag: &str) -> String {
    let canonical = serde_json::json!({
        "query": query,
        "adapters": ris,
        "schema": schema_tag,
    });
    format!(
        "{}/{}/{}",
        kind.prefix(),
        station_scope(query),
        sha256_hex(canonical.to_string().as_bytes())
    )
}

/// Fingerprint of one payload request.
pub fn payload_fingerprint(
    handle: &PayloadHandle,
    interval: Option<&TimeInterval>,
    schema_tag: &str,
) -> String {
    let canonical = serde_json::json!({
        "handle": handle,
        "interval": interval,
        "schema": schema_tag,
    });
    format!(
        "payload/{}/{}/{}",
        handle.station_id,
        handle.variable,
        sha256_hex(canonical.to_string().as_bytes())
    )
}

/// Prefix covering every payload entry of a station.
pub fn station_payload_prefix(station_id: &str) -> String {
    format!("payload/{}/", station_id)
}

/// Whether a key may hold data about the given station. Unscoped catalog
/// entries always qualify.
fn key_mentions_station(key: &str, station_id: &str) -> bool {
    let mut parts = key.splitn(3, '/');
    let (Some(kind), Some(scope)) = (parts.next(), parts.next()) else {
        return false;
    };
    let native_id = station_id
        .split_once(':')
        .map_or(station_id, |(_, native)| native);
    match kind {
        "payload" => scope == station_id,
        "catalog" | "stations" => {
            scope == ALL_STATIONS
                || scope
                    .split('+')
                    .any(|s| s == station_id || s == native_id)
        }
        _ => false,
    }
}

/// A cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CacheValue {
    Catalog(FederatedResult),
    Stations(StationCatalog),
    Payload(TimeSeries),
}

/// One cache entry. Entries are replaced wholesale, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub schema_tag: String,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub value: CacheValue,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, schema_tag: impl Into<String>, ttl: Duration, value: CacheValue) -> Self {
        Self {
            key: key.into(),
            schema_tag: schema_tag.into(),
            created_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
            value,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = i64::try_from(self.ttl_secs).unwrap_or(i64::MAX);
        self.created_at
            .checked_add_signed(ChronoDuration::seconds(ttl.min(i64::MAX / 1000)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Storage backend for cache entries. `store` must be atomic per entry: a
/// concurrent `load` sees the previous entry or the new one, never a mix.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    async fn store(&self, entry: CacheEntry) -> Result<(), CacheError>;

    async fn remove(&self, key: &str) -> Result<(), CacheError>;

    /// Remove every entry whose key satisfies `matches`; returns the count.
    async fn evict(&self, matches: &(dyn for<'k> Fn(&'k str) -> bool + Sync)) -> Result<usize, CacheError>;
}

/// Default bound on entries held by a [`MemoryStore`].
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;

/// Expires each entry at its own `created_at + ttl_secs`.
struct EntryExpiry;

impl EntryExpiry {
    fn remaining(entry: &CacheEntry) -> Duration {
        (entry.expires_at() - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(Self::remaining(entry))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(Self::remaining(entry))
    }
}

/// Process-local store, bounded in size. Entries leave on their own once
/// their TTL has passed.
pub struct MemoryStore {
    entries: Cache<String, CacheEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(EntryExpiry)
            .build();
        Self { entries }
    }

    /// Live entries, after pending expirations and evictions are applied.
    pub async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.get(key).await)
    }

    async fn store(&self, entry: CacheEntry) -> Result<(), CacheError> {
        self.entries.insert(entry.key.clone(), entry).await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.invalidate(key).await;
        Ok(())
    }

    async fn evict(&self, matches: &(dyn for<'k> Fn(&'k str) -> bool + Sync)) -> Result<usize, CacheError> {
        let keys: Vec<Arc<String>> = self
            .entries
            .iter()
            .filter(|(key, _)| matches(key.as_str()))
            .map(|(key, _)| key)
            .collect();
        for key in &keys {
            self.entries.invalidate(key.as_str()).await;
        }
        Ok(keys.len())
    }
}

/// Persistent store: one JSON file per entry, named by the SHA-256 of its
/// key. Writes go to a temporary file that is renamed into place.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", sha256_hex(key.as_bytes())))
    }

    fn parse(key: &str, bytes: &[u8]) -> Result<CacheEntry, CacheError> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Corrupt {
            key: key.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl CacheStore for FileStore {
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let bytes = match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry = Self::parse(key, &bytes)?;
        if entry.key != key {
            return Err(CacheError::Corrupt {
                key: key.to_string(),
                message: format!("file holds entry for {}", entry.key),
            });
        }
        Ok(Some(entry))
    }

    async fn store(&self, entry: CacheEntry) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let target = self.path_for(&entry.key);
        let temp = target.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        let bytes = serde_json::to_vec(&entry).map_err(|e| CacheError::Corrupt {
            key: entry.key.clone(),
            message: e.to_string(),
        })?;
        tokio::fs::write(&temp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn evict(&self, matches: &(dyn for<'k> Fn(&'k str) -> bool + Sync)) -> Result<usize, CacheError> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut evicted = 0;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let key = match Self::parse(&path.display().to_string(), &bytes) {
                Ok(entry) => entry.key,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable cache file");
                    continue;
                }
            };
            if matches(&key) {
                tokio::fs::remove_file(&path).await?;
                evicted += 1;
            }
        }
        Ok(evicted)
    }
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    errors: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
}

/// Counters reported by the heartbeat endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub errors: u64,
    pub writes: u64,
    pub evictions: u64,
}

/// Fail-open cache in front of a [`CacheStore`].
pub struct CacheLayer {
    store: Option<Arc<dyn CacheStore>>,
    schema_tag: String,
    stats: CacheStats,
}

impl CacheLayer {
    pub fn new(store: Arc<dyn CacheStore>, schema_tag: impl Into<String>) -> Self {
        Self {
            store: Some(store),
            schema_tag: schema_tag.into(),
            stats: CacheStats::default(),
        }
    }

    pub fn in_memory(schema_tag: impl Into<String>) -> Self {
        Self::new(Arc::new(MemoryStore::new()), schema_tag)
    }

    /// A cache that never stores anything.
    pub fn disabled(schema_tag: impl Into<String>) -> Self {
        Self {
            store: None,
            schema_tag: schema_tag.into(),
            stats: CacheStats::default(),
        }
    }

    pub fn from_config(config: &CacheConfig, vocabulary_version: &str) -> Self {
        let tag = schema_tag(vocabulary_version);
        if !config.enabled {
            return Self::disabled(tag);
        }
        match &config.directory {
            Some(dir) => Self::new(Arc::new(FileStore::new(dir)), tag),
            None => Self::new(Arc::new(MemoryStore::with_capacity(config.max_entries)), tag),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn schema_tag(&self) -> &str {
        &self.schema_tag
    }

    pub async fn get(&self, key: &str) -> Option<CacheValue> {
        self.get_at(key, Utc::now()).await
    }

    async fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<CacheValue> {
        let store = self.store.as_ref()?;
        let entry = match store.load(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                warn!(key = key, error = %e, "Cache read failed, treating as miss");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if entry.schema_tag != self.schema_tag {
            debug!(
                key = key,
                entry_tag = %entry.schema_tag,
                current_tag = %self.schema_tag,
                "Ignoring cache entry with stale schema tag"
            );
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        if entry.is_expired(now) {
            debug!(key = key, created_at = %entry.created_at, "Cache entry expired");
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = store.remove(key).await {
                warn!(key = key, error = %e, "Failed to remove expired cache entry");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
            return None;
        }

        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value)
    }

    /// Store a value. A zero TTL stores nothing.
    pub async fn put(&self, key: &str, value: CacheValue, ttl: Duration) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        if ttl.as_secs() == 0 {
            return;
        }
        let entry = CacheEntry::new(key, self.schema_tag.clone(), ttl, value);
        match store.store(entry).await {
            Ok(()) => {
                self.stats.writes.fetch_add(1, Ordering::Relaxed);
                debug!(key = key, ttl_secs = ttl.as_secs(), "Cached entry");
            }
            Err(e) => {
                warn!(key = key, error = %e, "Cache write failed");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Evict every entry whose key starts with `prefix`.
    pub async fn evict_prefix(&self, prefix: &str) -> usize {
        let prefix = prefix.to_string();
        self.evict_where(move |key| key.starts_with(prefix.as_str()))
            .await
    }

    /// Evict payloads of a station and every catalog entry that may contain it.
    pub async fn evict_station(&self, station_id: &str) -> usize {
        let station_id = station_id.to_string();
        self.evict_where(move |key| key_mentions_station(key, &station_id))
            .await
    }

    async fn evict_where(&self, matches: impl Fn(&str) -> bool + Sync) -> usize {
        let Some(store) = self.store.as_ref() else {
            return 0;
        };
        match store.evict(&matches).await {
            Ok(count) => {
                self.stats
                    .evictions
                    .fetch_add(count as u64, Ordering::Relaxed);
                count
            }
            Err(e) => {
                warn!(error = %e, "Cache eviction failed");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("enabled", &self.is_enabled())
            .field("schema_tag", &self.schema_tag)
            .field("stats", &self.stats())
            .finish()
    }
}
