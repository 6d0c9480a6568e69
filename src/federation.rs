//! Federation facade.
//!
//! The single entry point callers use. A request is planned, fanned out to
//! the selected adapters concurrently, merged and cached:
//!
//! 1. the [`QueryPlanner`] picks adapters and narrows the query per adapter;
//! 2. the cache is consulted under the plan's fingerprint;
//! 3. each adapter runs in its own task, bounded by its semaphore, retrying
//!    `Unavailable` failures with exponential backoff;
//! 4. at the deadline outstanding tasks are aborted and reported as failed;
//! 5. completed results go through the [`MergeEngine`];
//! 6. complete (non-partial) results are written back to the cache.
//!
//! One source failing never fails the request. Only a plan with no
//! applicable source, or a fan-out in which no source completed, is an
//! error.

use futures::future::{BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::adapters::{Adapter, AdapterRegistry};
use crate::cache::{catalog_fingerprint, payload_fingerprint, CacheLayer, CacheValue, CatalogKind};
use crate::config::{Config, FederationConfig, MatchingConfig, RetryConfig};
use crate::error::{AdapterError, FailureKind, FederationError, Result, SourceFailure};
use crate::logging::log_federation_summary;
use crate::merge::MergeEngine;
use crate::model::{
    FederatedResult, Manifest, PayloadHandle, Query, Ri, SourceStatus, StationCatalog,
    TimeInterval, TimeSeries,
};
use crate::normalizer::Normalizer;
use crate::planner::{Plan, QueryPlanner};
use crate::vocabulary::Vocabulary;

/// Bounded exponential backoff for `Unavailable` adapter failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

/// Process-wide federation defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct FederationSettings {
    pub default_ttl: Duration,
    pub default_deadline: Duration,
    pub retry: RetryPolicy,
    pub matching: MatchingConfig,
}

impl FederationSettings {
    pub fn from_config(config: &FederationConfig) -> Self {
        Self {
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            default_deadline: Duration::from_millis(config.default_deadline_ms),
            retry: config.retry.into(),
            matching: config.matching,
        }
    }
}

impl Default for FederationSettings {
    fn default() -> Self {
        Self::from_config(&FederationConfig::default())
    }
}

/// Per-request overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FederationOptions {
    pub deadline: Option<Duration>,
    pub ttl: Option<Duration>,
    /// Skip the cache read; the fresh result is still written back
    pub bypass_cache: bool,
}

impl FederationOptions {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn bypassing_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }
}

/// A federation answer and whether it came from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct FederationResponse<T> {
    pub result: T,
    pub cache_hit: bool,
}

/// One adapter operation, boxed so the fan-out can run it on any adapter.
type AdapterCall<T> = Arc<
    dyn Fn(Arc<dyn Adapter>, Query) -> BoxFuture<'static, std::result::Result<T, AdapterError>>
        + Send
        + Sync,
>;

fn adapter_call<T, F, Fut>(f: F) -> AdapterCall<T>
where
    F: Fn(Arc<dyn Adapter>, Query) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, AdapterError>> + Send + 'static,
{
    Arc::new(move |adapter: Arc<dyn Adapter>, query: Query| f(adapter, query).boxed())
}

/// Manifest and gathered items of one fan-out.
struct Gathered<T> {
    manifest: Manifest,
    items: Vec<T>,
}

pub struct Federation {
    registry: AdapterRegistry,
    vocabulary: Arc<Vocabulary>,
    cache: Arc<CacheLayer>,
    merge: MergeEngine,
    settings: FederationSettings,
}

impl Federation {
    pub fn new(
        registry: AdapterRegistry,
        vocabulary: Arc<Vocabulary>,
        cache: Arc<CacheLayer>,
        settings: FederationSettings,
    ) -> Self {
        let merge = MergeEngine::new(settings.matching);
        Self {
            registry,
            vocabulary,
            cache,
            merge,
            settings,
        }
    }

    /// Build the vocabulary, the real adapters and the cache from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let vocabulary = Arc::new(match &config.vocabulary.path {
            Some(path) => Vocabulary::from_file(path)?,
            None => Vocabulary::builtin()?,
        });
        info!(
            version = vocabulary.version(),
            variables = vocabulary.variables().len(),
            "Loaded controlled vocabulary"
        );

        let normalizer = Normalizer::new(vocabulary.clone());
        let registry = AdapterRegistry::from_config(&config.federation.adapters, &normalizer)?;
        let cache = Arc::new(CacheLayer::from_config(&config.cache, vocabulary.version()));

        Ok(Self::new(
            registry,
            vocabulary,
            cache,
            FederationSettings::from_config(&config.federation),
        ))
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn vocabulary(&self) -> &Arc<Vocabulary> {
        &self.vocabulary
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    pub fn settings(&self) -> &FederationSettings {
        &self.settings
    }

    /// Plan a query without contacting any adapter.
    pub fn plan(&self, query: &Query) -> Result<Plan> {
        QueryPlanner::new(&self.vocabulary).plan(query, &self.registry)
    }

    /// Answer a query with merged, normalized records.
    pub async fn submit(
        &self,
        query: &Query,
        options: &FederationOptions,
    ) -> Result<FederationResponse<FederatedResult>> {
        let start = Instant::now();
        let plan = self.plan(query)?;
        let fingerprint = catalog_fingerprint(
            CatalogKind::Records,
            &plan.query,
            &plan.ris(),
            self.cache.schema_tag(),
        );

        if !options.bypass_cache {
            if let Some(CacheValue::Catalog(result)) = self.cache.get(&fingerprint).await {
                log_federation_summary("submit", &fingerprint, &result.manifest, true, start);
                return Ok(FederationResponse {
                    result,
                    cache_hit: true,
                });
            }
        }

        let deadline = self.deadline(options);
        let call = adapter_call(|adapter, query| async move { adapter.fetch_records(&query).await });
        let gathered = self.gather(&plan, deadline, call).await?;

        let merged = self.merge.merge_records(gathered.items);
        let result = FederatedResult {
            fingerprint: fingerprint.clone(),
            schema_version: self.cache.schema_tag().to_string(),
            partial: gathered.manifest.is_partial(),
            manifest: gathered.manifest,
            stations: merged.stations,
            ambiguous_matches: merged.ambiguous,
        };

        if !result.partial {
            self.cache
                .put(
                    &fingerprint,
                    CacheValue::Catalog(result.clone()),
                    self.ttl(options),
                )
                .await;
        }

        log_federation_summary("submit", &fingerprint, &result.manifest, false, start);
        Ok(FederationResponse {
            result,
            cache_hit: false,
        })
    }

    /// Discover and reconcile stations without fetching dataset records.
    pub async fn discover(
        &self,
        query: &Query,
        options: &FederationOptions,
    ) -> Result<FederationResponse<StationCatalog>> {
        let start = Instant::now();
        let plan = self.plan(query)?;
        let fingerprint = catalog_fingerprint(
            CatalogKind::Stations,
            &plan.query,
            &plan.ris(),
            self.cache.schema_tag(),
        );

        if !options.bypass_cache {
            if let Some(CacheValue::Stations(result)) = self.cache.get(&fingerprint).await {
                log_federation_summary("discover", &fingerprint, &result.manifest, true, start);
                return Ok(FederationResponse {
                    result,
                    cache_hit: true,
                });
            }
        }

        let deadline = self.deadline(options);
        let call = adapter_call(|adapter, query| async move { adapter.discover(&query).await });
        let gathered = self.gather(&plan, deadline, call).await?;

        let merged = self.merge.merge_stations(gathered.items);
        let result = StationCatalog {
            partial: gathered.manifest.is_partial(),
            manifest: gathered.manifest,
            stations: merged.stations,
            ambiguous_matches: merged.ambiguous,
        };

        if !result.partial {
            self.cache
                .put(
                    &fingerprint,
                    CacheValue::Stations(result.clone()),
                    self.ttl(options),
                )
                .await;
        }

        log_federation_summary("discover", &fingerprint, &result.manifest, false, start);
        Ok(FederationResponse {
            result,
            cache_hit: false,
        })
    }

    /// Download the time series behind a payload handle.
    ///
    /// Payloads are fetched from one adapter only, so any failure after
    /// retries is returned as an error rather than a partial result.
    pub async fn fetch_payload(
        &self,
        handle: &PayloadHandle,
        interval: Option<&TimeInterval>,
        options: &FederationOptions,
    ) -> Result<FederationResponse<TimeSeries>> {
        let start = Instant::now();
        let entry = self
            .registry
            .get(handle.ri)
            .ok_or_else(|| FederationError::UnknownSource {
                ri: handle.ri.to_string(),
            })?;

        let key = payload_fingerprint(handle, interval, self.cache.schema_tag());
        if !options.bypass_cache {
            if let Some(CacheValue::Payload(series)) = self.cache.get(&key).await {
                debug!(key = %key, "Payload served from cache");
                return Ok(FederationResponse {
                    result: series,
                    cache_hit: true,
                });
            }
        }

        let deadline = self.deadline(options);
        let owned_handle = handle.clone();
        let owned_interval = interval.copied();
        let call = adapter_call(move |adapter, _query| {
            let handle = owned_handle.clone();
            async move {
                adapter
                    .fetch_payload(&handle, owned_interval.as_ref())
                    .await
            }
        });
        let attempts = Arc::new(AtomicU32::new(0));
        let outcome = tokio::time::timeout(
            deadline,
            call_with_retry(
                handle.ri,
                entry.adapter.clone(),
                entry.limiter.clone(),
                Query::new(),
                call,
                self.settings.retry,
                attempts.clone(),
            ),
        )
        .await;

        let series = match outcome {
            Ok(Ok(series)) => series,
            Ok(Err((error, _attempts))) => return Err(FederationError::Adapter(error)),
            Err(_) => {
                warn!(
                    ri = %handle.ri,
                    dataset_id = %handle.dataset_id,
                    attempts = attempts.load(Ordering::Relaxed),
                    "Payload retrieval exceeded its deadline"
                );
                return Err(FederationError::DeadlineExceeded {
                    deadline_ms: millis(deadline),
                });
            }
        };

        self.cache
            .put(&key, CacheValue::Payload(series.clone()), self.ttl(options))
            .await;
        info!(
            ri = %handle.ri,
            station_id = %handle.station_id,
            variable = %handle.variable,
            observations = series.observations.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Fetched payload"
        );
        Ok(FederationResponse {
            result: series,
            cache_hit: false,
        })
    }

    /// Evict cache entries by key prefix.
    pub async fn evict(&self, prefix: &str) -> usize {
        let count = self.cache.evict_prefix(prefix).await;
        info!(prefix = prefix, evicted = count, "Evicted cache entries");
        count
    }

    /// Evict everything cached that may mention a station.
    pub async fn evict_station(&self, station_id: &str) -> usize {
        let count = self.cache.evict_station(station_id).await;
        info!(station_id = station_id, evicted = count, "Evicted station cache entries");
        count
    }

    fn deadline(&self, options: &FederationOptions) -> Duration {
        options.deadline.unwrap_or(self.settings.default_deadline)
    }

    fn ttl(&self, options: &FederationOptions) -> Duration {
        options.ttl.unwrap_or(self.settings.default_ttl)
    }

    /// Run `call` on every planned adapter concurrently and build the manifest.
    async fn gather<T: Send + 'static>(
        &self,
        plan: &Plan,
        deadline: Duration,
        call: AdapterCall<Vec<T>>,
    ) -> Result<Gathered<T>> {
        let deadline_at = tokio::time::Instant::now() + deadline;
        let mut tasks = JoinSet::new();
        let mut attempts: BTreeMap<Ri, Arc<AtomicU32>> = BTreeMap::new();

        for step in &plan.steps {
            let Some(entry) = self.registry.get(step.ri) else {
                continue;
            };
            let counter = Arc::new(AtomicU32::new(0));
            attempts.insert(step.ri, counter.clone());

            let ri = step.ri;
            let adapter = entry.adapter.clone();
            let limiter = entry.limiter.clone();
            let query = step.query.clone();
            let call = call.clone();
            let retry = self.settings.retry;
            tasks.spawn(async move {
                let outcome = call_with_retry(ri, adapter, limiter, query, call, retry, counter).await;
                (ri, outcome)
            });
        }

        let mut outcomes = BTreeMap::new();
        let mut timed_out = false;
        loop {
            match tokio::time::timeout_at(deadline_at, tasks.join_next()).await {
                Ok(Some(Ok((ri, outcome)))) => {
                    outcomes.insert(ri, outcome);
                }
                Ok(Some(Err(e))) => {
                    error!(error = %e, "Adapter task failed to complete");
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    tasks.abort_all();
                    break;
                }
            }
        }

        let mut manifest = Manifest::default();
        for (ri, reason) in &plan.skipped {
            manifest.record(*ri, SourceStatus::Skipped { reason: *reason });
        }

        let mut items = Vec::new();
        for (ri, counter) in &attempts {
            let made = counter.load(Ordering::Relaxed);
            let status = match outcomes.remove(ri) {
                Some(Ok(found)) if found.is_empty() => SourceStatus::Empty,
                Some(Ok(found)) => {
                    let count = found.len();
                    items.extend(found);
                    SourceStatus::Contributed { count }
                }
                Some(Err((error, made))) => SourceStatus::Failed {
                    failure: SourceFailure::from_adapter_error(&error, made),
                },
                None if timed_out => {
                    warn!(ri = %ri, deadline_ms = millis(deadline), attempts = made, "Adapter cancelled at deadline");
                    SourceStatus::Failed {
                        failure: SourceFailure::deadline(*ri, millis(deadline), made),
                    }
                }
                None => SourceStatus::Failed {
                    failure: SourceFailure::from_adapter_error(
                        &AdapterError::unavailable(*ri, "adapter task aborted"),
                        made,
                    ),
                },
            };
            manifest.record(*ri, status);
        }

        if manifest.completed().is_empty() {
            let failures: Vec<SourceFailure> = manifest.failed().into_iter().cloned().collect();
            if failures
                .iter()
                .any(|f| f.kind == FailureKind::DeadlineExceeded)
            {
                return Err(FederationError::DeadlineExceeded {
                    deadline_ms: millis(deadline),
                });
            }
            return Err(FederationError::AllSourcesFailed { failures });
        }

        Ok(Gathered { manifest, items })
    }
}

impl std::fmt::Debug for Federation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Federation")
            .field("adapters", &self.registry.ris())
            .field("vocabulary", &self.vocabulary.version())
            .field("cache", &self.cache)
            .field("settings", &self.settings)
            .finish()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Call an adapter, retrying retryable failures. Each attempt holds one
/// permit of the adapter's semaphore; backoff sleeps hold none.
async fn call_with_retry<T>(
    ri: Ri,
    adapter: Arc<dyn Adapter>,
    limiter: Arc<Semaphore>,
    query: Query,
    call: AdapterCall<T>,
    retry: RetryPolicy,
    attempts: Arc<AtomicU32>,
) -> std::result::Result<T, (AdapterError, u32)> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        attempts.store(attempt, Ordering::Relaxed);

        let result = {
            let _permit = limiter
                .acquire()
                .await
                .map_err(|_| (AdapterError::unavailable(ri, "adapter is shut down"), attempt))?;
            call(adapter.clone(), query.clone()).await
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    info!(ri = %ri, attempts = attempt, "Adapter recovered after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                let delay = retry.backoff(attempt);
                warn!(
                    ri = %ri,
                    attempt = attempt,
                    max_attempts = retry.max_attempts,
                    delay_ms = millis(delay),
                    error = %e,
                    "Adapter unavailable, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                match &e {
                    AdapterError::Schema { message, raw, .. } => error!(
                        ri = %ri,
                        message = %message,
                        raw = %raw,
                        "Adapter returned an unexpected response"
                    ),
                    AdapterError::Unavailable { .. } => warn!(
                        ri = %ri,
                        attempts = attempt,
                        error = %e,
                        "Adapter unavailable, giving up"
                    ),
                }
                return Err((e, attempt));
            }
        }
    }
}
