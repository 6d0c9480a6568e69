//! Research-infrastructure adapters.
//!
//! Each adapter translates the RI-agnostic [`Query`] into its service's
//! native requests and parses the responses into normalized records. All
//! adapters implement [`Adapter`]; the facade holds them in an
//! [`AdapterRegistry`] keyed by [`Ri`] in a fixed order.

pub mod actris;
pub mod iagos;
pub mod icos;
pub mod transport;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::info;

use crate::config::AdapterConfig;
use crate::error::{AdapterError, Result};
use crate::model::{
    NativeSample, NormalizedRecord, PayloadHandle, Query, Ri, Station, TimeInterval, TimeSeries,
};
use crate::normalizer::Normalizer;

pub use actris::ActrisAdapter;
pub use iagos::IagosAdapter;
pub use icos::IcosAdapter;
pub use transport::{HttpTransport, ReqwestTransport, TransportError};

/// The contract every RI adapter fulfils.
///
/// An empty result is `Ok(vec![])`, never an error.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn ri(&self) -> Ri;

    /// Short name recorded in provenance.
    fn name(&self) -> &str;

    /// Canonical variables this RI can serve. Used by the planner.
    fn known_variables(&self) -> BTreeSet<String>;

    /// Stations matching the query's station and bbox filters.
    async fn discover(&self, query: &Query) -> std::result::Result<Vec<Station>, AdapterError>;

    /// Dataset records matching the query, already normalized.
    async fn fetch_records(
        &self,
        query: &Query,
    ) -> std::result::Result<Vec<NormalizedRecord>, AdapterError>;

    /// Download and normalize the time series behind a handle.
    async fn fetch_payload(
        &self,
        handle: &PayloadHandle,
        interval: Option<&TimeInterval>,
    ) -> std::result::Result<TimeSeries, AdapterError>;
}

/// An adapter plus the semaphore bounding its in-flight native calls.
#[derive(Clone)]
pub struct RegisteredAdapter {
    pub adapter: Arc<dyn Adapter>,
    pub limiter: Arc<Semaphore>,
    pub max_concurrency: usize,
}

/// Enabled adapters in registry order.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    entries: Vec<RegisteredAdapter>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the real adapters for every enabled entry.
    pub fn from_config(configs: &[AdapterConfig], normalizer: &Normalizer) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs.iter().filter(|c| c.enabled) {
            let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(
                Duration::from_secs(config.timeout_secs),
            )?);
            let adapter: Arc<dyn Adapter> = match config.ri {
                Ri::Actris => Arc::new(ActrisAdapter::new(
                    &config.base_url,
                    transport,
                    normalizer.clone(),
                )),
                Ri::Iagos => Arc::new(IagosAdapter::new(
                    &config.base_url,
                    transport,
                    normalizer.clone(),
                )),
                Ri::Icos => Arc::new(IcosAdapter::new(
                    &config.base_url,
                    transport,
                    normalizer.clone(),
                )),
            };
            info!(
                ri = %config.ri,
                base_url = %config.base_url,
                max_concurrency = config.max_concurrency,
                "Registered adapter"
            );
            registry.register(adapter, config.max_concurrency);
        }
        Ok(registry)
    }

    /// Add an adapter, replacing any adapter already registered for its RI.
    pub fn register(&mut self, adapter: Arc<dyn Adapter>, max_concurrency: usize) {
        let max_concurrency = max_concurrency.max(1);
        let ri = adapter.ri();
        self.entries.retain(|e| e.adapter.ri() != ri);
        self.entries.push(RegisteredAdapter {
            adapter,
            limiter: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        });
        self.entries.sort_by_key(|e| e.adapter.ri());
    }

    pub fn with(mut self, adapter: Arc<dyn Adapter>, max_concurrency: usize) -> Self {
        self.register(adapter, max_concurrency);
        self
    }

    pub fn get(&self, ri: Ri) -> Option<&RegisteredAdapter> {
        self.entries.iter().find(|e| e.adapter.ri() == ri)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredAdapter> {
        self.entries.iter()
    }

    pub fn ris(&self) -> Vec<Ri> {
        self.entries.iter().map(|e| e.adapter.ri()).collect()
    }

    /// Known-variable catalog of every adapter, in registry order.
    pub fn catalogs(&self) -> Vec<(Ri, BTreeSet<String>)> {
        self.entries
            .iter()
            .map(|e| (e.adapter.ri(), e.adapter.known_variables()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// Native responses are decoded into per-adapter `#[derive(Deserialize)]`
// types. Unknown fields are ignored; a missing or mistyped required field is
// a schema error carrying the offending body.

/// Decode a native response body into its typed shape.
pub(crate) fn decode<T: DeserializeOwned>(
    ri: Ri,
    what: &str,
    body: &Value,
) -> std::result::Result<T, AdapterError> {
    T::deserialize(body).map_err(|e| schema_error(ri, format!("invalid {}: {}", what, e), body))
}

pub(crate) fn schema_error(ri: Ri, message: impl Into<String>, body: &Value) -> AdapterError {
    AdapterError::schema(ri, message, &body.to_string())
}

/// A JSON scalar that services send either as a number or as a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Number(serde_json::Number),
    Text(String),
}

impl Scalar {
    fn into_text(self) -> String {
        match self {
            Scalar::Number(n) => n.to_string(),
            Scalar::Text(s) => s,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => n.as_f64(),
            Scalar::Text(s) => s.trim().parse().ok(),
        }
    }

    /// RFC 3339, naive ISO (taken as UTC), a bare date, or epoch milliseconds.
    fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Scalar::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            Scalar::Text(s) => parse_time_str(s.trim()),
        }
    }
}

/// Identifiers: strings on some services, numbers on others.
pub(crate) fn text<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Scalar::deserialize(d).map(Scalar::into_text)
}

pub(crate) fn optional_text<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<String>, D::Error> {
    Ok(Option::<Scalar>::deserialize(d)?.map(Scalar::into_text))
}

pub(crate) fn number<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<f64, D::Error> {
    let raw = Scalar::deserialize(d)?;
    raw.as_f64()
        .ok_or_else(|| D::Error::custom(format!("not numeric: {}", raw.into_text())))
}

pub(crate) fn optional_number<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<f64>, D::Error> {
    match Option::<Scalar>::deserialize(d)? {
        None => Ok(None),
        Some(raw) => raw
            .as_f64()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("not numeric: {}", raw.into_text()))),
    }
}

pub(crate) fn time<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<DateTime<Utc>, D::Error> {
    let raw = Scalar::deserialize(d)?;
    raw.as_time()
        .ok_or_else(|| D::Error::custom(format!("not a timestamp: {}", raw.into_text())))
}

/// Absent is fine, present but unparseable is an error.
pub(crate) fn optional_time<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error> {
    match Option::<Scalar>::deserialize(d)? {
        None => Ok(None),
        Some(raw) => raw
            .as_time()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("not a timestamp: {}", raw.into_text()))),
    }
}

pub(crate) fn parse_time_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, format) {
            return Some(t.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}

/// One entry of a native time axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Timestamp(pub DateTime<Utc>);

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        time(d).map(Timestamp)
    }
}

/// A sample: numbers and numeric strings; anything else is a gap.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct SampleValue(pub Option<f64>);

impl<'de> Deserialize<'de> for SampleValue {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let value = match Value::deserialize(d)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        Ok(SampleValue(value))
    }
}

/// A native quality flag as text; numeric flags are stringified.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SampleFlag(pub Option<String>);

impl<'de> Deserialize<'de> for SampleFlag {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let flag = match Value::deserialize(d)? {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        Ok(SampleFlag(flag))
    }
}

/// Zip a time axis with its values and optional flags into samples, keeping
/// those inside `interval`.
pub(crate) fn samples(
    times: &[Timestamp],
    values: &[SampleValue],
    flags: Option<&[SampleFlag]>,
    interval: Option<&TimeInterval>,
) -> Vec<NativeSample> {
    times
        .iter()
        .zip(values)
        .enumerate()
        .filter(|(_, (t, _))| interval.map_or(true, |iv| iv.contains(&t.0)))
        .map(|(i, (t, v))| NativeSample {
            time: t.0,
            value: v.0,
            flag: flags.and_then(|f| f.get(i)).and_then(|f| f.0.clone()),
        })
        .collect()
}

pub(crate) fn trim_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Site {
        #[serde(deserialize_with = "text")]
        id: String,
        #[serde(deserialize_with = "number")]
        lat: f64,
        #[serde(default, deserialize_with = "optional_number")]
        alt: Option<f64>,
        #[serde(default, deserialize_with = "optional_time")]
        end: Option<DateTime<Utc>>,
    }

    #[test]
    fn test_decode_lenient_scalars() {
        let body = json!({"id": 42, "lat": "45.5", "alt": null, "extra": {"ignored": true}});
        let site: Site = decode(Ri::Actris, "site", &body).unwrap();
        assert_eq!(site.id, "42");
        assert_eq!(site.lat, 45.5);
        assert_eq!(site.alt, None);
        assert_eq!(site.end, None);
    }

    #[test]
    fn test_decode_failure_is_schema_error_with_body() {
        let body = json!({"id": "PUY", "lat": "north"});
        match decode::<Site>(Ri::Actris, "site", &body).unwrap_err() {
            AdapterError::Schema { message, raw, .. } => {
                assert!(message.contains("not numeric"));
                assert!(raw.contains("\"id\":\"PUY\""));
            }
            other => panic!("unexpected {:?}", other),
        }

        let missing = json!({"id": "PUY"});
        match decode::<Site>(Ri::Actris, "site", &missing).unwrap_err() {
            AdapterError::Schema { message, .. } => assert!(message.contains("lat")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_time_formats() {
        let parse = |v: Value| serde_json::from_value::<Timestamp>(v).ok().map(|t| t.0);
        let expected = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(parse(json!("2020-01-02T03:04:05Z")), Some(expected));
        assert_eq!(parse(json!("2020-01-02T03:04:05")), Some(expected));
        assert_eq!(parse(json!("2020-01-02 03:04:05")), Some(expected));
        assert_eq!(parse(json!(expected.timestamp_millis())), Some(expected));
        assert_eq!(
            parse(json!("2020-01-02")),
            Some(Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap())
        );
        assert_eq!(parse(json!("yesterday")), None);
    }

    #[test]
    fn test_optional_time_rejects_garbage() {
        let body = json!({"id": "x", "lat": 1.0, "end": "not a date"});
        assert!(decode::<Site>(Ri::Iagos, "site", &body).is_err());
    }

    #[test]
    fn test_samples_zip_and_filter() {
        let times: Vec<Timestamp> =
            serde_json::from_value(json!(["2020-01-01T00:00:00Z", "2020-01-01T01:00:00Z"])).unwrap();
        let values: Vec<SampleValue> = serde_json::from_value(json!(["1.5", null])).unwrap();
        let flags: Vec<SampleFlag> = serde_json::from_value(json!([0, "V"])).unwrap();

        let all = samples(&times, &values, Some(&flags), None);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].value, Some(1.5));
        assert_eq!(all[0].flag.as_deref(), Some("0"));
        assert_eq!(all[1].value, None);
        assert_eq!(all[1].flag.as_deref(), Some("V"));

        let interval = TimeInterval::new(times[1].0, times[1].0 + chrono::Duration::hours(1)).unwrap();
        let kept = samples(&times, &values, None, Some(&interval));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].flag, None);
    }
}
