//! Fixture builders for stations, records and federations.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use atmofed::adapters::{Adapter, AdapterRegistry};
use atmofed::cache::CacheLayer;
use atmofed::config::MatchingConfig;
use atmofed::federation::{Federation, FederationSettings, RetryPolicy};
use atmofed::model::{
    AccessKind, Coverage, Dataset, DatasetUrl, GeoPoint, NativeRequest, NormalizedRecord,
    Observation, Provenance, QualityFlag, Ri, Station, StationKey, TimeSeries, Variable,
};
use atmofed::vocabulary::Vocabulary;

pub fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

pub fn station(ri: Ri, id: &str, name: &str, lat: f64, lon: f64) -> Station {
    Station {
        key: StationKey::new(ri, id),
        name: name.to_string(),
        location: GeoPoint::new(lat, lon, None),
        variables: BTreeSet::new(),
        uri: None,
    }
}

/// A record of `variable` at `station`, from native dataset `dataset_id`,
/// covering 2019 through 2021.
pub fn record(station: &Station, variable: &str, dataset_id: &str) -> NormalizedRecord {
    let unit = Vocabulary::builtin()
        .ok()
        .and_then(|v| v.variable(variable).map(|d| d.unit.clone()))
        .unwrap_or_default();
    let ri = station.key.ri;
    let mut station = station.clone();
    station.variables.insert(variable.to_string());
    let url = format!("https://data.example/{}/{}", station.key.native_id, dataset_id);

    NormalizedRecord {
        station,
        variable: Variable {
            name: variable.to_string(),
            unit,
            native_name: variable.to_lowercase(),
            native_unit: None,
        },
        dataset: Dataset {
            id: dataset_id.to_string(),
            title: Some(format!("{} {}", variable, dataset_id)),
            coverage: Coverage {
                begin: Some(utc(2019, 1, 1)),
                end: Some(utc(2021, 12, 31)),
            },
            urls: vec![DatasetUrl {
                url: url.clone(),
                kind: AccessKind::Http,
            }],
        },
        provenance: Provenance {
            ri,
            adapter: "mock".to_string(),
            request: NativeRequest::get(url),
        },
    }
}

/// Hourly series of `values`, starting 2020-01-01T00:00Z.
pub fn series(ri: Ri, station_id: &str, variable: &str, values: &[Option<f64>]) -> TimeSeries {
    TimeSeries {
        ri,
        station_id: station_id.to_string(),
        dataset_id: "payload".to_string(),
        variable: variable.to_string(),
        unit: String::new(),
        observations: values
            .iter()
            .enumerate()
            .map(|(i, v)| Observation {
                time: utc(2020, 1, 1) + chrono::Duration::hours(i as i64),
                value: *v,
                flag: if v.is_some() {
                    QualityFlag::Valid
                } else {
                    QualityFlag::Missing
                },
            })
            .collect(),
    }
}

/// Settings with millisecond backoff so retry tests stay fast.
pub fn fast_settings() -> FederationSettings {
    FederationSettings {
        default_ttl: Duration::from_secs(3600),
        default_deadline: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        },
        matching: MatchingConfig::default(),
    }
}

pub fn federation(adapters: Vec<Arc<dyn Adapter>>) -> Federation {
    federation_with(adapters, fast_settings())
}

pub fn federation_with(adapters: Vec<Arc<dyn Adapter>>, settings: FederationSettings) -> Federation {
    let vocabulary = Arc::new(Vocabulary::builtin().unwrap());
    let cache = Arc::new(CacheLayer::in_memory(atmofed::cache::schema_tag(
        vocabulary.version(),
    )));
    let mut registry = AdapterRegistry::new();
    for adapter in adapters {
        registry.register(adapter, 2);
    }
    Federation::new(registry, vocabulary, cache, settings)
}
