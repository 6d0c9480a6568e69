//! IAGOS adapter.
//!
//! IAGOS measures from commercial aircraft; the stations exposed here are the
//! airports whose take-off and landing profiles are aggregated by the IAGOS
//! data portal API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

use super::{
    decode, number, optional_number, optional_text, optional_time, samples, schema_error, text,
    trim_base_url, Adapter, HttpTransport, SampleFlag, SampleValue, Timestamp,
};
use crate::error::AdapterError;
use crate::model::{
    AccessKind, Coverage, Dataset, DatasetUrl, GeoPoint, NativeRecord, NativeRequest,
    NativeSeries, NormalizedRecord, PayloadHandle, Query, Ri, Station, StationKey, TimeInterval,
    TimeSeries,
};
use crate::normalizer::Normalizer;
use crate::vocabulary::MappingContext;

type AdapterResult<T> = std::result::Result<T, AdapterError>;

#[derive(Debug, Deserialize)]
struct IagosAirport {
    #[serde(deserialize_with = "text")]
    iata_code: String,
    #[serde(default, deserialize_with = "optional_text")]
    name: Option<String>,
    #[serde(deserialize_with = "number")]
    latitude: f64,
    #[serde(deserialize_with = "number")]
    longitude: f64,
    #[serde(default, deserialize_with = "optional_number")]
    elevation: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct IagosDatasetList {
    datasets: Vec<IagosDataset>,
}

#[derive(Debug, Deserialize)]
struct IagosDataset {
    #[serde(deserialize_with = "text")]
    id: String,
    variable: String,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, deserialize_with = "optional_time")]
    begin: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "optional_time")]
    end: Option<DateTime<Utc>>,
    url: String,
}

/// Time series behind one dataset.
#[derive(Debug, Deserialize)]
struct IagosSeries {
    #[serde(default)]
    variable: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    times: Vec<Timestamp>,
    values: Vec<SampleValue>,
    #[serde(default)]
    flags: Option<Vec<SampleFlag>>,
}

pub struct IagosAdapter {
    base_url: String,
    transport: Arc<dyn HttpTransport>,
    normalizer: Normalizer,
}

impl IagosAdapter {
    pub fn new(base_url: &str, transport: Arc<dyn HttpTransport>, normalizer: Normalizer) -> Self {
        Self {
            base_url: trim_base_url(base_url),
            transport,
            normalizer,
        }
    }

    async fn send(&self, request: &NativeRequest) -> AdapterResult<Value> {
        self.transport
            .send(request)
            .await
            .map_err(|e| e.into_adapter_error(Ri::Iagos))
    }

    async fn airports(&self) -> AdapterResult<Vec<Station>> {
        let request = NativeRequest::get(format!("{}/airports", self.base_url));
        let body = self.send(&request).await?;
        let airports: Vec<IagosAirport> = decode(Ri::Iagos, "airport list", &body)?;

        let mut stations = Vec::with_capacity(airports.len());
        for airport in airports {
            let location = GeoPoint::new(airport.latitude, airport.longitude, airport.elevation);
            if !location.is_valid() {
                return Err(schema_error(
                    Ri::Iagos,
                    format!("airport {} has an invalid location", airport.iata_code),
                    &body,
                ));
            }
            stations.push(Station {
                name: airport.name.unwrap_or_else(|| airport.iata_code.clone()),
                uri: Some(format!("{}/airports/{}", self.base_url, airport.iata_code)),
                key: StationKey::new(Ri::Iagos, airport.iata_code),
                location,
                variables: BTreeSet::new(),
            });
        }
        Ok(stations)
    }

    fn native_variables(&self, query: &Query) -> BTreeSet<String> {
        let vocabulary = self.normalizer.vocabulary();
        let wanted = if query.is_wildcard() {
            self.known_variables()
        } else {
            query.variables.clone()
        };
        wanted
            .iter()
            .flat_map(|v| vocabulary.native_names(Ri::Iagos, v, MappingContext::Catalog))
            .map(str::to_string)
            .collect()
    }

    async fn datasets(
        &self,
        station: &Station,
        natives: &BTreeSet<String>,
        interval: Option<&TimeInterval>,
    ) -> AdapterResult<Vec<NativeRecord>> {
        let mut request = NativeRequest::get(format!(
            "{}/airports/{}/datasets",
            self.base_url, station.key.native_id
        ))
        .param(
            "variables",
            natives.iter().cloned().collect::<Vec<_>>().join(","),
        );
        if let Some(interval) = interval {
            request = request
                .param("from", interval.start.to_rfc3339())
                .param("to", interval.end.to_rfc3339());
        }
        let body = self.send(&request).await?;
        let list: IagosDatasetList = decode(Ri::Iagos, "dataset list", &body)?;

        let records = list
            .datasets
            .into_iter()
            // The service may return more than was asked for
            .filter(|entry| natives.iter().any(|n| n.eq_ignore_ascii_case(&entry.variable)))
            .map(|entry| NativeRecord {
                station: station.clone(),
                dataset: Dataset {
                    id: entry.id,
                    title: entry.title,
                    coverage: Coverage {
                        begin: entry.begin,
                        end: entry.end,
                    },
                    urls: vec![DatasetUrl {
                        url: entry.url,
                        kind: AccessKind::Api,
                    }],
                },
                native_variable: entry.variable,
                native_unit: entry.unit,
                request: request.clone(),
            })
            .collect();
        Ok(records)
    }
}

#[async_trait]
impl Adapter for IagosAdapter {
    fn ri(&self) -> Ri {
        Ri::Iagos
    }

    fn name(&self) -> &str {
        "iagos"
    }

    fn known_variables(&self) -> BTreeSet<String> {
        self.normalizer.vocabulary().catalog(Ri::Iagos)
    }

    async fn discover(&self, query: &Query) -> AdapterResult<Vec<Station>> {
        if query.excludes_ri(Ri::Iagos) {
            return Ok(vec![]);
        }
        let mut stations: Vec<Station> = self
            .airports()
            .await?
            .into_iter()
            .filter(|s| query.admits_station(s))
            .collect();
        stations.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(stations)
    }

    async fn fetch_records(&self, query: &Query) -> AdapterResult<Vec<NormalizedRecord>> {
        let natives = self.native_variables(query);
        if natives.is_empty() {
            return Ok(vec![]);
        }
        let stations = self.discover(query).await?;

        let mut found = Vec::new();
        for station in &stations {
            found.extend(
                self.datasets(station, &natives, query.interval.as_ref())
                    .await?
                    .into_iter()
                    .filter(|r| query.admits_coverage(&r.dataset.coverage)),
            );
        }

        let records = self.normalizer.normalize_all(Ri::Iagos, self.name(), found);
        info!(
            airports = stations.len(),
            records = records.len(),
            "IAGOS query completed"
        );
        Ok(records)
    }

    async fn fetch_payload(
        &self,
        handle: &PayloadHandle,
        interval: Option<&TimeInterval>,
    ) -> AdapterResult<TimeSeries> {
        let url = handle.url_of(AccessKind::Api).ok_or_else(|| {
            AdapterError::unavailable(
                Ri::Iagos,
                format!("dataset {} has no API URL", handle.dataset_id),
            )
        })?;
        let mut request = NativeRequest::get(url).param("variable", handle.native_variable.clone());
        if let Some(interval) = interval {
            request = request
                .param("from", interval.start.to_rfc3339())
                .param("to", interval.end.to_rfc3339());
        }
        let body = self.send(&request).await?;

        let native: IagosSeries = decode(Ri::Iagos, "time series", &body)?;
        if native.times.len() != native.values.len() {
            return Err(schema_error(
                Ri::Iagos,
                format!(
                    "{} values for {} timestamps",
                    native.values.len(),
                    native.times.len()
                ),
                &body,
            ));
        }

        let series = NativeSeries {
            samples: samples(
                &native.times,
                &native.values,
                native.flags.as_deref(),
                interval,
            ),
            native_variable: native
                .variable
                .unwrap_or_else(|| handle.native_variable.clone()),
            native_unit: native.unit,
        };
        self.normalizer
            .normalize_series(handle, series)
            .ok_or_else(|| {
                schema_error(
                    Ri::Iagos,
                    format!("series for {} cannot be normalized", handle.native_variable),
                    &body,
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::{normalizer, StaticTransport};
    use crate::error::FailureKind;
    use crate::geo::BoundingBox;
    use crate::model::QualityFlag;
    use serde_json::json;

    const BASE: &str = "http://iagos.test";

    fn airports() -> Value {
        json!([
            {"iata_code": "FRA", "name": "Frankfurt", "latitude": 50.03, "longitude": 8.57,
             "elevation": 111.0},
            {"iata_code": "CDG", "name": "Paris Charles de Gaulle", "latitude": 49.01,
             "longitude": 2.55},
            {"iata_code": "NRT", "name": "Tokyo Narita", "latitude": 35.76, "longitude": 140.39}
        ])
    }

    fn adapter(transport: StaticTransport) -> IagosAdapter {
        IagosAdapter::new(BASE, Arc::new(transport), normalizer())
    }

    #[tokio::test]
    async fn test_discover_applies_bbox() {
        let transport = StaticTransport::new().with_json(&format!("{}/airports", BASE), airports());
        let query = Query::new().with_bbox(BoundingBox::new(-10.0, 35.0, 30.0, 60.0).unwrap());
        let stations = adapter(transport).discover(&query).await.unwrap();
        let ids: Vec<String> = stations.iter().map(Station::id).collect();
        assert_eq!(ids, vec!["IAGOS:CDG", "IAGOS:FRA"]);
    }

    #[tokio::test]
    async fn test_fetch_records() {
        let transport = StaticTransport::new()
            .with_json(&format!("{}/airports", BASE), airports())
            .with_json(
                &format!("{}/airports/FRA/datasets", BASE),
                json!({"datasets": [
                    {"id": "FRA-O3-2019", "variable": "O3_P1", "unit": "ppb",
                     "begin": "2019-01-01T00:00:00Z", "end": "2019-12-31T23:59:59Z",
                     "url": format!("{}/series/FRA-O3-2019", BASE)},
                    {"id": "FRA-CO-2019", "variable": "CO_P1", "unit": "ppb",
                     "url": format!("{}/series/FRA-CO-2019", BASE)}
                ]}),
            );
        let query = Query::new()
            .with_variables(["O3"])
            .with_stations(["IAGOS:FRA"]);

        let adapter = adapter(transport);
        let records = adapter.fetch_records(&query).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].station.id(), "IAGOS:FRA");
        assert_eq!(records[0].variable.name, "O3");
        assert_eq!(records[0].variable.native_unit.as_deref(), Some("ppb"));
        assert_eq!(
            records[0].provenance.request.params.get("variables").map(String::as_str),
            Some("O3_P1")
        );
    }

    #[tokio::test]
    async fn test_unknown_optional_fields_are_ignored() {
        let dataset = json!({"id": "FRA-O3-2019", "variable": "O3_P1", "unit": "ppb",
                             "url": format!("{}/series/FRA-O3-2019", BASE)});
        let mut extended = dataset.clone();
        extended["doi"] = json!("10.25326/20");
        extended["processing_level"] = json!({"level": 2, "label": "L2"});

        let query = Query::new()
            .with_variables(["O3"])
            .with_stations(["FRA"]);
        let mut outputs = Vec::new();
        for (body, airport_extra) in [(dataset, false), (extended, true)] {
            let mut airports = airports();
            if airport_extra {
                airports[0]["country"] = json!("DE");
            }
            let transport = StaticTransport::new()
                .with_json(&format!("{}/airports", BASE), airports)
                .with_json(
                    &format!("{}/airports/FRA/datasets", BASE),
                    json!({"datasets": [body], "generated": "2024-05-01"}),
                );
            outputs.push(adapter(transport).fetch_records(&query).await.unwrap());
        }
        assert_eq!(outputs[0].len(), 1);
        assert_eq!(outputs[0], outputs[1]);
    }

    #[tokio::test]
    async fn test_missing_datasets_key_is_schema_error() {
        let transport = StaticTransport::new()
            .with_json(&format!("{}/airports", BASE), airports())
            .with_json(&format!("{}/airports/FRA/datasets", BASE), json!({"items": []}));
        let query = Query::new()
            .with_variables(["O3"])
            .with_stations(["FRA"]);
        let err = adapter(transport).fetch_records(&query).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::AdapterSchemaError);
    }

    #[tokio::test]
    async fn test_fetch_payload() {
        let url = format!("{}/series/FRA-P-2019", BASE);
        let transport = StaticTransport::new().with_json(
            &url,
            json!({
                "variable": "air_press_AC",
                "unit": "Pa",
                "times": ["2019-01-01T00:00:00Z", "2019-01-01T00:00:04Z", "2019-01-01T00:00:08Z"],
                "values": [101325.0, 100000.0, null],
                "flags": [0, 2, 7]
            }),
        );
        let handle = PayloadHandle {
            ri: Ri::Iagos,
            station_id: "IAGOS:FRA".to_string(),
            variable: "AP".to_string(),
            native_variable: "air_press_AC".to_string(),
            dataset_id: "FRA-P-2019".to_string(),
            urls: vec![DatasetUrl {
                url,
                kind: AccessKind::Api,
            }],
        };

        let series = adapter(transport).fetch_payload(&handle, None).await.unwrap();
        let values: Vec<Option<f64>> = series.observations.iter().map(|o| o.value).collect();
        assert_eq!(values, vec![Some(1013.25), Some(1000.0), None]);
        let flags: Vec<QualityFlag> = series.observations.iter().map(|o| o.flag).collect();
        assert_eq!(
            flags,
            vec![QualityFlag::Valid, QualityFlag::Suspect, QualityFlag::Missing]
        );
    }

    #[tokio::test]
    async fn test_mismatched_lengths_are_schema_errors() {
        let url = format!("{}/series/bad", BASE);
        let transport = StaticTransport::new().with_json(
            &url,
            json!({"times": ["2019-01-01T00:00:00Z"], "values": [1.0, 2.0]}),
        );
        let handle = PayloadHandle {
            ri: Ri::Iagos,
            station_id: "IAGOS:FRA".to_string(),
            variable: "O3".to_string(),
            native_variable: "O3_P1".to_string(),
            dataset_id: "bad".to_string(),
            urls: vec![DatasetUrl {
                url,
                kind: AccessKind::Api,
            }],
        };
        let err = adapter(transport).fetch_payload(&handle, None).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::AdapterSchemaError);
    }
}
