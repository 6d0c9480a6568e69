//! ACTRIS adapter.
//!
//! Talks to the ACTRIS metadata REST service: the facility list, paged
//! dataset search per facility and content attribute, and JSON time series
//! exports keyed by EBAS component names.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    decode, optional_number, optional_text, optional_time, samples, schema_error, text, time,
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

/// Payload columns that describe the measurement context, not a variable.
const STATIC_PARAMETERS: &[&str] = &[
    "latitude",
    "longitude",
    "air_pressure",
    "barometric_altitude",
    "pressure",
    "relative_humidity",
    "temperature",
];

/// Upper bound on pages fetched for one facility and content attribute.
const MAX_PAGES: usize = 200;

type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Entry of the facility list.
#[derive(Debug, Deserialize)]
struct ActrisFacility {
    #[serde(deserialize_with = "text")]
    identifier: String,
    #[serde(default, deserialize_with = "optional_text")]
    name: Option<String>,
    #[serde(default, deserialize_with = "optional_number")]
    lat: Option<f64>,
    #[serde(default, deserialize_with = "optional_number")]
    lon: Option<f64>,
    #[serde(default, deserialize_with = "optional_number")]
    alt: Option<f64>,
    #[serde(default)]
    actris_national_facility: Option<bool>,
}

/// Entry of a dataset search page.
#[derive(Debug, Deserialize)]
struct ActrisDataset {
    #[serde(deserialize_with = "text")]
    id: String,
    #[serde(default)]
    md_identification: Option<ActrisIdentification>,
    #[serde(default)]
    md_distribution_information: Option<Vec<ActrisDistribution>>,
    ex_temporal_extent: ActrisTemporalExtent,
}

#[derive(Debug, Deserialize)]
struct ActrisIdentification {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActrisDistribution {
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    dataset_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActrisTemporalExtent {
    #[serde(deserialize_with = "time")]
    time_period_begin: DateTime<Utc>,
    #[serde(default, deserialize_with = "optional_time")]
    time_period_end: Option<DateTime<Utc>>,
}

/// JSON time series export.
#[derive(Debug, Deserialize)]
struct ActrisExport {
    time: Vec<Timestamp>,
    variables: Vec<ActrisColumn>,
}

#[derive(Debug, Deserialize)]
struct ActrisColumn {
    ebas_component: String,
    #[serde(default)]
    statistics: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    values: Vec<SampleValue>,
    #[serde(default)]
    flags: Option<Vec<SampleFlag>>,
}

pub struct ActrisAdapter {
    base_url: String,
    transport: Arc<dyn HttpTransport>,
    normalizer: Normalizer,
}

impl ActrisAdapter {
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
            .map_err(|e| e.into_adapter_error(Ri::Actris))
    }

    /// National facilities only; other entries in the list are contacts,
    /// labs and such.
    async fn facilities(&self) -> AdapterResult<Vec<Station>> {
        let request = NativeRequest::get(format!("{}/facilities", self.base_url));
        let body = self.send(&request).await?;
        let facilities: Vec<ActrisFacility> = decode(Ri::Actris, "facility list", &body)?;

        facilities
            .into_iter()
            .filter(|f| f.actris_national_facility == Some(true))
            .map(|f| self.station(f, &body))
            .collect()
    }

    fn station(&self, facility: ActrisFacility, body: &Value) -> AdapterResult<Station> {
        let location = match (facility.lat, facility.lon) {
            (Some(lat), Some(lon)) => GeoPoint::new(lat, lon, facility.alt),
            _ => {
                return Err(schema_error(
                    Ri::Actris,
                    format!("facility {} has no location", facility.identifier),
                    body,
                ))
            }
        };
        if !location.is_valid() {
            return Err(schema_error(
                Ri::Actris,
                format!("facility {} has an invalid location", facility.identifier),
                body,
            ));
        }
        Ok(Station {
            uri: Some(format!("{}/facilities/{}", self.base_url, facility.identifier)),
            name: facility.name.unwrap_or_else(|| facility.identifier.clone()),
            key: StationKey::new(Ri::Actris, facility.identifier),
            location,
            variables: BTreeSet::new(),
        })
    }

    /// Content attribute labels to search for.
    fn content_labels(&self, query: &Query) -> BTreeSet<String> {
        let vocabulary = self.normalizer.vocabulary();
        let wanted: BTreeSet<String> = if query.is_wildcard() {
            self.known_variables()
        } else {
            query.variables.clone()
        };
        wanted
            .iter()
            .flat_map(|v| vocabulary.native_names(Ri::Actris, v, MappingContext::Catalog))
            .map(str::to_string)
            .collect()
    }

    /// All pages of datasets for one facility and label. Paging ends at the
    /// first empty page.
    async fn datasets(&self, station: &Station, label: &str) -> AdapterResult<Vec<NativeRecord>> {
        let mut records = Vec::new();
        for page in 0..MAX_PAGES {
            let request = NativeRequest::get(format!(
                "{}/metadata/facility/{}/content/{}/page/{}",
                self.base_url, station.key.native_id, label, page
            ));
            let body = self.send(&request).await?;
            let entries: Vec<ActrisDataset> = decode(Ri::Actris, "dataset page", &body)?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                records.push(NativeRecord {
                    station: station.clone(),
                    native_variable: label.to_string(),
                    native_unit: None,
                    dataset: dataset(entry, &body)?,
                    request: request.clone(),
                });
            }
        }
        debug!(
            station = %station.key,
            label = label,
            count = records.len(),
            "Fetched ACTRIS dataset pages"
        );
        Ok(records)
    }
}

fn dataset(entry: ActrisDataset, body: &Value) -> AdapterResult<Dataset> {
    let mut urls = Vec::new();
    for item in entry.md_distribution_information.unwrap_or_default() {
        let kind = match item.protocol.as_deref() {
            Some("OPeNDAP") => AccessKind::Opendap,
            Some("HTTP") => AccessKind::Http,
            _ => continue,
        };
        let url = item.dataset_url.ok_or_else(|| {
            schema_error(
                Ri::Actris,
                format!("dataset {} has a distribution without URL", entry.id),
                body,
            )
        })?;
        urls.push(DatasetUrl { url, kind });
    }

    Ok(Dataset {
        title: entry.md_identification.and_then(|i| i.title),
        id: entry.id,
        coverage: Coverage {
            begin: Some(entry.ex_temporal_extent.time_period_begin),
            end: entry.ex_temporal_extent.time_period_end,
        },
        urls,
    })
}

#[async_trait]
impl Adapter for ActrisAdapter {
    fn ri(&self) -> Ri {
        Ri::Actris
    }

    fn name(&self) -> &str {
        "actris"
    }

    fn known_variables(&self) -> BTreeSet<String> {
        self.normalizer.vocabulary().catalog(Ri::Actris)
    }

    async fn discover(&self, query: &Query) -> AdapterResult<Vec<Station>> {
        if query.excludes_ri(Ri::Actris) {
            return Ok(vec![]);
        }
        let mut stations: Vec<Station> = self
            .facilities()
            .await?
            .into_iter()
            .filter(|s| query.admits_station(s))
            .collect();
        stations.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(stations)
    }

    async fn fetch_records(&self, query: &Query) -> AdapterResult<Vec<NormalizedRecord>> {
        let labels = self.content_labels(query);
        if labels.is_empty() {
            return Ok(vec![]);
        }
        let stations = self.discover(query).await?;

        let mut natives = Vec::new();
        for station in &stations {
            for label in &labels {
                natives.extend(
                    self.datasets(station, label)
                        .await?
                        .into_iter()
                        .filter(|r| query.admits_coverage(&r.dataset.coverage)),
                );
            }
        }

        let records = self.normalizer.normalize_all(Ri::Actris, self.name(), natives);
        info!(
            stations = stations.len(),
            labels = labels.len(),
            records = records.len(),
            "ACTRIS query completed"
        );
        Ok(records)
    }

    async fn fetch_payload(
        &self,
        handle: &PayloadHandle,
        interval: Option<&TimeInterval>,
    ) -> AdapterResult<TimeSeries> {
        let url = handle
            .url_of(AccessKind::Http)
            .or_else(|| handle.url_of(AccessKind::Opendap))
            .ok_or_else(|| {
                AdapterError::unavailable(
                    Ri::Actris,
                    format!("dataset {} has no downloadable URL", handle.dataset_id),
                )
            })?;
        let mut request = NativeRequest::get(url).param("format", "json");
        if let Some(interval) = interval {
            request = request
                .param("start", interval.start.to_rfc3339())
                .param("end", interval.end.to_rfc3339());
        }
        let body = self.send(&request).await?;

        let series = self.parse_payload(&body, &handle.variable, interval)?;
        self.normalizer
            .normalize_series(handle, series)
            .ok_or_else(|| {
                schema_error(
                    Ri::Actris,
                    format!(
                        "no usable column for {} in dataset {}",
                        handle.variable, handle.dataset_id
                    ),
                    &body,
                )
            })
    }
}

impl ActrisAdapter {
    /// Pick the column for `variable` out of an export.
    ///
    /// Uncertainty columns and ancillary static parameters are ignored. A
    /// component shared by several variables is told apart by its unit.
    fn parse_payload(
        &self,
        body: &Value,
        variable: &str,
        interval: Option<&TimeInterval>,
    ) -> AdapterResult<NativeSeries> {
        let export: ActrisExport = decode(Ri::Actris, "time series export", body)?;
        let vocabulary = self.normalizer.vocabulary();

        for column in export.variables {
            let component = column.ebas_component.as_str();
            if STATIC_PARAMETERS.contains(&component) {
                continue;
            }
            if column.statistics.as_deref() == Some("uncertainty") {
                continue;
            }
            let maps_to_variable = vocabulary
                .lookup(
                    Ri::Actris,
                    component,
                    column.unit.as_deref(),
                    MappingContext::Payload,
                )
                .map_or(false, |m| m.canonical.eq_ignore_ascii_case(variable));
            if !maps_to_variable {
                continue;
            }

            if column.values.len() != export.time.len() {
                return Err(schema_error(
                    Ri::Actris,
                    format!(
                        "column {} has {} values for {} timestamps",
                        component,
                        column.values.len(),
                        export.time.len()
                    ),
                    body,
                ));
            }

            return Ok(NativeSeries {
                samples: samples(
                    &export.time,
                    &column.values,
                    column.flags.as_deref(),
                    interval,
                ),
                native_variable: column.ebas_component,
                native_unit: column.unit,
            });
        }

        // The dataset does not carry this variable
        Ok(NativeSeries {
            native_variable: vocabulary
                .native_names(Ri::Actris, variable, MappingContext::Payload)
                .first()
                .map(|s| s.to_string())
                .unwrap_or_else(|| variable.to_string()),
            native_unit: None,
            samples: vec![],
        })
    }
}
