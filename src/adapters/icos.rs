//! ICOS adapter.
//!
//! Station and data-object discovery go through the ICOS Carbon Portal
//! SPARQL endpoint; payloads are read column-wise from the data object's
//! landing page.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    decode, number, samples, schema_error, text, time, trim_base_url, Adapter, HttpTransport,
    SampleFlag, SampleValue, Timestamp,
};
use crate::error::AdapterError;
use crate::model::{
    AccessKind, Coverage, Dataset, DatasetUrl, GeoPoint, NativeRecord, NativeRequest,
    NativeSeries, NormalizedRecord, PayloadHandle, Query, Ri, Station, StationKey, TimeInterval,
    TimeSeries,
};
use crate::normalizer::Normalizer;
use crate::vocabulary::MappingContext;

const CPMETA: &str = "http://meta.icos-cp.eu/resources/cpmeta/";

/// Data object specification holding each native variable.
const SPEC_BY_VARIABLE: &[(&str, &str)] = &[
    ("ap", "atcMtoL2DataObject"),
    ("wd", "atcMtoL2DataObject"),
    ("ws", "atcMtoL2DataObject"),
    ("at", "atcMtoL2DataObject"),
    ("rh", "atcMtoL2DataObject"),
    ("co2", "atcCo2Product"),
    ("co", "atcCoL2DataObject"),
    ("ch4", "atcCh4Product"),
    ("n2o", "atcN2oL2DataObject"),
];

const STATION_QUERY: &str = r#"prefix cpmeta: <http://meta.icos-cp.eu/ontologies/cpmeta/>
select ?uri ?id ?name ?lat ?lon ?elevation ?theme
where {
    ?uri a cpmeta:AS ;
        cpmeta:hasStationId ?id ;
        cpmeta:hasName ?name ;
        cpmeta:hasLatitude ?lat ;
        cpmeta:hasLongitude ?lon .
    OPTIONAL { ?uri cpmeta:hasElevation ?elevation }
    BIND("AS" AS ?theme)
}"#;

type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// SPARQL JSON results; only the bindings are used.
#[derive(Debug, Deserialize)]
struct SparqlResponse<B> {
    results: SparqlResults<B>,
}

#[derive(Debug, Deserialize)]
struct SparqlResults<B> {
    bindings: Vec<B>,
}

/// An RDF term bound to a variable. Only its lexical value matters.
#[derive(Debug, Deserialize)]
struct Term {
    #[serde(deserialize_with = "text")]
    value: String,
}

#[derive(Debug, Deserialize)]
struct NumericTerm {
    #[serde(deserialize_with = "number")]
    value: f64,
}

#[derive(Debug, Deserialize)]
struct TimeTerm {
    #[serde(deserialize_with = "time")]
    value: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct IcosStationBinding {
    #[serde(default)]
    uri: Option<Term>,
    id: Term,
    #[serde(default)]
    name: Option<Term>,
    lat: NumericTerm,
    lon: NumericTerm,
    #[serde(default)]
    elevation: Option<NumericTerm>,
    #[serde(default)]
    theme: Option<Term>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IcosObjectBinding {
    station: Term,
    dobj: Term,
    spec: Term,
    #[serde(default)]
    file_name: Option<Term>,
    time_start: TimeTerm,
    time_end: TimeTerm,
}

/// Column-wise data object content.
#[derive(Debug, Deserialize)]
struct IcosColumns {
    columns: Map<String, Value>,
    #[serde(default)]
    units: Option<Map<String, Value>>,
}

fn spec_uri(native_variable: &str) -> Option<String> {
    let lower = native_variable.to_ascii_lowercase();
    SPEC_BY_VARIABLE
        .iter()
        .find(|(v, _)| *v == lower)
        .map(|(_, spec)| format!("{}{}", CPMETA, spec))
}

/// Latest versions of the data objects of the given specs.
fn dataset_query(specs: &BTreeSet<String>) -> String {
    let values: Vec<String> = specs.iter().map(|s| format!("<{}>", s)).collect();
    format!(
        r#"prefix cpmeta: <http://meta.icos-cp.eu/ontologies/cpmeta/>
prefix prov: <http://www.w3.org/ns/prov#>
select ?station ?dobj ?spec ?fileName ?size ?submTime ?timeStart ?timeEnd
where {{
    VALUES ?spec {{ {} }}
    ?dobj cpmeta:hasObjectSpec ?spec .
    ?dobj cpmeta:hasSizeInBytes ?size .
    ?dobj cpmeta:hasName ?fileName .
    ?dobj cpmeta:wasAcquiredBy/prov:wasAssociatedWith ?station .
    ?dobj cpmeta:wasSubmittedBy/prov:endedAtTime ?submTime .
    ?dobj cpmeta:hasStartTime | (cpmeta:wasAcquiredBy / prov:startedAtTime) ?timeStart .
    ?dobj cpmeta:hasEndTime | (cpmeta:wasAcquiredBy / prov:endedAtTime) ?timeEnd .
    FILTER NOT EXISTS {{[] cpmeta:isNextVersionOf ?dobj}}
}}"#,
        values.join(" ")
    )
}

/// Station code from a station URI, e.g. `.../stations/AS_HTM` -> `HTM`.
fn station_code(uri: &str) -> &str {
    let tail = uri.rsplit('/').next().unwrap_or(uri);
    tail.rsplit('_').next().unwrap_or(tail)
}

pub struct IcosAdapter {
    base_url: String,
    transport: Arc<dyn HttpTransport>,
    normalizer: Normalizer,
}

impl IcosAdapter {
    pub fn new(base_url: &str, transport: Arc<dyn HttpTransport>, normalizer: Normalizer) -> Self {
        Self {
            base_url: trim_base_url(base_url),
            transport,
            normalizer,
        }
    }

    fn sparql_request(&self, query: String) -> NativeRequest {
        NativeRequest::post(format!("{}/sparql", self.base_url)).param("query", query)
    }

    /// Run a SPARQL query and decode its result bindings.
    async fn sparql<B: serde::de::DeserializeOwned>(
        &self,
        request: &NativeRequest,
    ) -> AdapterResult<Vec<B>> {
        let body = self
            .transport
            .send(request)
            .await
            .map_err(|e| e.into_adapter_error(Ri::Icos))?;
        let response: SparqlResponse<B> = decode(Ri::Icos, "SPARQL results", &body)?;
        Ok(response.results.bindings)
    }

    async fn stations(&self) -> AdapterResult<Vec<Station>> {
        let request = self.sparql_request(STATION_QUERY.to_string());
        let bindings: Vec<IcosStationBinding> = self.sparql(&request).await?;

        let mut stations = Vec::new();
        for binding in bindings {
            // Only atmosphere stations carry the variables served here
            if binding.theme.as_ref().map_or(false, |t| t.value != "AS") {
                continue;
            }
            let id = binding.id.value;
            let location = GeoPoint::new(
                binding.lat.value,
                binding.lon.value,
                binding.elevation.map(|e| e.value),
            );
            if !location.is_valid() {
                return Err(AdapterError::schema(
                    Ri::Icos,
                    format!("station {} has an invalid location", id),
                    &format!("lat={} lon={}", location.latitude, location.longitude),
                ));
            }
            stations.push(Station {
                name: binding.name.map_or_else(|| id.clone(), |n| n.value),
                uri: binding.uri.map(|u| u.value),
                key: StationKey::new(Ri::Icos, id),
                location,
                variables: BTreeSet::new(),
            });
        }
        Ok(stations)
    }

    /// Native variables (lowercase) to search for.
    fn native_variables(&self, query: &Query) -> BTreeSet<String> {
        let vocabulary = self.normalizer.vocabulary();
        let wanted = if query.is_wildcard() {
            self.known_variables()
        } else {
            query.variables.clone()
        };
        wanted
            .iter()
            .flat_map(|v| vocabulary.native_names(Ri::Icos, v, MappingContext::Catalog))
            .map(str::to_ascii_lowercase)
            .collect()
    }
}

#[async_trait]
impl Adapter for IcosAdapter {
    fn ri(&self) -> Ri {
        Ri::Icos
    }

    fn name(&self) -> &str {
        "icos"
    }

    fn known_variables(&self) -> BTreeSet<String> {
        self.normalizer.vocabulary().catalog(Ri::Icos)
    }

    async fn discover(&self, query: &Query) -> AdapterResult<Vec<Station>> {
        if query.excludes_ri(Ri::Icos) {
            return Ok(vec![]);
        }
        let mut stations: Vec<Station> = self
            .stations()
            .await?
            .into_iter()
            .filter(|s| query.admits_station(s))
            .collect();
        stations.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(stations)
    }

    async fn fetch_records(&self, query: &Query) -> AdapterResult<Vec<NormalizedRecord>> {
        let natives = self.native_variables(query);
        let specs: BTreeSet<String> = natives.iter().filter_map(|v| spec_uri(v)).collect();
        if specs.is_empty() {
            return Ok(vec![]);
        }

        let stations: BTreeMap<String, Station> = self
            .discover(query)
            .await?
            .into_iter()
            .map(|s| (s.key.native_id.clone(), s))
            .collect();
        if stations.is_empty() {
            return Ok(vec![]);
        }

        let request = self.sparql_request(dataset_query(&specs));
        let bindings: Vec<IcosObjectBinding> = self.sparql(&request).await?;

        let mut seen = BTreeSet::new();
        let mut records = Vec::new();
        for binding in &bindings {
            let station_uri = &binding.station.value;
            let dobj = &binding.dobj.value;
            let spec = &binding.spec.value;
            let coverage = Coverage {
                begin: Some(binding.time_start.value),
                end: Some(binding.time_end.value),
            };

            let station = match stations.get(station_code(station_uri)) {
                Some(station) => station,
                None => continue,
            };
            // Several meteo variables share one object; the same object can
            // also come back once per matching path in the query
            if !seen.insert(dobj.clone()) || !query.admits_coverage(&coverage) {
                continue;
            }

            let dataset = Dataset {
                id: dobj.clone(),
                title: binding.file_name.as_ref().map(|f| f.value.clone()),
                coverage,
                urls: vec![DatasetUrl {
                    url: dobj.clone(),
                    kind: AccessKind::LandingPage,
                }],
            };
            let in_object = natives
                .iter()
                .filter(|v| spec_uri(v).as_deref() == Some(spec.as_str()));
            for native in in_object {
                records.push(NativeRecord {
                    station: station.clone(),
                    native_variable: native.clone(),
                    native_unit: None,
                    dataset: dataset.clone(),
                    request: request.clone(),
                });
            }
        }

        debug!(bindings = bindings.len(), objects = seen.len(), "Parsed ICOS SPARQL results");
        let records = self.normalizer.normalize_all(Ri::Icos, self.name(), records);
        info!(
            stations = stations.len(),
            records = records.len(),
            "ICOS query completed"
        );
        Ok(records)
    }

    async fn fetch_payload(
        &self,
        handle: &PayloadHandle,
        interval: Option<&TimeInterval>,
    ) -> AdapterResult<TimeSeries> {
        let url = handle.url_of(AccessKind::LandingPage).ok_or_else(|| {
            AdapterError::unavailable(
                Ri::Icos,
                format!("data object {} has no landing page", handle.dataset_id),
            )
        })?;
        let request = NativeRequest::get(url).param("format", "json");
        let body = self
            .transport
            .send(&request)
            .await
            .map_err(|e| e.into_adapter_error(Ri::Icos))?;

        let series = parse_columns(&body, &handle.native_variable, interval)?;
        self.normalizer
            .normalize_series(handle, series)
            .ok_or_else(|| {
                schema_error(
                    Ri::Icos,
                    format!("column {} cannot be normalized", handle.native_variable),
                    &body,
                )
            })
    }
}

/// Column lookup ignoring case: ICOS mixes `co2` and `AP` style names.
fn column<'a>(columns: &'a Map<String, Value>, name: &str) -> Option<(&'a String, &'a Value)> {
    columns.iter().find(|(k, _)| k.eq_ignore_ascii_case(name))
}

fn parse_columns(
    body: &Value,
    native_variable: &str,
    interval: Option<&TimeInterval>,
) -> AdapterResult<NativeSeries> {
    let content: IcosColumns = decode(Ri::Icos, "data object content", body)?;
    let columns = &content.columns;
    let times = column(columns, "TIMESTAMP")
        .ok_or_else(|| schema_error(Ri::Icos, "missing TIMESTAMP column", body))?;
    let times: Vec<Timestamp> = decode(Ri::Icos, "TIMESTAMP column", times.1)?;

    let (name, values) = match column(columns, native_variable) {
        Some((name, values)) => {
            let values: Vec<SampleValue> = decode(Ri::Icos, "data column", values)?;
            (name.clone(), values)
        }
        None => {
            // The object does not carry this variable
            return Ok(NativeSeries {
                native_variable: native_variable.to_string(),
                native_unit: None,
                samples: vec![],
            });
        }
    };
    if values.len() != times.len() {
        return Err(schema_error(
            Ri::Icos,
            format!(
                "column {} has {} values for {} timestamps",
                name,
                values.len(),
                times.len()
            ),
            body,
        ));
    }

    let flags: Option<Vec<SampleFlag>> = column(columns, &format!("Flag_{}", name))
        .or_else(|| column(columns, &format!("{}_Flag", name)))
        .or_else(|| column(columns, "Flag"))
        .and_then(|(_, f)| Vec::<SampleFlag>::deserialize(f).ok());

    let native_unit = content
        .units
        .as_ref()
        .and_then(|units| column(units, &name))
        .and_then(|(_, u)| u.as_str().map(str::to_string));

    Ok(NativeSeries {
        samples: samples(&times, &values, flags.as_deref(), interval),
        native_variable: name,
        native_unit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::{normalizer, StaticTransport};
    use crate::error::FailureKind;
    use crate::model::QualityFlag;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    const BASE: &str = "http://icos.test";

    fn literal(value: &str) -> Value {
        json!({"type": "literal", "value": value})
    }

    fn stations_body() -> Value {
        json!({
            "head": {"vars": ["uri", "id", "name", "lat", "lon", "elevation", "theme"]},
            "results": {"bindings": [
                {"uri": literal("http://meta.icos-cp.eu/resources/stations/AS_HTM"),
                 "id": literal("HTM"), "name": literal("Hyltemossa"),
                 "lat": literal("56.0976"), "lon": literal("13.4189"),
                 "elevation": literal("115"), "theme": literal("AS")},
                {"uri": literal("http://meta.icos-cp.eu/resources/stations/ES_SE-Htm"),
                 "id": literal("SE-Htm"), "name": literal("Hyltemossa eco"),
                 "lat": literal("56.1"), "lon": literal("13.4"), "theme": literal("ES")},
                {"uri": literal("http://meta.icos-cp.eu/resources/stations/AS_PUY"),
                 "id": literal("PUY"), "name": literal("Puy de Dome"),
                 "lat": literal("45.7719"), "lon": literal("2.9658"), "theme": literal("AS")}
            ]}
        })
    }

    fn datasets_body() -> Value {
        let row = |station: &str, dobj: &str, spec: &str, start: &str, end: &str| {
            json!({
                "station": literal(&format!("http://meta.icos-cp.eu/resources/stations/AS_{}", station)),
                "dobj": literal(&format!("https://meta.icos-cp.eu/objects/{}", dobj)),
                "spec": literal(&format!("{}{}", CPMETA, spec)),
                "fileName": literal(&format!("{}.csv", dobj)),
                "timeStart": literal(start),
                "timeEnd": literal(end)
            })
        };
        json!({"results": {"bindings": [
            row("HTM", "obj1", "atcCo2Product", "2017-01-01T00:00:00Z", "2019-01-01T00:00:00Z"),
            row("HTM", "obj1", "atcCo2Product", "2017-01-01T00:00:00Z", "2019-01-01T00:00:00Z"),
            row("HTM", "obj2", "atcMtoL2DataObject", "2017-01-01T00:00:00Z", "2019-01-01T00:00:00Z"),
            row("PUY", "obj3", "atcCo2Product", "2010-01-01T00:00:00Z", "2012-01-01T00:00:00Z"),
            row("XXX", "obj4", "atcCo2Product", "2017-01-01T00:00:00Z", "2019-01-01T00:00:00Z")
        ]}})
    }

    fn adapter(transport: StaticTransport) -> IcosAdapter {
        IcosAdapter::new(BASE, Arc::new(transport), normalizer())
    }

    #[test]
    fn test_station_code() {
        assert_eq!(station_code("http://meta.icos-cp.eu/resources/stations/AS_HTM"), "HTM");
        assert_eq!(station_code("HTM"), "HTM");
    }

    #[test]
    fn test_object_spec_lookup_is_case_insensitive() {
        assert_eq!(
            spec_uri("CO2").as_deref(),
            Some("http://meta.icos-cp.eu/resources/cpmeta/atcCo2Product")
        );
        assert_eq!(spec_uri("AT"), spec_uri("rh"));
        assert!(spec_uri("o3").is_none());
    }

    #[tokio::test]
    async fn test_discover_keeps_atmosphere_stations() {
        let transport =
            StaticTransport::new().with_json(&format!("{}/sparql", BASE), stations_body());
        let stations = adapter(transport).discover(&Query::new()).await.unwrap();
        let ids: Vec<String> = stations.iter().map(Station::id).collect();
        assert_eq!(ids, vec!["ICOS:HTM", "ICOS:PUY"]);
        assert_eq!(stations[0].location.elevation, Some(115.0));
    }

    /// Routes the two SPARQL queries by inspecting the query text.
    struct SparqlTransport {
        stations: Value,
        datasets: Value,
    }

    #[async_trait]
    impl HttpTransport for SparqlTransport {
        async fn send(
            &self,
            request: &NativeRequest,
        ) -> std::result::Result<Value, crate::adapters::TransportError> {
            let query = request.params.get("query").cloned().unwrap_or_default();
            if query.contains("hasObjectSpec") {
                Ok(self.datasets.clone())
            } else {
                Ok(self.stations.clone())
            }
        }
    }

    #[tokio::test]
    async fn test_fetch_records_dedupes_and_filters() {
        let adapter = IcosAdapter::new(
            BASE,
            Arc::new(SparqlTransport {
                stations: stations_body(),
                datasets: datasets_body(),
            }),
            normalizer(),
        );
        let interval = TimeInterval::new(
            Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let query = Query::new()
            .with_variables(["CO2", "AT"])
            .with_interval(interval);

        let records = adapter.fetch_records(&query).await.unwrap();
        let summary: Vec<(String, String, String)> = records
            .iter()
            .map(|r| (r.station.id(), r.dataset.id.clone(), r.variable.name.clone()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (
                    "ICOS:HTM".to_string(),
                    "https://meta.icos-cp.eu/objects/obj1".to_string(),
                    "CO2".to_string()
                ),
                (
                    "ICOS:HTM".to_string(),
                    "https://meta.icos-cp.eu/objects/obj2".to_string(),
                    "AT".to_string()
                ),
            ]
        );
        assert_eq!(records[0].dataset.urls[0].kind, AccessKind::LandingPage);
        assert_eq!(records[0].provenance.request.method, "POST");
    }

    #[tokio::test]
    async fn test_missing_bindings_is_schema_error() {
        let transport = StaticTransport::new()
            .with_json(&format!("{}/sparql", BASE), json!({"head": {}, "boolean": true}));
        let err = adapter(transport).discover(&Query::new()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::AdapterSchemaError);
    }

    #[tokio::test]
    async fn test_unparseable_coordinate_is_schema_error() {
        let mut body = stations_body();
        body["results"]["bindings"][0]["lat"] = literal("fifty-six");
        let transport = StaticTransport::new().with_json(&format!("{}/sparql", BASE), body);
        let err = adapter(transport).discover(&Query::new()).await.unwrap_err();
        match err {
            AdapterError::Schema { message, raw, .. } => {
                assert!(message.contains("not numeric"));
                assert!(raw.contains("Hyltemossa"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_payload_converts_temperature() {
        let url = "https://meta.icos-cp.eu/objects/obj2";
        let transport = StaticTransport::new().with_json(
            url,
            json!({
                "columns": {
                    "TIMESTAMP": [1514764800000i64, 1514768400000i64],
                    "AT": [10.0, null],
                    "Flag_AT": ["O", "N"],
                    "RH": [80.0, 81.0]
                },
                "units": {"AT": "degC"}
            }),
        );
        let handle = PayloadHandle {
            ri: Ri::Icos,
            station_id: "ICOS:HTM".to_string(),
            variable: "AT".to_string(),
            native_variable: "at".to_string(),
            dataset_id: url.to_string(),
            urls: vec![DatasetUrl {
                url: url.to_string(),
                kind: AccessKind::LandingPage,
            }],
        };

        let series = adapter(transport).fetch_payload(&handle, None).await.unwrap();
        assert_eq!(series.unit, "K");
        assert_eq!(series.observations[0].value, Some(10.0 + 273.15));
        assert_eq!(series.observations[0].flag, QualityFlag::Valid);
        assert_eq!(series.observations[1].value, None);
        assert_eq!(series.observations[1].flag, QualityFlag::Invalid);
        assert_eq!(
            series.observations[0].time,
            Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0).unwrap()
        );
    }
}
