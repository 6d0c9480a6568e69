//! Shared data model.
//!
//! Everything that crosses a component boundary lives here: the RI-agnostic
//! [`Query`], the per-station and per-dataset types the adapters produce, the
//! [`NormalizedRecord`] the merge engine works on, and the [`FederatedResult`]
//! returned to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{FederationError, Result, SourceFailure};
pub use crate::geo::{BoundingBox, GeoPoint};

/// A research infrastructure known to the adapter registry.
///
/// The derived ordering is the fixed registry order used for deterministic
/// fan-out and manifest ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Ri {
    Actris,
    Iagos,
    Icos,
}

impl Ri {
    pub const ALL: [Ri; 3] = [Ri::Actris, Ri::Iagos, Ri::Icos];

    pub fn as_str(&self) -> &'static str {
        match self {
            Ri::Actris => "ACTRIS",
            Ri::Iagos => "IAGOS",
            Ri::Icos => "ICOS",
        }
    }
}

impl fmt::Display for Ri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Ri {
    type Err = FederationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACTRIS" => Ok(Ri::Actris),
            "IAGOS" => Ok(Ri::Iagos),
            "ICOS" => Ok(Ri::Icos),
            _ => Err(FederationError::UnknownSource { ri: s.to_string() }),
        }
    }
}

/// Composite station key: owning RI plus the RI's native identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StationKey {
    pub ri: Ri,
    pub native_id: String,
}

impl StationKey {
    pub fn new(ri: Ri, native_id: impl Into<String>) -> Self {
        Self {
            ri,
            native_id: native_id.into(),
        }
    }
}

impl fmt::Display for StationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ri, self.native_id)
    }
}

impl FromStr for StationKey {
    type Err = FederationError;

    fn from_str(s: &str) -> Result<Self> {
        let (ri, native_id) = s.split_once(':').ok_or_else(|| FederationError::InvalidQuery {
            param: "station".to_string(),
            message: format!("expected RI-qualified identifier like ICOS:HTM, got {}", s),
        })?;
        if native_id.is_empty() {
            return Err(FederationError::InvalidQuery {
                param: "station".to_string(),
                message: format!("empty native identifier in {}", s),
            });
        }
        Ok(StationKey::new(ri.parse()?, native_id))
    }
}

/// Station metadata as reported by one RI. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub key: StationKey,
    pub name: String,
    pub location: GeoPoint,
    /// Canonical names of the variables known to be available
    #[serde(default)]
    pub variables: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl Station {
    /// RI-qualified identifier, e.g. `ICOS:HTM`.
    pub fn id(&self) -> String {
        self.key.to_string()
    }
}

/// A canonical variable as attached to a record, with the native name it
/// was normalised from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub unit: String,
    pub native_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_unit: Option<String>,
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeInterval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(FederationError::InvalidQuery {
                param: "time".to_string(),
                message: format!("start ({}) must be <= end ({})", start, end),
            });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, t: &DateTime<Utc>) -> bool {
        *t >= self.start && *t < self.end
    }

    /// Whether a dataset covering the closed range `[begin, end]` has any
    /// instant inside this interval. Missing bounds are treated as open.
    pub fn overlaps_coverage(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> bool {
        let starts_before_end = begin.map_or(true, |b| b < self.end);
        let ends_after_start = end.map_or(true, |e| e >= self.start);
        starts_before_end && ends_after_start
    }
}

/// An RI-agnostic query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Canonical variable names or ECV group names; empty means all
    #[serde(default)]
    pub variables: BTreeSet<String>,
    /// RI-qualified (`ICOS:HTM`) or bare native station identifiers; empty means all
    #[serde(default)]
    pub stations: BTreeSet<String>,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
    #[serde(default)]
    pub interval: Option<TimeInterval>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variables<I, S>(mut self, variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variables = variables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stations<I, S>(mut self, stations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stations = stations.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn with_interval(mut self, interval: TimeInterval) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(interval) = &self.interval {
            if interval.start > interval.end {
                return Err(FederationError::InvalidQuery {
                    param: "time".to_string(),
                    message: "start must be <= end".to_string(),
                });
            }
        }
        if let Some(bbox) = &self.bbox {
            bbox.validate()?;
        }
        if self.variables.iter().any(|v| v.trim().is_empty()) {
            return Err(FederationError::InvalidQuery {
                param: "variables".to_string(),
                message: "variable names must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Station filter as seen by one RI: qualified identifiers of that RI and
    /// bare identifiers are kept, identifiers qualified with another RI dropped.
    pub fn station_ids_for(&self, ri: Ri) -> BTreeSet<String> {
        self.stations
            .iter()
            .filter_map(|s| match s.split_once(':') {
                Some((prefix, id)) if prefix.eq_ignore_ascii_case(ri.as_str()) => {
                    Some(id.to_string())
                }
                Some(_) => None,
                None => Some(s.clone()),
            })
            .collect()
    }

    /// True when a station filter is set but names no station of this RI.
    pub fn excludes_ri(&self, ri: Ri) -> bool {
        !self.stations.is_empty() && self.station_ids_for(ri).is_empty()
    }

    /// Whether a station passes the station and bbox filters.
    pub fn admits_station(&self, station: &Station) -> bool {
        let by_id = self.stations.is_empty()
            || self.stations.contains(&station.id())
            || self.stations.contains(&station.key.native_id);
        let by_location = self
            .bbox
            .as_ref()
            .map_or(true, |bbox| bbox.contains(&station.location));
        by_id && by_location
    }

    pub fn admits_coverage(&self, coverage: &Coverage) -> bool {
        self.interval
            .as_ref()
            .map_or(true, |i| i.overlaps_coverage(coverage.begin, coverage.end))
    }
}

/// Echo of the native request that produced a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NativeRequest {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl NativeRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Temporal coverage of a dataset, closed at both ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coverage {
    pub begin: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// How a dataset's bulk data can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Opendap,
    Http,
    LandingPage,
    Api,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetUrl {
    pub url: String,
    pub kind: AccessKind,
}

/// A native dataset reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub coverage: Coverage,
    #[serde(default)]
    pub urls: Vec<DatasetUrl>,
}

/// A record as parsed from a native response, before normalisation.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeRecord {
    pub station: Station,
    pub native_variable: String,
    pub native_unit: Option<String>,
    pub dataset: Dataset,
    pub request: NativeRequest,
}

/// Which adapter produced a record. Never discarded by merging.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub ri: Ri,
    pub adapter: String,
    pub request: NativeRequest,
}

/// The unit the merge engine operates on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub station: Station,
    pub variable: Variable,
    pub dataset: Dataset,
    pub provenance: Provenance,
}

impl NormalizedRecord {
    pub fn source(&self) -> Ri {
        self.provenance.ri
    }

    /// Exact within-RI identity: same RI, same native dataset, same variable.
    pub fn dedupe_key(&self) -> (Ri, String, String) {
        (
            self.provenance.ri,
            self.dataset.id.clone(),
            self.variable.name.clone(),
        )
    }

    pub fn payload_handle(&self) -> PayloadHandle {
        PayloadHandle {
            ri: self.provenance.ri,
            station_id: self.station.id(),
            variable: self.variable.name.clone(),
            native_variable: self.variable.native_name.clone(),
            dataset_id: self.dataset.id.clone(),
            urls: self.dataset.urls.clone(),
        }
    }
}

/// Lazy reference to a bulk time series. Nothing is downloaded until the
/// handle is passed to `Federation::fetch_payload`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadHandle {
    pub ri: Ri,
    pub station_id: String,
    pub variable: String,
    pub native_variable: String,
    pub dataset_id: String,
    pub urls: Vec<DatasetUrl>,
}

impl PayloadHandle {
    pub fn url_of(&self, kind: AccessKind) -> Option<&str> {
        self.urls
            .iter()
            .find(|u| u.kind == kind)
            .map(|u| u.url.as_str())
    }
}

/// Controlled quality flag vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    Valid,
    Suspect,
    Invalid,
    Missing,
}

impl QualityFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityFlag::Valid => "valid",
            QualityFlag::Suspect => "suspect",
            QualityFlag::Invalid => "invalid",
            QualityFlag::Missing => "missing",
        }
    }
}

/// One native sample: time, value (absent for gaps) and native flag.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeSample {
    pub time: DateTime<Utc>,
    pub value: Option<f64>,
    pub flag: Option<String>,
}

/// A time series in native vocabulary, as parsed by an adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeSeries {
    pub native_variable: String,
    pub native_unit: Option<String>,
    pub samples: Vec<NativeSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub time: DateTime<Utc>,
    pub value: Option<f64>,
    pub flag: QualityFlag,
}

/// A normalised time series payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub ri: Ri,
    pub station_id: String,
    pub dataset_id: String,
    pub variable: String,
    pub unit: String,
    pub observations: Vec<Observation>,
}

/// Why the planner left a source out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoMatchingVariable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoMatchingVariable => f.write_str("no matching variable"),
        }
    }
}

/// What happened to one source during a federation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    /// Returned at least one record (or station)
    Contributed { count: usize },
    /// Answered, but nothing matched
    Empty,
    /// Left out by the planner
    Skipped { reason: SkipReason },
    /// Gave up after retries, schema error or deadline
    Failed { failure: SourceFailure },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub ri: Ri,
    #[serde(flatten)]
    pub status: SourceStatus,
}

/// Per-source account of a federation call, in registry order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn record(&mut self, ri: Ri, status: SourceStatus) {
        self.entries.retain(|e| e.ri != ri);
        self.entries.push(ManifestEntry { ri, status });
        self.entries.sort_by_key(|e| e.ri);
    }

    pub fn status(&self, ri: Ri) -> Option<&SourceStatus> {
        self.entries.iter().find(|e| e.ri == ri).map(|e| &e.status)
    }

    pub fn contributed(&self) -> Vec<Ri> {
        self.filter(|s| matches!(s, SourceStatus::Contributed { .. }))
    }

    pub fn skipped(&self) -> Vec<Ri> {
        self.filter(|s| matches!(s, SourceStatus::Skipped { .. }))
    }

    pub fn failed(&self) -> Vec<&SourceFailure> {
        self.entries
            .iter()
            .filter_map(|e| match &e.status {
                SourceStatus::Failed { failure } => Some(failure),
                _ => None,
            })
            .collect()
    }

    /// Sources that answered, with or without data.
    pub fn completed(&self) -> Vec<Ri> {
        self.filter(|s| matches!(s, SourceStatus::Contributed { .. } | SourceStatus::Empty))
    }

    pub fn is_partial(&self) -> bool {
        !self.failed().is_empty()
    }

    fn filter(&self, f: impl Fn(&SourceStatus) -> bool) -> Vec<Ri> {
        self.entries
            .iter()
            .filter(|e| f(&e.status))
            .map(|e| e.ri)
            .collect()
    }
}

/// All records of one canonical variable at one reconciled station.
/// Records from several RIs are kept side by side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableEntry {
    pub name: String,
    pub unit: String,
    pub records: Vec<NormalizedRecord>,
}

impl VariableEntry {
    pub fn sources(&self) -> BTreeSet<Ri> {
        self.records.iter().map(|r| r.source()).collect()
    }
}

/// A reconciled station: one or more RI stations judged to be the same site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationEntry {
    /// Canonical identifier: the smallest member identifier
    pub id: String,
    pub name: String,
    pub location: GeoPoint,
    pub members: Vec<Station>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<VariableEntry>,
}

impl StationEntry {
    pub fn sources(&self) -> BTreeSet<Ri> {
        self.members.iter().map(|m| m.key.ri).collect()
    }

    pub fn variable(&self, name: &str) -> Option<&VariableEntry> {
        self.variables.iter().find(|v| v.name == name)
    }
}

/// A cross-RI match that was not applied because it was ambiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguousMatch {
    pub station: String,
    pub candidates: Vec<String>,
}

/// The unified answer to a federated query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederatedResult {
    pub fingerprint: String,
    pub schema_version: String,
    /// True when at least one applicable source failed or timed out
    pub partial: bool,
    pub manifest: Manifest,
    pub stations: Vec<StationEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ambiguous_matches: Vec<AmbiguousMatch>,
}

impl FederatedResult {
    pub fn records(&self) -> impl Iterator<Item = &NormalizedRecord> {
        self.stations
            .iter()
            .flat_map(|s| s.variables.iter())
            .flat_map(|v| v.records.iter())
    }

    pub fn record_count(&self) -> usize {
        self.records().count()
    }

    pub fn payload_handles(&self) -> Vec<PayloadHandle> {
        self.records().map(NormalizedRecord::payload_handle).collect()
    }

    pub fn station(&self, id: &str) -> Option<&StationEntry> {
        self.stations
            .iter()
            .find(|s| s.id == id || s.members.iter().any(|m| m.id() == id))
    }
}

/// Reconciled stations without records, the answer to a discovery call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationCatalog {
    pub partial: bool,
    pub manifest: Manifest,
    pub stations: Vec<StationEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ambiguous_matches: Vec<AmbiguousMatch>,
}
