//! Schema normalizer.
//!
//! Pure mapping from native records and series onto the controlled
//! vocabulary. Records whose native variable has no mapping are dropped with
//! a warning; they are never passed through under a guessed name.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::model::{
    NativeRecord, NativeSeries, NormalizedRecord, Observation, PayloadHandle, Provenance, Ri,
    TimeSeries, Variable,
};
use crate::vocabulary::{same_unit, MappingContext, NativeMapping, Vocabulary};

#[derive(Debug, Clone)]
pub struct Normalizer {
    vocabulary: Arc<Vocabulary>,
}

impl Normalizer {
    pub fn new(vocabulary: Arc<Vocabulary>) -> Self {
        Self { vocabulary }
    }

    pub fn vocabulary(&self) -> &Arc<Vocabulary> {
        &self.vocabulary
    }

    /// Map one native record. Returns `None` when the native variable (or its
    /// declared unit) is not covered by the vocabulary.
    pub fn normalize(
        &self,
        ri: Ri,
        adapter: &str,
        native: NativeRecord,
    ) -> Option<NormalizedRecord> {
        let mapping = match self.mapping_for(
            ri,
            &native.native_variable,
            native.native_unit.as_deref(),
            MappingContext::Catalog,
        ) {
            Some(mapping) => mapping,
            None => {
                warn!(
                    ri = %ri,
                    native_variable = %native.native_variable,
                    dataset = %native.dataset.id,
                    "Dropping record with no controlled-vocabulary mapping"
                );
                return None;
            }
        };

        // The vocabulary entry exists: validated at load time
        let unit = self
            .vocabulary
            .variable(&mapping.canonical)
            .map(|v| v.unit.clone())
            .unwrap_or_default();

        let mut station = native.station;
        station.variables.insert(mapping.canonical.clone());

        Some(NormalizedRecord {
            station,
            variable: Variable {
                name: mapping.canonical.clone(),
                unit,
                native_name: native.native_variable,
                native_unit: native.native_unit.or_else(|| mapping.native_unit.clone()),
            },
            dataset: native.dataset,
            provenance: Provenance {
                ri,
                adapter: adapter.to_string(),
                request: native.request,
            },
        })
    }

    /// Map a batch, dropping unmappable records.
    pub fn normalize_all(
        &self,
        ri: Ri,
        adapter: &str,
        natives: Vec<NativeRecord>,
    ) -> Vec<NormalizedRecord> {
        let total = natives.len();
        let records: Vec<NormalizedRecord> = natives
            .into_iter()
            .filter_map(|n| self.normalize(ri, adapter, n))
            .collect();

        debug!(
            ri = %ri,
            adapter = adapter,
            total = total,
            kept = records.len(),
            "Normalized native records"
        );
        records
    }

    /// Convert a native series to canonical units and flags.
    ///
    /// Returns `None` if the series' native variable does not map to the
    /// canonical variable named by the handle.
    pub fn normalize_series(
        &self,
        handle: &PayloadHandle,
        native: NativeSeries,
    ) -> Option<TimeSeries> {
        let mapping = self.mapping_for(
            handle.ri,
            &native.native_variable,
            native.native_unit.as_deref(),
            MappingContext::Payload,
        )?;
        if !mapping.canonical.eq_ignore_ascii_case(&handle.variable) {
            warn!(
                ri = %handle.ri,
                native_variable = %native.native_variable,
                expected = %handle.variable,
                actual = %mapping.canonical,
                "Payload column maps to a different variable"
            );
            return None;
        }

        let unit = self
            .vocabulary
            .variable(&mapping.canonical)
            .map(|v| v.unit.clone())
            .unwrap_or_default();
        let conversion = mapping.conversion;

        let observations = native
            .samples
            .into_iter()
            .map(|sample| {
                let value = sample
                    .value
                    .filter(|v| v.is_finite())
                    .map(|v| conversion.apply(v));
                let flag = self.vocabulary.quality_flag(handle.ri, sample.flag.as_deref());
                Observation {
                    time: sample.time,
                    value,
                    flag,
                }
            })
            .collect();

        Some(TimeSeries {
            ri: handle.ri,
            station_id: handle.station_id.clone(),
            dataset_id: handle.dataset_id.clone(),
            variable: mapping.canonical.clone(),
            unit,
            observations,
        })
    }

    fn mapping_for(
        &self,
        ri: Ri,
        native_variable: &str,
        native_unit: Option<&str>,
        context: MappingContext,
    ) -> Option<&NativeMapping> {
        let mapping = self.vocabulary.lookup(ri, native_variable, native_unit, context)?;
        if let (Some(declared), Some(actual)) = (mapping.native_unit.as_deref(), native_unit) {
            if !same_unit(declared, actual) {
                warn!(
                    ri = %ri,
                    native_variable = native_variable,
                    declared = declared,
                    actual = actual,
                    "Native unit does not match the vocabulary, refusing to convert"
                );
                return None;
            }
        }
        Some(mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dataset, GeoPoint, NativeRequest, NativeSample, QualityFlag, Station, StationKey};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;

    fn normalizer() -> Normalizer {
        Normalizer::new(Arc::new(Vocabulary::builtin().unwrap()))
    }

    fn native(ri: Ri, variable: &str, unit: Option<&str>) -> NativeRecord {
        NativeRecord {
            station: Station {
                key: StationKey::new(ri, "FR001"),
                name: "Test site".to_string(),
                location: GeoPoint::new(45.0, 3.0, None),
                variables: BTreeSet::new(),
                uri: None,
            },
            native_variable: variable.to_string(),
            native_unit: unit.map(str::to_string),
            dataset: Dataset {
                id: "ds-1".to_string(),
                title: None,
                coverage: Default::default(),
                urls: vec![],
            },
            request: NativeRequest::get("http://example.invalid/datasets"),
        }
    }

    fn handle(ri: Ri, variable: &str, native_variable: &str) -> PayloadHandle {
        PayloadHandle {
            ri,
            station_id: format!("{}:FR001", ri),
            variable: variable.to_string(),
            native_variable: native_variable.to_string(),
            dataset_id: "ds-1".to_string(),
            urls: vec![],
        }
    }

    #[test]
    fn test_normalize_record() {
        let record = normalizer()
            .normalize(Ri::Icos, "icos", native(Ri::Icos, "co2", None))
            .unwrap();
        assert_eq!(record.variable.name, "CO2");
        assert_eq!(record.variable.unit, "umol mol-1");
        assert_eq!(record.variable.native_name, "co2");
        assert_eq!(record.variable.native_unit.as_deref(), Some("umol mol-1"));
        assert!(record.station.variables.contains("CO2"));
        assert_eq!(record.provenance.adapter, "icos");
    }

    #[test]
    fn test_unmappable_records_are_dropped() {
        let n = normalizer();
        assert!(n.normalize(Ri::Icos, "icos", native(Ri::Icos, "radon", None)).is_none());
        // Mapping exists but the declared unit disagrees
        assert!(n
            .normalize(Ri::Iagos, "iagos", native(Ri::Iagos, "O3_P1", Some("ug m-3")))
            .is_none());

        let kept = n.normalize_all(
            Ri::Icos,
            "icos",
            vec![native(Ri::Icos, "ch4", None), native(Ri::Icos, "radon", None)],
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].variable.name, "CH4");
    }

    #[test]
    fn test_normalize_series_converts_units_and_flags() {
        let t0 = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let series = NativeSeries {
            native_variable: "air_press_AC".to_string(),
            native_unit: Some("Pa".to_string()),
            samples: vec![
                NativeSample {
                    time: t0,
                    value: Some(101325.0),
                    flag: Some("0".to_string()),
                },
                NativeSample {
                    time: t0 + chrono::Duration::hours(1),
                    value: None,
                    flag: Some("7".to_string()),
                },
                NativeSample {
                    time: t0 + chrono::Duration::hours(2),
                    value: Some(f64::NAN),
                    flag: Some("99".to_string()),
                },
            ],
        };

        let ts = normalizer()
            .normalize_series(&handle(Ri::Iagos, "AP", "air_press_AC"), series)
            .unwrap();
        assert_eq!(ts.unit, "hPa");
        assert_eq!(ts.observations[0].value, Some(1013.25));
        assert_eq!(ts.observations[0].flag, QualityFlag::Valid);
        assert_eq!(ts.observations[1].flag, QualityFlag::Missing);
        assert_eq!(ts.observations[2].value, None);
        assert_eq!(ts.observations[2].flag, QualityFlag::Suspect);
    }

    #[test]
    fn test_normalize_series_rejects_other_variable() {
        let series = NativeSeries {
            native_variable: "co".to_string(),
            native_unit: None,
            samples: vec![],
        };
        assert!(normalizer()
            .normalize_series(&handle(Ri::Icos, "CO2", "co2"), series)
            .is_none());
    }
}
