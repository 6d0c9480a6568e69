//! The controlled vocabulary.
//!
//! A versioned table of canonical variables (name, unit, ECV groups), the
//! native names each RI uses for them together with exact unit conversions,
//! and the per-RI quality flag tables. The built-in table ships with the
//! crate; a replacement can be loaded from a JSON file.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use crate::error::{FederationError, Result};
use crate::model::{QualityFlag, Ri};

const BUILTIN_VOCABULARY: &str = include_str!("../vocabulary/default.json");

/// A canonical variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    pub unit: String,
    #[serde(default)]
    pub description: String,
    /// Essential Climate Variable groups this variable belongs to
    #[serde(default)]
    pub ecv: Vec<String>,
}

/// Where a native name appears in an RI's responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingContext {
    /// Catalog/metadata searches only
    Catalog,
    /// Bulk data columns only
    Payload,
    #[default]
    Any,
}

impl MappingContext {
    fn admits(&self, wanted: MappingContext) -> bool {
        wanted == MappingContext::Any || *self == MappingContext::Any || *self == wanted
    }
}

/// Exact affine unit conversion: `value * multiply / divide + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitConversion {
    #[serde(default = "one")]
    pub multiply: f64,
    #[serde(default = "one")]
    pub divide: f64,
    #[serde(default)]
    pub offset: f64,
}

impl Default for UnitConversion {
    fn default() -> Self {
        Self {
            multiply: 1.0,
            divide: 1.0,
            offset: 0.0,
        }
    }
}

impl UnitConversion {
    pub fn apply(&self, value: f64) -> f64 {
        value * self.multiply / self.divide + self.offset
    }

    pub fn is_identity(&self) -> bool {
        self.multiply == 1.0 && self.divide == 1.0 && self.offset == 0.0
    }
}

/// One native name of one RI mapped onto a canonical variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeMapping {
    pub ri: Ri,
    pub native_name: String,
    pub canonical: String,
    #[serde(default)]
    pub native_unit: Option<String>,
    #[serde(flatten)]
    pub conversion: UnitConversion,
    #[serde(default)]
    pub context: MappingContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagMapping {
    pub ri: Ri,
    pub native: String,
    pub flag: QualityFlag,
}

/// On-disk shape of a vocabulary file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabularyTable {
    pub version: String,
    pub variables: Vec<VariableDefinition>,
    #[serde(default)]
    pub mappings: Vec<NativeMapping>,
    #[serde(default)]
    pub quality_flags: Vec<FlagMapping>,
}

/// Indexed, validated controlled vocabulary. Immutable after load.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    table: VocabularyTable,
    by_canonical: HashMap<String, usize>,
    by_native: HashMap<(Ri, String), Vec<usize>>,
    flags: HashMap<(Ri, String), QualityFlag>,
}

impl Vocabulary {
    /// The vocabulary compiled into the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_VOCABULARY)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content).map_err(|e| FederationError::Vocabulary {
            message: format!("{}: {}", path.display(), e),
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let table: VocabularyTable =
            serde_json::from_str(json).map_err(|e| FederationError::Vocabulary {
                message: format!("invalid vocabulary JSON: {}", e),
            })?;
        Self::from_table(table)
    }

    pub fn from_table(table: VocabularyTable) -> Result<Self> {
        if table.version.trim().is_empty() {
            return Err(vocabulary_error("version must not be empty"));
        }

        let mut by_canonical = HashMap::new();
        for (i, variable) in table.variables.iter().enumerate() {
            if variable.name.trim().is_empty() {
                return Err(vocabulary_error("variable name must not be empty"));
            }
            if by_canonical
                .insert(variable.name.to_ascii_lowercase(), i)
                .is_some()
            {
                return Err(vocabulary_error(format!(
                    "duplicate canonical variable {}",
                    variable.name
                )));
            }
        }

        let mut by_native: HashMap<(Ri, String), Vec<usize>> = HashMap::new();
        for (i, mapping) in table.mappings.iter().enumerate() {
            if !by_canonical.contains_key(&mapping.canonical.to_ascii_lowercase()) {
                return Err(vocabulary_error(format!(
                    "{} mapping {} refers to unknown variable {}",
                    mapping.ri, mapping.native_name, mapping.canonical
                )));
            }
            let conversion = &mapping.conversion;
            if conversion.divide == 0.0
                || !conversion.multiply.is_finite()
                || !conversion.divide.is_finite()
                || !conversion.offset.is_finite()
            {
                return Err(vocabulary_error(format!(
                    "{} mapping {} has an invalid unit conversion",
                    mapping.ri, mapping.native_name
                )));
            }

            let key = (mapping.ri, mapping.native_name.to_ascii_lowercase());
            let entries = by_native.entry(key).or_default();
            // One native name may only be ambiguous across contexts or units
            let clashes = entries.iter().any(|&j| {
                let other = &table.mappings[j];
                let distinct_units = match (&other.native_unit, &mapping.native_unit) {
                    (Some(a), Some(b)) => !same_unit(a, b),
                    _ => false,
                };
                other.context.admits(mapping.context) && !distinct_units
            });
            if clashes {
                return Err(vocabulary_error(format!(
                    "duplicate {} mapping for {}",
                    mapping.ri, mapping.native_name
                )));
            }
            entries.push(i);
        }

        let mut flags = HashMap::new();
        for flag in &table.quality_flags {
            flags.insert((flag.ri, flag.native.trim().to_ascii_lowercase()), flag.flag);
        }

        Ok(Self {
            table,
            by_canonical,
            by_native,
            flags,
        })
    }

    pub fn version(&self) -> &str {
        &self.table.version
    }

    pub fn table(&self) -> &VocabularyTable {
        &self.table
    }

    pub fn variables(&self) -> &[VariableDefinition] {
        &self.table.variables
    }

    /// Canonical variable by name, case-insensitively.
    pub fn variable(&self, name: &str) -> Option<&VariableDefinition> {
        self.by_canonical
            .get(&name.trim().to_ascii_lowercase())
            .map(|&i| &self.table.variables[i])
    }

    /// Mapping for a native name of an RI, case-insensitively.
    ///
    /// A native name can carry several quantities told apart only by unit,
    /// e.g. an amount fraction and a mass concentration. Given the unit the
    /// response declares, the mapping with that `native_unit` wins; otherwise
    /// the first admissible mapping in table order.
    pub fn lookup(
        &self,
        ri: Ri,
        native_name: &str,
        native_unit: Option<&str>,
        context: MappingContext,
    ) -> Option<&NativeMapping> {
        let candidates: Vec<&NativeMapping> = self
            .by_native
            .get(&(ri, native_name.trim().to_ascii_lowercase()))?
            .iter()
            .map(|&i| &self.table.mappings[i])
            .filter(|m| m.context.admits(context))
            .collect();
        native_unit
            .and_then(|unit| {
                candidates.iter().copied().find(|m| {
                    m.native_unit
                        .as_deref()
                        .map_or(false, |declared| same_unit(declared, unit))
                })
            })
            .or_else(|| candidates.first().copied())
    }

    /// Every mapping of an RI, in table order.
    pub fn mappings(&self, ri: Ri) -> impl Iterator<Item = &NativeMapping> {
        self.table.mappings.iter().filter(move |m| m.ri == ri)
    }

    /// Native names an RI uses for a canonical variable in the given context.
    pub fn native_names(&self, ri: Ri, canonical: &str, context: MappingContext) -> Vec<&str> {
        self.mappings(ri)
            .filter(|m| m.canonical.eq_ignore_ascii_case(canonical) && m.context.admits(context))
            .map(|m| m.native_name.as_str())
            .collect()
    }

    /// Canonical variables an RI is known to provide.
    pub fn catalog(&self, ri: Ri) -> BTreeSet<String> {
        self.mappings(ri).map(|m| m.canonical.clone()).collect()
    }

    /// ECV group names and their member variables.
    pub fn ecv_groups(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut groups: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for variable in &self.table.variables {
            for ecv in &variable.ecv {
                groups
                    .entry(ecv.clone())
                    .or_default()
                    .insert(variable.name.clone());
            }
        }
        groups
    }

    /// Resolve requested names to canonical variable names.
    ///
    /// Canonical names win over ECV group names; both are matched
    /// case-insensitively. Names that match neither are kept verbatim so the
    /// planner can report them as unservable.
    pub fn expand(&self, requested: &BTreeSet<String>) -> BTreeSet<String> {
        let groups = self.ecv_groups();
        let mut resolved = BTreeSet::new();
        for name in requested {
            let name = name.trim();
            if let Some(variable) = self.variable(name) {
                resolved.insert(variable.name.clone());
                continue;
            }
            match groups.iter().find(|(group, _)| group.eq_ignore_ascii_case(name)) {
                Some((_, members)) => resolved.extend(members.iter().cloned()),
                None => {
                    resolved.insert(name.to_string());
                }
            }
        }
        resolved
    }

    /// Map a native quality flag. Absent flags are valid, unknown ones suspect.
    pub fn quality_flag(&self, ri: Ri, native: Option<&str>) -> QualityFlag {
        let native = match native.map(str::trim) {
            None | Some("") => return QualityFlag::Valid,
            Some(native) => native,
        };
        self.flags
            .get(&(ri, native.to_ascii_lowercase()))
            .copied()
            .unwrap_or(QualityFlag::Suspect)
    }
}

/// Compare unit strings ignoring case and whitespace.
pub fn same_unit(a: &str, b: &str) -> bool {
    let strip = |s: &str| -> String {
        s.chars()
            .filter(|c| !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect()
    };
    strip(a) == strip(b)
}

fn vocabulary_error(message: impl Into<String>) -> FederationError {
    FederationError::Vocabulary {
        message: message.into(),
    }
}

fn one() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_builtin_vocabulary_loads() {
        let vocabulary = Vocabulary::builtin().unwrap();
        assert!(!vocabulary.version().is_empty());
        assert!(vocabulary.variable("O3").is_some());
        assert_eq!(vocabulary.variable("co2").unwrap().name, "CO2");
    }

    #[test]
    fn test_catalogs_per_ri() {
        let vocabulary = Vocabulary::builtin().unwrap();
        let icos = vocabulary.catalog(Ri::Icos);
        assert!(icos.contains("CO2"));
        assert!(!icos.contains("O3"));
        assert!(vocabulary.catalog(Ri::Iagos).contains("O3"));
        assert!(!vocabulary.catalog(Ri::Actris).contains("O3"));
    }

    #[test]
    fn test_lookup_is_case_insensitive_and_context_aware() {
        let vocabulary = Vocabulary::builtin().unwrap();
        let mapping = vocabulary
            .lookup(Ri::Icos, "CO2", None, MappingContext::Payload)
            .unwrap();
        assert_eq!(mapping.canonical, "CO2");

        assert!(vocabulary
            .lookup(Ri::Actris, "elemental_carbon", None, MappingContext::Catalog)
            .is_none());
        assert_eq!(
            vocabulary
                .lookup(Ri::Actris, "elemental_carbon", None, MappingContext::Payload)
                .unwrap()
                .canonical,
            "EC"
        );
        assert!(vocabulary.lookup(Ri::Iagos, "co2", None, MappingContext::Any).is_none());
    }

    #[test]
    fn test_lookup_picks_mapping_by_native_unit() {
        let vocabulary = Vocabulary::builtin().unwrap();
        let lookup = |unit| {
            vocabulary
                .lookup(Ri::Actris, "nitrogen_dioxide", unit, MappingContext::Payload)
                .map(|m| m.canonical.as_str())
        };
        assert_eq!(lookup(Some("ug/m3")), Some("NO2_mass"));
        assert_eq!(lookup(Some("UG/M3")), Some("NO2_mass"));
        assert_eq!(lookup(Some("nmol/mol")), Some("NO2"));
        // No declared or no known unit: first mapping in table order
        assert_eq!(lookup(None), Some("NO2"));
        assert_eq!(lookup(Some("ppt")), Some("NO2"));
    }

    #[test]
    fn test_same_unit() {
        assert!(same_unit("nmol mol-1", "NMOL MOL-1"));
        assert!(same_unit("m s-1", "ms-1"));
        assert!(!same_unit("Pa", "hPa"));
    }

    #[test]
    fn test_expand_ecv_groups() {
        let vocabulary = Vocabulary::builtin().unwrap();
        let expanded = vocabulary.expand(&names(&["aerosol optical properties", "o3"]));
        assert_eq!(
            expanded,
            names(&[
                "O3",
                "aerosol_absorption",
                "aerosol_backscatter",
                "aerosol_optical_depth",
                "aerosol_scattering",
            ])
        );

        // Unknown names are kept for reporting
        assert_eq!(vocabulary.expand(&names(&["XYZ"])), names(&["XYZ"]));
    }

    #[test]
    fn test_unit_conversions_are_exact() {
        let vocabulary = Vocabulary::builtin().unwrap();
        let pressure = vocabulary
            .lookup(Ri::Iagos, "air_press_AC", Some("Pa"), MappingContext::Payload)
            .unwrap();
        assert_eq!(pressure.conversion.apply(101325.0), 1013.25);

        let temperature = vocabulary
            .lookup(Ri::Icos, "AT", None, MappingContext::Payload)
            .unwrap();
        assert_eq!(temperature.conversion.apply(0.0), 273.15);

        let ozone = vocabulary
            .lookup(Ri::Iagos, "O3_P1", None, MappingContext::Payload)
            .unwrap();
        assert!(ozone.conversion.is_identity());
        assert_eq!(ozone.conversion.apply(41.7), 41.7);
    }

    #[test]
    fn test_quality_flags() {
        let vocabulary = Vocabulary::builtin().unwrap();
        assert_eq!(vocabulary.quality_flag(Ri::Icos, Some("O")), QualityFlag::Valid);
        assert_eq!(vocabulary.quality_flag(Ri::Icos, Some("n")), QualityFlag::Invalid);
        assert_eq!(vocabulary.quality_flag(Ri::Icos, None), QualityFlag::Valid);
        assert_eq!(
            vocabulary.quality_flag(Ri::Actris, Some("999")),
            QualityFlag::Missing
        );
        assert_eq!(
            vocabulary.quality_flag(Ri::Iagos, Some("42")),
            QualityFlag::Suspect
        );
    }

    #[test]
    fn test_rejects_inconsistent_tables() {
        let unknown_target = r#"{
            "version": "t",
            "variables": [{"name": "O3", "unit": "ppb"}],
            "mappings": [{"ri": "IAGOS", "native_name": "x", "canonical": "CO"}]
        }"#;
        assert!(Vocabulary::from_json(unknown_target).is_err());

        let duplicate = r#"{
            "version": "t",
            "variables": [{"name": "O3", "unit": "ppb"}],
            "mappings": [
                {"ri": "IAGOS", "native_name": "o3", "canonical": "O3"},
                {"ri": "IAGOS", "native_name": "O3", "canonical": "O3"}
            ]
        }"#;
        assert!(Vocabulary::from_json(duplicate).is_err());

        let split_by_unit = r#"{
            "version": "t",
            "variables": [{"name": "NO2", "unit": "ppb"}, {"name": "NO2_mass", "unit": "ug m-3"}],
            "mappings": [
                {"ri": "ACTRIS", "native_name": "no2", "canonical": "NO2", "native_unit": "ppb"},
                {"ri": "ACTRIS", "native_name": "no2", "canonical": "NO2_mass", "native_unit": "ug/m3"}
            ]
        }"#;
        assert!(Vocabulary::from_json(split_by_unit).is_ok());

        let same_unit_twice = r#"{
            "version": "t",
            "variables": [{"name": "NO2", "unit": "ppb"}, {"name": "NO2_mass", "unit": "ug m-3"}],
            "mappings": [
                {"ri": "ACTRIS", "native_name": "no2", "canonical": "NO2", "native_unit": "ppb"},
                {"ri": "ACTRIS", "native_name": "no2", "canonical": "NO2_mass", "native_unit": "PPB"}
            ]
        }"#;
        assert!(Vocabulary::from_json(same_unit_twice).is_err());

        let zero_divide = r#"{
            "version": "t",
            "variables": [{"name": "O3", "unit": "ppb"}],
            "mappings": [{"ri": "IAGOS", "native_name": "o3", "canonical": "O3", "divide": 0.0}]
        }"#;
        assert!(Vocabulary::from_json(zero_divide).is_err());
    }
}
