//! Merge engine.
//!
//! Combines the normalized records of several adapters into one result:
//! exact duplicates within an RI are collapsed, stations that different RIs
//! report for the same physical site are reconciled, and records of the same
//! variable from different RIs are kept side by side with their provenance.
//!
//! Two stations of different RIs are the same site when they lie within
//! `max_distance_km` of each other *and* their names are at least
//! `min_name_similarity` alike. A station with more than one such candidate
//! in the same other RI is left unmerged and reported as ambiguous.
//!
//! Merging is deterministic and idempotent: its output does not depend on
//! the order adapters answered in.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::MatchingConfig;
use crate::model::{
    AmbiguousMatch, NormalizedRecord, Ri, Station, StationEntry, StationKey, VariableEntry,
};

/// Reconciled stations plus any matches that were withheld.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutput {
    pub stations: Vec<StationEntry>,
    pub ambiguous: Vec<AmbiguousMatch>,
}

#[derive(Debug, Clone)]
pub struct MergeEngine {
    matching: MatchingConfig,
}

impl MergeEngine {
    pub fn new(matching: MatchingConfig) -> Self {
        Self { matching }
    }

    /// Merge records into reconciled stations.
    pub fn merge_records(&self, records: Vec<NormalizedRecord>) -> MergeOutput {
        let records = dedupe(records);

        let mut stations: BTreeMap<StationKey, Station> = BTreeMap::new();
        for record in &records {
            stations
                .entry(record.station.key.clone())
                .and_modify(|s| s.variables.extend(record.station.variables.iter().cloned()))
                .or_insert_with(|| record.station.clone());
        }

        let (groups, ambiguous) = self.reconcile(stations.into_values().collect());

        let mut by_station: BTreeMap<StationKey, Vec<NormalizedRecord>> = BTreeMap::new();
        for record in records {
            by_station
                .entry(record.station.key.clone())
                .or_default()
                .push(record);
        }

        let stations = groups
            .into_iter()
            .map(|members| {
                let records: Vec<NormalizedRecord> = members
                    .iter()
                    .flat_map(|m| by_station.remove(&m.key).unwrap_or_default())
                    .collect();
                station_entry(members, records)
            })
            .collect();

        MergeOutput {
            stations,
            ambiguous,
        }
    }

    /// Reconcile bare stations, as returned by discovery.
    pub fn merge_stations(&self, stations: Vec<Station>) -> MergeOutput {
        let mut unique: BTreeMap<StationKey, Station> = BTreeMap::new();
        for station in stations {
            unique
                .entry(station.key.clone())
                .and_modify(|s| s.variables.extend(station.variables.iter().cloned()))
                .or_insert(station);
        }

        let (groups, ambiguous) = self.reconcile(unique.into_values().collect());
        MergeOutput {
            stations: groups
                .into_iter()
                .map(|members| station_entry(members, vec![]))
                .collect(),
            ambiguous,
        }
    }

    /// Group stations (sorted by key, unique) into physical sites.
    fn reconcile(&self, stations: Vec<Station>) -> (Vec<Vec<Station>>, Vec<AmbiguousMatch>) {
        let n = stations.len();

        // candidates[i][ri] = indices of stations of `ri` that match station i
        let mut candidates: Vec<BTreeMap<Ri, Vec<usize>>> = vec![BTreeMap::new(); n];
        for i in 0..n {
            for j in (i + 1)..n {
                if stations[i].key.ri == stations[j].key.ri {
                    continue;
                }
                if self.is_match(&stations[i], &stations[j]) {
                    candidates[i].entry(stations[j].key.ri).or_default().push(j);
                    candidates[j].entry(stations[i].key.ri).or_default().push(i);
                }
            }
        }

        let mut ambiguous = Vec::new();
        let mut blocked: BTreeSet<usize> = BTreeSet::new();
        for (i, by_ri) in candidates.iter().enumerate() {
            for indices in by_ri.values().filter(|v| v.len() > 1) {
                blocked.insert(i);
                ambiguous.push(AmbiguousMatch {
                    station: stations[i].id(),
                    candidates: indices.iter().map(|&j| stations[j].id()).collect(),
                });
            }
        }

        let mut sets = DisjointSet::new(n);
        for (i, by_ri) in candidates.iter().enumerate() {
            if blocked.contains(&i) {
                continue;
            }
            for indices in by_ri.values() {
                if let [j] = indices.as_slice() {
                    if !blocked.contains(j) {
                        sets.union(i, *j);
                    }
                }
            }
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..n {
            groups.entry(sets.find(i)).or_default().push(i);
        }

        let matched = |i: usize, j: usize| -> bool {
            candidates[i]
                .get(&stations[j].key.ri)
                .map_or(false, |indices| indices.contains(&j))
        };

        // Union is transitive: a chain A-B-C lands in one group even when A
        // and C do not match, or when A and C share an RI. Such groups are
        // split back into singletons.
        let mut result: Vec<Vec<usize>> = Vec::new();
        for members in groups.into_values() {
            let ris: BTreeSet<Ri> = members.iter().map(|&i| stations[i].key.ri).collect();
            let pairwise = members.iter().enumerate().all(|(k, &i)| {
                members[k + 1..].iter().all(|&j| matched(i, j))
            });
            if ris.len() == members.len() && pairwise {
                result.push(members);
                continue;
            }
            for &i in &members {
                ambiguous.push(AmbiguousMatch {
                    station: stations[i].id(),
                    candidates: members
                        .iter()
                        .filter(|&&j| j != i)
                        .map(|&j| stations[j].id())
                        .collect(),
                });
                result.push(vec![i]);
            }
        }

        ambiguous.sort_by(|a, b| {
            a.station
                .cmp(&b.station)
                .then_with(|| a.candidates.cmp(&b.candidates))
        });
        ambiguous.dedup();

        let mut stations: Vec<Option<Station>> = stations.into_iter().map(Some).collect();
        let mut groups: Vec<Vec<Station>> = result
            .into_iter()
            .map(|members| {
                members
                    .into_iter()
                    .filter_map(|i| stations[i].take())
                    .collect::<Vec<_>>()
            })
            .collect();
        for group in &mut groups {
            group.sort_by(|a, b| a.key.cmp(&b.key));
        }
        groups.sort_by(|a, b| a[0].key.cmp(&b[0].key));

        debug!(
            sites = groups.len(),
            ambiguous = ambiguous.len(),
            "Reconciled stations"
        );
        (groups, ambiguous)
    }

    fn is_match(&self, a: &Station, b: &Station) -> bool {
        a.location.distance_km(&b.location) <= self.matching.max_distance_km
            && name_similarity(&a.name, &b.name) >= self.matching.min_name_similarity
    }
}

/// Drop exact within-RI duplicates: same RI, dataset and variable.
fn dedupe(mut records: Vec<NormalizedRecord>) -> Vec<NormalizedRecord> {
    records.sort_by(|a, b| {
        a.dedupe_key()
            .cmp(&b.dedupe_key())
            .then_with(|| a.station.key.cmp(&b.station.key))
    });
    let mut seen = BTreeSet::new();
    records.retain(|r| seen.insert(r.dedupe_key()));
    records
}

fn station_entry(members: Vec<Station>, records: Vec<NormalizedRecord>) -> StationEntry {
    let mut variables: BTreeMap<String, VariableEntry> = BTreeMap::new();
    for record in records {
        variables
            .entry(record.variable.name.clone())
            .or_insert_with(|| VariableEntry {
                name: record.variable.name.clone(),
                unit: record.variable.unit.clone(),
                records: Vec::new(),
            })
            .records
            .push(record);
    }
    let variables = variables
        .into_values()
        .map(|mut v| {
            v.records.sort_by(|a, b| {
                (a.source(), &a.station.key, &a.dataset.id).cmp(&(
                    b.source(),
                    &b.station.key,
                    &b.dataset.id,
                ))
            });
            v
        })
        .collect();

    // Members are sorted by key, so the first carries the smallest identifier
    let first = &members[0];
    StationEntry {
        id: first.id(),
        name: first.name.clone(),
        location: first.location,
        members,
        variables,
    }
}

/// Dice coefficient over character bigrams of the normalized names.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    if a.chars().count() < 2 || b.chars().count() < 2 {
        return 0.0;
    }

    let bigrams = |s: &str| -> Vec<(char, char)> {
        let chars: Vec<char> = s.chars().collect();
        chars.windows(2).map(|w| (w[0], w[1])).collect()
    };
    let a_grams = bigrams(&a);
    let mut b_grams = bigrams(&b);
    let total = a_grams.len() + b_grams.len();

    let mut shared = 0;
    for gram in &a_grams {
        if let Some(pos) = b_grams.iter().position(|g| g == gram) {
            b_grams.swap_remove(pos);
            shared += 1;
        }
    }
    (2 * shared) as f64 / total as f64
}

/// Lowercase alphanumerics only.
fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        let mut root = i;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = i;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// The smaller root wins so groups are labelled deterministically.
    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}
