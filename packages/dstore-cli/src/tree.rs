// Data trees and rows: the host-side shells a store populates
use crate::entry::{DataEntry, EntryPath};
use crate::error::{StoreError, StoreResult};
use crate::space::{Frequency, Space};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Options for bootstrapping a new tree in a store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeOptions {
    /// Hierarchy level -> regex with named groups deriving axis IDs from it.
    #[serde(default)]
    pub id_composition: BTreeMap<String, String>,
    /// Backend-specific settings that the built-in stores ignore.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Compiled `id_composition` patterns.
///
/// Not every axis appears in a hierarchy; some are embedded in a more
/// specific ID. With `subject: (?P<group>[A-Z]+)(?P<member>[0-9]+)` the
/// subject `CONTROL01` yields group `CONTROL` and member `01`.
#[derive(Debug, Clone, Default)]
pub struct IdComposition {
    patterns: Vec<(String, Regex, Vec<(String, usize)>)>,
}

impl IdComposition {
    pub fn compile(
        map: &BTreeMap<String, String>,
        space: &Space,
        hierarchy: &[String],
    ) -> StoreResult<Self> {
        let mut patterns = Vec::new();
        for (level, pattern) in map {
            if !hierarchy.contains(level) {
                return Err(StoreError::Configuration(format!(
                    "id_composition source '{level}' is not a level of the hierarchy {hierarchy:?}"
                )));
            }
            let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
                StoreError::Configuration(format!(
                    "malformed id_composition pattern for '{level}': {e}"
                ))
            })?;
            let mut groups = Vec::new();
            for name in regex.capture_names().flatten() {
                let axis = space.axis_index(name).ok_or_else(|| {
                    StoreError::Configuration(format!(
                        "id_composition group '{name}' is not an axis of the {} space",
                        space.name
                    ))
                })?;
                groups.push((name.to_string(), axis));
            }
            if groups.is_empty() {
                return Err(StoreError::Configuration(format!(
                    "id_composition pattern for '{level}' has no named groups"
                )));
            }
            patterns.push((level.clone(), regex, groups));
        }
        Ok(Self { patterns })
    }

    /// Axis IDs embedded in `id`, the ID of hierarchy level `level`.
    pub fn decompose(&self, level: &str, id: &str) -> StoreResult<Vec<(usize, String)>> {
        let Some((_, regex, groups)) = self.patterns.iter().find(|(l, _, _)| l == level) else {
            return Ok(Vec::new());
        };
        let captures = regex.captures(id).ok_or_else(|| {
            StoreError::Configuration(format!(
                "{level} ID '{id}' does not match id_composition pattern '{}'",
                regex.as_str()
            ))
        })?;
        Ok(groups
            .iter()
            .filter_map(|(name, axis)| captures.name(name).map(|m| (*axis, m.as_str().to_string())))
            .collect())
    }
}

#[derive(Debug, Clone)]
struct Leaf {
    hierarchy_ids: Vec<String>,
    axis_ids: Vec<String>,
}

/// Tree of a dataset, filled leaf by leaf by a store scan.
#[derive(Debug, Clone)]
pub struct DataTree {
    dataset_id: String,
    space: Space,
    hierarchy: Vec<String>,
    levels: Vec<Frequency>,
    composition: IdComposition,
    leaves: Vec<Leaf>,
    seen: HashSet<Vec<String>>,
    siblings: HashMap<Vec<String>, usize>,
}

impl DataTree {
    pub fn new(
        dataset_id: impl Into<String>,
        space: Space,
        hierarchy: Vec<String>,
        id_composition: &BTreeMap<String, String>,
    ) -> StoreResult<Self> {
        if hierarchy.is_empty() {
            return Err(StoreError::Configuration("hierarchy must not be empty".into()));
        }
        let mut levels = Vec::with_capacity(hierarchy.len());
        for level in &hierarchy {
            let freq = space.parse_frequency(level)?;
            if freq.is_root() || levels.contains(&freq) {
                return Err(StoreError::Configuration(format!(
                    "'{level}' cannot be a level of the hierarchy {hierarchy:?}"
                )));
            }
            levels.push(freq);
        }
        let composition = IdComposition::compile(id_composition, &space, &hierarchy)?;
        Ok(Self {
            dataset_id: dataset_id.into(),
            space,
            hierarchy,
            levels,
            composition,
            leaves: Vec::new(),
            seen: HashSet::new(),
            siblings: HashMap::new(),
        })
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub fn space(&self) -> &Space {
        &self.space
    }

    pub fn hierarchy(&self) -> &[String] {
        &self.hierarchy
    }

    /// Register a leaf by its hierarchy IDs.
    ///
    /// Axis IDs are derived in this order: levels that are axes, then
    /// composition patterns, then axes covered by a level inherit its ID, and
    /// finally uncovered axes take the leaf's first-seen ordinal among its
    /// siblings. The last rule makes the result depend on insertion order.
    pub fn add_leaf(&mut self, ids: Vec<String>) -> StoreResult<()> {
        if ids.len() != self.hierarchy.len() {
            return Err(StoreError::Structure(format!(
                "leaf {ids:?} of '{}' has {} IDs but the hierarchy {:?} has {} levels",
                self.dataset_id,
                ids.len(),
                self.hierarchy,
                self.hierarchy.len()
            )));
        }
        if self.seen.contains(&ids) {
            return Err(StoreError::Structure(format!(
                "leaf {ids:?} of '{}' added twice",
                self.dataset_id
            )));
        }

        let mut axis_ids: Vec<Option<String>> = vec![None; self.space.axes().len()];
        for (level, id) in self.hierarchy.iter().zip(&ids) {
            if let Some(axis) = self.space.axis_index(level) {
                axis_ids[axis] = Some(id.clone());
            }
        }
        for (level, id) in self.hierarchy.iter().zip(&ids) {
            for (axis, value) in self.composition.decompose(level, id)? {
                axis_ids[axis].get_or_insert(value);
            }
        }
        for (freq, id) in self.levels.iter().zip(&ids) {
            for axis in freq.axes() {
                axis_ids[axis].get_or_insert_with(|| id.clone());
            }
        }

        let parent = ids[..ids.len() - 1].to_vec();
        let ordinal = self.siblings.entry(parent).or_insert(0);
        *ordinal += 1;
        let ordinal = ordinal.to_string();
        let axis_ids = axis_ids
            .into_iter()
            .map(|id| id.unwrap_or_else(|| ordinal.clone()))
            .collect();

        debug!(dataset = %self.dataset_id, leaf = ?ids, "added leaf");
        self.seen.insert(ids.clone());
        self.leaves.push(Leaf {
            hierarchy_ids: ids,
            axis_ids,
        });
        Ok(())
    }

    /// Hierarchy IDs of every leaf, in insertion order.
    pub fn leaves(&self) -> impl Iterator<Item = &[String]> {
        self.leaves.iter().map(|l| l.hierarchy_ids.as_slice())
    }

    /// One row per distinct combination of the axes fixed by `freq`.
    pub fn rows(&self, freq: Frequency) -> Vec<DataRow> {
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for leaf in &self.leaves {
            let ids: Vec<String> = freq.axes().map(|i| leaf.axis_ids[i].clone()).collect();
            if seen.insert(ids.clone()) {
                rows.push(self.make_row(freq, ids, leaf));
            }
        }
        if rows.is_empty() && freq.is_root() {
            rows.push(self.root());
        }
        rows
    }

    pub fn rows_named(&self, frequency: &str) -> StoreResult<Vec<DataRow>> {
        Ok(self.rows(self.space.parse_frequency(frequency)?))
    }

    /// Row at `freq` whose fixed-axis IDs (space order) are `ids`.
    pub fn row(&self, freq: Frequency, ids: &[String]) -> Option<DataRow> {
        if freq.is_root() {
            return Some(self.root());
        }
        self.leaves
            .iter()
            .find(|leaf| freq.axes().map(|i| &leaf.axis_ids[i]).eq(ids.iter()))
            .map(|leaf| self.make_row(freq, ids.to_vec(), leaf))
    }

    /// Leaf row addressed by its hierarchy IDs.
    pub fn leaf_row(&self, hierarchy_ids: &[String]) -> Option<DataRow> {
        let leaf = self.leaves.iter().find(|l| l.hierarchy_ids == hierarchy_ids)?;
        Some(self.make_row(self.space.leaf(), leaf.axis_ids.clone(), leaf))
    }

    /// The dataset-wide row.
    pub fn root(&self) -> DataRow {
        let freq = self.space.root();
        DataRow::new(
            &self.dataset_id,
            freq,
            self.space.frequency_name(freq),
            Vec::new(),
            None,
        )
    }

    fn make_row(&self, freq: Frequency, ids: Vec<String>, leaf: &Leaf) -> DataRow {
        let hierarchy_ids = (freq == self.space.leaf()).then(|| leaf.hierarchy_ids.clone());
        DataRow::new(
            &self.dataset_id,
            freq,
            self.space.frequency_name(freq),
            ids,
            hierarchy_ids,
        )
    }
}

/// One node of a dataset: the entries stored at a frequency and ID tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRow {
    pub dataset_id: String,
    pub frequency: Frequency,
    pub frequency_name: String,
    /// IDs of the axes fixed at this row, in space order.
    pub ids: Vec<String>,
    /// Hierarchy IDs, present for leaf rows only.
    pub hierarchy_ids: Option<Vec<String>>,
    entries: Vec<DataEntry>,
}

impl DataRow {
    pub fn new(
        dataset_id: &str,
        frequency: Frequency,
        frequency_name: String,
        ids: Vec<String>,
        hierarchy_ids: Option<Vec<String>>,
    ) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            frequency,
            frequency_name,
            ids,
            hierarchy_ids,
            entries: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.hierarchy_ids.is_some()
    }

    /// Register an entry found in the store.
    pub fn add_entry(&mut self, entry: DataEntry) -> StoreResult<()> {
        if self.entries.iter().any(|e| e.path == entry.path) {
            return Err(StoreError::Structure(format!(
                "duplicate entry '{}' in row {}",
                entry.path,
                self.label()
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[DataEntry] {
        &self.entries
    }

    /// Look up an entry by its full path (`name`, `name@`, `name@analysis`).
    pub fn entry(&self, path: &str) -> StoreResult<Option<&DataEntry>> {
        let path: EntryPath = path.parse()?;
        Ok(self.entries.iter().find(|e| e.path == path))
    }

    /// Human readable `frequency:id/id` label.
    pub fn label(&self) -> String {
        format!("{}:{}", self.frequency_name, self.ids.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::Datatype;

    fn grid(dims: usize) -> Vec<Vec<String>> {
        let mut leaves = vec![vec![]];
        for axis in ["a", "b", "c", "d"] {
            leaves = leaves
                .into_iter()
                .flat_map(|prefix: Vec<String>| {
                    (0..dims).map(move |i| {
                        let mut ids = prefix.clone();
                        ids.push(format!("{axis}{i}"));
                        ids
                    })
                })
                .collect();
        }
        leaves
    }

    fn test_tree() -> DataTree {
        let hierarchy = ["a", "b", "c", "d"].map(String::from).to_vec();
        let mut tree = DataTree::new("ds", Space::test(), hierarchy, &BTreeMap::new()).unwrap();
        for leaf in grid(2) {
            tree.add_leaf(leaf).unwrap();
        }
        tree
    }

    #[test]
    fn test_row_counts_are_products_of_fixed_dims() {
        let tree = test_tree();
        for freq in tree.space().frequencies() {
            let expected = 2usize.pow(freq.axes().count() as u32);
            assert_eq!(tree.rows(freq).len(), expected, "{freq:?}");
        }
    }

    #[test]
    fn test_leaf_rows_carry_hierarchy_ids() {
        let tree = test_tree();
        let leaf_rows = tree.rows_named("abcd").unwrap();
        assert!(leaf_rows.iter().all(DataRow::is_leaf));
        assert_eq!(
            leaf_rows[0].hierarchy_ids.as_deref(),
            Some(&["a0", "b0", "c0", "d0"].map(String::from)[..])
        );
        let c_rows = tree.rows_named("c").unwrap();
        assert!(!c_rows[0].is_leaf());
        assert_eq!(c_rows[0].label(), "c:c0");
    }

    #[test]
    fn test_duplicate_and_short_leaves_are_structural_errors() {
        let mut tree = test_tree();
        let dup = ["a0", "b0", "c0", "d0"].map(String::from).to_vec();
        assert!(matches!(tree.add_leaf(dup), Err(StoreError::Structure(_))));
        let short = vec!["a9".to_string()];
        assert!(matches!(tree.add_leaf(short), Err(StoreError::Structure(_))));
    }

    #[test]
    fn test_id_composition_derives_group_and_member() {
        let mut composition = BTreeMap::new();
        composition.insert(
            "subject".to_string(),
            r"(?P<group>[A-Z]+)(?P<member>[0-9]+)".to_string(),
        );
        let hierarchy = vec!["subject".to_string(), "visit".to_string()];
        let mut tree = DataTree::new("ds", Space::clinical(), hierarchy, &composition).unwrap();
        for subject in ["CONTROL01", "CONTROL02", "TEST01", "TEST02"] {
            for visit in ["V1", "V2"] {
                tree.add_leaf(vec![subject.into(), visit.into()]).unwrap();
            }
        }

        let groups = tree.rows_named("group").unwrap();
        let ids: Vec<_> = groups.iter().map(|r| r.ids.clone()).collect();
        assert_eq!(ids, vec![vec!["CONTROL".to_string()], vec!["TEST".to_string()]]);
        assert_eq!(tree.rows_named("member").unwrap().len(), 2);
        assert_eq!(tree.rows_named("matchedpoint").unwrap().len(), 4);
        assert_eq!(tree.rows_named("session").unwrap().len(), 8);
    }

    #[test]
    fn test_unmatched_composition_is_configuration_error() {
        let mut composition = BTreeMap::new();
        composition.insert("subject".to_string(), r"(?P<group>[A-Z]+)(?P<member>[0-9]+)".to_string());
        let hierarchy = vec!["subject".to_string()];
        let mut tree = DataTree::new("ds", Space::clinical(), hierarchy, &composition).unwrap();
        let err = tree.add_leaf(vec!["control-1".into()]).unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
    }

    #[test]
    fn test_malformed_composition_rejected() {
        let hierarchy = vec!["subject".to_string()];
        for pattern in [r"(?P<group>[A-Z+", r"[A-Z]+", r"(?P<site>[A-Z]+)"] {
            let mut composition = BTreeMap::new();
            composition.insert("subject".to_string(), pattern.to_string());
            let result = DataTree::new("ds", Space::clinical(), hierarchy.clone(), &composition);
            assert!(matches!(result, Err(StoreError::Configuration(_))), "{pattern}");
        }
    }

    #[test]
    fn test_uncovered_axis_uses_first_seen_ordinal() {
        let hierarchy = vec!["subject".to_string()];
        let mut tree = DataTree::new("ds", Space::clinical(), hierarchy, &BTreeMap::new()).unwrap();
        tree.add_leaf(vec!["s2".into()]).unwrap();
        tree.add_leaf(vec!["s1".into()]).unwrap();

        let visits = tree.rows_named("visit").unwrap();
        let ids: Vec<_> = visits.iter().map(|r| r.ids[0].clone()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        // Subject IDs fill both of the axes the subject level covers
        let sessions = tree.rows_named("session").unwrap();
        assert_eq!(sessions[0].ids, vec!["s2", "s2", "1"]);
    }

    #[test]
    fn test_row_entry_lookup_keeps_namespaces_apart() {
        let tree = test_tree();
        let mut row = tree.rows_named("abcd").unwrap().remove(0);
        row.add_entry(DataEntry::new("brain_mask".parse().unwrap(), Datatype::File, "p"))
            .unwrap();
        row.add_entry(DataEntry::new("brain_mask@".parse().unwrap(), Datatype::File, "d"))
            .unwrap();

        assert_eq!(row.entry("brain_mask").unwrap().unwrap().uri, "p");
        assert_eq!(row.entry("brain_mask@").unwrap().unwrap().uri, "d");
        assert!(row.entry("brain_mask@other").unwrap().is_none());

        let again = DataEntry::new("brain_mask@".parse().unwrap(), Datatype::File, "x");
        assert!(row.add_entry(again).is_err());
    }
}
