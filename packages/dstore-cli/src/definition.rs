// Dataset definition documents
use crate::datatype::Datatype;
use crate::error::{StoreError, StoreResult};
use crate::space::Space;
use crate::tree::DataTree;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Definition schema version written by this crate
pub const STORE_VERSION: &str = "1.0.0";

/// Snapshot of a dataset's configuration.
///
/// Stores persist definitions as plain JSON documents keyed by
/// `(dataset_id, name)`; this type is the shape the CLI reads and writes.
/// Unknown keys survive a load/save cycle through `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatasetDefinition {
    pub store_version: String,
    pub space: Space,
    pub hierarchy: Vec<String>,
    #[serde(default)]
    pub id_composition: BTreeMap<String, String>,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Source or sink column of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Column {
    pub name: String,
    /// Entry path the column reads from or writes to
    pub path: String,
    pub datatype: Datatype,
    pub row_frequency: String,
    /// Sink columns hold derivatives
    #[serde(default)]
    pub is_sink: bool,
}

impl DatasetDefinition {
    pub fn new(space: Space, hierarchy: Vec<String>) -> Self {
        Self {
            store_version: STORE_VERSION.to_string(),
            space,
            hierarchy,
            id_composition: BTreeMap::new(),
            columns: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn to_document(&self) -> StoreResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_document(
        dataset_id: &str,
        name: &str,
        document: serde_json::Value,
    ) -> StoreResult<Self> {
        serde_json::from_value(document).map_err(|e| StoreError::MalformedDefinition {
            dataset_id: dataset_id.to_string(),
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Empty tree shell for this definition, ready for a store scan.
    pub fn tree(&self, dataset_id: &str) -> StoreResult<DataTree> {
        DataTree::new(
            dataset_id,
            self.space.clone(),
            self.hierarchy.clone(),
            &self.id_composition,
        )
    }

    /// Add a column, rejecting duplicate names and unknown frequencies.
    pub fn add_column(&mut self, column: Column) -> StoreResult<()> {
        if self.columns.iter().any(|c| c.name == column.name) {
            return Err(StoreError::Configuration(format!(
                "column '{}' already defined",
                column.name
            )));
        }
        self.space.parse_frequency(&column.row_frequency)?;
        self.columns.push(column);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> DatasetDefinition {
        let mut def = DatasetDefinition::new(Space::test(), vec!["a".into(), "b".into()]);
        def.add_column(Column {
            name: "deriv1".into(),
            path: "deriv1@".into(),
            datatype: Datatype::PlainText,
            row_frequency: "ab".into(),
            is_sink: true,
        })
        .unwrap();
        def
    }

    #[test]
    fn test_definition_document_roundtrip() {
        let def = definition();
        let doc = def.to_document().unwrap();
        assert_eq!(doc["store-version"], STORE_VERSION);
        assert_eq!(doc["columns"][0]["datatype"], "plain-text");

        let back = DatasetDefinition::from_document("ds", "default", doc).unwrap();
        assert_eq!(back, def);
    }

    #[test]
    fn test_unknown_keys_are_kept() {
        let mut doc = definition().to_document().unwrap();
        doc["pipelines"] = json!({"bet": {"version": 2}});
        let def = DatasetDefinition::from_document("ds", "default", doc.clone()).unwrap();
        assert_eq!(def.to_document().unwrap(), doc);
    }

    #[test]
    fn test_malformed_document() {
        let err = DatasetDefinition::from_document("ds", "default", json!({"hierarchy": 3}))
            .unwrap_err();
        assert!(matches!(err, StoreError::MalformedDefinition { .. }));
    }

    #[test]
    fn test_add_column_validation() {
        let mut def = definition();
        let dup = def.columns[0].clone();
        assert!(def.add_column(dup).is_err());
        let bad = Column {
            name: "x".into(),
            path: "x".into(),
            datatype: Datatype::Integer,
            row_frequency: "zz".into(),
            is_sink: false,
        };
        assert!(def.add_column(bad).is_err());
        assert!(def.tree("ds").is_ok());
    }
}
