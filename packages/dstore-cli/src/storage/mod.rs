// Data store contract and implementations
use crate::datatype::{Datatype, FieldValue, FileSet};
use crate::entry::{DataEntry, EntryPath};
use crate::error::StoreResult;
use crate::space::Space;
use crate::tree::{DataRow, DataTree, TreeOptions};
use async_trait::async_trait;

pub mod config;
pub mod files;
pub mod local;
pub mod remote;

pub use config::{RemoteConfig, StorageConfig, StoreKind};
pub use local::LocalStore;
pub use remote::{RemoteBackend, RemoteStore};

/// Structured provenance document attached to an entry.
pub type Provenance = serde_json::Map<String, serde_json::Value>;

/// Storage backend for hierarchical datasets.
///
/// A store holds many datasets addressed by ID. Each dataset is a tree whose
/// nodes (rows) hold entries addressed by path, with derivatives kept in
/// namespaces separate from primary data. The store owns only the bytes and
/// documents backing entries; trees, rows and entries belong to the caller.
#[async_trait]
pub trait DataStore: Send + Sync {
    fn name(&self) -> &str;

    /// Add every leaf present in storage to `tree`, in lexical order of the
    /// hierarchy-ID tuples so repeated scans agree.
    async fn populate_tree(&self, tree: &mut DataTree) -> StoreResult<()>;

    /// Add every primary and derivative entry stored at `row`.
    async fn populate_row(&self, row: &mut DataRow) -> StoreResult<()>;

    /// Create a dataset holding exactly `leaves` and nothing else.
    async fn create_data_tree(
        &self,
        id: &str,
        leaves: &[Vec<String>],
        hierarchy: &[String],
        space: &Space,
        options: &TreeOptions,
    ) -> StoreResult<()>;

    /// Address of a file-set entry at `path` within `row`.
    fn fileset_uri(&self, path: &EntryPath, datatype: Datatype, row: &DataRow) -> String;

    /// Address of a field entry at `path` within `row`.
    fn field_uri(&self, path: &EntryPath, datatype: Datatype, row: &DataRow) -> String;

    /// Address (and, where the backend needs it, register) a new entry.
    async fn create_entry(
        &self,
        path: &str,
        datatype: Datatype,
        row: &DataRow,
    ) -> StoreResult<DataEntry>;

    async fn get_fileset(&self, entry: &DataEntry, datatype: Datatype) -> StoreResult<FileSet>;

    /// Store `fileset` in `entry` and return the stored copy.
    async fn put_fileset(&self, fileset: &FileSet, entry: &DataEntry) -> StoreResult<FileSet>;

    async fn get_field(&self, entry: &DataEntry, datatype: Datatype) -> StoreResult<FieldValue>;

    async fn put_field(&self, value: &FieldValue, entry: &DataEntry) -> StoreResult<()>;

    /// Provenance of `entry`, or `None` if none was ever stored.
    async fn get_provenance(&self, entry: &DataEntry) -> StoreResult<Option<Provenance>>;

    /// Replace the provenance of `entry`.
    async fn put_provenance(&self, provenance: &Provenance, entry: &DataEntry) -> StoreResult<()>;

    /// Save a definition under `name`, leaving other names untouched.
    async fn save_dataset_definition(
        &self,
        dataset_id: &str,
        definition: &serde_json::Value,
        name: &str,
    ) -> StoreResult<()>;

    async fn load_dataset_definition(
        &self,
        dataset_id: &str,
        name: &str,
    ) -> StoreResult<serde_json::Value>;
}

/// Scan a whole dataset: the tree, then every row at `frequency`.
pub async fn scan_rows(
    store: &dyn DataStore,
    tree: &mut DataTree,
    frequency: &str,
) -> StoreResult<Vec<DataRow>> {
    store.populate_tree(tree).await?;
    let mut rows = tree.rows_named(frequency)?;
    for row in &mut rows {
        store.populate_row(row).await?;
    }
    Ok(rows)
}

/// Validate IDs that become path segments or resource names.
pub(crate) fn validate_id(id: &str) -> StoreResult<()> {
    if id.is_empty() || id.contains('/') || id.starts_with('.') || id.starts_with("__") {
        return Err(crate::error::StoreError::Configuration(format!(
            "invalid ID '{id}'"
        )));
    }
    Ok(())
}

/// Check a tree bootstrap request before anything is written.
pub(crate) fn validate_tree(
    id: &str,
    leaves: &[Vec<String>],
    hierarchy: &[String],
    space: &Space,
    options: &TreeOptions,
) -> StoreResult<DataTree> {
    let mut tree = DataTree::new(
        id,
        space.clone(),
        hierarchy.to_vec(),
        &options.id_composition,
    )?;
    for leaf in leaves {
        for part in leaf {
            validate_id(part)?;
        }
        tree.add_leaf(leaf.clone())?;
    }
    Ok(tree)
}
