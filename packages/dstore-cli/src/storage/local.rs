// Local filesystem storage backend
use super::{files, validate_id, validate_tree, DataStore, Provenance, StorageConfig};
use crate::datatype::{Datatype, FieldValue, FileSet};
use crate::entry::{decode_segment, encode_segment, DataEntry, EntryPath, Namespace};
use crate::error::{IoContext, StoreError, StoreResult};
use crate::space::Space;
use crate::tree::{DataRow, DataTree, TreeOptions};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

const FILES_DIR: &str = "files";
const FIELDS_DIR: &str = "fields";
const PROVENANCE_DIR: &str = "provenance";
const DERIVATIVES_DIR: &str = "derivatives";
const DEFINITIONS_DIR: &str = ".definitions";

/// Local filesystem storage backend
///
/// Dataset IDs are directories relative to the store root (absolute IDs are
/// used as-is). Within a dataset:
///
/// ```text
/// <h0>/.../<hN>/                          leaf rows, one level per hierarchy ID
/// __<frequency>__/<id>/.../               rows of other frequencies
/// <row>/primary/{files,fields}
/// <row>/primary/provenance/{files,fields}/<entry>.json
/// <row>/derivatives/@<analysis>/...       same layout per analysis
/// .definitions/<name>.json
/// ```
///
/// Names starting with `.` or `__` are never rows, so scans skip them.
pub struct LocalStore {
    name: String,
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct FieldRecord {
    datatype: Datatype,
    value: FieldValue,
}

impl LocalStore {
    /// Create a new LocalStore from configuration
    pub fn new(config: &StorageConfig) -> Self {
        Self::with_root(&config.root)
    }

    /// Create a new LocalStore instance from a root path
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            name: "local".to_string(),
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Get the root directory for storage
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Initialize storage directories
    pub async fn initialize(&self) -> StoreResult<()> {
        fs::create_dir_all(&self.root).await.at(&self.root)
    }

    fn dataset_dir(&self, dataset_id: &str) -> PathBuf {
        self.root.join(dataset_id)
    }

    /// Row location relative to the store root, with `/` separators.
    fn row_segment(row: &DataRow) -> String {
        let mut parts = vec![row.dataset_id.clone()];
        match &row.hierarchy_ids {
            Some(ids) => parts.extend(ids.iter().cloned()),
            None => {
                parts.push(format!("__{}__", row.frequency_name));
                parts.extend(row.ids.iter().cloned());
            }
        }
        parts.join("/")
    }

    fn entry_uri(path: &EntryPath, is_fileset: bool, row: &DataRow) -> String {
        let segment = encode_segment(path.base());
        let (kind, file) = if is_fileset {
            (FILES_DIR, segment)
        } else {
            (FIELDS_DIR, format!("{segment}.json"))
        };
        format!(
            "{}/{}/{kind}/{file}",
            Self::row_segment(row),
            path.namespace().storage_dir()
        )
    }

    fn entry_location(&self, entry: &DataEntry) -> PathBuf {
        self.root.join(&entry.uri)
    }

    /// Provenance file, keyed by entry kind so a file-set and a field
    /// sharing a path keep separate records.
    fn provenance_location(&self, entry: &DataEntry) -> StoreResult<PathBuf> {
        let location = self.entry_location(entry);
        let invalid = || StoreError::InvalidPath(entry.uri.clone());
        let kind_dir = location.parent().ok_or_else(invalid)?;
        let namespace_dir = kind_dir.parent().ok_or_else(invalid)?;
        Ok(namespace_dir
            .join(PROVENANCE_DIR)
            .join(files::file_name(kind_dir)?)
            .join(format!("{}.json", encode_segment(entry.path.base()))))
    }

    fn definition_location(&self, dataset_id: &str, name: &str) -> StoreResult<PathBuf> {
        validate_id(name)?;
        Ok(self
            .dataset_dir(dataset_id)
            .join(DEFINITIONS_DIR)
            .join(format!("{name}.json")))
    }

    /// Register the file-sets and fields of one namespace directory.
    async fn scan_namespace(
        &self,
        row: &mut DataRow,
        namespace: &Namespace,
        dir: &Path,
    ) -> StoreResult<()> {
        let files_dir = dir.join(FILES_DIR);
        if files::exists(&files_dir).await? {
            for (name, is_dir) in visible(files::read_dir_sorted(&files_dir).await?) {
                if !is_dir {
                    return Err(StoreError::Structure(format!(
                        "file-set entry {} is not a directory",
                        files_dir.join(&name).display()
                    )));
                }
                let path = namespace.entry_path(&decode_segment(&name))?;
                let uri = self.fileset_uri(&path, Datatype::FileSet, row);
                row.add_entry(DataEntry::new(path, Datatype::FileSet, uri))?;
            }
        }

        let fields_dir = dir.join(FIELDS_DIR);
        if files::exists(&fields_dir).await? {
            for (name, is_dir) in visible(files::read_dir_sorted(&fields_dir).await?) {
                let stem = name.strip_suffix(".json").filter(|_| !is_dir).ok_or_else(|| {
                    StoreError::Structure(format!(
                        "field entry {} is not a JSON file",
                        fields_dir.join(&name).display()
                    ))
                })?;
                let record = read_field(&fields_dir.join(&name)).await?;
                let path = namespace.entry_path(&decode_segment(stem))?;
                let uri = self.field_uri(&path, record.datatype, row);
                row.add_entry(DataEntry::new(path, record.datatype, uri))?;
            }
        }
        Ok(())
    }
}

/// Drop names reserved for store bookkeeping.
fn visible(children: Vec<(String, bool)>) -> impl Iterator<Item = (String, bool)> {
    children
        .into_iter()
        .filter(|(name, _)| !name.starts_with('.') && !name.starts_with("__"))
}

async fn read_field(location: &Path) -> StoreResult<FieldRecord> {
    let data = fs::read(location).await.at(location)?;
    serde_json::from_slice(&data).map_err(|e| {
        StoreError::Structure(format!("unreadable field {}: {e}", location.display()))
    })
}

#[async_trait]
impl DataStore for LocalStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn populate_tree(&self, tree: &mut DataTree) -> StoreResult<()> {
        let dataset_dir = self.dataset_dir(tree.dataset_id());
        if !files::exists(&dataset_dir).await? {
            return Err(StoreError::NotFound(format!("dataset {}", dataset_dir.display())));
        }

        // Breadth-first by level; each directory listing is sorted, so leaves
        // come out in lexical order of their ID tuples.
        let mut frontier: Vec<Vec<String>> = vec![Vec::new()];
        for (depth, level) in tree.hierarchy().iter().enumerate() {
            let mut next = Vec::new();
            for prefix in frontier {
                let dir = prefix.iter().fold(dataset_dir.clone(), |d, id| d.join(id));
                let children: Vec<_> = visible(files::read_dir_sorted(&dir).await?).collect();
                if children.is_empty() && depth > 0 {
                    return Err(StoreError::Structure(format!(
                        "{} has no '{level}' level beneath it",
                        dir.display()
                    )));
                }
                for (name, is_dir) in children {
                    if !is_dir {
                        return Err(StoreError::Structure(format!(
                            "unexpected file {} where a '{level}' directory belongs",
                            dir.join(&name).display()
                        )));
                    }
                    let mut ids = prefix.clone();
                    ids.push(name);
                    next.push(ids);
                }
            }
            frontier = next;
        }

        tracing::debug!("Found {} leaves in {}", frontier.len(), dataset_dir.display());
        for ids in frontier {
            tree.add_leaf(ids)?;
        }
        Ok(())
    }

    async fn populate_row(&self, row: &mut DataRow) -> StoreResult<()> {
        let row_dir = self.root.join(Self::row_segment(row));
        if !files::exists(&row_dir).await? {
            return Ok(());
        }

        self.scan_namespace(row, &Namespace::Primary, &row_dir.join("primary"))
            .await?;

        let derivatives_dir = row_dir.join(DERIVATIVES_DIR);
        if files::exists(&derivatives_dir).await? {
            for (name, _) in visible(files::read_dir_sorted(&derivatives_dir).await?) {
                let namespace = Namespace::from_derivative_dir(&name).ok_or_else(|| {
                    StoreError::Structure(format!(
                        "{} is not an analysis namespace",
                        derivatives_dir.join(&name).display()
                    ))
                })?;
                self.scan_namespace(row, &namespace, &derivatives_dir.join(&name))
                    .await?;
            }
        }
        Ok(())
    }

    async fn create_data_tree(
        &self,
        id: &str,
        leaves: &[Vec<String>],
        hierarchy: &[String],
        space: &Space,
        options: &TreeOptions,
    ) -> StoreResult<()> {
        validate_tree(id, leaves, hierarchy, space, options)?;

        let dataset_dir = self.dataset_dir(id);
        if files::exists(&dataset_dir).await?
            && visible(files::read_dir_sorted(&dataset_dir).await?).next().is_some()
        {
            return Err(StoreError::Configuration(format!(
                "dataset {} already contains data",
                dataset_dir.display()
            )));
        }

        fs::create_dir_all(&dataset_dir).await.at(&dataset_dir)?;
        for leaf in leaves {
            let leaf_dir = leaf.iter().fold(dataset_dir.clone(), |d, id| d.join(id));
            fs::create_dir_all(&leaf_dir).await.at(&leaf_dir)?;
        }

        tracing::info!("Created dataset {} with {} leaves", dataset_dir.display(), leaves.len());
        Ok(())
    }

    fn fileset_uri(&self, path: &EntryPath, _datatype: Datatype, row: &DataRow) -> String {
        Self::entry_uri(path, true, row)
    }

    fn field_uri(&self, path: &EntryPath, _datatype: Datatype, row: &DataRow) -> String {
        Self::entry_uri(path, false, row)
    }

    async fn create_entry(
        &self,
        path: &str,
        datatype: Datatype,
        row: &DataRow,
    ) -> StoreResult<DataEntry> {
        let path: EntryPath = path.parse()?;
        let uri = if datatype.is_fileset() {
            self.fileset_uri(&path, datatype, row)
        } else {
            self.field_uri(&path, datatype, row)
        };
        Ok(DataEntry::new(path, datatype, uri))
    }

    async fn get_fileset(&self, entry: &DataEntry, datatype: Datatype) -> StoreResult<FileSet> {
        let location = self.entry_location(entry);
        if !files::exists(&location).await? {
            return Err(StoreError::NotFound(format!("file-set {}", entry.uri)));
        }
        datatype.cast_fileset(FileSet::from_dir(&location).await?).await
    }

    async fn put_fileset(&self, fileset: &FileSet, entry: &DataEntry) -> StoreResult<FileSet> {
        let fileset = entry.datatype.cast_fileset(fileset.clone()).await?;
        let location = self.entry_location(entry);
        let parent = location
            .parent()
            .ok_or_else(|| StoreError::InvalidPath(entry.uri.clone()))?;
        fs::create_dir_all(parent).await.at(parent)?;

        // Stage next to the target so the final rename stays on one filesystem
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(parent)
            .at(parent)?;
        let mut copied = 0;
        for (fspath, name) in fileset.fspaths().iter().zip(fileset.names()?) {
            copied += files::copy_path(fspath, &staging.path().join(name)).await?;
        }
        files::replace_dir(staging.path(), &location).await?;

        tracing::info!("Stored file-set {} ({} bytes)", entry.uri, copied);
        FileSet::from_dir(&location).await
    }

    async fn get_field(&self, entry: &DataEntry, datatype: Datatype) -> StoreResult<FieldValue> {
        let location = self.entry_location(entry);
        if !files::exists(&location).await? {
            return Err(StoreError::NotFound(format!("field {}", entry.uri)));
        }
        datatype.cast_field(read_field(&location).await?.value)
    }

    async fn put_field(&self, value: &FieldValue, entry: &DataEntry) -> StoreResult<()> {
        let record = FieldRecord {
            datatype: entry.datatype,
            value: entry.datatype.cast_field(value.clone())?,
        };
        let location = self.entry_location(entry);
        files::write_atomic(&location, &serde_json::to_vec(&record)?).await?;
        tracing::debug!("Stored field {} = {}", entry.uri, record.value);
        Ok(())
    }

    async fn get_provenance(&self, entry: &DataEntry) -> StoreResult<Option<Provenance>> {
        let location = self.provenance_location(entry)?;
        if !files::exists(&location).await? {
            return Ok(None);
        }
        let data = fs::read(&location).await.at(&location)?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    async fn put_provenance(&self, provenance: &Provenance, entry: &DataEntry) -> StoreResult<()> {
        let location = self.provenance_location(entry)?;
        files::write_atomic(&location, &serde_json::to_vec_pretty(provenance)?).await
    }

    async fn save_dataset_definition(
        &self,
        dataset_id: &str,
        definition: &serde_json::Value,
        name: &str,
    ) -> StoreResult<()> {
        let location = self.definition_location(dataset_id, name)?;
        files::write_atomic(&location, &serde_json::to_vec_pretty(definition)?).await?;
        tracing::info!("Saved definition '{}' of {}", name, dataset_id);
        Ok(())
    }

    async fn load_dataset_definition(
        &self,
        dataset_id: &str,
        name: &str,
    ) -> StoreResult<serde_json::Value> {
        let location = self.definition_location(dataset_id, name)?;
        if !files::exists(&location).await? {
            return Err(StoreError::DefinitionNotFound {
                dataset_id: dataset_id.to_string(),
                name: name.to_string(),
            });
        }
        let data = fs::read(&location).await.at(&location)?;
        serde_json::from_slice(&data).map_err(|e| StoreError::MalformedDefinition {
            dataset_id: dataset_id.to_string(),
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}
