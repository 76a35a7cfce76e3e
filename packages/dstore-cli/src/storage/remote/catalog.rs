// Catalog server backend: a SQLite catalog next to an object directory
use super::RemoteBackend;
use crate::datatype::{Datatype, FieldValue};
use crate::db::Catalog;
use crate::entry::{encode_segment, DataEntry, EntryPath};
use crate::error::{IoContext, StoreError, StoreResult};
use crate::hash::{self, ChecksumMap};
use crate::space::Space;
use crate::storage::{files, validate_id, validate_tree, Provenance};
use crate::tree::{DataRow, DataTree, TreeOptions};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

const CATALOG_FILE: &str = "catalog.db";
const OBJECTS_DIR: &str = "objects";
const STAGING_DIR: &str = ".staging";

/// Backend for a catalog server directory:
///
/// ```text
/// <server>/catalog.db         accounts, datasets, resources, checksums, definitions
/// <server>/objects/<uri>/     files of each file-set entry
/// ```
pub struct CatalogBackend {
    server: PathBuf,
    user: String,
    password: String,
}

/// Open, authenticated catalog connection
#[derive(Clone)]
pub struct CatalogSession {
    catalog: Arc<Catalog>,
}

impl CatalogSession {
    pub fn same_catalog(&self, other: &CatalogSession) -> bool {
        Arc::ptr_eq(&self.catalog, &other.catalog)
    }
}

impl CatalogBackend {
    pub fn new(server: impl AsRef<Path>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            server: server.as_ref().to_path_buf(),
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn server(&self) -> &Path {
        &self.server
    }

    /// Create (or upgrade) a server directory and register an account on it
    pub async fn initialize(server: &Path, user: &str, password: &str) -> StoreResult<()> {
        let objects = server.join(OBJECTS_DIR);
        fs::create_dir_all(&objects).await.at(&objects)?;

        let catalog = Catalog::open(&server.join(CATALOG_FILE), true).await?;
        catalog.create_schema().await?;
        catalog.add_account(user, password).await?;
        catalog.close().await;

        info!("Initialized catalog server at {}", server.display());
        Ok(())
    }

    fn object_dir(&self, uri: &str) -> PathBuf {
        self.server.join(OBJECTS_DIR).join(uri)
    }

    /// Row location within its dataset
    fn row_key(row: &DataRow) -> String {
        match &row.hierarchy_ids {
            Some(ids) => ids.join("/"),
            None => {
                let mut parts = vec![format!("__{}__", row.frequency_name)];
                parts.extend(row.ids.iter().cloned());
                parts.join("/")
            }
        }
    }

    async fn register(
        &self,
        session: &CatalogSession,
        path: &EntryPath,
        datatype: Datatype,
        row: &DataRow,
    ) -> StoreResult<DataEntry> {
        let uri = self.entry_uri(path, row);
        session
            .catalog
            .register_resource(
                &uri,
                &row.dataset_id,
                &Self::row_key(row),
                &path.to_string(),
                datatype.tag(),
            )
            .await?;
        debug!("Registered {} as {}", uri, datatype);
        Ok(DataEntry::new(path.clone(), datatype, uri))
    }
}

#[async_trait]
impl RemoteBackend for CatalogBackend {
    type Session = CatalogSession;

    async fn connect(&self) -> StoreResult<CatalogSession> {
        let catalog = Catalog::open(&self.server.join(CATALOG_FILE), false).await?;
        if let Err(e) = catalog.authenticate(&self.user, &self.password).await {
            catalog.close().await;
            return Err(e);
        }
        Ok(CatalogSession {
            catalog: Arc::new(catalog),
        })
    }

    async fn disconnect(&self, session: CatalogSession) -> StoreResult<()> {
        session.catalog.close().await;
        Ok(())
    }

    async fn populate_tree(&self, session: &CatalogSession, tree: &mut DataTree) -> StoreResult<()> {
        for ids in session.catalog.dataset_leaves(tree.dataset_id()).await? {
            tree.add_leaf(ids)?;
        }
        Ok(())
    }

    async fn populate_row(&self, session: &CatalogSession, row: &mut DataRow) -> StoreResult<()> {
        let resources = session
            .catalog
            .row_resources(&row.dataset_id, &Self::row_key(row))
            .await?;
        for resource in resources {
            let unreadable =
                |e: StoreError| StoreError::Structure(format!("resource {}: {e}", resource.uri));
            let path: EntryPath = resource.path.parse().map_err(unreadable)?;
            let datatype: Datatype = resource.datatype.parse().map_err(unreadable)?;
            row.add_entry(DataEntry::new(path, datatype, resource.uri.clone()))?;
        }
        Ok(())
    }

    async fn create_data_tree(
        &self,
        session: &CatalogSession,
        id: &str,
        leaves: &[Vec<String>],
        hierarchy: &[String],
        space: &Space,
        options: &TreeOptions,
    ) -> StoreResult<()> {
        validate_id(id)?;
        validate_tree(id, leaves, hierarchy, space, options)?;
        session
            .catalog
            .create_dataset(id, hierarchy, space, leaves)
            .await?;
        info!("Created dataset '{}' with {} leaves", id, leaves.len());
        Ok(())
    }

    fn entry_uri(&self, path: &EntryPath, row: &DataRow) -> String {
        format!(
            "{}/{}/{}/{}",
            row.dataset_id,
            Self::row_key(row),
            path.namespace().storage_dir(),
            encode_segment(path.base())
        )
    }

    async fn create_fileset_entry(
        &self,
        session: &CatalogSession,
        path: &EntryPath,
        datatype: Datatype,
        row: &DataRow,
    ) -> StoreResult<DataEntry> {
        self.register(session, path, datatype, row).await
    }

    async fn create_field_entry(
        &self,
        session: &CatalogSession,
        path: &EntryPath,
        datatype: Datatype,
        row: &DataRow,
    ) -> StoreResult<DataEntry> {
        self.register(session, path, datatype, row).await
    }

    async fn download_files(
        &self,
        _session: &CatalogSession,
        entry: &DataEntry,
        download_dir: &Path,
    ) -> StoreResult<()> {
        let source = self.object_dir(&entry.uri);
        if !files::exists(&source).await? {
            return Err(StoreError::NotFound(format!("files of {}", entry.uri)));
        }
        for (name, _) in files::read_dir_sorted(&source).await? {
            files::copy_path(&source.join(&name), &download_dir.join(&name))
                .await
                .map_err(|e| StoreError::transfer(&entry.uri, e))?;
        }
        Ok(())
    }

    async fn upload_files(
        &self,
        session: &CatalogSession,
        cache_path: &Path,
        entry: &DataEntry,
    ) -> StoreResult<()> {
        // Only registered entries accept content
        session.catalog.resource(&entry.uri).await?;

        let staging_root = self.server.join(OBJECTS_DIR).join(STAGING_DIR);
        fs::create_dir_all(&staging_root).await.at(&staging_root)?;
        let staging = tempfile::tempdir_in(&staging_root).at(&staging_root)?;
        for (name, _) in files::read_dir_sorted(cache_path).await? {
            files::copy_path(&cache_path.join(&name), &staging.path().join(&name)).await?;
        }
        let checksums = hash::checksum_dir(staging.path()).await?;

        // The previous objects stay aside until the checksums are committed
        let swap = files::swap_dir(staging.path(), &self.object_dir(&entry.uri)).await?;
        if let Err(e) = session.catalog.replace_checksums(&entry.uri, &checksums).await {
            if let Err(undo) = swap.rollback().await {
                warn!("Failed to restore previous files of {}: {}", entry.uri, undo);
            }
            return Err(e);
        }
        swap.commit().await?;
        debug!("Stored {} files for {}", checksums.len(), entry.uri);
        Ok(())
    }

    async fn download_value(&self, session: &CatalogSession, entry: &DataEntry) -> StoreResult<FieldValue> {
        let resource = session.catalog.resource(&entry.uri).await?;
        let value = resource
            .value
            .ok_or_else(|| StoreError::NotFound(format!("value of {}", entry.uri)))?;
        serde_json::from_str(&value).map_err(|e| {
            StoreError::Structure(format!("unreadable value of {}: {e}", entry.uri))
        })
    }

    async fn upload_value(
        &self,
        session: &CatalogSession,
        value: &FieldValue,
        entry: &DataEntry,
    ) -> StoreResult<()> {
        session
            .catalog
            .set_value(&entry.uri, &serde_json::to_string(value)?)
            .await
    }

    async fn get_checksums(&self, session: &CatalogSession, uri: &str) -> StoreResult<ChecksumMap> {
        let resource = session.catalog.resource(uri).await?;
        if !resource.has_content {
            return Ok(ChecksumMap::new());
        }
        session.catalog.checksums(uri).await
    }

    async fn get_provenance(
        &self,
        session: &CatalogSession,
        entry: &DataEntry,
    ) -> StoreResult<Option<Provenance>> {
        match session.catalog.provenance(&entry.uri).await? {
            Some(document) => Ok(Some(serde_json::from_str(&document)?)),
            None => Ok(None),
        }
    }

    async fn put_provenance(
        &self,
        session: &CatalogSession,
        provenance: &Provenance,
        entry: &DataEntry,
    ) -> StoreResult<()> {
        session
            .catalog
            .set_provenance(&entry.uri, &serde_json::to_string(provenance)?)
            .await
    }

    async fn save_dataset_definition(
        &self,
        session: &CatalogSession,
        dataset_id: &str,
        definition: &serde_json::Value,
        name: &str,
    ) -> StoreResult<()> {
        validate_id(name)?;
        session
            .catalog
            .save_definition(dataset_id, name, &serde_json::to_string(definition)?)
            .await
    }

    async fn load_dataset_definition(
        &self,
        session: &CatalogSession,
        dataset_id: &str,
        name: &str,
    ) -> StoreResult<serde_json::Value> {
        let document = session
            .catalog
            .load_definition(dataset_id, name)
            .await?
            .ok_or_else(|| StoreError::DefinitionNotFound {
                dataset_id: dataset_id.to_string(),
                name: name.to_string(),
            })?;
        serde_json::from_str(&document).map_err(|e| StoreError::MalformedDefinition {
            dataset_id: dataset_id.to_string(),
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    /// Fresh server with the account `tester` / `secret`
    pub(crate) async fn create_test_server() -> (CatalogBackend, TempDir) {
        let temp = TempDir::new().unwrap();
        let server = temp.path().join("server");
        CatalogBackend::initialize(&server, "tester", "secret").await.unwrap();
        (CatalogBackend::new(&server, "tester", "secret"), temp)
    }

    async fn leaf_row(backend: &CatalogBackend, session: &CatalogSession) -> DataRow {
        let hierarchy = vec!["a".to_string(), "b".to_string()];
        let leaves = vec![vec!["a0".to_string(), "b0".to_string()]];
        backend
            .create_data_tree(session, "ds", &leaves, &hierarchy, &Space::test(), &TreeOptions::default())
            .await
            .unwrap();
        let mut tree = DataTree::new("ds", Space::test(), hierarchy, &BTreeMap::new()).unwrap();
        backend.populate_tree(session, &mut tree).await.unwrap();
        tree.leaf_row(&leaves[0]).unwrap()
    }

    #[tokio::test]
    async fn test_connect_checks_credentials() {
        let (backend, temp) = create_test_server().await;
        let session = backend.connect().await.unwrap();
        backend.disconnect(session).await.unwrap();

        let intruder = CatalogBackend::new(backend.server(), "tester", "guess");
        assert!(matches!(intruder.connect().await, Err(StoreError::Authentication(_))));

        let nowhere = CatalogBackend::new(temp.path().join("absent"), "tester", "secret");
        assert!(matches!(nowhere.connect().await, Err(StoreError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_entries_listed_after_registration() {
        let (backend, _temp) = create_test_server().await;
        let session = backend.connect().await.unwrap();
        let mut row = leaf_row(&backend, &session).await;

        let path: EntryPath = "anat/T1w@prep".parse().unwrap();
        let entry = backend
            .create_fileset_entry(&session, &path, Datatype::Directory, &row)
            .await
            .unwrap();
        assert_eq!(entry.uri, "ds/a0/b0/derivatives/@prep/anat%2FT1w");
        assert_eq!(entry.uri, backend.entry_uri(&path, &row));

        backend.populate_row(&session, &mut row).await.unwrap();
        let found = row.entry("anat/T1w@prep").unwrap().unwrap();
        assert_eq!(found.datatype, Datatype::Directory);
        assert!(row.entry("anat/T1w").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upload_and_download_files() {
        let (backend, temp) = create_test_server().await;
        let session = backend.connect().await.unwrap();
        let row = leaf_row(&backend, &session).await;
        let entry = backend
            .create_fileset_entry(&session, &"dwi".parse().unwrap(), Datatype::FileSet, &row)
            .await
            .unwrap();
        assert!(backend.get_checksums(&session, &entry.uri).await.unwrap().is_empty());

        let upload = temp.path().join("upload");
        std::fs::create_dir_all(upload.join("bvecs")).unwrap();
        std::fs::write(upload.join("dwi.nii"), b"image").unwrap();
        std::fs::write(upload.join("bvecs/x.txt"), b"1 0 0").unwrap();
        backend.upload_files(&session, &upload, &entry).await.unwrap();

        let checksums = backend.get_checksums(&session, &entry.uri).await.unwrap();
        let keys: Vec<_> = checksums.keys().cloned().collect();
        assert_eq!(keys, vec!["bvecs/x.txt", "dwi.nii"]);

        let download = temp.path().join("download");
        std::fs::create_dir_all(&download).unwrap();
        backend.download_files(&session, &entry, &download).await.unwrap();
        assert_eq!(hash::checksum_dir(&download).await.unwrap(), checksums);
    }

    #[tokio::test]
    async fn test_failed_checksum_commit_keeps_previous_files() {
        let (backend, temp) = create_test_server().await;
        let session = backend.connect().await.unwrap();
        let row = leaf_row(&backend, &session).await;
        let entry = backend
            .create_fileset_entry(&session, &"report".parse().unwrap(), Datatype::File, &row)
            .await
            .unwrap();

        let upload = temp.path().join("upload");
        std::fs::create_dir_all(&upload).unwrap();
        std::fs::write(upload.join("report.txt"), b"version-one").unwrap();
        backend.upload_files(&session, &upload, &entry).await.unwrap();
        let before = backend.get_checksums(&session, &entry.uri).await.unwrap();

        let pool = sqlx::SqlitePool::connect_with(
            sqlx::sqlite::SqliteConnectOptions::new().filename(backend.server().join(CATALOG_FILE)),
        )
        .await
        .unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_checksums BEFORE INSERT ON checksums
             BEGIN SELECT RAISE(ABORT, 'checksums rejected'); END",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool.close().await;

        std::fs::write(upload.join("report.txt"), b"version-two").unwrap();
        let err = backend.upload_files(&session, &upload, &entry).await.unwrap_err();
        assert!(matches!(err, StoreError::Database(_)), "{err}");

        let stored = backend.object_dir(&entry.uri).join("report.txt");
        assert_eq!(std::fs::read(stored).unwrap(), b"version-one");
        assert_eq!(backend.get_checksums(&session, &entry.uri).await.unwrap(), before);
        let leftovers: Vec<_> = files::read_dir_sorted(backend.object_dir(&entry.uri).parent().unwrap())
            .await
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(leftovers, vec!["report"]);
    }

    #[tokio::test]
    async fn test_download_failure_is_transfer_error() {
        let (backend, temp) = create_test_server().await;
        let session = backend.connect().await.unwrap();
        let row = leaf_row(&backend, &session).await;
        let entry = backend
            .create_fileset_entry(&session, &"report".parse().unwrap(), Datatype::File, &row)
            .await
            .unwrap();
        let upload = temp.path().join("upload");
        std::fs::create_dir_all(&upload).unwrap();
        std::fs::write(upload.join("report.txt"), b"content").unwrap();
        backend.upload_files(&session, &upload, &entry).await.unwrap();

        // A regular file where the download directory belongs
        let blocked = temp.path().join("blocked");
        std::fs::write(&blocked, b"").unwrap();
        let err = backend.download_files(&session, &entry, &blocked).await.unwrap_err();
        assert!(matches!(err, StoreError::Transfer { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_missing_value_and_definition() {
        let (backend, _temp) = create_test_server().await;
        let session = backend.connect().await.unwrap();
        let row = leaf_row(&backend, &session).await;
        let entry = backend
            .create_field_entry(&session, &"age".parse().unwrap(), Datatype::Integer, &row)
            .await
            .unwrap();

        assert!(backend.download_value(&session, &entry).await.unwrap_err().is_not_found());
        assert_eq!(backend.get_provenance(&session, &entry).await.unwrap(), None);

        let missing = backend.load_dataset_definition(&session, "ds", "default").await;
        assert!(matches!(missing, Err(StoreError::DefinitionNotFound { .. })));

        session.catalog.save_definition("ds", "broken", "{oops").await.unwrap();
        let broken = backend.load_dataset_definition(&session, "ds", "broken").await;
        assert!(matches!(broken, Err(StoreError::MalformedDefinition { .. })));
    }
}
