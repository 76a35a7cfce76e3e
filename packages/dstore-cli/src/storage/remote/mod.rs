// Remote stores: a backend speaking to a server plus a local file-set cache
use super::{files, DataStore, Provenance, RemoteConfig};
use crate::datatype::{Datatype, FieldValue, FileSet};
use crate::entry::{DataEntry, EntryPath};
use crate::error::{IoContext, StoreError, StoreResult};
use crate::hash::{self, Blake3Hash, ChecksumMap};
use crate::space::Space;
use crate::tree::{DataRow, DataTree, TreeOptions};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs;
use tracing::{debug, info, warn};

pub mod catalog;
pub mod session;
pub mod watch;

pub use catalog::{CatalogBackend, CatalogSession};
pub use session::{Connection, SessionManager};
pub use watch::{DownloadWatch, WatchOutcome};

const DOWNLOADS_DIR: &str = ".downloads";
const UPLOADS_DIR: &str = ".uploads";

/// Server side of a remote store.
///
/// Every call that talks to the server receives the shared session;
/// [`RemoteStore`] opens it, shares it between concurrent operations and
/// closes it once idle.
#[async_trait]
pub trait RemoteBackend: Send + Sync + 'static {
    type Session: Clone + Send + Sync + 'static;

    async fn connect(&self) -> StoreResult<Self::Session>;

    async fn disconnect(&self, session: Self::Session) -> StoreResult<()>;

    async fn populate_tree(&self, session: &Self::Session, tree: &mut DataTree) -> StoreResult<()>;

    async fn populate_row(&self, session: &Self::Session, row: &mut DataRow) -> StoreResult<()>;

    async fn create_data_tree(
        &self,
        session: &Self::Session,
        id: &str,
        leaves: &[Vec<String>],
        hierarchy: &[String],
        space: &Space,
        options: &TreeOptions,
    ) -> StoreResult<()>;

    /// Server address of the entry at `path` within `row`.
    fn entry_uri(&self, path: &EntryPath, row: &DataRow) -> String;

    async fn create_fileset_entry(
        &self,
        session: &Self::Session,
        path: &EntryPath,
        datatype: Datatype,
        row: &DataRow,
    ) -> StoreResult<DataEntry>;

    async fn create_field_entry(
        &self,
        session: &Self::Session,
        path: &EntryPath,
        datatype: Datatype,
        row: &DataRow,
    ) -> StoreResult<DataEntry>;

    /// Write the entry's files into the existing, empty `download_dir`.
    async fn download_files(
        &self,
        session: &Self::Session,
        entry: &DataEntry,
        download_dir: &Path,
    ) -> StoreResult<()>;

    /// Replace the entry's files with the contents of `cache_path`.
    async fn upload_files(
        &self,
        session: &Self::Session,
        cache_path: &Path,
        entry: &DataEntry,
    ) -> StoreResult<()>;

    async fn download_value(&self, session: &Self::Session, entry: &DataEntry) -> StoreResult<FieldValue>;

    async fn upload_value(
        &self,
        session: &Self::Session,
        value: &FieldValue,
        entry: &DataEntry,
    ) -> StoreResult<()>;

    /// Checksums the server holds for the entry's files.
    async fn get_checksums(&self, session: &Self::Session, uri: &str) -> StoreResult<ChecksumMap>;

    /// Checksums of a local file-set, comparable with [`RemoteBackend::get_checksums`].
    async fn calculate_checksums(&self, fileset: &FileSet) -> StoreResult<ChecksumMap> {
        hash::checksum_fileset(fileset).await
    }

    async fn get_provenance(
        &self,
        session: &Self::Session,
        entry: &DataEntry,
    ) -> StoreResult<Option<Provenance>>;

    async fn put_provenance(
        &self,
        session: &Self::Session,
        provenance: &Provenance,
        entry: &DataEntry,
    ) -> StoreResult<()>;

    async fn save_dataset_definition(
        &self,
        session: &Self::Session,
        dataset_id: &str,
        definition: &serde_json::Value,
        name: &str,
    ) -> StoreResult<()>;

    async fn load_dataset_definition(
        &self,
        session: &Self::Session,
        dataset_id: &str,
        name: &str,
    ) -> StoreResult<serde_json::Value>;
}

/// File-set transfers performed by a store since it was opened
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    pub downloads: u64,
    pub uploads: u64,
}

/// Data store over a [`RemoteBackend`], caching file-sets locally.
///
/// A cached copy is served only while its checksums match the server's.
/// Downloads land in `<cache>/.downloads/<hash of uri>` and are moved into
/// place when complete, so concurrent processes sharing a cache wait for
/// each other instead of downloading twice.
pub struct RemoteStore<B: RemoteBackend> {
    name: String,
    backend: Arc<B>,
    sessions: SessionManager<B>,
    cache_dir: PathBuf,
    watch: DownloadWatch,
    stats: Mutex<TransferStats>,
}

impl RemoteStore<CatalogBackend> {
    /// Remote store over a catalog server, as configured
    pub fn from_config(config: &RemoteConfig) -> Self {
        let backend = CatalogBackend::new(&config.server, &config.user, &config.password);
        let watch = DownloadWatch::new(config.stall_timeout(), config.poll_interval());
        Self::new("remote", backend, &config.cache_dir, watch)
    }
}

impl<B: RemoteBackend> RemoteStore<B> {
    pub fn new(
        name: impl Into<String>,
        backend: B,
        cache_dir: impl AsRef<Path>,
        watch: DownloadWatch,
    ) -> Self {
        let backend = Arc::new(backend);
        Self {
            name: name.into(),
            sessions: SessionManager::new(Arc::clone(&backend)),
            backend,
            cache_dir: cache_dir.as_ref().to_path_buf(),
            watch,
            stats: Mutex::new(TransferStats::default()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn sessions(&self) -> &SessionManager<B> {
        &self.sessions
    }

    /// Hold the shared session across several calls; operations made while
    /// it is held reuse it instead of reconnecting.
    pub async fn connection(&self) -> StoreResult<Connection<B>> {
        self.sessions.acquire().await
    }

    pub fn stats(&self) -> TransferStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Where the cached copy of an entry lives
    pub fn cache_path(&self, entry: &DataEntry) -> PathBuf {
        self.cache_dir.join(&entry.uri)
    }

    fn download_dir(&self, entry: &DataEntry) -> PathBuf {
        let key = Blake3Hash::from_bytes(entry.uri.as_bytes()).to_hex();
        self.cache_dir.join(DOWNLOADS_DIR).join(key)
    }

    /// Whether the cached copy of a file-set differs from the server's.
    pub async fn is_stale(&self, entry: &DataEntry) -> StoreResult<bool> {
        let conn = self.connection().await?;
        let remote = self.backend.get_checksums(conn.session(), &entry.uri).await;
        let remote = conn.finish(remote).await?;
        Ok(!self.cache_matches(&self.cache_path(entry), &remote).await?)
    }

    async fn cache_matches(&self, cache: &Path, remote: &ChecksumMap) -> StoreResult<bool> {
        if !files::exists(cache).await? {
            return Ok(false);
        }
        let fileset = FileSet::from_dir(cache).await?;
        let local = self.backend.calculate_checksums(&fileset).await?;
        Ok(!hash::is_stale(remote, &local))
    }

    /// Make the cache hold the server's copy and return its location.
    async fn fetch(&self, session: &B::Session, entry: &DataEntry) -> StoreResult<PathBuf> {
        let remote = self.backend.get_checksums(session, &entry.uri).await?;
        let cache = self.cache_path(entry);
        let download_dir = self.download_dir(entry);
        if let Some(parent) = download_dir.parent() {
            fs::create_dir_all(parent).await.at(parent)?;
        }

        loop {
            if self.cache_matches(&cache, &remote).await? {
                debug!("Cache hit for {}", entry.uri);
                return Ok(cache);
            }
            // Creating the download directory claims the download
            match fs::create_dir(&download_dir).await {
                Ok(()) => {
                    // A sibling may have finished between the check and the claim
                    if self.cache_matches(&cache, &remote).await? {
                        files::remove_path(&download_dir).await?;
                        return Ok(cache);
                    }
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    info!("Waiting for another download of {}", entry.uri);
                    if self.watch.wait(&download_dir).await? == WatchOutcome::Stalled {
                        warn!(
                            "Download of {} made no progress for {:?}; taking over",
                            entry.uri,
                            self.watch.stall_timeout()
                        );
                        files::remove_path(&download_dir).await?;
                    }
                }
                Err(e) => return Err(StoreError::io(&download_dir, e)),
            }
        }

        let result = self.download(session, entry, &remote, &download_dir, &cache).await;
        if result.is_err() {
            if let Err(e) = files::remove_path(&download_dir).await {
                warn!("Failed to clean up {}: {}", download_dir.display(), e);
            }
        }
        result?;
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).downloads += 1;
        Ok(cache)
    }

    async fn download(
        &self,
        session: &B::Session,
        entry: &DataEntry,
        remote: &ChecksumMap,
        download_dir: &Path,
        cache: &Path,
    ) -> StoreResult<()> {
        self.backend.download_files(session, entry, download_dir).await?;
        let fileset = FileSet::from_dir(download_dir).await?;
        let received = self.backend.calculate_checksums(&fileset).await?;
        if hash::is_stale(remote, &received) {
            return Err(StoreError::transfer(
                &entry.uri,
                "downloaded files do not match the server's checksums",
            ));
        }
        files::replace_dir(download_dir, cache).await?;
        info!("Downloaded {} ({} files)", entry.uri, received.len());
        Ok(())
    }
}

#[async_trait]
impl<B: RemoteBackend> DataStore for RemoteStore<B> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn populate_tree(&self, tree: &mut DataTree) -> StoreResult<()> {
        let conn = self.connection().await?;
        let result = self.backend.populate_tree(conn.session(), tree).await;
        conn.finish(result).await
    }

    async fn populate_row(&self, row: &mut DataRow) -> StoreResult<()> {
        let conn = self.connection().await?;
        let result = self.backend.populate_row(conn.session(), row).await;
        conn.finish(result).await
    }

    async fn create_data_tree(
        &self,
        id: &str,
        leaves: &[Vec<String>],
        hierarchy: &[String],
        space: &Space,
        options: &TreeOptions,
    ) -> StoreResult<()> {
        let conn = self.connection().await?;
        let result = self
            .backend
            .create_data_tree(conn.session(), id, leaves, hierarchy, space, options)
            .await;
        conn.finish(result).await
    }

    fn fileset_uri(&self, path: &EntryPath, _datatype: Datatype, row: &DataRow) -> String {
        self.backend.entry_uri(path, row)
    }

    fn field_uri(&self, path: &EntryPath, _datatype: Datatype, row: &DataRow) -> String {
        self.backend.entry_uri(path, row)
    }

    async fn create_entry(
        &self,
        path: &str,
        datatype: Datatype,
        row: &DataRow,
    ) -> StoreResult<DataEntry> {
        let path: EntryPath = path.parse()?;
        let conn = self.connection().await?;
        let result = if datatype.is_fileset() {
            self.backend
                .create_fileset_entry(conn.session(), &path, datatype, row)
                .await
        } else {
            self.backend
                .create_field_entry(conn.session(), &path, datatype, row)
                .await
        };
        conn.finish(result).await
    }

    async fn get_fileset(&self, entry: &DataEntry, datatype: Datatype) -> StoreResult<FileSet> {
        let conn = self.connection().await?;
        let result = self.fetch(conn.session(), entry).await;
        let cache = conn.finish(result).await?;
        datatype.cast_fileset(FileSet::from_dir(&cache).await?).await
    }

    async fn put_fileset(&self, fileset: &FileSet, entry: &DataEntry) -> StoreResult<FileSet> {
        let fileset = entry.datatype.cast_fileset(fileset.clone()).await?;
        let uploads = self.cache_dir.join(UPLOADS_DIR);
        fs::create_dir_all(&uploads).await.at(&uploads)?;
        let staging = tempfile::Builder::new()
            .prefix("upload-")
            .tempdir_in(&uploads)
            .at(&uploads)?;
        for (fspath, name) in fileset.fspaths().iter().zip(fileset.names()?) {
            files::copy_path(fspath, &staging.path().join(name)).await?;
        }

        let conn = self.connection().await?;
        let result = self
            .backend
            .upload_files(conn.session(), staging.path(), entry)
            .await;
        conn.finish(result).await?;

        // The staged copy is exactly what the server now holds
        let cache = self.cache_path(entry);
        files::replace_dir(staging.path(), &cache).await?;
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).uploads += 1;
        info!("Uploaded {}", entry.uri);
        FileSet::from_dir(&cache).await
    }

    async fn get_field(&self, entry: &DataEntry, datatype: Datatype) -> StoreResult<FieldValue> {
        let conn = self.connection().await?;
        let result = self.backend.download_value(conn.session(), entry).await;
        datatype.cast_field(conn.finish(result).await?)
    }

    async fn put_field(&self, value: &FieldValue, entry: &DataEntry) -> StoreResult<()> {
        let value = entry.datatype.cast_field(value.clone())?;
        let conn = self.connection().await?;
        let result = self.backend.upload_value(conn.session(), &value, entry).await;
        conn.finish(result).await
    }

    async fn get_provenance(&self, entry: &DataEntry) -> StoreResult<Option<Provenance>> {
        let conn = self.connection().await?;
        let result = self.backend.get_provenance(conn.session(), entry).await;
        conn.finish(result).await
    }

    async fn put_provenance(&self, provenance: &Provenance, entry: &DataEntry) -> StoreResult<()> {
        let conn = self.connection().await?;
        let result = self
            .backend
            .put_provenance(conn.session(), provenance, entry)
            .await;
        conn.finish(result).await
    }

    async fn save_dataset_definition(
        &self,
        dataset_id: &str,
        definition: &serde_json::Value,
        name: &str,
    ) -> StoreResult<()> {
        let conn = self.connection().await?;
        let result = self
            .backend
            .save_dataset_definition(conn.session(), dataset_id, definition, name)
            .await;
        conn.finish(result).await
    }

    async fn load_dataset_definition(
        &self,
        dataset_id: &str,
        name: &str,
    ) -> StoreResult<serde_json::Value> {
        let conn = self.connection().await?;
        let result = self
            .backend
            .load_dataset_definition(conn.session(), dataset_id, name)
            .await;
        conn.finish(result).await
    }
}
