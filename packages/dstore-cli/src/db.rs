// SQLite catalog behind the remote store: accounts, dataset trees, entry
// resources, checksums and definitions
use crate::error::{StoreError, StoreResult};
use crate::hash::{Blake3Hash, ChecksumMap};
use crate::space::Space;
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS accounts (
        user TEXT PRIMARY KEY,
        password_hash TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS datasets (
        id TEXT PRIMARY KEY,
        hierarchy TEXT NOT NULL,
        space TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS leaves (
        dataset_id TEXT NOT NULL,
        ids TEXT NOT NULL,
        PRIMARY KEY (dataset_id, ids)
    )",
    "CREATE TABLE IF NOT EXISTS resources (
        uri TEXT PRIMARY KEY,
        dataset_id TEXT NOT NULL,
        row_key TEXT NOT NULL,
        path TEXT NOT NULL,
        datatype TEXT NOT NULL,
        value TEXT,
        has_content INTEGER NOT NULL DEFAULT 0,
        provenance TEXT
    )",
    "CREATE INDEX IF NOT EXISTS resources_by_row ON resources (dataset_id, row_key)",
    "CREATE TABLE IF NOT EXISTS checksums (
        uri TEXT NOT NULL,
        path TEXT NOT NULL,
        digest TEXT NOT NULL,
        PRIMARY KEY (uri, path)
    )",
    "CREATE TABLE IF NOT EXISTS definitions (
        dataset_id TEXT NOT NULL,
        name TEXT NOT NULL,
        document TEXT NOT NULL,
        PRIMARY KEY (dataset_id, name)
    )",
];

/// Catalog row of one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub uri: String,
    /// Full entry path (`name`, `name@`, `name@analysis`)
    pub path: String,
    pub datatype: String,
    pub value: Option<String>,
    pub has_content: bool,
}

impl Resource {
    fn from_row(row: &SqliteRow) -> StoreResult<Self> {
        Ok(Self {
            uri: row.try_get("uri")?,
            path: row.try_get("path")?,
            datatype: row.try_get("datatype")?,
            value: row.try_get("value")?,
            has_content: row.try_get("has_content")?,
        })
    }
}

/// Catalog database wrapper
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    /// Open the catalog at `path`, creating the file only when `create` is set
    pub async fn open(path: &Path, create: bool) -> StoreResult<Self> {
        if !create && !path.exists() {
            return Err(StoreError::Configuration(format!(
                "no catalog at {}",
                path.display()
            )));
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn create_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create or reset an account
    pub async fn add_account(&self, user: &str, password: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO accounts (user, password_hash) VALUES (?, ?)
             ON CONFLICT(user) DO UPDATE SET password_hash = excluded.password_hash",
        )
        .bind(user)
        .bind(password_hash(password))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn authenticate(&self, user: &str, password: &str) -> StoreResult<()> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT password_hash FROM accounts WHERE user = ?")
                .bind(user)
                .fetch_optional(&self.pool)
                .await?;
        match stored {
            Some(hash) if hash == password_hash(password) => Ok(()),
            _ => Err(StoreError::Authentication(user.to_string())),
        }
    }

    /// Register a dataset and its leaves in one transaction
    pub async fn create_dataset(
        &self,
        id: &str,
        hierarchy: &[String],
        space: &Space,
        leaves: &[Vec<String>],
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let existing: Option<String> = sqlx::query_scalar("SELECT id FROM datasets WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_some() {
            return Err(StoreError::Configuration(format!(
                "dataset '{id}' already exists"
            )));
        }

        sqlx::query("INSERT INTO datasets (id, hierarchy, space) VALUES (?, ?, ?)")
            .bind(id)
            .bind(serde_json::to_string(hierarchy)?)
            .bind(serde_json::to_string(space)?)
            .execute(&mut *tx)
            .await?;
        for leaf in leaves {
            sqlx::query("INSERT INTO leaves (dataset_id, ids) VALUES (?, ?)")
                .bind(id)
                .bind(serde_json::to_string(leaf)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Leaves of a dataset, sorted by their ID tuples
    pub async fn dataset_leaves(&self, id: &str) -> StoreResult<Vec<Vec<String>>> {
        let known: Option<String> = sqlx::query_scalar("SELECT id FROM datasets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        if known.is_none() {
            return Err(StoreError::NotFound(format!("dataset '{id}'")));
        }

        let mut leaves = Vec::new();
        let mut rows = sqlx::query("SELECT ids FROM leaves WHERE dataset_id = ?")
            .bind(id)
            .fetch(&self.pool);
        while let Some(row) = rows.try_next().await? {
            let ids: String = row.try_get("ids")?;
            let ids: Vec<String> = serde_json::from_str(&ids).map_err(|e| {
                StoreError::Structure(format!("unreadable leaf of '{id}': {e}"))
            })?;
            leaves.push(ids);
        }
        leaves.sort();
        Ok(leaves)
    }

    /// Register an entry; re-registering keeps any stored content
    pub async fn register_resource(
        &self,
        uri: &str,
        dataset_id: &str,
        row_key: &str,
        path: &str,
        datatype: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO resources (uri, dataset_id, row_key, path, datatype) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(uri) DO UPDATE SET datatype = excluded.datatype",
        )
        .bind(uri)
        .bind(dataset_id)
        .bind(row_key)
        .bind(path)
        .bind(datatype)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn row_resources(&self, dataset_id: &str, row_key: &str) -> StoreResult<Vec<Resource>> {
        let rows = sqlx::query(
            "SELECT uri, path, datatype, value, has_content FROM resources
             WHERE dataset_id = ? AND row_key = ? ORDER BY path",
        )
        .bind(dataset_id)
        .bind(row_key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Resource::from_row).collect()
    }

    pub async fn resource(&self, uri: &str) -> StoreResult<Resource> {
        let row = sqlx::query(
            "SELECT uri, path, datatype, value, has_content FROM resources WHERE uri = ?",
        )
        .bind(uri)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("resource {uri}")))?;
        Resource::from_row(&row)
    }

    pub async fn set_value(&self, uri: &str, value: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE resources SET value = ? WHERE uri = ?")
            .bind(value)
            .bind(uri)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("resource {uri}")));
        }
        Ok(())
    }

    /// Replace the checksums of a resource and mark it as holding content
    pub async fn replace_checksums(&self, uri: &str, checksums: &ChecksumMap) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM checksums WHERE uri = ?")
            .bind(uri)
            .execute(&mut *tx)
            .await?;
        for (path, digest) in checksums {
            sqlx::query("INSERT INTO checksums (uri, path, digest) VALUES (?, ?, ?)")
                .bind(uri)
                .bind(path)
                .bind(digest)
                .execute(&mut *tx)
                .await?;
        }
        let result = sqlx::query("UPDATE resources SET has_content = 1 WHERE uri = ?")
            .bind(uri)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("resource {uri}")));
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn checksums(&self, uri: &str) -> StoreResult<ChecksumMap> {
        let rows = sqlx::query("SELECT path, digest FROM checksums WHERE uri = ?")
            .bind(uri)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> StoreResult<(String, String)> {
                let path: String = row.try_get("path")?;
                let digest: String = row.try_get("digest")?;
                let digest = Blake3Hash::parse(&digest).map_err(|_| {
                    StoreError::Structure(format!("corrupt checksum of {uri}/{path}: '{digest}'"))
                })?;
                Ok((path, digest.to_hex()))
            })
            .collect()
    }

    /// Provenance document of a resource, `None` when never stored
    pub async fn provenance(&self, uri: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT provenance FROM resources WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("resource {uri}")))?;
        Ok(row.try_get("provenance")?)
    }

    pub async fn set_provenance(&self, uri: &str, document: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE resources SET provenance = ? WHERE uri = ?")
            .bind(document)
            .bind(uri)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("resource {uri}")));
        }
        Ok(())
    }

    pub async fn save_definition(&self, dataset_id: &str, name: &str, document: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO definitions (dataset_id, name, document) VALUES (?, ?, ?)
             ON CONFLICT(dataset_id, name) DO UPDATE SET document = excluded.document",
        )
        .bind(dataset_id)
        .bind(name)
        .bind(document)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_definition(&self, dataset_id: &str, name: &str) -> StoreResult<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT document FROM definitions WHERE dataset_id = ? AND name = ?")
                .bind(dataset_id)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?,
        )
    }
}

fn password_hash(password: &str) -> String {
    Blake3Hash::from_bytes(password.as_bytes()).to_hex()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_catalog() -> (Catalog, TempDir) {
        let temp = TempDir::new().unwrap();
        let catalog = Catalog::open(&temp.path().join("catalog.db"), true).await.unwrap();
        catalog.create_schema().await.unwrap();
        catalog.add_account("tester", "secret").await.unwrap();
        (catalog, temp)
    }

    #[tokio::test]
    async fn test_open_missing_without_create() {
        let temp = TempDir::new().unwrap();
        let result = Catalog::open(&temp.path().join("catalog.db"), false).await;
        assert!(matches!(result, Err(StoreError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_authenticate() {
        let (catalog, _temp) = create_test_catalog().await;
        assert!(catalog.authenticate("tester", "secret").await.is_ok());
        let wrong = catalog.authenticate("tester", "guess").await;
        assert!(matches!(wrong, Err(StoreError::Authentication(_))));
        let unknown = catalog.authenticate("nobody", "secret").await;
        assert!(matches!(unknown, Err(StoreError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_dataset_leaves_sorted_and_unique_dataset() {
        let (catalog, _temp) = create_test_catalog().await;
        let hierarchy = vec!["a".to_string(), "b".to_string()];
        let leaves = vec![
            vec!["a1".to_string(), "b0".to_string()],
            vec!["a0".to_string(), "b1".to_string()],
        ];
        catalog
            .create_dataset("ds", &hierarchy, &Space::test(), &leaves)
            .await
            .unwrap();

        let mut expected = leaves.clone();
        expected.sort();
        assert_eq!(catalog.dataset_leaves("ds").await.unwrap(), expected);

        let again = catalog.create_dataset("ds", &hierarchy, &Space::test(), &[]).await;
        assert!(matches!(again, Err(StoreError::Configuration(_))));
        assert!(catalog.dataset_leaves("other").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_resource_lifecycle() {
        let (catalog, _temp) = create_test_catalog().await;
        let uri = "ds/a0/b0/primary/scan";
        assert!(catalog.set_value(uri, "1").await.unwrap_err().is_not_found());

        catalog
            .register_resource(uri, "ds", "a0/b0", "scan", "file")
            .await
            .unwrap();
        assert_eq!(catalog.provenance(uri).await.unwrap(), None);
        assert!(!catalog.resource(uri).await.unwrap().has_content);

        let mut checksums = ChecksumMap::new();
        checksums.insert("scan.nii".to_string(), "ab".repeat(32));
        catalog.replace_checksums(uri, &checksums).await.unwrap();
        catalog.set_provenance(uri, "{\"tool\":\"x\"}").await.unwrap();

        // Registering again keeps content
        catalog
            .register_resource(uri, "ds", "a0/b0", "scan", "file")
            .await
            .unwrap();
        assert!(catalog.resource(uri).await.unwrap().has_content);
        assert_eq!(catalog.checksums(uri).await.unwrap(), checksums);
        assert_eq!(
            catalog.provenance(uri).await.unwrap().as_deref(),
            Some("{\"tool\":\"x\"}")
        );
        assert_eq!(catalog.row_resources("ds", "a0/b0").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_checksum_rejected() {
        let (catalog, _temp) = create_test_catalog().await;
        let uri = "ds/a0/b0/primary/scan";
        catalog
            .register_resource(uri, "ds", "a0/b0", "scan", "file")
            .await
            .unwrap();
        let mut checksums = ChecksumMap::new();
        checksums.insert("scan.nii".to_string(), "not-a-digest".to_string());
        catalog.replace_checksums(uri, &checksums).await.unwrap();

        let err = catalog.checksums(uri).await.unwrap_err();
        assert!(matches!(err, StoreError::Structure(_)), "{err}");
    }

    #[tokio::test]
    async fn test_definitions_by_name() {
        let (catalog, _temp) = create_test_catalog().await;
        catalog.save_definition("ds", "default", "{}").await.unwrap();
        catalog.save_definition("ds", "other", "[]").await.unwrap();
        catalog.save_definition("ds", "default", "{\"v\":2}").await.unwrap();

        assert_eq!(
            catalog.load_definition("ds", "default").await.unwrap().as_deref(),
            Some("{\"v\":2}")
        );
        assert_eq!(catalog.load_definition("ds", "other").await.unwrap().as_deref(), Some("[]"));
        assert_eq!(catalog.load_definition("ds", "absent").await.unwrap(), None);
    }
}
