// Store error taxonomy
use std::path::PathBuf;

/// Errors surfaced by data store operations.
///
/// Stale caches and missing provenance are not errors: the former is a
/// boolean answer, the latter is `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested entry, row or object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// No dataset definition stored under this compound key.
    #[error("no dataset definition named '{name}' for dataset '{dataset_id}'")]
    DefinitionNotFound { dataset_id: String, name: String },

    /// A stored dataset definition exists but cannot be decoded.
    #[error("malformed dataset definition '{name}' for dataset '{dataset_id}': {reason}")]
    MalformedDefinition {
        dataset_id: String,
        name: String,
        reason: String,
    },

    /// Backing storage does not match the expected hierarchy or namespace shape.
    #[error("structural inconsistency: {0}")]
    Structure(String),

    /// Invalid tree options, hierarchy or id composition.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A download or upload did not complete.
    #[error("transfer failed for {uri}: {reason}")]
    Transfer { uri: String, reason: String },

    /// Stored content cannot be represented as the requested datatype.
    #[error("cannot read {found} as {requested}")]
    Datatype { requested: String, found: String },

    /// Entry path or row ID that cannot be mapped onto storage.
    #[error("invalid path '{0}'")]
    InvalidPath(String),

    /// Remote session could not be established with the given credentials.
    #[error("authentication failed for user '{0}'")]
    Authentication(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("catalog error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Attach the offending path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn transfer(uri: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        StoreError::Transfer {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    /// True for the not-found family, which callers often treat as "absent".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_) | StoreError::DefinitionNotFound { .. }
        )
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Extension for mapping `std::io::Result` onto `StoreError::Io` with a path.
pub(crate) trait IoContext<T> {
    fn at(self, path: &std::path::Path) -> StoreResult<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &std::path::Path) -> StoreResult<T> {
        self.map_err(|e| StoreError::io(path, e))
    }
}
