// BLAKE3 digests and per-file checksum maps
use crate::datatype::FileSet;
use crate::error::{IoContext, StoreError, StoreResult};
use crate::storage::files;
use blake3::{Hash, Hasher};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

/// Relative file path (with `/` separators) to hex digest.
///
/// Remote services report one of these per entry and the local side computes
/// one for a cached file-set with the same algorithm, so the two maps compare
/// directly.
pub type ChecksumMap = BTreeMap<String, String>;

/// BLAKE3 hash wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Blake3Hash(Hash);

impl Blake3Hash {
    /// Compute BLAKE3 hash from a file using streaming I/O
    ///
    /// This uses a buffered reader to handle large files efficiently
    /// without loading the entire file into memory.
    pub fn from_file<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).at(path)?;

        let reader = BufReader::with_capacity(1024 * 1024, file); // 1MB buffer
        Self::from_reader(reader).at(path)
    }

    /// Compute BLAKE3 hash from any reader, in 16KB chunks
    pub fn from_reader<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut hasher = Hasher::new();
        let mut buffer = [0u8; 16384];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(Blake3Hash(hasher.finalize()))
    }

    /// Compute BLAKE3 hash from bytes in memory
    pub fn from_bytes(data: &[u8]) -> Self {
        Blake3Hash(blake3::hash(data))
    }

    /// Get hex string representation without prefix
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Parse a hex digest, with or without the `blake3:` prefix
    pub fn parse(s: &str) -> StoreResult<Self> {
        let hex = s.strip_prefix("blake3:").unwrap_or(s);
        let invalid = || StoreError::InvalidPath(format!("invalid BLAKE3 digest: {s}"));

        let bytes = hex::decode(hex).map_err(|_| invalid())?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| invalid())?;
        Ok(Blake3Hash(Hash::from(bytes)))
    }
}

impl fmt::Display for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blake3:{}", self.to_hex())
    }
}

/// Checksum every regular file beneath `dir`, keyed relative to `dir`.
pub async fn checksum_dir(dir: &Path) -> StoreResult<ChecksumMap> {
    let targets = files::walk_files(dir)
        .await?
        .into_iter()
        .map(|rel| (files::slash_path(&rel), dir.join(rel)))
        .collect();
    hash_files(targets).await
}

/// Checksum the files of a file-set.
///
/// A top-level file is keyed by its file name, files inside a top-level
/// directory by `<dir name>/<relative path>`, so the map of a file-set read
/// back from an entry directory equals the map of that directory.
pub async fn checksum_fileset(fileset: &FileSet) -> StoreResult<ChecksumMap> {
    let mut targets = Vec::new();
    for fspath in fileset.fspaths() {
        let name = files::file_name(fspath)?;
        let meta = tokio::fs::metadata(fspath).await.at(fspath)?;
        if meta.is_dir() {
            for rel in files::walk_files(fspath).await? {
                targets.push((
                    format!("{name}/{}", files::slash_path(&rel)),
                    fspath.join(rel),
                ));
            }
        } else {
            targets.push((name, fspath.clone()));
        }
    }
    hash_files(targets).await
}

async fn hash_files(targets: Vec<(String, PathBuf)>) -> StoreResult<ChecksumMap> {
    tokio::task::spawn_blocking(move || {
        targets
            .into_iter()
            .map(|(key, path)| -> StoreResult<(String, String)> {
                Ok((key, Blake3Hash::from_file(&path)?.to_hex()))
            })
            .collect::<StoreResult<ChecksumMap>>()
    })
    .await
    .map_err(|e| StoreError::Structure(format!("checksum task failed: {e}")))?
}

/// A cached copy is stale unless both maps hold the same paths and digests.
pub fn is_stale(remote: &ChecksumMap, local: &ChecksumMap) -> bool {
    remote != local
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_hash_hello_world() {
        let hash = Blake3Hash::from_bytes(b"hello world");
        // Known BLAKE3 hash for "hello world"
        assert_eq!(
            hash.to_hex(),
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn test_hash_from_reader_large() {
        // Larger than the read buffer
        let data = vec![0xAB; 100_000];
        let hash = Blake3Hash::from_reader(Cursor::new(&data)).unwrap();
        assert_eq!(hash, Blake3Hash::from_bytes(&data));
    }

    #[test]
    fn test_parse_with_and_without_prefix() {
        let hash = Blake3Hash::from_bytes(b"parse me");
        assert_eq!(Blake3Hash::parse(&hash.to_string()).unwrap(), hash);
        assert_eq!(Blake3Hash::parse(&hash.to_hex()).unwrap(), hash);
        assert!(Blake3Hash::parse("blake3:tooshort").is_err());
    }

    #[tokio::test]
    async fn test_checksum_dir_keys_are_relative() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), b"alpha").unwrap();
        std::fs::create_dir_all(temp.path().join("sub/inner")).unwrap();
        std::fs::write(temp.path().join("sub/inner/b.bin"), b"beta").unwrap();

        let sums = checksum_dir(temp.path()).await.unwrap();
        let keys: Vec<&str> = sums.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["a.txt", "sub/inner/b.bin"]);
        assert_eq!(sums["a.txt"], Blake3Hash::from_bytes(b"alpha").to_hex());
    }

    #[tokio::test]
    async fn test_fileset_and_dir_maps_agree() {
        let temp = TempDir::new().unwrap();
        let entry_dir = temp.path().join("entry");
        std::fs::create_dir_all(entry_dir.join("dir1")).unwrap();
        std::fs::write(entry_dir.join("file.txt"), b"one").unwrap();
        std::fs::write(entry_dir.join("dir1/nested.txt"), b"two").unwrap();

        let fileset = FileSet::from_dir(&entry_dir).await.unwrap();
        assert_eq!(
            checksum_fileset(&fileset).await.unwrap(),
            checksum_dir(&entry_dir).await.unwrap()
        );
    }

    #[test]
    fn test_staleness() {
        let mut remote = ChecksumMap::new();
        remote.insert("file.txt".into(), "aa".into());
        let mut local = remote.clone();
        assert!(!is_stale(&remote, &local));

        local.insert("extra.txt".into(), "bb".into());
        assert!(is_stale(&remote, &local));

        local.remove("extra.txt");
        local.insert("file.txt".into(), "cc".into());
        assert!(is_stale(&remote, &local));
    }
}
