// Entry paths and the primary/derivative namespaces
use crate::datatype::Datatype;
use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Delimiter between an entry's base path and the analysis that produced it.
pub const DERIVATIVE_DELIMITER: char = '@';

/// Path of an entry within a row.
///
/// `brain_mask` is a primary entry; `brain_mask@` is a derivative written by
/// the unnamed analysis and `brain_mask@my_analysis` one written by
/// `my_analysis`. The three never collide.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryPath {
    base: String,
    analysis: Option<String>,
}

impl EntryPath {
    pub fn primary(base: impl Into<String>) -> StoreResult<Self> {
        Self::new(base.into(), None)
    }

    pub fn derivative(base: impl Into<String>, analysis: impl Into<String>) -> StoreResult<Self> {
        Self::new(base.into(), Some(analysis.into()))
    }

    fn new(base: String, analysis: Option<String>) -> StoreResult<Self> {
        // Leading `.` and `__` are reserved for store bookkeeping
        let bad_part = |s: &str| s.contains(DERIVATIVE_DELIMITER) || s.starts_with('.');
        if base.is_empty()
            || base.starts_with("__")
            || bad_part(&base)
            || analysis.as_deref().is_some_and(bad_part)
        {
            let full = match &analysis {
                Some(a) => format!("{base}@{a}"),
                None => base,
            };
            return Err(StoreError::InvalidPath(full));
        }
        Ok(Self { base, analysis })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn namespace(&self) -> Namespace {
        match &self.analysis {
            None => Namespace::Primary,
            Some(name) => Namespace::Derivative(name.clone()),
        }
    }
}

impl FromStr for EntryPath {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        match s.split_once(DERIVATIVE_DELIMITER) {
            Some((base, analysis)) => Self::derivative(base, analysis),
            None => Self::primary(s),
        }
    }
}

impl fmt::Display for EntryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.analysis {
            Some(analysis) => write!(f, "{}{DERIVATIVE_DELIMITER}{analysis}", self.base),
            None => write!(f, "{}", self.base),
        }
    }
}

impl Serialize for EntryPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EntryPath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Which namespace of a row an entry lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Namespace {
    Primary,
    /// Outputs of the named analysis (empty name for the default analysis).
    Derivative(String),
}

impl Namespace {
    /// Directory (or key prefix) holding this namespace within a row.
    pub fn storage_dir(&self) -> String {
        match self {
            Namespace::Primary => "primary".to_string(),
            Namespace::Derivative(name) => format!("derivatives/{DERIVATIVE_DELIMITER}{name}"),
        }
    }

    /// Inverse of [`Namespace::storage_dir`] for the directory beneath `derivatives/`.
    pub fn from_derivative_dir(dir: &str) -> Option<Self> {
        dir.strip_prefix(DERIVATIVE_DELIMITER)
            .map(|name| Namespace::Derivative(name.to_string()))
    }

    /// Attach this namespace to a base path.
    pub fn entry_path(&self, base: &str) -> StoreResult<EntryPath> {
        match self {
            Namespace::Primary => EntryPath::primary(base),
            Namespace::Derivative(name) => EntryPath::derivative(base, name.clone()),
        }
    }
}

/// A single addressable item stored at a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntry {
    pub path: EntryPath,
    pub datatype: Datatype,
    /// Store-specific address, as produced by the store's uri functions.
    pub uri: String,
}

impl DataEntry {
    pub fn new(path: EntryPath, datatype: Datatype, uri: impl Into<String>) -> Self {
        Self {
            path,
            datatype,
            uri: uri.into(),
        }
    }

    pub fn is_fileset(&self) -> bool {
        self.datatype.is_fileset()
    }
}

/// Escape an entry base path (which may contain `/`) into one path segment.
pub fn encode_segment(base: &str) -> String {
    base.replace('%', "%25").replace('/', "%2F")
}

pub fn decode_segment(segment: &str) -> String {
    segment.replace("%2F", "/").replace("%25", "%")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_and_derivative_paths_differ() {
        let primary: EntryPath = "brain_mask".parse().unwrap();
        let unnamed: EntryPath = "brain_mask@".parse().unwrap();
        let named: EntryPath = "brain_mask@my_analysis".parse().unwrap();

        assert_eq!(primary.namespace(), Namespace::Primary);
        assert_eq!(unnamed.namespace(), Namespace::Derivative(String::new()));
        assert_eq!(named.namespace().storage_dir(), "derivatives/@my_analysis");
        assert_ne!(primary, unnamed);
        assert_ne!(unnamed, named);
        assert_eq!(unnamed.to_string(), "brain_mask@");
        assert_eq!(named.base(), "brain_mask");
    }

    #[test]
    fn test_invalid_paths() {
        assert!("".parse::<EntryPath>().is_err());
        assert!("@analysis".parse::<EntryPath>().is_err());
        assert!("a@b@c".parse::<EntryPath>().is_err());
        assert!(".hidden".parse::<EntryPath>().is_err());
        assert!(matches!(
            "__notes".parse::<EntryPath>(),
            Err(StoreError::InvalidPath(_))
        ));
        assert!("__notes@prep".parse::<EntryPath>().is_err());
        assert!("notes__".parse::<EntryPath>().is_ok());
        assert!("_notes".parse::<EntryPath>().is_ok());
    }

    #[test]
    fn test_namespace_dir_roundtrip() {
        let ns = Namespace::Derivative("fmriprep".into());
        let dir = ns.storage_dir();
        let leaf = dir.strip_prefix("derivatives/").unwrap();
        assert_eq!(Namespace::from_derivative_dir(leaf), Some(ns));
        assert_eq!(Namespace::from_derivative_dir("plain"), None);
    }

    #[test]
    fn test_segment_encoding() {
        let encoded = encode_segment("anat/T1w%raw");
        assert!(!encoded.contains('/'));
        assert_eq!(decode_segment(&encoded), "anat/T1w%raw");
    }

    #[test]
    fn test_entry_serializes_path_as_string() {
        let entry = DataEntry::new("deriv1@".parse().unwrap(), Datatype::PlainText, "x/y");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["path"], "deriv1@");
        let back: DataEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }
}
