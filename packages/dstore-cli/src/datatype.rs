// Datatypes: how raw stored bytes and values are cast for callers
use crate::error::{IoContext, StoreError, StoreResult};
use crate::storage::files;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Closed set of datatypes a store can cast entries to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Datatype {
    /// Exactly one regular file
    File,
    /// Exactly one `.txt` file
    PlainText,
    /// Exactly one directory
    Directory,
    /// Any non-empty collection of files and directories
    FileSet,
    Text,
    Integer,
    Float,
    Boolean,
    TextArray,
    IntegerArray,
    FloatArray,
}

const ALL: [Datatype; 11] = [
    Datatype::File,
    Datatype::PlainText,
    Datatype::Directory,
    Datatype::FileSet,
    Datatype::Text,
    Datatype::Integer,
    Datatype::Float,
    Datatype::Boolean,
    Datatype::TextArray,
    Datatype::IntegerArray,
    Datatype::FloatArray,
];

impl Datatype {
    pub fn tag(self) -> &'static str {
        match self {
            Datatype::File => "file",
            Datatype::PlainText => "plain-text",
            Datatype::Directory => "directory",
            Datatype::FileSet => "file-set",
            Datatype::Text => "text",
            Datatype::Integer => "integer",
            Datatype::Float => "float",
            Datatype::Boolean => "boolean",
            Datatype::TextArray => "text-array",
            Datatype::IntegerArray => "integer-array",
            Datatype::FloatArray => "float-array",
        }
    }

    pub fn is_fileset(self) -> bool {
        matches!(
            self,
            Datatype::File | Datatype::PlainText | Datatype::Directory | Datatype::FileSet
        )
    }

    fn mismatch(self, found: impl fmt::Display) -> StoreError {
        StoreError::Datatype {
            requested: self.tag().to_string(),
            found: found.to_string(),
        }
    }

    /// Check that a file-set has the shape this datatype requires.
    pub async fn cast_fileset(self, fileset: FileSet) -> StoreResult<FileSet> {
        if !self.is_fileset() {
            return Err(self.mismatch("file-set"));
        }
        let paths = fileset.fspaths();
        if paths.is_empty() {
            return Err(self.mismatch("empty file-set"));
        }
        if self == Datatype::FileSet {
            return Ok(fileset);
        }
        if paths.len() != 1 {
            return Err(self.mismatch(format!("file-set of {} paths", paths.len())));
        }

        let path = &paths[0];
        let is_dir = tokio::fs::metadata(path).await.at(path)?.is_dir();
        let ok = match self {
            Datatype::Directory => is_dir,
            Datatype::File => !is_dir,
            Datatype::PlainText => {
                !is_dir && path.extension().is_some_and(|ext| ext == "txt")
            }
            _ => false,
        };
        if ok {
            Ok(fileset)
        } else {
            Err(self.mismatch(path.display()))
        }
    }

    /// Convert a stored field value to this datatype's representation.
    pub fn cast_field(self, value: FieldValue) -> StoreResult<FieldValue> {
        let err = |v: &FieldValue| self.mismatch(format!("{} value {v}", v.kind()));
        let unchanged = matches!(
            (self, &value),
            (Datatype::Text, FieldValue::Text(_))
                | (Datatype::Integer, FieldValue::Integer(_))
                | (Datatype::Float, FieldValue::Float(_))
                | (Datatype::Boolean, FieldValue::Boolean(_))
                | (Datatype::TextArray, FieldValue::TextArray(_))
                | (Datatype::IntegerArray, FieldValue::IntegerArray(_))
                | (Datatype::FloatArray, FieldValue::FloatArray(_))
        );
        if unchanged {
            return Ok(value);
        }

        let cast = match (self, &value) {
            (Datatype::Text, v) => Some(FieldValue::Text(v.to_string())),
            (Datatype::Integer, FieldValue::Text(s)) => s.trim().parse().ok().map(FieldValue::Integer),
            (Datatype::Integer, FieldValue::Float(f)) if f.fract() == 0.0 => {
                Some(FieldValue::Integer(*f as i64))
            }
            (Datatype::Float, FieldValue::Integer(i)) => Some(FieldValue::Float(*i as f64)),
            (Datatype::Float, FieldValue::Text(s)) => s.trim().parse().ok().map(FieldValue::Float),
            (Datatype::Boolean, FieldValue::Text(s)) => parse_bool(s).map(FieldValue::Boolean),
            (Datatype::Boolean, FieldValue::Integer(i)) if *i == 0 || *i == 1 => {
                Some(FieldValue::Boolean(*i == 1))
            }
            (Datatype::TextArray, FieldValue::IntegerArray(v)) => {
                Some(FieldValue::TextArray(v.iter().map(i64::to_string).collect()))
            }
            (Datatype::TextArray, FieldValue::FloatArray(v)) => {
                Some(FieldValue::TextArray(v.iter().map(f64::to_string).collect()))
            }
            (Datatype::IntegerArray, FieldValue::TextArray(v)) => v
                .iter()
                .map(|s| s.trim().parse().ok())
                .collect::<Option<Vec<i64>>>()
                .map(FieldValue::IntegerArray),
            (Datatype::FloatArray, FieldValue::IntegerArray(v)) => {
                Some(FieldValue::FloatArray(v.iter().map(|i| *i as f64).collect()))
            }
            (Datatype::FloatArray, FieldValue::TextArray(v)) => v
                .iter()
                .map(|s| s.trim().parse().ok())
                .collect::<Option<Vec<f64>>>()
                .map(FieldValue::FloatArray),
            _ => None,
        };
        cast.ok_or_else(|| err(&value))
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Datatype {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        ALL.into_iter()
            .find(|d| d.tag() == s)
            .ok_or_else(|| StoreError::Configuration(format!("unknown datatype '{s}'")))
    }
}

/// Files and directories making up one file-set entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSet {
    fspaths: Vec<PathBuf>,
}

impl FileSet {
    pub fn new(fspaths: Vec<PathBuf>) -> Self {
        Self { fspaths }
    }

    /// Every child of `dir`, sorted by name.
    pub async fn from_dir(dir: &Path) -> StoreResult<Self> {
        let fspaths = files::read_dir_sorted(dir)
            .await?
            .into_iter()
            .map(|(name, _)| dir.join(name))
            .collect();
        Ok(Self { fspaths })
    }

    pub fn fspaths(&self) -> &[PathBuf] {
        &self.fspaths
    }

    /// Top-level names, as they appear inside a stored entry.
    pub fn names(&self) -> StoreResult<Vec<String>> {
        self.fspaths.iter().map(|p| files::file_name(p)).collect()
    }
}

/// Scalar or homogeneous list value of a field entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    IntegerArray(Vec<i64>),
    FloatArray(Vec<f64>),
    TextArray(Vec<String>),
}

impl FieldValue {
    fn kind(&self) -> &'static str {
        match self {
            FieldValue::Boolean(_) => "boolean",
            FieldValue::Integer(_) => "integer",
            FieldValue::Float(_) => "float",
            FieldValue::Text(_) => "text",
            FieldValue::IntegerArray(_) => "integer-array",
            FieldValue::FloatArray(_) => "float-array",
            FieldValue::TextArray(_) => "text-array",
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<T: fmt::Display>(items: &[T]) -> String {
            items.iter().map(T::to_string).collect::<Vec<_>>().join(",")
        }
        match self {
            FieldValue::Boolean(b) => write!(f, "{b}"),
            FieldValue::Integer(i) => write!(f, "{i}"),
            FieldValue::Float(x) => write!(f, "{x}"),
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::IntegerArray(v) => write!(f, "[{}]", join(v)),
            FieldValue::FloatArray(v) => write!(f, "[{}]", join(v)),
            FieldValue::TextArray(v) => write!(f, "[{}]", join(v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tag_roundtrip() {
        for datatype in ALL {
            assert_eq!(datatype.tag().parse::<Datatype>().unwrap(), datatype);
            let json = serde_json::to_string(&datatype).unwrap();
            assert_eq!(json, format!("\"{}\"", datatype.tag()));
        }
        assert!("nifti".parse::<Datatype>().is_err());
    }

    #[test]
    fn test_cast_field_conversions() {
        let no = FieldValue::Text("no".into());
        assert_eq!(Datatype::Boolean.cast_field(no).unwrap(), FieldValue::Boolean(false));

        let decimal = FieldValue::Text("33.3333".into());
        assert_eq!(Datatype::Float.cast_field(decimal).unwrap(), FieldValue::Float(33.3333));

        let int = FieldValue::Integer(99);
        assert_eq!(Datatype::Text.cast_field(int).unwrap(), FieldValue::Text("99".into()));

        let list = FieldValue::IntegerArray(vec![1, 2, 3]);
        assert_eq!(
            Datatype::FloatArray.cast_field(list).unwrap(),
            FieldValue::FloatArray(vec![1.0, 2.0, 3.0])
        );

        assert!(Datatype::Integer.cast_field(FieldValue::Text("abc".into())).is_err());
        assert!(Datatype::File.cast_field(FieldValue::Integer(1)).is_err());
    }

    #[test]
    fn test_untagged_field_json() {
        let cases = [
            (FieldValue::Boolean(true), "true"),
            (FieldValue::Integer(5), "5"),
            (FieldValue::Float(2.5), "2.5"),
            (FieldValue::Text("sample-text".into()), "\"sample-text\""),
            (FieldValue::IntegerArray(vec![1, 2]), "[1,2]"),
        ];
        for (value, json) in cases {
            assert_eq!(serde_json::to_string(&value).unwrap(), json);
            assert_eq!(serde_json::from_str::<FieldValue>(json).unwrap(), value);
        }
    }

    #[tokio::test]
    async fn test_cast_fileset_shapes() {
        let temp = TempDir::new().unwrap();
        let txt = temp.path().join("file.txt");
        let dir = temp.path().join("dir1");
        std::fs::write(&txt, b"hello").unwrap();
        std::fs::create_dir(&dir).unwrap();

        let single = FileSet::new(vec![txt.clone()]);
        assert!(Datatype::PlainText.cast_fileset(single.clone()).await.is_ok());
        assert!(Datatype::File.cast_fileset(single.clone()).await.is_ok());
        assert!(Datatype::Directory.cast_fileset(single).await.is_err());

        let folder = FileSet::new(vec![dir.clone()]);
        assert!(Datatype::Directory.cast_fileset(folder).await.is_ok());

        let both = FileSet::new(vec![txt, dir]);
        assert!(Datatype::File.cast_fileset(both.clone()).await.is_err());
        assert!(Datatype::FileSet.cast_fileset(both).await.is_ok());
        assert!(Datatype::FileSet.cast_fileset(FileSet::new(vec![])).await.is_err());
    }
}
