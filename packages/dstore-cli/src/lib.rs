//! Data store backends for hierarchical datasets.
//!
//! A dataset is a tree of rows over a [`space::Space`]; rows hold file-set
//! and field entries in a primary namespace plus one derivative namespace per
//! analysis. [`storage::DataStore`] is the contract every backend implements;
//! [`storage::LocalStore`] keeps datasets in a directory tree and
//! [`storage::RemoteStore`] fronts a remote service with a checksum-validated
//! local cache.

pub mod datatype;
pub mod db;
pub mod definition;
pub mod entry;
pub mod error;
pub mod hash;
pub mod space;
pub mod storage;
pub mod tree;

pub use datatype::{Datatype, FieldValue, FileSet};
pub use entry::{DataEntry, EntryPath, Namespace};
pub use error::{StoreError, StoreResult};
pub use space::{Frequency, Space};
pub use storage::{DataStore, LocalStore, Provenance, RemoteStore};
pub use tree::{DataRow, DataTree, TreeOptions};
