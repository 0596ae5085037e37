//! Store collaborators consumed by the scheduler.
//!
//! The scheduler only needs a handful of queries: is a path valid, what does
//! it reference, how do I read a derivation, where does a path live on disk.
//! [`Store`] captures exactly that; [`LocalStore`] is a small file-backed
//! implementation good enough to drive real builds and tests.

mod derivation;
mod local;
mod substituter;

use std::collections::{BTreeSet, VecDeque};
use std::fmt::{Debug, Display};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::StoreError;

pub use derivation::{Derivation, hash_derivation_modulo};
pub use local::LocalStore;
pub use substituter::{LocalCache, Substituter};

/// Number of hex characters in the hash part of a store path.
pub const HASH_PART_LEN: usize = 32;

/// Name of a store object: `<32 hex chars>-<name>`.
///
/// Cheap to clone, ordered by its textual form.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorePath(Arc<str>);

impl StorePath {
    pub fn new(s: &str) -> Result<Self, StoreError> {
        let invalid = || StoreError::InvalidPath(s.to_string());

        let (hash, name) = s.split_at_checked(HASH_PART_LEN).ok_or_else(invalid)?;
        let name = name.strip_prefix('-').ok_or_else(invalid)?;

        let hash_ok = hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !hash_ok || !valid_name(name) {
            return Err(invalid());
        }

        Ok(Self(Arc::from(s)))
    }

    /// Builds a path from a digest, keeping the first 16 bytes as hash part.
    pub fn from_parts(hash: Hash32, name: &str) -> Result<Self, StoreError> {
        let hex = hash.to_hex();
        Self::new(&format!("{}-{name}", &hex[..HASH_PART_LEN]))
    }

    pub fn hash_part(&self) -> &str {
        &self.0[..HASH_PART_LEN]
    }

    pub fn name(&self) -> &str {
        &self.0[HASH_PART_LEN + 1..]
    }

    pub fn is_derivation(&self) -> bool {
        self.name().ends_with(".drv")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name.len() <= 211
        && name
            .bytes()
            .all(|b| {
                b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.' | b'_' | b'?' | b'=')
            })
}

impl TryFrom<String> for StorePath {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<StorePath> for String {
    fn from(value: StorePath) -> Self {
        value.0.to_string()
    }
}

impl Display for StorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for StorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorePath({})", self.0)
    }
}

/// Metadata of a valid store object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathInfo {
    pub path: StorePath,
    pub nar_hash: Hash32,
    pub nar_size: u64,
    #[serde(default)]
    pub references: BTreeSet<StorePath>,
    #[serde(default)]
    pub deriver: Option<StorePath>,
}

pub trait Store: Send + Sync {
    fn store_dir(&self) -> &Utf8Path;

    /// `Ok(None)` when the path is not valid.
    fn query_path_info(&self, path: &StorePath) -> Result<Option<PathInfo>, StoreError>;

    fn is_valid_path(&self, path: &StorePath) -> Result<bool, StoreError> {
        Ok(self.query_path_info(path)?.is_some())
    }

    fn register_valid_path(&self, info: PathInfo) -> Result<(), StoreError>;

    fn read_derivation(&self, drv: &StorePath) -> Result<Derivation, StoreError>;

    fn to_real_path(&self, path: &StorePath) -> Utf8PathBuf {
        self.store_dir().join(path.as_str())
    }
}

/// Transitive references of `paths`, the paths themselves included.
pub fn compute_closure(
    store: &dyn Store,
    paths: impl IntoIterator<Item = StorePath>,
) -> Result<BTreeSet<StorePath>, StoreError> {
    let mut closure = BTreeSet::new();
    let mut queue: VecDeque<StorePath> = paths.into_iter().collect();

    while let Some(path) = queue.pop_front() {
        if !closure.insert(path.clone()) {
            continue;
        }

        let info = store
            .query_path_info(&path)?
            .ok_or_else(|| StoreError::NotValid(path.clone()))?;

        queue.extend(info.references.into_iter().filter(|r| !closure.contains(r)));
    }

    Ok(closure)
}

/// Copies a file system tree, preserving symlinks and permissions.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;

    if meta.file_type().is_symlink() {
        std::os::unix::fs::symlink(fs::read_link(src)?, dst)?;
    } else if meta.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        fs::set_permissions(dst, meta.permissions())?;
    } else {
        fs::copy(src, dst)?;
    }

    Ok(())
}

/// Removes whatever lives at `path`, if anything.
pub(crate) fn remove_tree(path: &Utf8Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
