use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::core::Hash32;
use crate::error::StoreError;

use super::{Derivation, PathInfo, Store, StorePath, hash_derivation_modulo};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Store kept in a plain directory.
///
/// Objects live directly under the store directory, the validity registry is
/// one JSON file per object in `.kiln-db/`. Entries are written to a temporary
/// file and renamed into place, so a concurrent reader sees either the whole
/// entry or none of it.
#[derive(Debug, Clone)]
pub struct LocalStore {
    dir: Utf8PathBuf,
    db: Utf8PathBuf,
}

impl LocalStore {
    pub fn open(dir: &Utf8Path) -> Result<Self, StoreError> {
        let db = dir.join(".kiln-db");
        fs::create_dir_all(&db).map_err(|e| StoreError::io(&db, e))?;

        Ok(Self {
            dir: dir.to_owned(),
            db,
        })
    }

    fn entry_path(&self, path: &StorePath) -> Utf8PathBuf {
        self.db.join(format!("{}.json", path.hash_part()))
    }

    /// A unique sibling of `path` to write into before renaming.
    pub(crate) fn temp_path(path: &Utf8Path) -> Utf8PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = path.file_name().unwrap_or("object");
        path.with_file_name(format!(".{name}.{}.{n}.tmp", std::process::id()))
    }

    /// Adds a regular file with the given contents. The path depends on the
    /// name, the contents and the references.
    pub fn add_text(
        &self,
        name: &str,
        contents: impl AsRef<[u8]>,
        references: impl IntoIterator<Item = StorePath>,
    ) -> Result<StorePath, StoreError> {
        let contents = contents.as_ref();
        let references: BTreeSet<StorePath> = references.into_iter().collect();

        let mut hasher = blake3::Hasher::new();
        hasher.update(b"text\0");
        hasher.update(name.as_bytes());
        hasher.update(b"\0");
        hasher.update(contents);
        for reference in &references {
            hasher.update(b"\0");
            hasher.update(reference.as_str().as_bytes());
        }

        let path = StorePath::from_parts(hasher.finalize().into(), name)?;
        self.add_file(&path, contents, references)?;
        Ok(path)
    }

    /// Assigns output paths to `drv`, writes it to the store and registers
    /// it. Returns the path of the `.drv` file.
    pub fn add_derivation(&self, mut drv: Derivation) -> Result<StorePath, StoreError> {
        let modulo = hash_derivation_modulo(self, &drv)?;
        drv.assign_outputs(modulo)?;

        let bytes = serde_json::to_vec_pretty(&drv)?;
        let path = StorePath::from_parts(Hash32::hash(&bytes), &format!("{}.drv", drv.name))?;

        let references = drv.input_drvs.union(&drv.input_srcs).cloned().collect();
        self.add_file(&path, &bytes, references)?;
        Ok(path)
    }

    fn add_file(
        &self,
        path: &StorePath,
        contents: &[u8],
        references: BTreeSet<StorePath>,
    ) -> Result<(), StoreError> {
        if self.is_valid_path(path)? {
            return Ok(());
        }

        let real = self.to_real_path(path);
        let temp = Self::temp_path(&real);
        fs::write(&temp, contents).map_err(|e| StoreError::io(&temp, e))?;
        fs::rename(&temp, &real).map_err(|e| StoreError::io(&real, e))?;

        self.register_valid_path(PathInfo {
            path: path.clone(),
            nar_hash: Hash32::hash_path(&real).map_err(|e| StoreError::io(&real, e))?,
            nar_size: contents.len() as u64,
            references,
            deriver: None,
        })
    }
}

impl Store for LocalStore {
    fn store_dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn query_path_info(&self, path: &StorePath) -> Result<Option<PathInfo>, StoreError> {
        let entry = self.entry_path(path);

        let data = match fs::read(&entry) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&entry, e)),
        };

        let info: PathInfo = serde_json::from_slice(&data).map_err(|e| StoreError::Corrupt {
            path: path.to_string(),
            reason: e.to_string(),
        })?;

        // Same hash part, different object
        if &info.path != path {
            return Ok(None);
        }

        if fs::symlink_metadata(self.to_real_path(path)).is_err() {
            return Err(StoreError::Corrupt {
                path: path.to_string(),
                reason: "registered as valid but missing on disk".into(),
            });
        }

        Ok(Some(info))
    }

    fn register_valid_path(&self, info: PathInfo) -> Result<(), StoreError> {
        debug!("registering '{}' as valid", info.path);

        let entry = self.entry_path(&info.path);
        let temp = Self::temp_path(&entry);

        fs::write(&temp, serde_json::to_vec(&info)?).map_err(|e| StoreError::io(&temp, e))?;
        fs::rename(&temp, &entry).map_err(|e| StoreError::io(&entry, e))?;
        Ok(())
    }

    fn read_derivation(&self, drv: &StorePath) -> Result<Derivation, StoreError> {
        if !self.is_valid_path(drv)? {
            return Err(StoreError::MissingDerivation(drv.clone()));
        }

        let real = self.to_real_path(drv);
        let data = fs::read(&real).map_err(|e| StoreError::io(&real, e))?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, LocalStore::open(&root).unwrap())
    }

    #[test]
    fn test_add_text_registers_path() {
        let (_dir, store) = store();

        let path = store.add_text("greeting", "hello", []).unwrap();
        let info = store.query_path_info(&path).unwrap().unwrap();

        assert_eq!(info.path, path);
        assert_eq!(info.nar_size, 5);
        assert_eq!(fs::read_to_string(store.to_real_path(&path)).unwrap(), "hello");

        // Adding again is a no-op
        assert_eq!(store.add_text("greeting", "hello", []).unwrap(), path);
    }

    #[test]
    fn test_unknown_path_is_invalid() {
        let (_dir, store) = store();
        let path = StorePath::from_parts(Hash32::hash("nothing"), "nothing").unwrap();

        assert!(!store.is_valid_path(&path).unwrap());
        assert!(matches!(
            store.read_derivation(&path),
            Err(StoreError::MissingDerivation(_))
        ));
    }

    #[test]
    fn test_missing_object_is_corrupt() {
        let (_dir, store) = store();
        let path = store.add_text("gone", "data", []).unwrap();

        fs::remove_file(store.to_real_path(&path)).unwrap();

        assert!(matches!(
            store.query_path_info(&path),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_garbled_entry_is_corrupt() {
        let (_dir, store) = store();
        let path = store.add_text("garbled", "data", []).unwrap();

        fs::write(store.entry_path(&path), "{ not json").unwrap();

        assert!(matches!(
            store.query_path_info(&path),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_derivation_references_inputs() {
        let (_dir, store) = store();

        let src = store.add_text("src", "echo", []).unwrap();
        let dep = store.add_derivation(Derivation::new("dep", "/bin/sh")).unwrap();
        let drv = Derivation::new("top", "/bin/sh").input_src(src.clone()).input_drv(dep.clone());
        let drv = store.add_derivation(drv).unwrap();

        let info = store.query_path_info(&drv).unwrap().unwrap();
        assert_eq!(info.references, [src, dep].into_iter().collect());
    }
}
