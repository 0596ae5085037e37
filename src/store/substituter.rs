use std::fs;
use std::io;

use anyhow::{anyhow, bail};
use camino::{Utf8Path, Utf8PathBuf};

use crate::core::Hash32;
use crate::error::StoreError;

use super::{LocalStore, PathInfo, Store, StorePath, copy_tree, remove_tree};

/// A source of prebuilt store objects.
pub trait Substituter: Send + Sync {
    fn uri(&self) -> String;

    /// `Ok(None)` when the substituter does not have the path.
    fn query_path_info(&self, path: &StorePath) -> anyhow::Result<Option<PathInfo>>;

    /// Materialises `path` at `dest`, which does not exist yet.
    fn copy_path(&self, path: &StorePath, dest: &Utf8Path) -> anyhow::Result<()>;
}

/// Binary cache in a local directory: `<hash part>.json` holds the path info,
/// the object tree sits next to it under its full name.
#[derive(Debug, Clone)]
pub struct LocalCache {
    dir: Utf8PathBuf,
}

impl LocalCache {
    pub fn open(dir: &Utf8Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        Ok(Self {
            dir: dir.to_owned(),
        })
    }

    fn info_path(&self, path: &StorePath) -> Utf8PathBuf {
        self.dir.join(format!("{}.json", path.hash_part()))
    }

    /// Copies a valid path of `store` into the cache.
    pub fn publish(&self, store: &dyn Store, path: &StorePath) -> Result<(), StoreError> {
        let info = store
            .query_path_info(path)?
            .ok_or_else(|| StoreError::NotValid(path.clone()))?;

        let dest = self.dir.join(path.as_str());
        if !dest.exists() {
            let temp = LocalStore::temp_path(&dest);
            copy_tree(store.to_real_path(path).as_std_path(), temp.as_std_path())
                .map_err(|e| StoreError::io(&temp, e))?;
            fs::rename(&temp, &dest).map_err(|e| StoreError::io(&dest, e))?;
        }

        let entry = self.info_path(path);
        fs::write(&entry, serde_json::to_vec(&info)?).map_err(|e| StoreError::io(&entry, e))?;
        Ok(())
    }
}

impl Substituter for LocalCache {
    fn uri(&self) -> String {
        format!("file://{}", self.dir)
    }

    fn query_path_info(&self, path: &StorePath) -> anyhow::Result<Option<PathInfo>> {
        let entry = self.info_path(path);

        let data = match fs::read(&entry) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(anyhow!("Couldn't read '{entry}'.\n{e}")),
        };

        let info: PathInfo = serde_json::from_slice(&data)?;
        Ok((&info.path == path).then_some(info))
    }

    fn copy_path(&self, path: &StorePath, dest: &Utf8Path) -> anyhow::Result<()> {
        let Some(info) = Substituter::query_path_info(self, path)? else {
            bail!("'{path}' is not available from {}", self.uri());
        };

        let src = self.dir.join(path.as_str());
        copy_tree(src.as_std_path(), dest.as_std_path())
            .map_err(|e| anyhow!("Couldn't copy '{src}' to '{dest}'.\n{e}"))?;

        let actual = Hash32::hash_path(dest)?;
        if actual != info.nar_hash {
            let _ = remove_tree(dest);
            bail!(
                "hash mismatch for '{path}' from {}: expected {}, got {actual}",
                self.uri(),
                info.nar_hash
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    #[test]
    fn test_publish_then_copy() {
        let (_guard, root) = dir();
        let store = LocalStore::open(&root.join("store")).unwrap();
        let cache = LocalCache::open(&root.join("cache")).unwrap();

        let path = store.add_text("payload", "contents", []).unwrap();
        cache.publish(&store, &path).unwrap();

        let info = Substituter::query_path_info(&cache, &path).unwrap().unwrap();
        assert_eq!(info.path, path);

        let dest = root.join("copy");
        cache.copy_path(&path, &dest).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "contents");
    }

    #[test]
    fn test_missing_path() {
        let (_guard, root) = dir();
        let cache = LocalCache::open(&root).unwrap();
        let path = StorePath::from_parts(Hash32::hash("absent"), "absent").unwrap();

        assert!(Substituter::query_path_info(&cache, &path).unwrap().is_none());
        assert!(cache.copy_path(&path, &root.join("dest")).is_err());
    }

    #[test]
    fn test_tampered_object_is_rejected() {
        let (_guard, root) = dir();
        let store = LocalStore::open(&root.join("store")).unwrap();
        let cache = LocalCache::open(&root.join("cache")).unwrap();

        let path = store.add_text("payload", "contents", []).unwrap();
        cache.publish(&store, &path).unwrap();
        fs::write(root.join("cache").join(path.as_str()), "evil").unwrap();

        let dest = root.join("copy");
        let err = cache.copy_path(&path, &dest).unwrap_err();
        assert!(err.to_string().contains("hash mismatch"));
        assert!(!dest.exists());
    }
}
