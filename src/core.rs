use std::fmt::{Debug, Display};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::str::FromStr;

use camino::Utf8Path;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A 32-byte BLAKE3 hash used for content addressing.
///
/// In `kiln` this serves three purposes:
/// 1. It names store objects: the hash part of every [`StorePath`] is a
///    truncated `Hash32`.
/// 2. It fingerprints the contents of a store object (see [`Hash32::hash_path`])
///    so copies from substituters can be verified.
/// 3. It turns arbitrary lock keys into safe file names.
///
/// [`StorePath`]: crate::store::StorePath
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Hashes the contents of a single file, memory-mapped and in parallel
    /// when it is large enough to pay off.
    pub fn hash_file(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    /// Hashes a file system tree rooted at `path`.
    ///
    /// Directory entries are visited in sorted order and every entry
    /// contributes its name, its type, the executable bit and its contents,
    /// so two trees hash equal iff they would serialise to the same archive.
    /// Symlinks are not followed.
    pub fn hash_path(path: &Utf8Path) -> io::Result<Self> {
        let mut hasher = blake3::Hasher::new();
        hash_tree(&mut hasher, path)?;
        Ok(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

fn hash_tree(hasher: &mut blake3::Hasher, path: &Utf8Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    let kind = meta.file_type();

    if kind.is_symlink() {
        let target = fs::read_link(path)?;
        hasher.update(b"symlink\0");
        hasher.update(target.as_os_str().as_encoded_bytes());
        hasher.update(b"\0");
    } else if kind.is_dir() {
        hasher.update(b"directory\0");

        let mut names = Vec::new();
        for entry in path.read_dir_utf8()? {
            names.push(entry?.file_name().to_owned());
        }
        names.sort();

        for name in names {
            hasher.update(b"entry\0");
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
            hash_tree(hasher, &path.join(&name))?;
        }

        hasher.update(b"end\0");
    } else {
        let executable = meta.permissions().mode() & 0o111 != 0;
        hasher.update(if executable {
            b"executable\0".as_slice()
        } else {
            b"regular\0".as_slice()
        });
        hasher.update(&meta.len().to_le_bytes());
        hasher.update(Hash32::hash_file(path)?.as_bytes());
    }

    Ok(())
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid hash '{0}'")]
pub struct ParseHashError(String);

impl FromStr for Hash32 {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 64 {
            return Err(ParseHashError(s.to_string()));
        }

        let nibble = |c: u8| match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            _ => None,
        };

        let mut out = [0u8; 32];
        for (i, pair) in bytes.chunks_exact(2).enumerate() {
            match (nibble(pair[0]), nibble(pair[1])) {
                (Some(hi), Some(lo)) => out[i] = (hi << 4) | lo,
                _ => return Err(ParseHashError(s.to_string())),
            }
        }

        Ok(Hash32(out))
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_hex_parse() {
        let hash = Hash32::hash("hello");
        let hex = hash.to_hex();

        assert_eq!(hex.len(), 64);
        assert_eq!(hex.parse::<Hash32>().unwrap(), hash);
        assert!("xyz".parse::<Hash32>().is_err());
        assert!(hex.to_uppercase().parse::<Hash32>().is_err());
    }

    #[test]
    fn test_serde_as_hex() {
        let hash = Hash32::hash("abc");
        let json = serde_json::to_string(&hash).unwrap();

        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        assert_eq!(serde_json::from_str::<Hash32>(&json).unwrap(), hash);
    }

    #[test]
    fn test_hash_file_matches_buffer_hash() {
        let (_guard, root) = tempdir();

        let big = root.join("big");
        let data = vec![7u8; 3 * 1024 * 1024];
        fs::write(&big, &data).unwrap();
        assert_eq!(Hash32::hash_file(&big).unwrap(), Hash32::hash(&data));

        let empty = root.join("empty");
        fs::write(&empty, "").unwrap();
        assert_eq!(Hash32::hash_file(&empty).unwrap(), Hash32::hash(""));
    }

    #[test]
    fn test_hash_path_tracks_contents_and_names() {
        let (_guard, root) = tempdir();

        let a = root.join("a");
        fs::create_dir_all(a.join("sub")).unwrap();
        fs::write(a.join("sub/file"), "data").unwrap();

        let b = root.join("b");
        fs::create_dir_all(b.join("sub")).unwrap();
        fs::write(b.join("sub/file"), "data").unwrap();

        // Identical trees at different locations
        assert_eq!(Hash32::hash_path(&a).unwrap(), Hash32::hash_path(&b).unwrap());

        // Renaming an entry changes the hash
        fs::rename(b.join("sub/file"), b.join("sub/other")).unwrap();
        assert_ne!(Hash32::hash_path(&a).unwrap(), Hash32::hash_path(&b).unwrap());

        // And the contents of a file
        let before = Hash32::hash_path(&a).unwrap();
        fs::write(a.join("sub/file"), "date").unwrap();
        assert_ne!(before, Hash32::hash_path(&a).unwrap());

        // So does the executable bit
        let single = root.join("single");
        fs::write(&single, "x").unwrap();
        let before = Hash32::hash_path(&single).unwrap();
        fs::set_permissions(&single, fs::Permissions::from_mode(0o755)).unwrap();
        assert_ne!(before, Hash32::hash_path(&single).unwrap());
    }
}
