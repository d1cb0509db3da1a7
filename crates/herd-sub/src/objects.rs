//! The sub's object cache: content-addressed files fanned out by hash.
//!
//! Objects live at `aa/bb/rest-of-hex`, the same layout the applier reads
//! from. Anything else under the directory (update copies named
//! `<object>~N~`, the temporary hardlink, half-written files) is ignored
//! when listing.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use herd_core::Hash;

use crate::error::{SubError, SubResult};

const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone)]
pub struct ObjectCache {
    dir: PathBuf,
}

impl ObjectCache {
    /// Open the cache at `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> SubResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| SubError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, hash: &Hash) -> PathBuf {
        self.dir.join(hash.object_filename())
    }

    pub async fn contains(&self, hash: &Hash) -> bool {
        tokio::fs::try_exists(self.path(hash))
            .await
            .unwrap_or(false)
    }

    /// Store `data` as object `hash`. The content must hash to `hash`.
    pub async fn add(&self, hash: Hash, data: &[u8]) -> SubResult<()> {
        let actual = Hash::of(data);
        if actual != hash {
            return Err(SubError::HashMismatch {
                expected: hash,
                actual,
            });
        }
        let path = self.path(&hash);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SubError::io(parent, e))?;
        }
        let mut partial = path.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);
        tokio::fs::write(&partial, data)
            .await
            .map_err(|e| SubError::io(&partial, e))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| SubError::io(&path, e))
    }

    /// Remove object `hash`. Returns false if it was not cached.
    pub async fn remove(&self, hash: &Hash) -> SubResult<bool> {
        let path = self.path(hash);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SubError::io(&path, e)),
        }
    }

    /// Every cached object, in hash order.
    pub fn list(&self) -> SubResult<Vec<Hash>> {
        let mut hashes = Vec::new();
        for (first, first_path) in fan_out(&self.dir)? {
            for (second, second_path) in fan_out(&first_path)? {
                let entries =
                    fs::read_dir(&second_path).map_err(|e| SubError::io(&second_path, e))?;
                for entry in entries {
                    let entry = entry.map_err(|e| SubError::io(&second_path, e))?;
                    let Some(rest) = entry.file_name().to_str().map(str::to_string) else {
                        continue;
                    };
                    if let Ok(hash) = format!("{first}{second}{rest}").parse::<Hash>() {
                        hashes.push(hash);
                    }
                }
            }
        }
        hashes.sort();
        Ok(hashes)
    }
}

/// Two-character subdirectories of `dir`.
fn fan_out(dir: &Path) -> SubResult<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(SubError::io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| SubError::io(dir, e))?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.len() == 2 && entry.file_type().is_ok_and(|t| t.is_dir()) {
            out.push((name, entry.path()));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (tempfile::TempDir, ObjectCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectCache::open(dir.path().join("objects")).unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn added_objects_are_listed_until_removed() {
        let (_dir, cache) = cache();
        let a = Hash::of(b"alpha");
        let b = Hash::of(b"beta");
        cache.add(a, b"alpha").await.unwrap();
        cache.add(b, b"beta").await.unwrap();

        let mut want = vec![a, b];
        want.sort();
        assert_eq!(cache.list().unwrap(), want);
        assert!(cache.contains(&a).await);

        assert!(cache.remove(&a).await.unwrap());
        assert!(!cache.remove(&a).await.unwrap());
        assert_eq!(cache.list().unwrap(), vec![b]);
        assert_eq!(
            fs::read(cache.dir().join(b.object_filename())).unwrap(),
            b"beta"
        );
    }

    #[tokio::test]
    async fn content_must_match_its_hash() {
        let (_dir, cache) = cache();
        let err = cache.add(Hash::of(b"alpha"), b"beta").await.unwrap_err();
        assert!(matches!(err, SubError::HashMismatch { .. }));
        assert!(cache.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_leftovers_are_not_objects() {
        let (_dir, cache) = cache();
        let a = Hash::of(b"alpha");
        cache.add(a, b"alpha").await.unwrap();
        let object = cache.dir().join(a.object_filename());
        let mut copy = object.clone().into_os_string();
        copy.push("~1~");
        fs::write(copy, b"alpha").unwrap();
        let mut partial = object.into_os_string();
        partial.push(PARTIAL_SUFFIX);
        fs::write(partial, b"alp").unwrap();
        fs::write(cache.dir().join("temporaryHardlink"), b"").unwrap();

        assert_eq!(cache.list().unwrap(), vec![a]);
    }

    #[test]
    fn missing_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectCache {
            dir: dir.path().join("gone"),
        };
        assert!(cache.list().unwrap().is_empty());
    }
}
