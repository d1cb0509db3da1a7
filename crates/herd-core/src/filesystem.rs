//! Inode tables — the file-system view shared by images and subs.
//!
//! A [`FileSystem`] is flat: an inode table keyed by inode number plus an
//! ordered `path → inode number` map. Hardlinks are several paths sharing
//! one inode number. Paths are absolute and `/` is the root directory.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::hash::Hash;

pub type InodeNumber = u64;

/// Regular file backed by an object in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegularInode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    #[serde(default)]
    pub mtime_seconds: i64,
    #[serde(default)]
    pub mtime_nanos: u32,
    pub size: u64,
    /// Zero hash when `size == 0`.
    pub hash: Hash,
}

impl RegularInode {
    /// True when the file's content exists as an object somewhere.
    pub fn is_materialised(&self) -> bool {
        self.size > 0
    }
}

/// Regular file whose content is generated per machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputedInode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Name of the generator that produces the content.
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkInode {
    pub uid: u32,
    pub gid: u32,
    pub target: String,
}

/// Device nodes, FIFOs and sockets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialInode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    #[serde(default)]
    pub mtime_seconds: i64,
    #[serde(default)]
    pub mtime_nanos: u32,
    #[serde(default)]
    pub rdev: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryInode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inode {
    Regular(RegularInode),
    Computed(ComputedInode),
    Symlink(SymlinkInode),
    Special(SpecialInode),
    Directory(DirectoryInode),
}

impl Inode {
    pub fn kind(&self) -> &'static str {
        match self {
            Inode::Regular(_) => "regular",
            Inode::Computed(_) => "computed",
            Inode::Symlink(_) => "symlink",
            Inode::Special(_) => "special",
            Inode::Directory(_) => "directory",
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Inode::Directory(_))
    }

    /// Hash of a regular inode's content if it has any.
    pub fn materialised_hash(&self) -> Option<Hash> {
        match self {
            Inode::Regular(r) if r.is_materialised() => Some(r.hash),
            _ => None,
        }
    }

    /// Whether two inodes hold the same content and type, ignoring metadata.
    pub fn same_content(&self, other: &Inode) -> bool {
        match (self, other) {
            (Inode::Regular(a), Inode::Regular(b)) => a.size == b.size && a.hash == b.hash,
            (Inode::Symlink(a), Inode::Symlink(b)) => a.target == b.target,
            (Inode::Special(a), Inode::Special(b)) => {
                a.rdev == b.rdev && (a.mode & MODE_TYPE_MASK) == (b.mode & MODE_TYPE_MASK)
            }
            (Inode::Directory(_), Inode::Directory(_)) => true,
            (Inode::Computed(a), Inode::Computed(b)) => a.source == b.source,
            _ => false,
        }
    }

    /// Whether two inodes of the same content differ in metadata.
    pub fn same_metadata(&self, other: &Inode) -> bool {
        match (self, other) {
            (Inode::Regular(a), Inode::Regular(b)) => {
                a.mode == b.mode
                    && a.uid == b.uid
                    && a.gid == b.gid
                    && a.mtime_seconds == b.mtime_seconds
                    && a.mtime_nanos == b.mtime_nanos
            }
            (Inode::Symlink(a), Inode::Symlink(b)) => a.uid == b.uid && a.gid == b.gid,
            (Inode::Special(a), Inode::Special(b)) => {
                a.mode == b.mode
                    && a.uid == b.uid
                    && a.gid == b.gid
                    && a.mtime_seconds == b.mtime_seconds
                    && a.mtime_nanos == b.mtime_nanos
            }
            (Inode::Directory(a), Inode::Directory(b)) => {
                a.mode == b.mode && a.uid == b.uid && a.gid == b.gid
            }
            (Inode::Computed(a), Inode::Computed(b)) => {
                a.mode == b.mode && a.uid == b.uid && a.gid == b.gid
            }
            _ => false,
        }
    }

    /// True if `other` differs from `self` in something besides mtime.
    pub fn differs_beyond_mtime(&self, other: &Inode) -> bool {
        match (self, other) {
            (Inode::Regular(a), Inode::Regular(b)) => {
                a.mode != b.mode || a.uid != b.uid || a.gid != b.gid
            }
            (Inode::Special(a), Inode::Special(b)) => {
                a.mode != b.mode || a.uid != b.uid || a.gid != b.gid
            }
            _ => !self.same_metadata(other),
        }
    }
}

/// File type bits of a Unix mode.
pub const MODE_TYPE_MASK: u32 = 0o170000;

/// A flat inode table with an ordered path index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystem {
    pub inodes: BTreeMap<InodeNumber, Inode>,
    pub paths: BTreeMap<String, InodeNumber>,
}

impl FileSystem {
    /// An empty file-system holding only a root directory.
    pub fn new() -> Self {
        let mut fs = Self::default();
        fs.insert(
            "/",
            Inode::Directory(DirectoryInode {
                mode: 0o040755,
                uid: 0,
                gid: 0,
            }),
        );
        fs
    }

    /// Insert `inode` at `path` under a freshly allocated inode number.
    pub fn insert(&mut self, path: &str, inode: Inode) -> InodeNumber {
        let number = self.inodes.keys().next_back().map_or(1, |n| n + 1);
        self.inodes.insert(number, inode);
        self.paths.insert(path.to_string(), number);
        number
    }

    /// Add `path` as a hardlink to the inode already at `existing`.
    pub fn link(&mut self, path: &str, existing: &str) -> CoreResult<InodeNumber> {
        let number = *self.paths.get(existing).ok_or_else(|| {
            CoreError::InconsistentFileSystem(format!("link source {existing} not found"))
        })?;
        self.paths.insert(path.to_string(), number);
        Ok(number)
    }

    pub fn get(&self, path: &str) -> Option<&Inode> {
        self.paths.get(path).and_then(|n| self.inodes.get(n))
    }

    pub fn inode_number(&self, path: &str) -> Option<InodeNumber> {
        self.paths.get(path).copied()
    }

    pub fn num_inodes(&self) -> usize {
        self.inodes.len()
    }

    /// Hashes of every regular inode with content.
    pub fn materialised_hashes(&self) -> impl Iterator<Item = Hash> + '_ {
        self.inodes.values().filter_map(Inode::materialised_hash)
    }

    /// Computed inodes by path.
    pub fn computed_inodes(&self) -> impl Iterator<Item = (&str, &ComputedInode)> + '_ {
        self.paths.iter().filter_map(|(path, n)| match self.inodes.get(n) {
            Some(Inode::Computed(c)) => Some((path.as_str(), c)),
            _ => None,
        })
    }

    /// All paths per inode number, in path order.
    pub fn inode_to_filenames(&self) -> BTreeMap<InodeNumber, Vec<String>> {
        let mut out: BTreeMap<InodeNumber, Vec<String>> = BTreeMap::new();
        for (path, number) in &self.paths {
            out.entry(*number).or_default().push(path.clone());
        }
        out
    }

    /// Validate that the path index and inode table agree.
    pub fn check_consistency(&self) -> CoreResult<()> {
        match self.get("/") {
            Some(inode) if inode.is_directory() => {}
            _ => {
                return Err(CoreError::InconsistentFileSystem(
                    "missing root directory".into(),
                ));
            }
        }
        for (path, number) in &self.paths {
            if !path.starts_with('/') {
                return Err(CoreError::InconsistentFileSystem(format!(
                    "relative path {path}"
                )));
            }
            if !self.inodes.contains_key(number) {
                return Err(CoreError::InconsistentFileSystem(format!(
                    "{path} refers to missing inode {number}"
                )));
            }
            if path == "/" {
                continue;
            }
            let parent = parent_path(path);
            match self.get(parent) {
                Some(inode) if inode.is_directory() => {}
                _ => {
                    return Err(CoreError::InconsistentFileSystem(format!(
                        "{path} has no parent directory"
                    )));
                }
            }
        }
        let referenced: std::collections::BTreeSet<_> = self.paths.values().collect();
        if let Some(orphan) = self.inodes.keys().find(|n| !referenced.contains(n)) {
            return Err(CoreError::InconsistentFileSystem(format!(
                "inode {orphan} has no path"
            )));
        }
        for (number, names) in self.inode_to_filenames() {
            if names.len() > 1 && self.inodes.get(&number).is_some_and(Inode::is_directory) {
                return Err(CoreError::InconsistentFileSystem(format!(
                    "directory hardlinked at {}",
                    names.join(", ")
                )));
            }
        }
        Ok(())
    }
}

/// Parent directory of an absolute path (`/` for top-level entries).
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regular(size: u64, data: &[u8]) -> Inode {
        Inode::Regular(RegularInode {
            mode: 0o100644,
            uid: 0,
            gid: 0,
            mtime_seconds: 0,
            mtime_nanos: 0,
            size,
            hash: if size == 0 { Hash::ZERO } else { Hash::of(data) },
        })
    }

    fn dir() -> Inode {
        Inode::Directory(DirectoryInode {
            mode: 0o040755,
            uid: 0,
            gid: 0,
        })
    }

    #[test]
    fn new_filesystem_is_consistent() {
        let fs = FileSystem::new();
        fs.check_consistency().unwrap();
        assert_eq!(fs.num_inodes(), 1);
    }

    #[test]
    fn hardlinks_share_inode() {
        let mut fs = FileSystem::new();
        fs.insert("/bin", dir());
        let n = fs.insert("/bin/a", regular(10, b"a"));
        assert_eq!(fs.link("/bin/b", "/bin/a").unwrap(), n);
        fs.check_consistency().unwrap();
        let names = fs.inode_to_filenames();
        assert_eq!(names[&n], vec!["/bin/a".to_string(), "/bin/b".to_string()]);
        assert_eq!(fs.materialised_hashes().count(), 1);
    }

    #[test]
    fn missing_parent_is_inconsistent() {
        let mut fs = FileSystem::new();
        fs.insert("/etc/passwd", regular(1, b"x"));
        assert!(fs.check_consistency().is_err());
    }

    #[test]
    fn empty_files_are_not_materialised() {
        let mut fs = FileSystem::new();
        fs.insert("/empty", regular(0, b""));
        assert_eq!(fs.materialised_hashes().count(), 0);
    }

    #[test]
    fn parent_of_paths() {
        assert_eq!(parent_path("/a"), "/");
        assert_eq!(parent_path("/a/b/c"), "/a/b");
    }

    #[test]
    fn mtime_only_change_is_not_significant() {
        let a = regular(4, b"abcd");
        let mut b = a.clone();
        if let Inode::Regular(r) = &mut b {
            r.mtime_seconds = 99;
        }
        assert!(!a.same_metadata(&b));
        assert!(!a.differs_beyond_mtime(&b));
        if let Inode::Regular(r) = &mut b {
            r.mode = 0o100755;
        }
        assert!(a.differs_beyond_mtime(&b));
    }
}
