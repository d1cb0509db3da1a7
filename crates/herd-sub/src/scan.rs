//! Walking a root directory into a [`FileSystem`].
//!
//! Entries are visited in name order, parents before children, so an
//! unchanged tree scans to an identical inode table. Hardlinked
//! non-directories share one inode. The sub's private directory and
//! anything matching the exclusions are left out.

use std::collections::HashMap;
use std::fs::{self, Metadata};
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use herd_applier::mutate::SUBD_DIRECTORY;
use herd_core::{
    DirectoryInode, FileSystem, Filter, Hash, Inode, RegularInode, SpecialInode, SymlinkInode,
};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{SubError, SubResult};

type InodeKey = (u64, u64);

#[derive(Debug, Clone, PartialEq, Eq)]
struct Stamp {
    size: u64,
    mtime: (i64, i64),
    ctime: (i64, i64),
}

impl Stamp {
    fn of(meta: &Metadata) -> Self {
        Self {
            size: meta.size(),
            mtime: (meta.mtime(), meta.mtime_nsec()),
            ctime: (meta.ctime(), meta.ctime_nsec()),
        }
    }
}

/// Content hashes from the previous scan, so unchanged files are not
/// read again.
#[derive(Debug, Default)]
pub struct ScanCache {
    hashes: HashMap<InodeKey, (Stamp, Hash)>,
}

impl ScanCache {
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// Scan everything beneath `root`.
pub fn scan_root(root: &Path, exclusions: &Filter, cache: &mut ScanCache) -> SubResult<FileSystem> {
    let mut scanner = Scanner {
        previous: &cache.hashes,
        hashes: HashMap::new(),
        linked: HashMap::new(),
        fs: FileSystem::default(),
    };
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| match tree_path(root, entry.path()) {
            Some(name) => name != SUBD_DIRECTORY && !exclusions.is_match(&name),
            None => true,
        });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.io_error().is_some_and(|io| io.kind() == ErrorKind::NotFound) => continue,
            Err(e) => {
                let path = e.path().unwrap_or(root).to_path_buf();
                return Err(SubError::io(path, e.into()));
            }
        };
        let name = tree_path(root, entry.path())
            .ok_or_else(|| SubError::NonUtf8Path(entry.path().display().to_string()))?;
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) if e.io_error().is_some_and(|io| io.kind() == ErrorKind::NotFound) => continue,
            Err(e) => return Err(SubError::io(entry.path(), e.into())),
        };
        scanner.add(&name, entry.path(), &meta)?;
    }
    let Scanner { fs, hashes, .. } = scanner;
    debug!(inodes = fs.num_inodes(), hashed = hashes.len(), "scanned root");
    cache.hashes = hashes;
    Ok(fs)
}

/// `path` as an absolute name inside the tree rooted at `root`.
fn tree_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?.to_str()?;
    Some(format!("/{relative}"))
}

struct Scanner<'a> {
    previous: &'a HashMap<InodeKey, (Stamp, Hash)>,
    hashes: HashMap<InodeKey, (Stamp, Hash)>,
    /// First path seen for each multiply-linked inode.
    linked: HashMap<InodeKey, String>,
    fs: FileSystem,
}

impl Scanner<'_> {
    fn add(&mut self, name: &str, path: &Path, meta: &Metadata) -> SubResult<()> {
        if meta.is_dir() {
            self.fs.insert(name, directory(meta));
            return Ok(());
        }
        let key = (meta.dev(), meta.ino());
        if meta.nlink() > 1 {
            if let Some(first) = self.linked.get(&key) {
                self.fs.link(name, first)?;
                return Ok(());
            }
            self.linked.insert(key, name.to_string());
        }
        if let Some(inode) = self.inode(path, meta, key)? {
            self.fs.insert(name, inode);
        }
        Ok(())
    }

    /// Build the inode for a non-directory. `None` if it vanished mid-scan.
    fn inode(&mut self, path: &Path, meta: &Metadata, key: InodeKey) -> SubResult<Option<Inode>> {
        let file_type = meta.file_type();
        if file_type.is_symlink() {
            let target = match fs::read_link(path) {
                Ok(target) => target,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(SubError::io(path, e)),
            };
            let target = target
                .into_os_string()
                .into_string()
                .map_err(|_| SubError::NonUtf8Path(path.display().to_string()))?;
            return Ok(Some(Inode::Symlink(SymlinkInode {
                uid: meta.uid(),
                gid: meta.gid(),
                target,
            })));
        }
        if !file_type.is_file() {
            return Ok(Some(Inode::Special(SpecialInode {
                mode: meta.mode(),
                uid: meta.uid(),
                gid: meta.gid(),
                mtime_seconds: meta.mtime(),
                mtime_nanos: meta.mtime_nsec() as u32,
                rdev: meta.rdev(),
            })));
        }
        let Some(hash) = self.hash(path, meta, key)? else {
            return Ok(None);
        };
        Ok(Some(Inode::Regular(RegularInode {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            mtime_seconds: meta.mtime(),
            mtime_nanos: meta.mtime_nsec() as u32,
            size: meta.size(),
            hash,
        })))
    }

    fn hash(&mut self, path: &Path, meta: &Metadata, key: InodeKey) -> SubResult<Option<Hash>> {
        if meta.size() == 0 {
            return Ok(Some(Hash::ZERO));
        }
        let stamp = Stamp::of(meta);
        let hash = match self.previous.get(&key) {
            Some((seen, hash)) if *seen == stamp => *hash,
            _ => match fs::read(path) {
                Ok(data) => Hash::of(&data),
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(SubError::io(path, e)),
            },
        };
        self.hashes.insert(key, (stamp, hash));
        Ok(Some(hash))
    }
}

fn directory(meta: &Metadata) -> Inode {
    Inode::Directory(DirectoryInode {
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
    })
}
