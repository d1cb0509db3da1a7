//! herd-diff — pure comparisons between images and a sub's observed state.
//!
//! # Architecture
//!
//! ```text
//!   Image (required) ─┐
//!   Image (planned) ──┼──▶ build_missing_lists ──▶ MissingLists { fetch, push }
//!   SubView ──────────┘
//!
//!   Image + SubView ─────▶ build_update_request ──▶ UpdateRequest
//!                                                   │
//!                                   is_unsafe_update ◀┘
//! ```
//!
//! Nothing in this crate performs I/O. Every function is deterministic in
//! its inputs and safe to re-run each cycle.

pub mod checks;
pub mod error;
pub mod missing;
pub mod update;

use std::collections::BTreeMap;

use herd_core::{FileSystem, Hash, RegularInode};

pub use checks::{cleanup_candidates, has_enough_space, is_unsafe_update, space_needed};
pub use error::{DiffError, DiffResult};
pub use missing::{MissingLists, build_missing_lists};
pub use update::build_update_request;

/// What the herd knows about one sub, borrowed for a diff.
#[derive(Debug, Clone, Copy)]
pub struct SubView<'a> {
    pub hostname: &'a str,
    pub filesystem: &'a FileSystem,
    /// Per-machine content of computed files, by path.
    pub computed_inodes: &'a BTreeMap<String, RegularInode>,
    pub object_cache: &'a [Hash],
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use herd_core::{ComputedInode, DirectoryInode, Image, Inode};

    pub fn regular(data: &[u8]) -> RegularInode {
        RegularInode {
            mode: 0o100644,
            uid: 0,
            gid: 0,
            mtime_seconds: 0,
            mtime_nanos: 0,
            size: data.len() as u64,
            hash: if data.is_empty() {
                Hash::ZERO
            } else {
                Hash::of(data)
            },
        }
    }

    pub fn dir() -> Inode {
        Inode::Directory(DirectoryInode {
            mode: 0o040755,
            uid: 0,
            gid: 0,
        })
    }

    fn ensure_parents(fs: &mut FileSystem, path: &str) {
        let mut prefix = String::new();
        let parts: Vec<_> = path.trim_start_matches('/').split('/').collect();
        for part in &parts[..parts.len().saturating_sub(1)] {
            prefix.push('/');
            prefix.push_str(part);
            if fs.get(&prefix).is_none() {
                fs.insert(&prefix, dir());
            }
        }
    }

    /// A file-system holding regular files with the given content, plus
    /// whatever parent directories they need.
    pub fn fs_with(files: &[(&str, &[u8])]) -> FileSystem {
        let mut fs = FileSystem::new();
        for (path, data) in files {
            ensure_parents(&mut fs, path);
            fs.insert(path, Inode::Regular(regular(data)));
        }
        fs
    }

    pub fn image_with(files: &[(&str, &[u8])]) -> Image {
        Image::new(fs_with(files))
    }

    pub fn image_with_computed(path: &str) -> Image {
        let mut fs = FileSystem::new();
        ensure_parents(&mut fs, path);
        fs.insert(
            path,
            Inode::Computed(ComputedInode {
                mode: 0o100644,
                uid: 0,
                gid: 0,
                source: "hostname".into(),
            }),
        );
        Image::new(fs)
    }

    pub fn view<'a>(
        fs: &'a FileSystem,
        computed: &'a BTreeMap<String, RegularInode>,
        cache: &'a [Hash],
    ) -> SubView<'a> {
        SubView {
            hostname: "test-sub",
            filesystem: fs,
            computed_inodes: computed,
            object_cache: cache,
        }
    }
}
