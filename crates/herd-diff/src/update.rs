//! Update-request builder: the tree diff between an image and a sub.
//!
//! Paths are compared in pre-order (lexicographic path order, so a parent
//! always precedes its children). For each image path:
//!
//! * an inode number already seen at an earlier path becomes a hardlink,
//!   unless the sub already links the two paths;
//! * an absent path is made (directories and other inodes in separate
//!   batches);
//! * a path whose content or type differs is remade;
//! * a path with equal content but different metadata is changed.
//!
//! Sub paths missing from the image are deleted when the image manages
//! them, collapsing deleted subtrees to their top path. Content already on
//! the sub is copied into its object cache first so regular inodes can be
//! renamed out of the cache.

use std::collections::{BTreeMap, BTreeSet};

use herd_core::{
    FileToCopyToCache, Hardlink, Hash, Image, Inode, InodeChange, InodeNumber, RegularInode,
    UpdateRequest, parent_path,
};

use crate::SubView;
use crate::error::{DiffError, DiffResult};

/// Sub-private area that updates never touch.
pub const SUBD_DIRECTORY: &str = "/.subd";

/// Build the request that converges `sub` onto `image`.
///
/// The request's triggers are the image's triggers. Fails if a computed
/// file of the image has no known content for this sub.
pub fn build_update_request(
    sub: &SubView<'_>,
    image: &Image,
    image_name: &str,
) -> DiffResult<UpdateRequest> {
    let mut request = UpdateRequest {
        image_name: image_name.to_string(),
        triggers: image.triggers.clone(),
        ..Default::default()
    };
    let current = sub.filesystem;
    let mut first_path: BTreeMap<InodeNumber, &str> = BTreeMap::new();
    let mut remade: BTreeSet<&str> = BTreeSet::new();

    for (path, number) in &image.filesystem.paths {
        if is_private(path) {
            continue;
        }
        let Some(wanted) = image.filesystem.inodes.get(number) else {
            continue;
        };
        if let Some(target) = first_path.get(number) {
            let already_linked = match (current.inode_number(path), current.inode_number(target)) {
                (Some(a), Some(b)) => a == b && !remade.contains(target),
                _ => false,
            };
            if !already_linked {
                request.hardlinks_to_make.push(Hardlink {
                    new_link: path.clone(),
                    target: target.to_string(),
                });
            }
            continue;
        }
        first_path.insert(*number, path.as_str());

        let wanted = resolve_computed(sub, path, wanted)?;
        match current.get(path) {
            None => {
                push_make(&mut request, path, wanted);
                remade.insert(path.as_str());
            }
            Some(have) if !have.same_content(&wanted) => {
                push_make(&mut request, path, wanted);
                remade.insert(path.as_str());
            }
            Some(have) if !have.same_metadata(&wanted) => {
                request.inodes_to_change.push(InodeChange {
                    name: path.clone(),
                    inode: wanted,
                });
            }
            Some(_) => {}
        }
    }

    // Byte order can put a sibling such as "/a.d" between "/a" and "/a/x",
    // so every deleted ancestor is looked up, not just the last one.
    let mut deleted: BTreeSet<&str> = BTreeSet::new();
    for path in current.paths.keys() {
        if path == "/" || is_private(path) || image.filesystem.paths.contains_key(path) {
            continue;
        }
        if ancestors(path).any(|a| deleted.contains(a)) {
            continue;
        }
        if !image.manages(path) {
            continue;
        }
        request.paths_to_delete.push(path.clone());
        deleted.insert(path.as_str());
    }

    fill_cache_copies(sub, &mut request, &remade);
    request.multiply_used_objects = multiply_used(&request);
    Ok(request)
}

fn is_private(path: &str) -> bool {
    is_under(path, SUBD_DIRECTORY)
}

fn is_under(path: &str, prefix: &str) -> bool {
    path == prefix || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Proper ancestors of an absolute path, nearest first, excluding `/`.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(path), |p| {
        let parent = parent_path(*p);
        (parent != "/" && parent != *p).then_some(parent)
    })
    .skip(1)
}

/// Replace a computed inode by the sub's content for it.
fn resolve_computed(sub: &SubView<'_>, path: &str, inode: &Inode) -> DiffResult<Inode> {
    match inode {
        Inode::Computed(computed) => {
            let content = sub
                .computed_inodes
                .get(path)
                .ok_or_else(|| DiffError::MissingComputedFile(path.to_string()))?;
            Ok(Inode::Regular(RegularInode {
                mode: computed.mode,
                uid: computed.uid,
                gid: computed.gid,
                ..content.clone()
            }))
        }
        other => Ok(other.clone()),
    }
}

fn push_make(request: &mut UpdateRequest, path: &str, inode: Inode) {
    let change = InodeChange {
        name: path.to_string(),
        inode,
    };
    if change.inode.is_directory() {
        request.directories_to_make.push(change);
    } else {
        request.inodes_to_make.push(change);
    }
}

/// Objects needed by new inodes that are not in the cache but sit in the
/// sub's file-system are copied (or hardlinked, when the source is about
/// to go away) into the cache first.
fn fill_cache_copies(sub: &SubView<'_>, request: &mut UpdateRequest, remade: &BTreeSet<&str>) {
    let cached: BTreeSet<Hash> = sub.object_cache.iter().copied().collect();
    let needed = request.required_objects();
    let deleted: Vec<&str> = request.paths_to_delete.iter().map(String::as_str).collect();
    let mut sources: BTreeMap<Hash, &str> = BTreeMap::new();
    for (path, number) in &sub.filesystem.paths {
        if let Some(hash) = sub.filesystem.inodes.get(number).and_then(Inode::materialised_hash) {
            if needed.contains(&hash) && !cached.contains(&hash) {
                sources.entry(hash).or_insert(path.as_str());
            }
        }
    }
    for (hash, path) in sources {
        let going_away =
            remade.contains(path) || deleted.iter().any(|d| is_under(path, d));
        request.files_to_copy_to_cache.push(FileToCopyToCache {
            name: path.to_string(),
            hash,
            do_hardlink: going_away,
        });
    }
}

fn multiply_used(request: &UpdateRequest) -> BTreeMap<Hash, u64> {
    let mut counts: BTreeMap<Hash, u64> = BTreeMap::new();
    for change in &request.inodes_to_make {
        if let Some(hash) = change.inode.materialised_hash() {
            *counts.entry(hash).or_default() += 1;
        }
    }
    counts.retain(|_, n| *n > 1);
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use herd_core::{Filter, SymlinkInode};

    fn names(changes: &[InodeChange]) -> Vec<&str> {
        changes.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn converged_sub_gets_empty_request() {
        let image = image_with(&[("/bin/app", b"v1"), ("/etc/conf", b"x")]);
        let fs = image.filesystem.clone();
        let computed = BTreeMap::new();
        let req = build_update_request(&view(&fs, &computed, &[]), &image, "img").unwrap();
        assert!(req.has_no_mutations());
        assert_eq!(req.image_name, "img");
    }

    #[test]
    fn changed_content_is_remade_not_deleted() {
        let image = image_with(&[("/bin/app", &[1u8; 100])]);
        let fs = fs_with(&[("/bin/app", &[0u8; 100])]);
        let computed = BTreeMap::new();
        let req = build_update_request(&view(&fs, &computed, &[]), &image, "img").unwrap();
        assert_eq!(names(&req.inodes_to_make), vec!["/bin/app"]);
        assert!(req.paths_to_delete.is_empty());
        assert!(req.directories_to_make.is_empty());
        assert!(req.files_to_copy_to_cache.is_empty());
    }

    #[test]
    fn new_directories_and_files_in_preorder() {
        let image = image_with(&[("/opt/a/b/file", b"f"), ("/opt/a/c", b"c")]);
        let fs = herd_core::FileSystem::new();
        let computed = BTreeMap::new();
        let req = build_update_request(&view(&fs, &computed, &[]), &image, "img").unwrap();
        assert_eq!(
            names(&req.directories_to_make),
            vec!["/opt", "/opt/a", "/opt/a/b"]
        );
        assert_eq!(names(&req.inodes_to_make), vec!["/opt/a/b/file", "/opt/a/c"]);
    }

    #[test]
    fn deletes_collapse_to_subtree_root() {
        let image = image_with(&[("/keep", b"k")]);
        let fs = fs_with(&[("/keep", b"k"), ("/old/a", b"1"), ("/old/b/c", b"2"), ("/stray", b"s")]);
        let computed = BTreeMap::new();
        let req = build_update_request(&view(&fs, &computed, &[]), &image, "img").unwrap();
        assert_eq!(req.paths_to_delete, vec!["/old".to_string(), "/stray".to_string()]);
    }

    #[test]
    fn deletes_collapse_across_interleaved_siblings() {
        let image = image_with(&[("/keep", b"k")]);
        let fs = fs_with(&[
            ("/keep", b"k"),
            ("/etc/foo/x", b"1"),
            ("/etc/foo.d/y", b"2"),
            ("/etc/foo/z/w", b"3"),
        ]);
        let computed = BTreeMap::new();
        let req = build_update_request(&view(&fs, &computed, &[]), &image, "img").unwrap();
        assert_eq!(req.paths_to_delete, vec!["/etc".to_string()]);

        let mut image = image_with(&[("/keep", b"k")]);
        image.filesystem.insert("/etc", dir());
        let req = build_update_request(&view(&fs, &computed, &[]), &image, "img").unwrap();
        assert_eq!(
            req.paths_to_delete,
            vec!["/etc/foo".to_string(), "/etc/foo.d".to_string()]
        );
    }

    #[test]
    fn filtered_and_private_paths_survive() {
        let mut image = image_with(&[]);
        image.filesystem.insert("/var", dir());
        image.filter = Some(Filter::new(["/var/log(/.*)?"]).unwrap());
        let fs = fs_with(&[("/var/log/syslog", b"l"), ("/.subd/patched-image", b"x"), ("/tmp", b"t")]);
        let computed = BTreeMap::new();
        let req = build_update_request(&view(&fs, &computed, &[]), &image, "img").unwrap();
        assert_eq!(req.paths_to_delete, vec!["/tmp".to_string()]);
    }

    #[test]
    fn sparse_image_never_deletes() {
        let mut image = image_with(&[("/a", b"a")]);
        image.filter = None;
        let fs = fs_with(&[("/a", b"a"), ("/b", b"b")]);
        let computed = BTreeMap::new();
        let req = build_update_request(&view(&fs, &computed, &[]), &image, "img").unwrap();
        assert!(req.paths_to_delete.is_empty());
    }

    #[test]
    fn metadata_change_goes_to_change_batch() {
        let image = image_with(&[("/etc/conf", b"x")]);
        let mut fs = image.filesystem.clone();
        let number = fs.inode_number("/etc/conf").unwrap();
        if let Some(Inode::Regular(r)) = fs.inodes.get_mut(&number) {
            r.mode = 0o100600;
        }
        let computed = BTreeMap::new();
        let req = build_update_request(&view(&fs, &computed, &[]), &image, "img").unwrap();
        assert_eq!(names(&req.inodes_to_change), vec!["/etc/conf"]);
        assert!(req.inodes_to_make.is_empty());
    }

    #[test]
    fn hardlinks_follow_first_path() {
        let mut image = image_with(&[("/bin/a", b"same")]);
        image.filesystem.link("/bin/b", "/bin/a").unwrap();
        let fs = fs_with(&[]);
        let computed = BTreeMap::new();
        let req = build_update_request(&view(&fs, &computed, &[]), &image, "img").unwrap();
        assert_eq!(names(&req.inodes_to_make), vec!["/bin/a"]);
        assert_eq!(
            req.hardlinks_to_make,
            vec![Hardlink {
                new_link: "/bin/b".into(),
                target: "/bin/a".into()
            }]
        );

        let fs = image.filesystem.clone();
        let req = build_update_request(&view(&fs, &computed, &[]), &image, "img").unwrap();
        assert!(req.hardlinks_to_make.is_empty());
    }

    #[test]
    fn multiply_used_objects_counted() {
        let image = image_with(&[("/a", b"dup"), ("/b", b"dup"), ("/c", b"one")]);
        let fs = fs_with(&[]);
        let computed = BTreeMap::new();
        let req = build_update_request(&view(&fs, &computed, &[]), &image, "img").unwrap();
        assert_eq!(
            req.multiply_used_objects,
            BTreeMap::from([(Hash::of(b"dup"), 2)])
        );
    }

    #[test]
    fn content_already_on_sub_is_copied_to_cache() {
        let image = image_with(&[("/new/place", b"moved"), ("/copy", b"kept")]);
        let fs = fs_with(&[("/old", b"moved"), ("/copy", b"kept")]);
        let computed = BTreeMap::new();
        let req = build_update_request(&view(&fs, &computed, &[]), &image, "img").unwrap();
        assert_eq!(
            req.files_to_copy_to_cache,
            vec![FileToCopyToCache {
                name: "/old".into(),
                hash: Hash::of(b"moved"),
                do_hardlink: true,
            }]
        );
        assert_eq!(req.paths_to_delete, vec!["/old".to_string()]);
    }

    #[test]
    fn type_change_is_remade() {
        let mut image = image_with(&[]);
        image.filesystem.insert(
            "/link",
            Inode::Symlink(SymlinkInode {
                uid: 0,
                gid: 0,
                target: "/x".into(),
            }),
        );
        let fs = fs_with(&[("/link", b"file")]);
        let computed = BTreeMap::new();
        let req = build_update_request(&view(&fs, &computed, &[]), &image, "img").unwrap();
        assert_eq!(names(&req.inodes_to_make), vec!["/link"]);
    }

    #[test]
    fn computed_content_is_used() {
        let image = image_with_computed("/etc/hostname");
        let fs = fs_with(&[]);
        let computed = BTreeMap::from([("/etc/hostname".to_string(), regular(b"web1\n"))]);
        let req = build_update_request(&view(&fs, &computed, &[]), &image, "img").unwrap();
        assert_eq!(
            req.inodes_to_make[0].inode.materialised_hash(),
            Some(Hash::of(b"web1\n"))
        );

        let empty = BTreeMap::new();
        assert!(matches!(
            build_update_request(&view(&fs, &empty, &[]), &image, "img"),
            Err(DiffError::MissingComputedFile(_))
        ));
    }
}
