//! Missing-object computation.

use std::collections::{BTreeMap, BTreeSet};

use herd_core::{Hash, Image, Inode};
use tracing::debug;

use crate::SubView;
use crate::error::{DiffError, DiffResult};

/// Objects a sub lacks: `fetch` from the object server, `push` from the herd.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingLists {
    pub fetch: BTreeMap<Hash, u64>,
    pub push: BTreeSet<Hash>,
}

impl MissingLists {
    pub fn is_empty(&self) -> bool {
        self.fetch.is_empty() && self.push.is_empty()
    }
}

/// Compute the objects `sub` is missing for `required` and, best-effort,
/// `planned`.
///
/// Computed files of the required image are pushed when `push_computed_files`
/// is set; a computed file with no known content fails the whole computation
/// unless `ignore_missing_computed_files` is set. Computed files of the
/// planned image are never pushed.
pub fn build_missing_lists(
    sub: &SubView<'_>,
    required: Option<&Image>,
    planned: Option<&Image>,
    push_computed_files: bool,
    ignore_missing_computed_files: bool,
) -> DiffResult<MissingLists> {
    let mut lists = MissingLists::default();
    if let Some(image) = required {
        add_image(
            sub,
            image,
            push_computed_files,
            ignore_missing_computed_files,
            &mut lists,
        )?;
    }
    if let Some(image) = planned {
        add_image(sub, image, false, false, &mut lists)?;
    }
    for hash in sub.object_cache {
        lists.fetch.remove(hash);
        lists.push.remove(hash);
    }
    for hash in sub.filesystem.materialised_hashes() {
        lists.fetch.remove(&hash);
        lists.push.remove(&hash);
    }
    Ok(lists)
}

fn add_image(
    sub: &SubView<'_>,
    image: &Image,
    push_computed_files: bool,
    ignore_missing_computed_files: bool,
    lists: &mut MissingLists,
) -> DiffResult<()> {
    for inode in image.filesystem.inodes.values() {
        if let Inode::Regular(regular) = inode {
            if regular.is_materialised() {
                lists.fetch.insert(regular.hash, regular.size);
            }
        }
    }
    if !push_computed_files {
        return Ok(());
    }
    for (path, _) in image.filesystem.computed_inodes() {
        match sub.computed_inodes.get(path) {
            Some(content) => {
                lists.push.insert(content.hash);
            }
            None if ignore_missing_computed_files => {}
            None => {
                debug!(sub = %sub.hostname, %path, "missing computed file");
                return Err(DiffError::MissingComputedFile(path.to_string()));
            }
        }
    }
    Ok(())
}
