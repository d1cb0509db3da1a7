//! Gates and housekeeping computed from a diff.

use std::collections::{BTreeMap, BTreeSet};

use herd_core::{FileSystem, Hash, Image, UpdateRequest};

const BLOCK_SIZE: u64 = 4096;

/// Whether an update would remove too much of a sub.
///
/// Sparse images never trip the check. Otherwise the update is unsafe when
/// the image has fewer than half as many inodes as the sub, or when it
/// deletes more than half of the sub's inodes.
pub fn is_unsafe_update(
    image: &Image,
    current: &FileSystem,
    request: &UpdateRequest,
    safety_check_disabled: bool,
) -> bool {
    if image.is_sparse() || safety_check_disabled {
        return false;
    }
    let half = current.num_inodes() / 2;
    image.filesystem.num_inodes() < half || request.paths_to_delete.len() > half
}

/// Disk space needed to hold `objects`, with each rounded up to whole blocks.
pub fn space_needed(objects: &BTreeMap<Hash, u64>) -> u64 {
    objects
        .values()
        .map(|size| size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE)
        .sum()
}

/// Free space must strictly exceed what is needed. Unknown free space is
/// assumed sufficient.
pub fn has_enough_space(free_space: Option<u64>, needed: u64) -> bool {
    free_space.is_none_or(|free| free > needed)
}

/// Objects a sub may drop from its cache.
///
/// Anything already materialised in the file-system goes. Other cached
/// objects go too unless the planned image needs them.
pub fn cleanup_candidates(
    current: &FileSystem,
    object_cache: &[Hash],
    planned: Option<&Image>,
) -> Vec<Hash> {
    let materialised: BTreeSet<Hash> = current.materialised_hashes().collect();
    let keep: BTreeSet<Hash> = planned
        .map(|image| {
            image
                .filesystem
                .materialised_hashes()
                .filter(|h| !materialised.contains(h))
                .collect()
        })
        .unwrap_or_default();
    let unique: BTreeSet<Hash> = object_cache.iter().copied().collect();
    unique.into_iter().filter(|h| !keep.contains(h)).collect()
}
