//! Messages exchanged between the herd and its subs.
//!
//! Every RPC is a request/response pair of serde types. The transport
//! that carries them is defined elsewhere (see `herd-node`).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::filesystem::{FileSystem, Inode};
use crate::hash::Hash;
use crate::triggers::Triggers;

/// Sub-side error text when a disruptive update must wait for permission.
pub const ERROR_DISRUPTION_PENDING: &str = "disruption pending";
/// Sub-side error text when a disruptive update was refused.
pub const ERROR_DISRUPTION_DENIED: &str = "disruption denied";

// ── Disruption ─────────────────────────────────────────────────────

/// Whether disruptive changes may currently be made to a sub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisruptionState {
    /// No policy configured.
    #[default]
    Anytime,
    Permitted,
    Requested,
    Denied,
}

impl DisruptionState {
    /// True when a disruptive update may proceed.
    pub fn allows_disruption(self) -> bool {
        matches!(self, DisruptionState::Anytime | DisruptionState::Permitted)
    }
}

impl std::fmt::Display for DisruptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisruptionState::Anytime => "anytime",
            DisruptionState::Permitted => "permitted",
            DisruptionState::Requested => "requested",
            DisruptionState::Denied => "denied",
        };
        f.write_str(s)
    }
}

// ── Configuration ──────────────────────────────────────────────────

/// Local resource governors of a sub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubConfiguration {
    #[serde(default)]
    pub cpu_percent: u8,
    #[serde(default)]
    pub network_speed_percent: u8,
    #[serde(default)]
    pub scan_speed_percent: u8,
    #[serde(default)]
    pub scan_exclusions: Vec<String>,
}

impl SubConfiguration {
    /// Overlay `desired` on `self`. Zero percentages in `desired` keep the
    /// current value; empty exclusions keep the current list.
    pub fn overlay(&self, desired: &SubConfiguration) -> SubConfiguration {
        let pick = |want: u8, have: u8| if want < 1 { have } else { want };
        SubConfiguration {
            cpu_percent: pick(desired.cpu_percent, self.cpu_percent),
            network_speed_percent: pick(
                desired.network_speed_percent,
                self.network_speed_percent,
            ),
            scan_speed_percent: pick(desired.scan_speed_percent, self.scan_speed_percent),
            scan_exclusions: if desired.scan_exclusions.is_empty() {
                self.scan_exclusions.clone()
            } else {
                desired.scan_exclusions.clone()
            },
        }
    }
}

// ── Poll ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRequest {
    pub have_generation: u64,
    #[serde(default)]
    pub short_poll_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub generation_count: u64,
    pub scan_count: u64,
    #[serde(default)]
    pub free_space: Option<u64>,
    #[serde(default)]
    pub current_configuration: SubConfiguration,
    #[serde(default)]
    pub fetch_in_progress: bool,
    #[serde(default)]
    pub update_in_progress: bool,
    #[serde(default)]
    pub locked_by_another_client: bool,
    #[serde(default)]
    pub last_fetch_error: String,
    #[serde(default)]
    pub last_update_error: String,
    #[serde(default)]
    pub last_update_had_trigger_failures: bool,
    #[serde(default)]
    pub last_write_error: String,
    #[serde(default)]
    pub last_successful_image_name: String,
    #[serde(default)]
    pub last_note: String,
    #[serde(default)]
    pub disruption_state: DisruptionState,
    /// Seconds since the epoch when the sub process started.
    pub start_time: u64,
    /// Seconds since the epoch when this poll was answered.
    pub poll_time: u64,
    /// Present only if the generation changed and this was not a short poll.
    #[serde(default)]
    pub filesystem: Option<FileSystem>,
    #[serde(default)]
    pub object_cache: Option<Vec<Hash>>,
}

// ── Fetch / push ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub server_address: String,
    pub hashes: Vec<Hash>,
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub speed_percent: Option<u8>,
}

/// Objects added to a sub's object server, with their content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddObjectsRequest {
    pub objects: Vec<(Hash, Vec<u8>)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupRequest {
    pub hashes: Vec<Hash>,
}

// ── Update ─────────────────────────────────────────────────────────

/// An inode to create or change at `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeChange {
    pub name: String,
    pub inode: Inode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hardlink {
    pub new_link: String,
    pub target: String,
}

/// A file already on the sub whose content should also be in the object
/// cache before mutation starts (it is about to be moved or replaced).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileToCopyToCache {
    pub name: String,
    pub hash: Hash,
    #[serde(default)]
    pub do_hardlink: bool,
}

/// Ordered mutation batches. The sub applies them in field order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub image_name: String,
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub force_disruption: bool,
    #[serde(default)]
    pub files_to_copy_to_cache: Vec<FileToCopyToCache>,
    #[serde(default)]
    pub directories_to_make: Vec<InodeChange>,
    #[serde(default)]
    pub inodes_to_make: Vec<InodeChange>,
    #[serde(default)]
    pub hardlinks_to_make: Vec<Hardlink>,
    #[serde(default)]
    pub paths_to_delete: Vec<String>,
    #[serde(default)]
    pub inodes_to_change: Vec<InodeChange>,
    /// Objects referenced by more than one new inode, with reference counts.
    #[serde(default)]
    pub multiply_used_objects: BTreeMap<Hash, u64>,
    #[serde(default)]
    pub triggers: Triggers,
}

impl UpdateRequest {
    /// True when no mutation batch carries anything.
    pub fn has_no_mutations(&self) -> bool {
        self.files_to_copy_to_cache.is_empty()
            && self.directories_to_make.is_empty()
            && self.inodes_to_make.is_empty()
            && self.hardlinks_to_make.is_empty()
            && self.paths_to_delete.is_empty()
            && self.inodes_to_change.is_empty()
    }

    /// Every path this request creates, changes or deletes, in batch order.
    pub fn touched_paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        out.extend(self.directories_to_make.iter().map(|c| c.name.as_str()));
        out.extend(self.inodes_to_make.iter().map(|c| c.name.as_str()));
        out.extend(self.hardlinks_to_make.iter().map(|h| h.new_link.as_str()));
        out.extend(self.paths_to_delete.iter().map(String::as_str));
        out.extend(self.inodes_to_change.iter().map(|c| c.name.as_str()));
        out
    }

    /// Distinct object hashes the sub needs in its cache for this request.
    pub fn required_objects(&self) -> BTreeSet<Hash> {
        self.inodes_to_make
            .iter()
            .filter_map(|c| c.inode.materialised_hash())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::DirectoryInode;

    #[test]
    fn overlay_keeps_current_values_for_zero() {
        let have = SubConfiguration {
            cpu_percent: 50,
            network_speed_percent: 10,
            scan_speed_percent: 2,
            scan_exclusions: vec!["/tmp/.*".into()],
        };
        let want = SubConfiguration {
            network_speed_percent: 90,
            ..Default::default()
        };
        let merged = have.overlay(&want);
        assert_eq!(merged.cpu_percent, 50);
        assert_eq!(merged.network_speed_percent, 90);
        assert_eq!(merged.scan_exclusions, vec!["/tmp/.*".to_string()]);
    }

    #[test]
    fn touched_paths_follow_batch_order() {
        let dir = Inode::Directory(DirectoryInode {
            mode: 0o040755,
            uid: 0,
            gid: 0,
        });
        let req = UpdateRequest {
            paths_to_delete: vec!["/old".into()],
            directories_to_make: vec![InodeChange {
                name: "/new".into(),
                inode: dir,
            }],
            ..Default::default()
        };
        assert_eq!(req.touched_paths(), vec!["/new", "/old"]);
        assert!(!req.has_no_mutations());
        assert!(UpdateRequest::default().has_no_mutations());
    }

    #[test]
    fn disruption_gate() {
        assert!(DisruptionState::Anytime.allows_disruption());
        assert!(DisruptionState::Permitted.allows_disruption());
        assert!(!DisruptionState::Requested.allows_disruption());
        assert!(!DisruptionState::Denied.allows_disruption());
    }
}
