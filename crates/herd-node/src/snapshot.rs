//! Values a node hands to the outside world.

use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use herd_core::{DisruptionState, Hash, MdbEntry};
use serde::{Deserialize, Serialize};

use crate::status::SubStatus;

/// Immutable view of one node, captured at the end of each cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubSnapshot {
    pub hostname: String,
    pub ip_address: Option<String>,
    pub location: Option<String>,
    pub status: SubStatus,
    pub required_image: String,
    pub planned_image: String,
    pub last_successful_image: String,
    pub last_note: String,
    pub last_error: String,
    pub last_address: String,
    pub insecure: bool,
    pub generation: u64,
    pub scan_count: u64,
    pub free_space: Option<u64>,
    pub disruption_state: DisruptionState,
    pub busy: bool,
    pub pending_safety_clear: bool,
    pub pending_force_disruption: bool,
    pub last_poll_was_full: bool,
    /// Seconds since the epoch, as reported by the sub.
    pub start_time: u64,
    pub poll_time: u64,
    /// Seconds since the epoch, as seen by the herd.
    pub last_reachable_time: Option<u64>,
    pub last_poll_succeeded_time: Option<u64>,
    pub last_update_time: Option<u64>,
    pub last_sync_time: Option<u64>,
    pub last_connect_millis: Option<u64>,
    pub last_short_poll_millis: Option<u64>,
    pub last_full_poll_millis: Option<u64>,
}

impl SubSnapshot {
    pub fn new(mdb: &MdbEntry) -> Self {
        Self {
            hostname: mdb.hostname.clone(),
            ip_address: mdb.ip_address.clone(),
            location: mdb.location.clone(),
            required_image: mdb.required_image.clone().unwrap_or_default(),
            planned_image: mdb.planned_image.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Who is asking for an operator action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
    pub username: String,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    /// Granted access to the method itself, regardless of ownership.
    #[serde(default)]
    pub have_method_access: bool,
}

impl AuthInfo {
    pub fn admin() -> Self {
        Self {
            have_method_access: true,
            ..Default::default()
        }
    }

    pub fn user(username: &str, groups: &[&str]) -> Self {
        Self {
            username: username.to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            have_method_access: false,
        }
    }
}

/// Freshly computed content of one computed file on one sub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputedFile {
    pub path: String,
    pub hash: Hash,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastUpdateRequest {
    #[serde(default)]
    pub use_planned_image: bool,
    #[serde(default)]
    pub disable_safety_check: bool,
    #[serde(default)]
    pub force_disruptive_update: bool,
    #[serde(default)]
    pub fail_on_reboot: bool,
    #[serde(with = "secs", default = "default_fast_update_timeout")]
    pub timeout: Duration,
}

impl Default for FastUpdateRequest {
    fn default() -> Self {
        Self {
            use_planned_image: false,
            disable_safety_check: false,
            force_disruptive_update: false,
            fail_on_reboot: false,
            timeout: default_fast_update_timeout(),
        }
    }
}

fn default_fast_update_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// One progress line of a fast update. Exactly one message per update has
/// `is_final` set, and it is the last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastUpdateMessage {
    pub message: String,
    pub synced: bool,
    #[serde(rename = "final")]
    pub is_final: bool,
}

pub(crate) fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_update_request_defaults() {
        let request: FastUpdateRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request, FastUpdateRequest::default());
        let request: FastUpdateRequest =
            serde_json::from_str(r#"{"use_planned_image": true, "timeout": 30}"#).unwrap();
        assert!(request.use_planned_image);
        assert_eq!(request.timeout, Duration::from_secs(30));
    }

    #[test]
    fn final_flag_serialises_as_final() {
        let message = FastUpdateMessage {
            message: String::new(),
            synced: true,
            is_final: true,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["final"], true);
    }

    #[test]
    fn snapshot_starts_from_mdb() {
        let mut mdb = MdbEntry::new("web-1");
        mdb.required_image = Some("base/1".into());
        let snapshot = SubSnapshot::new(&mdb);
        assert_eq!(snapshot.hostname, "web-1");
        assert_eq!(snapshot.required_image, "base/1");
        assert_eq!(snapshot.status, SubStatus::Unknown);
    }
}
