//! herd.toml configuration parser.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::proto::SubConfiguration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HerdConfig {
    #[serde(default)]
    pub herd: HerdSection,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub sub_configuration: SubConfiguration,
    #[serde(default)]
    pub api: ApiSection,
    /// Static machine database.
    #[serde(default)]
    pub subs: Vec<MdbEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HerdSection {
    pub default_image: Option<String>,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Object server address handed to subs in Fetch requests.
    #[serde(default)]
    pub object_server: String,
    #[serde(default = "default_sub_port")]
    pub sub_port: u16,
    /// Connect to the MDB IP address instead of the hostname when known.
    #[serde(default)]
    pub use_ip: bool,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
}

impl Default for HerdSection {
    fn default() -> Self {
        Self {
            default_image: None,
            scan_interval_secs: default_scan_interval(),
            object_server: String::new(),
            sub_port: default_sub_port(),
            use_ip: false,
            rpc_timeout_secs: default_rpc_timeout(),
        }
    }
}

/// Who the operator API treats as having method access. The caller's
/// identity comes from the fronting proxy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiSection {
    #[serde(default)]
    pub admin_users: Vec<String>,
    #[serde(default)]
    pub admin_groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_cpu_slots")]
    pub cpu_slots: usize,
    #[serde(default = "default_max_polls")]
    pub max_concurrent_polls: usize,
    #[serde(default = "default_max_pushes")]
    pub max_concurrent_pushes: usize,
    #[serde(default = "default_max_fast_updates")]
    pub max_concurrent_fast_updates: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            cpu_slots: default_cpu_slots(),
            max_concurrent_polls: default_max_polls(),
            max_concurrent_pushes: default_max_pushes(),
            max_concurrent_fast_updates: default_max_fast_updates(),
        }
    }
}

/// One machine as known to the herd.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdbEntry {
    pub hostname: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub required_image: Option<String>,
    #[serde(default)]
    pub planned_image: Option<String>,
    #[serde(default)]
    pub disable_updates: bool,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_users: Vec<String>,
    #[serde(default)]
    pub owner_groups: Vec<String>,
    #[serde(default)]
    pub location: Option<String>,
}

pub const TAG_DISABLE_SAFETY_CHECK: &str = "DisableSafetyCheck";
pub const TAG_FORCE_DISRUPTIVE_UPDATE: &str = "ForceDisruptiveUpdate";

impl MdbEntry {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            ..Default::default()
        }
    }

    pub fn safety_check_disabled(&self) -> bool {
        self.tags.contains_key(TAG_DISABLE_SAFETY_CHECK)
    }

    pub fn force_disruptive_update(&self) -> bool {
        self.tags
            .get(TAG_FORCE_DISRUPTIVE_UPDATE)
            .is_some_and(|v| v == "true")
    }
}

fn default_scan_interval() -> u64 {
    1
}

fn default_sub_port() -> u16 {
    6969
}

fn default_rpc_timeout() -> u64 {
    300
}

fn default_cpu_slots() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

fn default_max_polls() -> usize {
    1024
}

fn default_max_pushes() -> usize {
    16
}

fn default_max_fast_updates() -> usize {
    16
}

impl HerdConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: HerdConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.limits.cpu_slots == 0
            || self.limits.max_concurrent_polls == 0
            || self.limits.max_concurrent_pushes == 0
            || self.limits.max_concurrent_fast_updates == 0
        {
            anyhow::bail!("limits must be at least 1");
        }
        let mut seen = std::collections::BTreeSet::new();
        for sub in &self.subs {
            if sub.hostname.is_empty() {
                anyhow::bail!("sub with empty hostname");
            }
            if !seen.insert(sub.hostname.as_str()) {
                anyhow::bail!("duplicate sub {}", sub.hostname);
            }
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
