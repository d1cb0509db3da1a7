//! Persisted herd-wide settings.

use serde::{Deserialize, Serialize};

/// Key of the single [`HerdSettings`] record in the settings table.
pub const SETTINGS_KEY: &str = "herd";

/// Settings an operator can change at runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HerdSettings {
    /// Image used for subs without a required image.
    #[serde(default)]
    pub default_image: Option<String>,
    /// Set while updates are disabled for every sub.
    #[serde(default)]
    pub updates_disabled: Option<UpdatesDisabled>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatesDisabled {
    pub reason: String,
    pub by: String,
    /// Seconds since the epoch.
    pub since: u64,
}
