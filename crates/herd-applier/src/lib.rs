//! herd-applier — applies an update request to a sub's file-system.
//!
//! # Architecture
//!
//! ```text
//!   UpdateRequest ──▶ touched_paths ──▶ match_triggers(old) ──▶ plan_stop ──▶ ServiceRunner
//!        │                  │
//!        │                  └────────▶ match_triggers(new) ──▶ plan_start ──▶ ServiceRunner
//!        ▼
//!     Mutator: copy to cache → replicate objects → directories → inodes
//!              → hardlinks → deletes → metadata changes → patched image name
//! ```
//!
//! Matching and planning are pure; only [`Mutator`] and the
//! [`ServiceRunner`] implementations touch the system. [`Updater`] ties
//! them together in the fixed stop / mutate / start order.

pub mod error;
pub mod matcher;
pub mod mutate;
pub mod plan;
pub mod runner;
pub mod update;

pub use error::{ApplyError, ApplyResult};
pub use matcher::{match_triggers, matched_in_update};
pub use mutate::{MutationReport, Mutator, PATCHED_IMAGE_FILE};
pub use plan::{ServiceAction, plan_start, plan_stop};
pub use runner::{RebootMethod, ServiceRunner, SystemRunner, execute_actions};
pub use update::{DisruptionGate, UpdateOptions, UpdateOutcome, Updater};

/// Name of the sub's own service; never stopped, restarted last.
pub const SELF_SERVICE: &str = "subd";
