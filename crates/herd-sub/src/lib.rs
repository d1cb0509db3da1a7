//! herd-sub — the sub side of the herd protocol, backed by a real root.
//!
//! # Architecture
//!
//! ```text
//!   Poll ──▶ scan_root ──▶ FileSystem + ObjectCache::list ──▶ PollResponse
//!   Fetch ──▶ ObjectGetter ──▶ ObjectCache::add
//!   Update ──▶ Updater (stop / mutate / start) ──▶ DisruptionHandle gate
//!   Cleanup ──▶ ObjectCache::remove + DisruptionHandle::cancel
//! ```
//!
//! [`LocalSub`] implements [`herd_node::SubClient`], so it can be served
//! with [`herd_node::tcp::serve`] or handed straight to a connector.
//! Fetch and Update run to completion inside the call; at most one of
//! them runs at a time.

pub mod error;
pub mod objects;
pub mod scan;
pub mod sub;

pub use error::{SubError, SubResult};
pub use objects::ObjectCache;
pub use scan::{ScanCache, scan_root};
pub use sub::{LocalSub, SubOptions};
