//! herd — keeps a fleet of subs converged onto their images.
//!
//! # Architecture
//!
//! ```text
//!   herd.toml / MDB ──sync_mdb──▶ Herd ──┬── nodes: RwLock<BTreeMap<hostname, Arc<Node>>>
//!                                        │        (insert / delete / iterate only)
//!                                        │
//!   scan loop (interval.tick) ───────────┼──▶ spawn Node::try_cycle per idle node
//!                                        │
//!   operators ──────────────────────────▶├──▶ clear safety / force disruption / fast update
//!                                        │
//!   StateStore (redb) ◀── images, MDB, default image, updates-disabled
//! ```
//!
//! Observers read immutable [`herd_node::SubSnapshot`]s; no caller reaches
//! into a node's working state.

pub mod error;
pub mod herd;
pub mod images;

pub use error::{HerdError, HerdResult};
pub use herd::{Herd, MAX_LOCK_HOLD, MdbSyncReport, StatusSummary};
pub use images::{DirObjects, StoreImages};
