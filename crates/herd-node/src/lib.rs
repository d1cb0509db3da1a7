//! herd-node — everything the herd does for one sub.
//!
//! # Architecture
//!
//! ```text
//!   herd scan loop ──try_cycle──▶ Node ──lock──▶ NodeController
//!   operator ──fast_update─────▶  │                 │
//!                                 │                 ├─ SubConnector ─▶ SubClient (Poll/Fetch/Update/…)
//!                                 │                 ├─ herd-diff (missing lists, update request)
//!                                 │                 ├─ herd-throttle (poll/push slots, CPU tickets)
//!                                 │                 └─ publish ─▶ watch<SubSnapshot>
//!                                 └─ shared: MDB entry, pending flags, cancel, busy
//! ```
//!
//! At most one cycle runs per node: scan-loop cycles and fast updates take
//! the same controller lock, so a sub never sees overlapping Fetch or
//! Update calls from one herd.

pub mod controller;
pub mod error;
pub mod node;
pub mod snapshot;
pub mod status;
pub mod tcp;
pub mod transport;

#[cfg(any(test, feature = "fake-sub"))]
pub mod fake;

pub use controller::{Globals, NodeEnv, Progress};
pub use error::{NodeError, NodeResult, RpcError, RpcResult};
pub use node::Node;
pub use snapshot::{AuthInfo, ComputedFile, FastUpdateMessage, FastUpdateRequest, SubSnapshot};
pub use status::SubStatus;
pub use tcp::{JsonClient, JsonConnector};
pub use transport::{BoxFuture, ImageSource, ObjectGetter, SubClient, SubConnector};
