//! herd-disruption — decides when a sub may be disrupted.
//!
//! # Architecture
//!
//! ```text
//!   DisruptionHandle ──want/cancel──▶ coordinator loop ──command──▶ command queue
//!         ▲                                │                            │
//!         └───────── watch<DisruptionState>┘◀────── result ─────────────┘
//!                                                                       │
//!                                                          DisruptionManager
//!                                                     (external command, etc.)
//! ```
//!
//! The loop owns the current state. Callers nudge it through a
//! [`DisruptionHandle`]: `request()` says a disruptive update is wanted and
//! returns the current state, `cancel()` says it no longer is. The queue
//! runs at most one manager command at a time and spaces them out.

pub mod coordinator;
pub mod error;
pub mod policy;

pub use coordinator::{DisruptionConfig, DisruptionHandle, DisruptionTiming, start_coordinator};
pub use error::{DisruptionError, DisruptionResult};
pub use policy::{CommandManager, DisruptionCommand, DisruptionManager, DisruptionPolicy};
