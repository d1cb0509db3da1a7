//! herd-throttle — keeps one process managing thousands of subs in bounds.
//!
//! # Architecture
//!
//! ```text
//!   node task ──grab──▶ CpuSharer (FIFO, cpu_slots tickets) ──▶ diff / build update
//!       │
//!       ├─ release ticket ──▶ connect / RPC (no ticket held)
//!       │
//!       └─ Limits ── polls ─────────┐
//!                 ── pushes ────────┼─▶ bounded Pool, cancellable acquire
//!                 ── fast_updates ──┘
//! ```
//!
//! Tasks never hold a CPU ticket while waiting for a pool slot or for the
//! network. Both primitives are FIFO, so no task starves.

pub mod cpu;
pub mod error;
pub mod pool;

pub use cpu::{CpuSharer, CpuStats, CpuTicket};
pub use error::{ThrottleError, ThrottleResult};
pub use pool::{Limits, Pool, PoolStats, Slot};
