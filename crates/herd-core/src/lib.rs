//! herd-core — shared types for the herd and its subs.
//!
//! Everything that crosses a crate boundary lives here: content hashes,
//! inode tables, images with their filters and triggers, the RPC
//! messages exchanged with subs, and the herd configuration file.

pub mod config;
pub mod error;
pub mod filesystem;
pub mod filter;
pub mod hash;
pub mod image;
pub mod proto;
pub mod triggers;

pub use config::{HerdConfig, MdbEntry};
pub use error::{CoreError, CoreResult};
pub use filesystem::*;
pub use filter::{Filter, PathPattern};
pub use hash::Hash;
pub use image::Image;
pub use proto::*;
pub use triggers::{Trigger, Triggers};
