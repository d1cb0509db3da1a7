//! herd-state — embedded state store for the herd.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for images, the machine database (MDB) and herd-wide settings.
//!
//! # Architecture
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns, keyed
//! by image name or hostname. Images are immutable: storing a second image
//! under an existing name is rejected.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use tables::Record;
pub use types::*;
