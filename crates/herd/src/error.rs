//! Herd error types.

use herd_node::NodeError;
use herd_state::StateError;
use thiserror::Error;

/// Errors returned by herd-level operations.
#[derive(Debug, Error)]
pub enum HerdError {
    #[error("unknown sub: {0}")]
    UnknownSub(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("no access to method")]
    NoAccess,

    #[error("cannot disable updates: no reason given")]
    NoReason,

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type HerdResult<T> = Result<T, HerdError>;
