//! Errors raised while scanning a root or maintaining the object cache.

use std::path::Path;

use herd_core::{CoreError, Hash};
use thiserror::Error;

pub type SubResult<T> = Result<T, SubError>;

#[derive(Debug, Error)]
pub enum SubError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("{0}: path is not valid UTF-8")]
    NonUtf8Path(String),

    #[error("object {expected} has content hashing to {actual}")]
    HashMismatch { expected: Hash, actual: Hash },

    #[error("scan task failed: {0}")]
    Task(String),
}

impl SubError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        SubError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}
