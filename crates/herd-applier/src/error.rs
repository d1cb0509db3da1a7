//! Error types for the convergence applier.

use thiserror::Error;

pub type ApplyResult<T> = Result<T, ApplyError>;

#[derive(Debug, Error)]
pub enum ApplyError {
    /// Disruptive update refused or pending; carries the wire error text.
    #[error("{0}")]
    Disruption(&'static str),

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}: not a directory inode")]
    NotADirectory(String),

    #[error("{0}: cannot make {1} inode")]
    UnsupportedInode(String, &'static str),

    #[error("update task failed: {0}")]
    Task(String),
}

impl ApplyError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        ApplyError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}
