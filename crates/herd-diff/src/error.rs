//! Error types for the diff engine.

use thiserror::Error;

/// Result type alias for diff operations.
pub type DiffResult<T> = Result<T, DiffError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiffError {
    #[error("missing computed file: {0}")]
    MissingComputedFile(String),
}
