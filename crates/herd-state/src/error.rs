//! Failures of the herd's persistent records.

use thiserror::Error;

use crate::tables::Record;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// The database file could not be created or opened.
    #[error("cannot open state database: {0}")]
    Open(String),

    /// redb failed below the record level: a transaction, table or
    /// storage operation.
    #[error("state database: {0}")]
    Database(String),

    #[error("cannot encode {record} {key:?}: {reason}")]
    Encode {
        record: Record,
        key: String,
        reason: String,
    },

    /// A stored record no longer decodes, e.g. after a format change.
    #[error("corrupt {record} {key:?}: {reason}")]
    Corrupt {
        record: Record,
        key: String,
        reason: String,
    },

    /// Images are immutable once stored.
    #[error("image {0:?} already exists")]
    ImageExists(String),
}

impl StateError {
    pub(crate) fn database(err: impl std::fmt::Display) -> Self {
        Self::Database(err.to_string())
    }
}
