//! Error types for disruption management.

use thiserror::Error;

pub type DisruptionResult<T> = Result<T, DisruptionError>;

#[derive(Debug, Error)]
pub enum DisruptionError {
    #[error("failed to run disruption manager: {0}")]
    Spawn(String),

    #[error("invalid exit code {code}: {output}")]
    InvalidExitCode { code: i32, output: String },

    #[error("disruption manager killed by signal: {output}")]
    Killed { output: String },
}
