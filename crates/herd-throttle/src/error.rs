use thiserror::Error;

pub type ThrottleResult<T> = Result<T, ThrottleError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThrottleError {
    #[error("wait for {0} slot cancelled")]
    Cancelled(&'static str),

    #[error("{0} pool closed")]
    Closed(&'static str),

    #[error("no {0} slot available")]
    Unavailable(&'static str),
}
