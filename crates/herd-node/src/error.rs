use std::io;

use thiserror::Error;

pub type RpcResult<T> = Result<T, RpcError>;
pub type NodeResult<T> = Result<T, NodeError>;

/// Remote error text a sub returns when the caller lacks method access.
pub const ACCESS_DENIED_TEXT: &str = "access to method denied";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("{ACCESS_DENIED_TEXT}")]
    AccessDenied,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("no route to host")]
    NoRouteToHost,

    #[error("timeout")]
    Timeout,

    #[error("DNS lookup failed: {0}")]
    Dns(String),

    #[error("missing certificate")]
    MissingCertificate,

    #[error("bad certificate")]
    BadCertificate,

    #[error("connection closed")]
    Eof,

    #[error("{0}")]
    Remote(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("frame longer than {0} bytes")]
    FrameTooLarge(u64),
}

/// Why an operator action on a node was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("no access to sub")]
    NoAccess,

    #[error("no pending unsafe update")]
    NoPendingUnsafeUpdate,

    #[error("not waiting for disruptive update permission")]
    NotWaitingForDisruption,

    #[error("no {0} specified")]
    NoImageSpecified(&'static str),

    #[error("image: {0} does not exist yet")]
    ImageNotReady(String),

    #[error("sub is being deleted")]
    Deleting,
}

impl RpcError {
    /// Map error text returned by a sub onto a sentinel where one applies.
    pub fn from_remote(text: &str) -> Self {
        if text == ACCESS_DENIED_TEXT {
            RpcError::AccessDenied
        } else {
            RpcError::Remote(text.to_string())
        }
    }

    /// The wire text for this error.
    pub fn to_remote(&self) -> String {
        self.to_string()
    }
}

impl From<io::Error> for RpcError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => RpcError::ConnectionRefused,
            io::ErrorKind::TimedOut => RpcError::Timeout,
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                RpcError::NoRouteToHost
            }
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => RpcError::Eof,
            _ => RpcError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Io(format!("bad frame: {err}"))
    }
}
