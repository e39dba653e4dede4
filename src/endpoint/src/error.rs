use std::fmt;
use std::io;

use thiserror::Error;

use rdma::rdmacm::CmEventKind;

use crate::resource;

/// Why a blocking lifecycle step did not reach its target state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The connection manager reported an error event instead of the expected one.
    Event { kind: CmEventKind, status: i32 },
    /// The endpoint was closed while the step was pending.
    Closed,
    Timeout,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Event { kind, status } => write!(f, "{} (status {})", kind, status),
            Failure::Closed => f.write_str("endpoint closed"),
            Failure::Timeout => f.write_str("timed out"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Address resolution failed: {0}")]
    AddressResolutionFailed(Failure),
    #[error("Route resolution failed: {0}")]
    RouteResolutionFailed(Failure),
    #[error("Resource allocation failed: {0}")]
    ResourceAllocationFailed(#[source] Box<Error>),
    #[error("Connect failed: {0}")]
    ConnectFailed(Failure),
    #[error("Accept failed: {0}")]
    AcceptFailed(Failure),

    #[error("Endpoint is already connected")]
    AlreadyConnected,
    #[error("Endpoint is already closed")]
    AlreadyClosed,
    #[error("Server endpoint is already bound")]
    AlreadyBound,
    #[error("Server endpoint is not bound")]
    NotBound,
    #[error("Connection identifier is not bound to a device")]
    NoDeviceContext,
    #[error("No endpoint registered for the identifier")]
    UnknownEndpoint,
    #[error("Endpoint has no queue pair")]
    NoQueuePair,
    #[error("Completion queue is owned by a completion processor")]
    CompletionQueueShared,

    #[error("rdmacm internal error: {0}")]
    RdmaCm(#[source] io::Error),
    #[error("ibv internal error: {0}")]
    Ibv(#[source] io::Error),

    #[error("Resource not found in the table")]
    NotFound,
    #[error("Resource exists in the table")]
    Exists,
}

impl Error {
    /// The errno attached to a primitive failure, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::RdmaCm(e) | Error::Ibv(e) => e.raw_os_error(),
            Error::ResourceAllocationFailed(e) => e.raw_os_error(),
            Error::AddressResolutionFailed(f)
            | Error::RouteResolutionFailed(f)
            | Error::ConnectFailed(f)
            | Error::AcceptFailed(f) => match f {
                Failure::Event { status, .. } if *status < 0 => Some(-status),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<resource::Error> for Error {
    fn from(other: resource::Error) -> Self {
        match other {
            resource::Error::NotFound => Error::NotFound,
            resource::Error::Exists => Error::Exists,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
