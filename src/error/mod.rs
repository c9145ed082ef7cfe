//! Error handling module for the HTTP client connector

use std::time::Duration;
use thiserror::Error;

/// Custom error type for the connector
///
/// Errors are cloneable so a single connection failure can be delivered to
/// every call queued or in flight on that connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Unable to resolve destination: {0}")]
    UnresolvedHost(String),

    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("No connection available for {0}: pool capacity exhausted")]
    CapacityExhausted(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Timed out after {0:?} waiting for a response")]
    Timeout(Duration),

    #[error("Request aborted")]
    Aborted,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Failure categories reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TlsConfig,
    Connectivity,
    CapacityExhausted,
    Communication,
    Timeout,
    InvalidRequest,
}

impl Error {
    /// Map the error onto the failure category callers branch on.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TlsConfig(_) => ErrorKind::TlsConfig,
            Error::UnresolvedHost(_) | Error::Connectivity(_) => ErrorKind::Connectivity,
            Error::CapacityExhausted(_) => ErrorKind::CapacityExhausted,
            Error::Communication(_) | Error::Aborted | Error::Protocol(_) => {
                ErrorKind::Communication
            }
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    /// True when the failure happened before any byte reached the network
    /// and retrying later may succeed.
    pub fn is_capacity(&self) -> bool {
        self.kind() == ErrorKind::CapacityExhausted
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Communication(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::InvalidRequest(err.to_string())
    }
}

/// Result type for the connector
pub type Result<T> = std::result::Result<T, Error>;
