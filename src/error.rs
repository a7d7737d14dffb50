//! Error types shared by every layer of the client stack

use std::time::Duration;

use crate::transport::Endpoint;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for building clients and dispatching requests
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid client configuration: {0}")]
    Config(String),

    #[error("Service factory is closed")]
    FactoryClosed,

    #[error("Failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: Endpoint, reason: String },

    #[error("Connecting to {endpoint} timed out after {after:?}")]
    ConnectTimeout { endpoint: Endpoint, after: Duration },

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Remote replied with status {0}")]
    Status(u16),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("No hosts available")]
    NoHostsAvailable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hyper error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),
}

/// Coarse classification callers can key backoff policies on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Closed,
    Connection,
    Timeout,
    Unavailable,
}

impl ErrorKind {
    /// Short name used as a metric suffix
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Closed => "closed",
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unavailable => "unavailable",
        }
    }
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::FactoryClosed => ErrorKind::Closed,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::NoHostsAvailable => ErrorKind::Unavailable,
            Error::Connect { .. }
            | Error::ConnectTimeout { .. }
            | Error::Dispatch(_)
            | Error::Status(_)
            | Error::Io(_)
            | Error::Hyper(_)
            | Error::Http(_) => ErrorKind::Connection,
        }
    }

    /// True only for request timeouts, not connect timeouts
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// True for failures establishing a connection (as opposed to using one)
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Error::Connect { .. } | Error::ConnectTimeout { .. })
    }
}
