use std::io;
use std::path::PathBuf;

use russ_wire::WireError;
use thiserror::Error;

use crate::connection::ConnState;
use crate::connection::Role;

/// Error category for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Service address or socket not found
    NotFound,
    /// Invalid input or contract misuse
    InvalidInput,
    /// Address already owned by someone else
    Busy,
    /// Peer violated the protocol
    Protocol,
    /// Operating system failure
    External,
    /// Operation deadline expired
    Timeout,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::Busy => "busy",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::External => "external",
            ErrorCategory::Timeout => "timeout",
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Address already in use: {}", .0.display())]
    AddressInUse(PathBuf),

    #[error("Permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Dial timed out")]
    DialTimeout,

    #[error("Answer timed out")]
    AnswerTimeout,

    #[error("Descriptor exchange timed out")]
    ExchangeTimeout,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Incomplete descriptor exchange: received {received} of 3 descriptors")]
    IncompleteExchange { received: usize },

    #[error("Invalid descriptor index: {0}")]
    InvalidIndex(usize),

    #[error("Connection has not been answered")]
    NotAnswered,

    #[error("No request attached to {0:?} connection")]
    WrongRole(Role),

    #[error("Invalid connection state: expected {expected:?}, found {actual:?}")]
    InvalidState {
        expected: ConnState,
        actual: ConnState,
    },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Listener closed")]
    ListenerClosed,

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset => Error::ConnectionClosed,
            _ => Error::Io(err),
        }
    }
}

impl Error {
    /// Maps deadline expiry to `timeout`, everything else through `From`.
    pub(crate) fn on_timeout(err: io::Error, timeout: Error) -> Error {
        if is_timeout(&err) {
            timeout
        } else {
            Error::from(err)
        }
    }

    /// Maps a path-related OS failure to the address errors.
    pub(crate) fn for_path(err: io::Error, path: impl Into<PathBuf>) -> Error {
        match err.kind() {
            io::ErrorKind::AddrInUse => Error::AddressInUse(path.into()),
            io::ErrorKind::PermissionDenied => Error::PermissionDenied(path.into()),
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                Error::ServiceNotFound(path.into().display().to_string())
            }
            _ => Error::from(err),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::ServiceNotFound(_) => ErrorCategory::NotFound,
            Error::AddressInUse(_) => ErrorCategory::Busy,
            Error::DialTimeout | Error::AnswerTimeout | Error::ExchangeTimeout => {
                ErrorCategory::Timeout
            }
            Error::Wire(WireError::InvalidAttributeKey(_)) => ErrorCategory::InvalidInput,
            Error::Wire(_)
            | Error::Protocol(_)
            | Error::IncompleteExchange { .. }
            | Error::ConnectionClosed => ErrorCategory::Protocol,
            Error::InvalidIndex(_)
            | Error::NotAnswered
            | Error::WrongRole(_)
            | Error::InvalidState { .. } => ErrorCategory::InvalidInput,
            Error::PermissionDenied(_) | Error::ListenerClosed | Error::Io(_) => {
                ErrorCategory::External
            }
        }
    }

    /// Returns whether the operation may succeed if the caller retries it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DialTimeout
                | Error::AnswerTimeout
                | Error::ExchangeTimeout
                | Error::ConnectionClosed
        )
    }
}

pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}
