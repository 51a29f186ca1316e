//! Error taxonomy shared by every layer of the engine.
//!
//! A single [`Error`] value carries a [`ErrorKind`] and, when the failure
//! came from the operating system, the platform error code. Transient kinds
//! are recovered inside the engine and never surface to user code.

use std::fmt;
use std::io;

use thiserror::Error;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The operation would have blocked the caller.
    #[error("operation would block")]
    WouldBlock,

    /// The operation was interrupted before any work was done.
    #[error("operation interrupted")]
    Interrupted,

    /// The peer shut down the stream; no more data will arrive.
    #[error("end of file")]
    Eof,

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation's deadline passed before it completed.
    #[error("operation timed out")]
    Timeout,

    /// A configured limit (watermark, authorization bound) was reached.
    #[error("limit reached")]
    Limit,

    /// The peer actively refused the connection.
    #[error("connection refused")]
    ConnectionRefused,

    /// The peer reset the connection.
    #[error("connection reset")]
    ConnectionReset,

    /// The connection was aborted locally.
    #[error("connection aborted")]
    ConnectionAborted,

    /// No route to the destination network.
    #[error("network unreachable")]
    NetworkUnreachable,

    /// No route to the destination host.
    #[error("host unreachable")]
    HostUnreachable,

    /// The requested address is already in use.
    #[error("address in use")]
    AddressInUse,

    /// The requested address is not available on this host.
    #[error("address not available")]
    AddressNotAvailable,

    /// The socket is not connected.
    #[error("not connected")]
    NotConnected,

    /// The operation is already in progress or already done.
    #[error("operation already in progress")]
    Already,

    /// An argument or state precondition was violated.
    #[error("invalid argument or state")]
    Invalid,

    /// The operation is not implemented on this platform.
    #[error("not implemented")]
    NotImplemented,

    /// An unclassified failure.
    #[error("unknown error")]
    Unknown,
}

/// An error produced by the engine or the operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Error {
    kind: ErrorKind,
    code: Option<i32>,
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an error of the specified `kind` with no platform code.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self { kind, code: None }
    }

    /// Create an error of the specified `kind` carrying a platform `code`.
    #[must_use]
    pub const fn with_code(kind: ErrorKind, code: i32) -> Self {
        Self {
            kind,
            code: Some(code),
        }
    }

    /// Capture the calling thread's last OS error.
    #[must_use]
    pub fn last_os_error() -> Self {
        io::Error::last_os_error().into()
    }

    /// The classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The platform error code, if the failure came from the OS.
    #[must_use]
    pub const fn code(&self) -> Option<i32> {
        self.code
    }

    /// True for failures the engine absorbs and retries internally.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::WouldBlock | ErrorKind::Interrupted)
    }

    /// True for failures that fail the operation and drain its queue.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !self.is_transient()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (os error {})", self.kind, code),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::WouldBlock => ErrorKind::WouldBlock,
            io::ErrorKind::Interrupted => ErrorKind::Interrupted,
            io::ErrorKind::UnexpectedEof => ErrorKind::Eof,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted => ErrorKind::ConnectionAborted,
            io::ErrorKind::NetworkUnreachable => ErrorKind::NetworkUnreachable,
            io::ErrorKind::HostUnreachable => ErrorKind::HostUnreachable,
            io::ErrorKind::AddrInUse => ErrorKind::AddressInUse,
            io::ErrorKind::AddrNotAvailable => ErrorKind::AddressNotAvailable,
            io::ErrorKind::NotConnected => ErrorKind::NotConnected,
            io::ErrorKind::AlreadyExists => ErrorKind::Already,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorKind::Invalid,
            io::ErrorKind::Unsupported => ErrorKind::NotImplemented,
            _ => match err.raw_os_error() {
                #[cfg(unix)]
                Some(code) if code == libc::EINPROGRESS => ErrorKind::WouldBlock,
                #[cfg(unix)]
                Some(code) if code == libc::EPIPE => ErrorKind::ConnectionReset,
                #[cfg(unix)]
                Some(code) if code == libc::ENOPROTOOPT || code == libc::EOPNOTSUPP => {
                    ErrorKind::NotImplemented
                }
                _ => ErrorKind::Unknown,
            },
        };
        match err.raw_os_error() {
            Some(code) => Self::with_code(kind, code),
            None => Self::new(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(Error::new(ErrorKind::WouldBlock).is_transient());
        assert!(Error::new(ErrorKind::Interrupted).is_transient());
        assert!(!Error::new(ErrorKind::ConnectionReset).is_transient());
        assert!(Error::new(ErrorKind::Eof).is_terminal());
    }

    #[test]
    fn io_error_mapping() {
        let err: Error = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);

        let err: Error = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
    }

    #[test]
    fn display_includes_os_code() {
        let err = Error::with_code(ErrorKind::AddressInUse, 98);
        assert_eq!(err.to_string(), "address in use (os error 98)");

        let err = Error::new(ErrorKind::Cancelled);
        assert_eq!(err.to_string(), "operation cancelled");
    }

    #[cfg(unix)]
    #[test]
    fn in_progress_is_transient() {
        let err: Error = io::Error::from_raw_os_error(libc::EINPROGRESS).into();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
        assert!(err.is_transient());
    }
}
