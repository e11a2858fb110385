//! Transport error types.
//!
//! Every fallible operation in the engine returns an [`Error`] value; no
//! exceptions, no panics for recoverable conditions. An error carries an
//! abstract [`ErrorKind`], the [`ErrorCategory`] of its origin, and the
//! OS-level error code when one exists, for diagnostics.

use std::fmt;
use std::io;

/// The origin of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCategory {
    /// Raised by the operating system.
    System,
    /// Raised by the transport engine itself.
    Transport,
    /// Raised by a collaborator outside the engine (resolver, encryption).
    Generic,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Transport => write!(f, "transport"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

/// Abstract classification of a transport error.
///
/// `WouldBlock` and `Interrupted` are absorbed by the retry logic inside the
/// syscall facade and never surface to application callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// The operation cannot complete now without blocking.
    WouldBlock,
    /// The operation was interrupted by a signal.
    Interrupted,
    /// The operation is logically invalid in the current state.
    Invalid,
    /// The peer is unreachable.
    Unreachable,
    /// The local address is already in use.
    AddressInUse,
    /// The local address is not available on this host.
    AddressNotAvailable,
    /// The peer actively refused the connection.
    ConnectionRefused,
    /// The peer reset the connection.
    ConnectionReset,
    /// The connection is no longer usable.
    ConnectionDead,
    /// The peer has shut down its sending side.
    Eof,
    /// The operation was cancelled before it completed.
    Cancelled,
    /// A configured limit was reached.
    Limit,
    /// Memory could not be obtained.
    NoMemory,
    /// The operation is not implemented on this platform or transport.
    NotImplemented,
    /// The operation was refused by flow control.
    WouldFlowControl,
    /// The operation has been accepted but has not yet completed.
    Pending,
    /// The TLS handshake failed.
    TlsHandshake,
    /// The peer sent a fatal TLS alert.
    TlsAlert,
    /// The name does not resolve to any record.
    DnsNoSuchRecord,
    /// The name resolution timed out.
    DnsTimeout,
    /// An error that maps to no other classification.
    Other,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::WouldBlock => "operation would block",
            Self::Interrupted => "operation interrupted",
            Self::Invalid => "invalid operation",
            Self::Unreachable => "peer unreachable",
            Self::AddressInUse => "address in use",
            Self::AddressNotAvailable => "address not available",
            Self::ConnectionRefused => "connection refused",
            Self::ConnectionReset => "connection reset",
            Self::ConnectionDead => "connection dead",
            Self::Eof => "end of file",
            Self::Cancelled => "operation cancelled",
            Self::Limit => "limit reached",
            Self::NoMemory => "out of memory",
            Self::NotImplemented => "not implemented",
            Self::WouldFlowControl => "operation refused by flow control",
            Self::Pending => "operation pending",
            Self::TlsHandshake => "TLS handshake failure",
            Self::TlsAlert => "TLS alert",
            Self::DnsNoSuchRecord => "no such record",
            Self::DnsTimeout => "name resolution timed out",
            Self::Other => "error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error raised by a transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Error {
    kind: ErrorKind,
    category: ErrorCategory,
    code: Option<i32>,
}

impl Error {
    /// Create a transport-category error of the specified `kind`.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            category: ErrorCategory::Transport,
            code: None,
        }
    }

    /// Create a generic-category error of the specified `kind`.
    #[must_use]
    pub const fn generic(kind: ErrorKind) -> Self {
        Self {
            kind,
            category: ErrorCategory::Generic,
            code: None,
        }
    }

    /// Create a system-category error of the specified `kind` and OS `code`.
    #[must_use]
    pub const fn system(kind: ErrorKind, code: i32) -> Self {
        Self {
            kind,
            category: ErrorCategory::System,
            code: Some(code),
        }
    }

    /// The abstract classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The origin of this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.category
    }

    /// The OS-level error code, if the error originated in a system call.
    #[must_use]
    pub const fn code(&self) -> Option<i32> {
        self.code
    }

    /// True if a non-blocking retry of the failed operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::WouldBlock | ErrorKind::Interrupted)
    }

    /// True if the error indicates the connection is unusable.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionDead
                | ErrorKind::Unreachable
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({} error {})", self.kind, self.category, code),
            None => write!(f, "{} ({})", self.kind, self.category),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        let kind = match error.kind() {
            io::ErrorKind::WouldBlock => ErrorKind::WouldBlock,
            io::ErrorKind::Interrupted => ErrorKind::Interrupted,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorKind::Invalid,
            io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe => {
                ErrorKind::ConnectionDead
            }
            io::ErrorKind::NotConnected => ErrorKind::ConnectionDead,
            io::ErrorKind::AddrInUse => ErrorKind::AddressInUse,
            io::ErrorKind::AddrNotAvailable => ErrorKind::AddressNotAvailable,
            io::ErrorKind::TimedOut => ErrorKind::Unreachable,
            io::ErrorKind::UnexpectedEof => ErrorKind::Eof,
            io::ErrorKind::OutOfMemory => ErrorKind::NoMemory,
            io::ErrorKind::Unsupported => ErrorKind::NotImplemented,
            _ => ErrorKind::Other,
        };

        match error.raw_os_error() {
            Some(code) => Self::system(kind, code),
            None => Self {
                kind,
                category: ErrorCategory::System,
                code: None,
            },
        }
    }
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_io_errors() {
        let error = Error::from(io::Error::from(io::ErrorKind::WouldBlock));
        assert_eq!(error.kind(), ErrorKind::WouldBlock);
        assert!(error.is_retryable());

        let error = Error::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(error.kind(), ErrorKind::ConnectionReset);
        assert!(error.is_fatal());
        assert_eq!(error.category(), ErrorCategory::System);
    }

    #[cfg(unix)]
    #[test]
    fn preserves_os_code() {
        let error = Error::from(io::Error::from_raw_os_error(libc::ECONNREFUSED));
        assert_eq!(error.kind(), ErrorKind::ConnectionRefused);
        assert_eq!(error.code(), Some(libc::ECONNREFUSED));
    }

    #[test]
    fn orders_and_hashes() {
        use std::collections::HashSet;
        let mut seen = HashSet::new();
        seen.insert(Error::new(ErrorKind::Cancelled));
        seen.insert(Error::new(ErrorKind::Cancelled));
        assert_eq!(seen.len(), 1);
        assert!(Error::new(ErrorKind::WouldBlock) < Error::new(ErrorKind::Cancelled));
    }
}
