//! Error taxonomy shared by every subsystem in the crate.

use std::io;

/// The single error type returned from fallible operations across `netcore`.
///
/// Every variant maps to a kind named in the networking-toolkit error
/// taxonomy: I/O failures keep the native error when the platform gives us
/// one, logic errors describe misuse rather than environmental failure, and
/// a handful of kinds exist purely so callers can match on them instead of
/// inspecting a message string.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An underlying system call failed.
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// A bounded wait expired.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A non-blocking operation would have blocked. Used internally to
    /// translate `EAGAIN`/`EWOULDBLOCK`; rarely surfaced to callers.
    #[error("operation would block")]
    WouldBlock,

    /// A non-blocking connect is still pending. Only `connect_non_blocking`
    /// surfaces this.
    #[error("connection attempt in progress")]
    InProgress,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("connection aborted")]
    ConnectionAborted,

    #[error("host unreachable")]
    HostUnreachable,

    /// Bad address, bad buffer, port out of range, length out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Hostname resolution failed.
    #[error("failed to resolve '{host}': {reason}")]
    Resolve { host: String, reason: String },

    /// Misuse: closed socket, uninitialized socket, double-init, send on
    /// unconnected UDP socket, and similar caller errors.
    #[error("logic error: {0}")]
    Logic(&'static str),

    /// Feature not available on this platform (`SO_REUSEPORT`, IPv6
    /// multicast on platforms that don't support it, and so on).
    #[error("unsupported on this platform: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn io(context: &'static str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::TimedOut => Error::Timeout(std::time::Duration::ZERO),
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            io::ErrorKind::ConnectionReset => Error::ConnectionReset,
            io::ErrorKind::ConnectionAborted => Error::ConnectionAborted,
            _ => match raw_os_error_kind(&source) {
                Some(RawKind::HostUnreachable) => Error::HostUnreachable,
                _ => Error::Io { context, source },
            },
        }
    }

    /// `true` for the handful of kinds a caller can reasonably retry after
    /// (timeouts and would-block); everything else indicates a terminal or
    /// logic failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::WouldBlock)
    }
}

enum RawKind {
    HostUnreachable,
}

fn raw_os_error_kind(err: &io::Error) -> Option<RawKind> {
    let code = err.raw_os_error()?;
    #[cfg(unix)]
    {
        if code == libc::EHOSTUNREACH {
            return Some(RawKind::HostUnreachable);
        }
    }
    let _ = code;
    None
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::io("I/O operation failed", source)
    }
}
