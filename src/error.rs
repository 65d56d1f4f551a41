//! Error taxonomy for the session substrate.
//!
//! Every failure that crosses a component boundary is classified into one of
//! the variants below. Conversions from transport-level errors flatten nested
//! wrapping into a single leading message and decide *transience* once, so
//! retry policies in the pool, the SFTP queue and the transfer engine all
//! agree on what is worth retrying.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Which deadline was missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum TimeoutKind {
    Connect,
    Read,
    Operation,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Connect => write!(f, "connect"),
            TimeoutKind::Read => write!(f, "read"),
            TimeoutKind::Operation => write!(f, "operation"),
        }
    }
}

/// Why an operation was cancelled. User cancellation and connection closure
/// surface differently ("cancelled" vs "interrupted").
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CancelKind {
    User,
    Close,
}

impl fmt::Display for CancelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelKind::User => write!(f, "cancelled"),
            CancelKind::Close => write!(f, "interrupted"),
        }
    }
}

/// The substrate-wide error type.
///
/// `Clone` is load-bearing: a merged SFTP operation satisfies several callers
/// from one execution, so its outcome (including the error arm) must be
/// clonable. Source errors are therefore flattened to strings at conversion
/// time rather than carried as boxed causes.
#[derive(Debug, Clone, thiserror::Error, serde::Serialize)]
pub enum Error {
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("bad credentials: {0}")]
    BadCredentials(String),
    #[error("host unreachable: {0}")]
    HostUnreachable(String),
    #[error("{0} timed out")]
    Timeout(TimeoutKind),
    #[error("proxy refused: {0}")]
    ProxyRefused(String),
    #[error("proxy authentication rejected")]
    ProxyAuth,
    #[error("proxy handshake timed out")]
    ProxyTimeout,
    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("shutting down")]
    Shutdown,
    #[error("overloaded: {0}")]
    Overloaded(String),
    #[error("queue full: {0}")]
    QueueFull(String),
    #[error("not connected")]
    NotConnected,
    #[error("transport not ready: {0}")]
    TransportNotReady(String),
    #[error("transport lost: {0}")]
    TransportLost(String),
    #[error("{0}")]
    Cancelled(CancelKind),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("transfer failed: {0}")]
    TransferFailed(String),
    #[error("{0}")]
    Unknown(String),
}

impl Error {
    /// Whether local retry machinery (reconnection manager, SFTP op retry,
    /// chunk retry) should take another swing before surfacing the error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::TransportLost(_) | Error::ProxyTimeout
        )
    }

    /// Errors that mean the underlying transport is gone, as opposed to the
    /// operation merely failing on a live transport.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Error::TransportLost(_) | Error::NotConnected)
    }

    pub fn transfer_failed(cause: &Error) -> Error {
        Error::TransferFailed(cause.to_string())
    }
}

/// Conservative classification: only known "session is dead" errors map to
/// `TransportLost`; everything else (policy rejection, protocol violation) is
/// permanent.
impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect | russh::Error::SendError => {
                Error::TransportLost(err.to_string())
            }
            russh::Error::IO(io) => Error::from(io),
            russh::Error::ChannelOpenFailure(reason) => {
                Error::TransportLost(format!("channel open failure: {reason:?}"))
            }
            other => Error::Unknown(other.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                Error::TransportLost(err.to_string())
            }
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Error::Timeout(TimeoutKind::Read),
            ErrorKind::ConnectionRefused => {
                Error::HostUnreachable(format!("connection refused: {err}"))
            }
            ErrorKind::NotFound => Error::NotFound(err.to_string()),
            ErrorKind::PermissionDenied => Error::PermissionDenied(err.to_string()),
            _ => Error::Unknown(err.to_string()),
        }
    }
}

impl From<russh_sftp::client::error::Error> for Error {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        use russh_sftp::client::error::Error as SftpError;
        use russh_sftp::protocol::StatusCode;
        match err {
            SftpError::Timeout => Error::Timeout(TimeoutKind::Operation),
            SftpError::IO(msg) => Error::TransportLost(msg),
            SftpError::Status(status) => match status.status_code {
                StatusCode::NoSuchFile => Error::NotFound(status.error_message),
                StatusCode::PermissionDenied => Error::PermissionDenied(status.error_message),
                StatusCode::ConnectionLost | StatusCode::NoConnection => {
                    Error::TransportLost(status.error_message)
                }
                _ => Error::Unknown(status.error_message),
            },
            other => Error::Unknown(other.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(TimeoutKind::Operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn io_loss_errors_are_transient() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
        ] {
            let err = Error::from(io::Error::new(kind, "boom"));
            assert!(err.is_transient(), "{kind:?} should be transient");
            assert!(err.is_connection_loss());
        }
    }

    #[test]
    fn fs_errors_are_permanent() {
        let not_found = Error::from(io::Error::new(io::ErrorKind::NotFound, "nope"));
        assert!(matches!(not_found, Error::NotFound(_)));
        assert!(!not_found.is_transient());

        let denied = Error::from(io::Error::new(io::ErrorKind::PermissionDenied, "no"));
        assert!(matches!(denied, Error::PermissionDenied(_)));
        assert!(!denied.is_transient());
    }

    #[test]
    fn timeouts_are_transient() {
        assert!(Error::Timeout(TimeoutKind::Connect).is_transient());
        assert!(Error::Timeout(TimeoutKind::Operation).is_transient());
    }

    #[test]
    fn cancel_kinds_render_distinctly() {
        assert_eq!(Error::Cancelled(CancelKind::User).to_string(), "cancelled");
        assert_eq!(
            Error::Cancelled(CancelKind::Close).to_string(),
            "interrupted"
        );
    }

    #[test]
    fn refused_dial_maps_to_host_unreachable() {
        let err = Error::from(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(matches!(err, Error::HostUnreachable(_)));
    }
}
