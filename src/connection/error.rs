//! Transport-level errors and the reasons a connection ends.

use crate::http::BodyOverflow;
use crate::protocol::{ParseError, StatusCode};
use std::fmt;
use std::io;
use thiserror::Error;

/// The peer is gone, or the connection was already torn down.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("connection closed")]
pub struct ConnectionClosed;

/// Errors that end a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed request
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The request head did not fit in the read buffer
    #[error("request too large for a {capacity} byte buffer")]
    RequestTooLarge { capacity: usize },

    /// Body bytes beyond the declared Content-Length
    #[error(transparent)]
    BodyOverflow(#[from] BodyOverflow),

    /// Writing to the peer failed because the connection is closed
    #[error(transparent)]
    Closed(#[from] ConnectionClosed),
}

impl ConnectionError {
    /// The status sent to the client before disconnecting, if any.
    ///
    /// Transport failures get no response: there is nobody to send it to.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ConnectionError::Parse(e) => Some(e.status()),
            ConnectionError::RequestTooLarge { .. } | ConnectionError::BodyOverflow(_) => {
                Some(StatusCode::BAD_REQUEST)
            }
            ConnectionError::Io(_) | ConnectionError::Closed(_) => None,
        }
    }

    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            ConnectionError::Io(e) => DisconnectReason::from_io(e),
            ConnectionError::Parse(ParseError::BodyTooLarge { .. })
            | ConnectionError::RequestTooLarge { .. } => DisconnectReason::RequestTooLarge,
            ConnectionError::Parse(_) | ConnectionError::BodyOverflow(_) => {
                DisconnectReason::ProtocolError
            }
            ConnectionError::Closed(_) => DisconnectReason::Closed,
        }
    }
}

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed its side
    ConnectionReset,
    /// We closed after a `Connection: close` exchange
    Closed,
    ProtocolError,
    RequestTooLarge,
    /// No bytes arrived within the idle timeout
    Timeout,
    Io(io::ErrorKind),
    /// The server is stopping
    Shutdown,
}

impl DisconnectReason {
    /// Maps a socket error to a reason.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => DisconnectReason::ConnectionReset,
            io::ErrorKind::TimedOut => DisconnectReason::Timeout,
            kind => DisconnectReason::Io(kind),
        }
    }

    /// Whether this is an ordinary end of a connection rather than a fault.
    pub fn is_graceful(&self) -> bool {
        matches!(
            self,
            DisconnectReason::ConnectionReset | DisconnectReason::Closed | DisconnectReason::Shutdown
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ConnectionReset => f.write_str("connection reset"),
            DisconnectReason::Closed => f.write_str("closed"),
            DisconnectReason::ProtocolError => f.write_str("protocol error"),
            DisconnectReason::RequestTooLarge => f.write_str("request too large"),
            DisconnectReason::Timeout => f.write_str("idle timeout"),
            DisconnectReason::Io(kind) => write!(f, "I/O error ({})", kind),
            DisconnectReason::Shutdown => f.write_str("server shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_for_errors() {
        let err = ConnectionError::from(ParseError::InvalidHeader("x".into()));
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));

        let err = ConnectionError::from(ParseError::BodyTooLarge { size: 10, max: 5 });
        assert_eq!(err.status(), Some(StatusCode::PAYLOAD_TOO_LARGE));
        assert_eq!(err.disconnect_reason(), DisconnectReason::RequestTooLarge);

        let err = ConnectionError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(err.status(), None);
        assert_eq!(err.disconnect_reason(), DisconnectReason::ConnectionReset);
    }

    #[test]
    fn test_io_reason_mapping() {
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(
            DisconnectReason::from_io(&err),
            DisconnectReason::Io(io::ErrorKind::PermissionDenied)
        );
        assert!(!DisconnectReason::from_io(&err).is_graceful());
        assert!(DisconnectReason::Shutdown.is_graceful());
    }
}
