//! Client error types.

use relwire_protocol::{Opcode, ProtocolError, StatusVector};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The byte stream from the server could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A row or parameter block built locally did not fit its format.
    #[error("invalid message: {0}")]
    Message(ProtocolError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("unexpected {0:?} from server")]
    UnexpectedPacket(Opcode),

    #[error("connection rejected: {0}")]
    Rejected(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    /// Engine-side failure carried in a response status vector.
    #[error("{0}")]
    Engine(StatusVector),

    /// A pipelined request failed; reported when the queue was flushed.
    #[error("deferred {opcode:?} failed: {status}")]
    Deferred { opcode: Opcode, status: StatusVector },

    #[error("{0} handle used after release")]
    Released(&'static str),

    #[error("another cancel is already in flight on this connection")]
    AsyncInProgress,

    #[error("{0}")]
    Usage(String),
}

impl ClientError {
    /// True when the connection is gone and the caller must reconnect.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Protocol(_)
                | ClientError::ConnectionClosed
                | ClientError::Timeout
                | ClientError::UnexpectedPacket(_)
        )
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) | ClientError::Timeout | ClientError::ConnectionClosed => true,
            ClientError::AsyncInProgress => true,
            _ => false,
        }
    }

    /// Primary engine error code, if the server reported one.
    pub fn gds_code(&self) -> Option<u32> {
        match self {
            ClientError::Engine(status) | ClientError::Deferred { status, .. } => {
                status.primary_code()
            }
            _ => None,
        }
    }

    pub fn status(&self) -> Option<&StatusVector> {
        match self {
            ClientError::Engine(status) | ClientError::Deferred { status, .. } => Some(status),
            _ => None,
        }
    }

    pub(crate) fn usage(reason: impl Into<String>) -> Self {
        ClientError::Usage(reason.into())
    }

    /// Maps socket errors, turning read timeouts into `Timeout`.
    pub(crate) fn from_io(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => ClientError::Timeout,
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => ClientError::ConnectionClosed,
            _ => ClientError::Io(e),
        }
    }
}
