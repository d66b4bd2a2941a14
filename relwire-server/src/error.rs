//! Server error types.

use relwire_engine::EngineError;
use relwire_protocol::status::codes;
use relwire_protocol::{HandleError, Opcode, ProtocolError, StatusVector};
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("{0}")]
    Handle(#[from] HandleError),

    #[error("{0:?} is not allowed before the connection is accepted")]
    NotAuthenticated(Opcode),

    /// Deliberately carries no detail; the cause is logged server-side.
    #[error("login failed")]
    LoginFailed,

    #[error("wire encryption is required")]
    WireCryptRequired,

    #[error("another asynchronous operation is in progress")]
    AsyncInProgress,

    #[error("unexpected {0:?} from client")]
    UnexpectedPacket(Opcode),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Refused with a specific status, connection stays usable.
    #[error("request rejected: {0}")]
    Rejected(StatusVector),

    #[error("connection is broken")]
    Broken,

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        ServerError::InvalidRequest(reason.into())
    }

    /// Builds the status vector reported to the client.
    pub fn status(&self) -> StatusVector {
        match self {
            ServerError::Engine(e) => e.status(),
            ServerError::Rejected(status) => status.clone(),
            ServerError::Handle(e) => StatusVector::error(e.gds_code()).with_str(e.to_string()),
            ServerError::LoginFailed => StatusVector::error(codes::LOGIN)
                .with_str("Your user name and password are not defined")
                .with_sql_state("28000"),
            ServerError::WireCryptRequired => {
                StatusVector::error(codes::WIRE_CRYPT_REQUIRED).with_str(self.to_string())
            }
            ServerError::AsyncInProgress => {
                StatusVector::error(codes::ASYNC_ACTIVE).with_str(self.to_string())
            }
            ServerError::ShuttingDown => {
                StatusVector::error(codes::SHUTDOWN).with_str(self.to_string())
            }
            ServerError::Io(_) | ServerError::Broken => {
                StatusVector::error(codes::NETWORK_ERROR).with_str(self.to_string())
            }
            ServerError::Protocol(ProtocolError::FormatMismatch(_)) => {
                StatusVector::error(codes::MESSAGE_FORMAT).with_str(self.to_string())
            }
            ServerError::Protocol(_)
            | ServerError::NotAuthenticated(_)
            | ServerError::UnexpectedPacket(_)
            | ServerError::InvalidRequest(_) => {
                StatusVector::error(codes::PROTOCOL).with_str(self.to_string())
            }
        }
    }

    /// Returns whether the connection must be closed after this error.
    ///
    /// Engine errors and unknown handles are reported and the connection
    /// stays usable; everything that breaks the packet stream is fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            ServerError::Engine(_)
            | ServerError::Handle(_)
            | ServerError::AsyncInProgress
            | ServerError::Rejected(_)
            | ServerError::InvalidRequest(_) => false,
            ServerError::Protocol(ProtocolError::FormatMismatch(_)) => false,
            _ => true,
        }
    }
}
