//! Engine error types.

use relwire_protocol::status::codes;
use relwire_protocol::{HandleError, ProtocolError, StatusVector};
use thiserror::Error;

/// Errors raised behind the engine API.
///
/// Every variant maps to a stable error code so the server can report it in
/// a status vector without closing the connection.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("database not found: {name}")]
    DatabaseNotFound { name: String },

    #[error("database already exists: {name}")]
    DatabaseExists { name: String },

    #[error("table not found: {table}")]
    TableNotFound { table: String },

    #[error("table already exists: {table}")]
    TableExists { table: String },

    #[error("column not found: {column}")]
    ColumnNotFound { column: String },

    #[error("SQL error: {reason}")]
    Syntax { reason: String },

    #[error("violation of PRIMARY KEY on {table}: duplicate value {key}")]
    UniqueViolation { table: String, key: String },

    #[error("invalid transaction state: {reason}")]
    TransactionState { reason: String },

    #[error("transaction belongs to another attachment")]
    ForeignTransaction,

    #[error("statement does not produce a cursor")]
    NoCursor,

    #[error("cursor is not scrollable")]
    NotScrollable,

    #[error("blob not found: {id}")]
    BlobNotFound { id: u64 },

    #[error("end of blob")]
    BlobEof,

    #[error("invalid blob parameters: {reason}")]
    BadBpb { reason: String },

    #[error("request in invalid state: {reason}")]
    RequestState { reason: String },

    #[error("unknown service action: {action}")]
    ServiceUnknown { action: u32 },

    #[error("database {name} requires an encryption key")]
    KeyRequired { name: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("not supported: {feature}")]
    Unsupported { feature: String },

    #[error("message error: {0}")]
    Message(#[from] ProtocolError),

    #[error("handle error: {0}")]
    Handle(#[from] HandleError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn syntax(reason: impl Into<String>) -> Self {
        EngineError::Syntax {
            reason: reason.into(),
        }
    }

    /// Returns whether the caller may retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    /// Returns the primary error code reported on the wire.
    pub fn gds_code(&self) -> u32 {
        match self {
            EngineError::DatabaseNotFound { .. } => codes::DATABASE_UNKNOWN,
            EngineError::DatabaseExists { .. } => codes::DATABASE_EXISTS,
            EngineError::TableNotFound { .. } => codes::TABLE_UNKNOWN,
            EngineError::TableExists { .. } => codes::TABLE_EXISTS,
            EngineError::ColumnNotFound { .. } => codes::SQL_SYNTAX,
            EngineError::Syntax { .. } => codes::SQL_SYNTAX,
            EngineError::UniqueViolation { .. } => codes::UNIQUE_KEY_VIOLATION,
            EngineError::TransactionState { .. } => codes::TRANSACTION_STATE,
            EngineError::ForeignTransaction => codes::BAD_TRANS_HANDLE,
            EngineError::NoCursor => codes::NO_CURSOR,
            EngineError::NotScrollable => codes::CURSOR_NOT_SCROLLABLE,
            EngineError::BlobNotFound { .. } => codes::BLOB_NOT_FOUND,
            EngineError::BlobEof => codes::SEGSTR_EOF,
            EngineError::BadBpb { .. } => codes::BAD_BPB,
            EngineError::RequestState { .. } => codes::REQUEST_STATE,
            EngineError::ServiceUnknown { .. } => codes::SERVICE_UNKNOWN,
            EngineError::KeyRequired { .. } => codes::CRYPT_KEY_MISSING,
            EngineError::Cancelled => codes::CANCELLED,
            EngineError::Unsupported { .. } => codes::IMPLEMENT,
            EngineError::Message(_) => codes::MESSAGE_FORMAT,
            EngineError::Handle(e) => e.gds_code(),
            EngineError::Internal(_) => codes::INTERNAL,
        }
    }

    /// Five-character SQLSTATE, where one applies.
    pub fn sql_state(&self) -> Option<&'static str> {
        match self {
            EngineError::UniqueViolation { .. } => Some("23000"),
            EngineError::Syntax { .. } | EngineError::ColumnNotFound { .. } => Some("42000"),
            EngineError::TableNotFound { .. } => Some("42S02"),
            EngineError::TableExists { .. } => Some("42S01"),
            EngineError::Cancelled => Some("HY008"),
            EngineError::TransactionState { .. } => Some("25000"),
            _ => None,
        }
    }

    /// Builds the status vector sent back to the client.
    pub fn status(&self) -> StatusVector {
        let mut status = StatusVector::error(self.gds_code()).with_str(self.to_string());
        if let Some(state) = self.sql_state() {
            status = status.with_sql_state(state);
        }
        status
    }
}
