//! # relwire-client
//!
//! Client library for relwire.
//!
//! This crate provides:
//! - A blocking port with SCRAM login and negotiated wire encryption
//! - Lazy mode: poolable requests are queued and sent with the next call
//! - Proxies for attachments, transactions, statements, cursors, blobs,
//!   batches, compiled requests and the service manager
//! - Event subscriptions delivered over an aux channel
//! - Cancellation from another thread while a request is pending

pub mod attachment;
pub mod auth;
pub mod batch;
pub mod blob;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod events;
pub mod port;
mod proxy;
pub mod request;
pub mod service;
pub mod statement;
pub mod transaction;

pub use attachment::Attachment;
pub use batch::{Batch, BatchOptions, BlobPolicy, CompletionState};
pub use blob::Blob;
pub use connection::{ConnectionConfig, TcpTransport, Transport, WireCrypt};
pub use cursor::Cursor;
pub use error::ClientError;
pub use events::Events;
pub use port::{Port, Session};
pub use proxy::INFO_BUFFER_LENGTH;
pub use request::Request;
pub use service::Service;
pub use statement::{Statement, StatementType};
pub use transaction::Transaction;

pub use relwire_protocol::packet::{CancelKind, EventCount, SeekMode};
pub use relwire_protocol::{Field, FieldType, MessageFormat, ParamBlock, Value};

/// Connects and logs in.
pub fn connect(config: ConnectionConfig) -> Result<std::sync::Arc<Port>, ClientError> {
    Port::connect(config)
}
