//! # relwire-engine
//!
//! The engine side of relwire.
//!
//! This crate provides:
//! - The traits the server drives (attachments, transactions, statements,
//!   cursors, blobs, requests, services)
//! - Cooperative cancellation through [`CancelToken`]
//! - [`MemoryEngine`], an in-process engine with a small SQL dialect

pub mod api;
pub mod blob;
pub mod database;
pub mod error;
pub mod memory;
pub mod request;
pub mod service;
pub mod sql;
pub mod statement;

pub use api::{
    AttachParams, BlobSegment, CancelToken, Engine, EngineAttachment, EngineBlob, EngineCursor,
    EngineRequest, EngineService, EngineStatement, EngineTransaction, EventCallback, ExecOutcome,
    StatementType,
};
pub use error::EngineError;
pub use memory::{MemoryEngine, ENGINE_VERSION};
