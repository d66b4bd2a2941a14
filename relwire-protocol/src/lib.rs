//! # relwire-protocol
//!
//! Wire protocol for relwire, the remote interface to a relational engine.
//!
//! This crate provides:
//! - The opcode vocabulary and the `Packet` union with a bit-exact codec
//! - Status vectors, the only channel for engine errors across the wire
//! - Parameter blocks, info buffers and row message formats
//! - Per-connection handle tables
//! - Framing for blob data streamed into batches
//! - The stream cipher used once wire encryption is negotiated, and the
//!   SCRAM primitives that produce its key

pub mod blobstream;
pub mod codec;
pub mod crypt;
pub mod error;
pub mod format;
pub mod handle;
pub mod info;
pub mod opcode;
pub mod packet;
pub mod pblock;
pub mod scram;
pub mod status;
pub mod wire;

pub use codec::{Decoder, Encoder};
pub use crypt::{CipherPair, WireCipher};
pub use error::ProtocolError;
pub use format::{Field, FieldType, MessageFormat, Value};
pub use handle::{HandleError, HandleTable, ObjectKind};
pub use info::{InfoResponse, InfoWriter};
pub use opcode::Opcode;
pub use packet::{FetchOp, Packet, Response};
pub use pblock::ParamBlock;
pub use status::{StatusArg, StatusVector};

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 3;

/// Oldest protocol version accepted unless configured otherwise.
pub const MIN_PROTOCOL_VERSION: u32 = 2;

/// Default port for the relwire server.
pub const DEFAULT_PORT: u16 = 3050;

/// Maximum size of a single variable-length field (16 MiB).
pub const MAX_FIELD_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum live handles of one kind per connection.
pub const MAX_HANDLES: u32 = 65_000;
