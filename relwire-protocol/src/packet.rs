//! The packet union.
//!
//! Every frame on the wire is `opcode:u32` followed by the fields of the arm
//! that opcode selects. There is no outer length: the opcode fully determines
//! the layout, so a decoder reads fields until the arm is complete.

use crate::error::ProtocolError;
use crate::opcode::Opcode;
use crate::status::StatusVector;
use crate::wire::{WireReader, WireWrite};
use bytes::{BufMut, Bytes, BytesMut};

/// Upper bound on repeated elements (offers, rows, counts) in one packet.
pub const MAX_ELEMENTS: u32 = 1 << 20;

/// Server-side protocol types offered in `Connect` and chosen in `Accept`.
pub mod ptype {
    /// One request, one response.
    pub const SYNC: u32 = 2;
    /// Poolable requests may be deferred and answered together.
    pub const LAZY: u32 = 5;
}

/// Fields shared by every arm: how to put them on the wire and read them back.
pub trait Payload: Sized {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError>;
    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError>;
}

fn read_count(reader: &mut WireReader<'_>) -> Result<u32, ProtocolError> {
    let count = reader.u32()?;
    if count > MAX_ELEMENTS {
        return Err(ProtocolError::FieldTooLarge {
            size: count,
            max: MAX_ELEMENTS,
        });
    }
    Ok(count)
}

fn put_strings(buf: &mut BytesMut, values: &[String]) -> Result<(), ProtocolError> {
    buf.put_u32(values.len() as u32);
    for value in values {
        buf.put_wire_str(value)?;
    }
    Ok(())
}

fn read_strings(reader: &mut WireReader<'_>) -> Result<Vec<String>, ProtocolError> {
    let count = read_count(reader)?;
    let mut out = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        out.push(reader.string()?);
    }
    Ok(out)
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident, $label:literal { $($variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub fn as_u32(self) -> u32 {
                self as u32
            }
        }

        impl TryFrom<u32> for $name {
            type Error = ProtocolError;

            fn try_from(value: u32) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok($name::$variant),)+
                    other => Err(ProtocolError::InvalidEnum {
                        field: $label,
                        value: other,
                    }),
                }
            }
        }
    };
}

wire_enum!(
    /// Cursor movement requested by a fetch.
    FetchOp, "fetch op" {
        Next = 0,
        Prior = 1,
        First = 2,
        Last = 3,
        Absolute = 4,
        Relative = 5,
    }
);

wire_enum!(
    /// What `FreeStatement` does to the statement.
    FreeOption, "free option" {
        Close = 1,
        Drop = 2,
        Unprepare = 4,
    }
);

wire_enum!(
    /// Operational cancel request.
    CancelKind, "cancel kind" {
        Disable = 1,
        Enable = 2,
        Raise = 3,
        Abort = 4,
    }
);

wire_enum!(
    /// Origin for a blob seek.
    SeekMode, "seek mode" {
        Start = 0,
        Current = 1,
        End = 2,
    }
);

wire_enum!(
    /// Kind of sibling channel requested by `ConnectRequest`.
    ChannelKind, "channel kind" {
        Async = 1,
    }
);

/// One protocol version the client can speak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolOffer {
    pub version: u32,
    pub min_type: u32,
    pub max_type: u32,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub versions: Vec<ProtocolOffer>,
    /// User identification block (see [`crate::pblock::user_id`]).
    pub user_id: Bytes,
}

impl Payload for Connect {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.versions.len() as u32);
        for offer in &self.versions {
            buf.put_u32(offer.version);
            buf.put_u32(offer.min_type);
            buf.put_u32(offer.max_type);
            buf.put_u32(offer.weight);
        }
        buf.put_wire_bytes(&self.user_id)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let count = read_count(reader)?;
        let mut versions = Vec::with_capacity(count.min(16) as usize);
        for _ in 0..count {
            versions.push(ProtocolOffer {
                version: reader.u32()?,
                min_type: reader.u32()?,
                max_type: reader.u32()?,
                weight: reader.u32()?,
            });
        }
        Ok(Self {
            versions,
            user_id: reader.bytes()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accept {
    pub version: u32,
    pub ptype: u32,
}

impl Payload for Accept {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.version);
        buf.put_u32(self.ptype);
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            version: reader.u32()?,
            ptype: reader.u32()?,
        })
    }
}

/// Accept carrying auth state; also the body of `CondAccept`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptData {
    pub version: u32,
    pub ptype: u32,
    pub plugin: String,
    pub authenticated: bool,
    pub data: Bytes,
    /// Key types the server can use for wire encryption.
    pub keys: Vec<String>,
}

impl Payload for AcceptData {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.version);
        buf.put_u32(self.ptype);
        buf.put_wire_str(&self.plugin)?;
        buf.put_wire_bool(self.authenticated);
        buf.put_wire_bytes(&self.data)?;
        put_strings(buf, &self.keys)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            version: reader.u32()?,
            ptype: reader.u32()?,
            plugin: reader.string()?,
            authenticated: reader.bool()?,
            data: reader.bytes()?,
            keys: read_strings(reader)?,
        })
    }
}

/// Generic reply: object id, blob id, payload and status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub object: u32,
    pub blob_id: u64,
    pub data: Bytes,
    pub status: StatusVector,
}

impl Response {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_object(object: u32) -> Self {
        Self {
            object,
            ..Self::default()
        }
    }

    pub fn with_data(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn error(status: StatusVector) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }
}

impl Payload for Response {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.object);
        buf.put_u64(self.blob_id);
        buf.put_wire_bytes(&self.data)?;
        self.status.encode(buf)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            object: reader.u32()?,
            blob_id: reader.u64()?,
            data: reader.bytes()?,
            status: StatusVector::decode(reader)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub kind: ChannelKind,
    pub attachment: u32,
}

impl Payload for ConnectRequest {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.kind.as_u32());
        buf.put_u32(self.attachment);
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: ChannelKind::try_from(reader.u32()?)?,
            attachment: reader.u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxConnect {
    pub token: u64,
}

impl Payload for AuxConnect {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u64(self.token);
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            token: reader.u64()?,
        })
    }
}

/// Attach, create, and service attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachDb {
    pub database: String,
    pub dpb: Bytes,
}

impl Payload for AttachDb {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_wire_str(&self.database)?;
        buf.put_wire_bytes(&self.dpb)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            database: reader.string()?,
            dpb: reader.bytes()?,
        })
    }
}

/// Packets whose only field is the handle they act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef {
    pub id: u32,
}

impl ObjectRef {
    pub fn new(id: u32) -> Self {
        Self { id }
    }
}

impl Payload for ObjectRef {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.id);
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self { id: reader.u32()? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartTransaction {
    pub attachment: u32,
    pub tpb: Bytes,
}

impl Payload for StartTransaction {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.attachment);
        buf.put_wire_bytes(&self.tpb)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            attachment: reader.u32()?,
            tpb: reader.bytes()?,
        })
    }
}

/// Two-phase prepare with a caller-supplied message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepare2 {
    pub transaction: u32,
    pub message: Bytes,
}

impl Payload for Prepare2 {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.transaction);
        buf.put_wire_bytes(&self.message)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            transaction: reader.u32()?,
            message: reader.bytes()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenBlob {
    pub transaction: u32,
    pub blob_id: u64,
    pub bpb: Bytes,
}

impl Payload for OpenBlob {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.transaction);
        buf.put_u64(self.blob_id);
        buf.put_wire_bytes(&self.bpb)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            transaction: reader.u32()?,
            blob_id: reader.u64()?,
            bpb: reader.bytes()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBlob {
    pub transaction: u32,
    pub bpb: Bytes,
}

impl Payload for CreateBlob {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.transaction);
        buf.put_wire_bytes(&self.bpb)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            transaction: reader.u32()?,
            bpb: reader.bytes()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetSegment {
    pub blob: u32,
    /// Caller's buffer size; the reply never carries more.
    pub length: u32,
}

impl Payload for GetSegment {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.blob);
        buf.put_u32(self.length);
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            blob: reader.u32()?,
            length: reader.u32()?,
        })
    }
}

/// `PutSegment` and `BatchSegments`.
///
/// For `BatchSegments` the data is a sequence of `len:u16, bytes` segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobData {
    pub blob: u32,
    pub data: Bytes,
}

impl Payload for BlobData {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.blob);
        buf.put_wire_bytes(&self.data)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            blob: reader.u32()?,
            data: reader.bytes()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seek {
    pub blob: u32,
    pub mode: SeekMode,
    pub offset: i64,
}

impl Payload for Seek {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.blob);
        buf.put_u32(self.mode.as_u32());
        buf.put_i64(self.offset);
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            blob: reader.u32()?,
            mode: SeekMode::try_from(reader.u32()?)?,
            offset: reader.i64()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareStatement {
    pub transaction: u32,
    pub statement: u32,
    pub dialect: u32,
    pub sql: String,
    /// Info items to return with the prepare reply.
    pub items: Bytes,
    pub buffer_length: u32,
}

impl Payload for PrepareStatement {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.transaction);
        buf.put_u32(self.statement);
        buf.put_u32(self.dialect);
        buf.put_wire_str(&self.sql)?;
        buf.put_wire_bytes(&self.items)?;
        buf.put_u32(self.buffer_length);
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            transaction: reader.u32()?,
            statement: reader.u32()?,
            dialect: reader.u32()?,
            sql: reader.string()?,
            items: reader.bytes()?,
            buffer_length: reader.u32()?,
        })
    }
}

/// Statement id standing for the statement allocated last on the
/// connection, so a deferred allocate can be followed by its prepare.
pub const LAST_OBJECT: u32 = 0xFFFF;

/// Cursor flags carried by `Execute`.
pub mod cursor_flags {
    pub const SCROLLABLE: u32 = 1;
}

/// `Execute` and `Execute2`. Only `Execute2` returns an output message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execute {
    pub statement: u32,
    pub transaction: u32,
    pub in_format: Bytes,
    pub in_message: Bytes,
    pub out_format: Bytes,
    pub cursor_flags: u32,
}

impl Payload for Execute {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.statement);
        buf.put_u32(self.transaction);
        buf.put_wire_bytes(&self.in_format)?;
        buf.put_wire_bytes(&self.in_message)?;
        buf.put_wire_bytes(&self.out_format)?;
        buf.put_u32(self.cursor_flags);
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            statement: reader.u32()?,
            transaction: reader.u32()?,
            in_format: reader.bytes()?,
            in_message: reader.bytes()?,
            out_format: reader.bytes()?,
            cursor_flags: reader.u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecImmediate {
    pub attachment: u32,
    /// Zero when the statement runs without a caller transaction.
    pub transaction: u32,
    pub dialect: u32,
    pub sql: String,
    pub in_format: Bytes,
    pub in_message: Bytes,
    pub out_format: Bytes,
}

impl Payload for ExecImmediate {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.attachment);
        buf.put_u32(self.transaction);
        buf.put_u32(self.dialect);
        buf.put_wire_str(&self.sql)?;
        buf.put_wire_bytes(&self.in_format)?;
        buf.put_wire_bytes(&self.in_message)?;
        buf.put_wire_bytes(&self.out_format)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            attachment: reader.u32()?,
            transaction: reader.u32()?,
            dialect: reader.u32()?,
            sql: reader.string()?,
            in_format: reader.bytes()?,
            in_message: reader.bytes()?,
            out_format: reader.bytes()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetch {
    pub statement: u32,
    pub format: Bytes,
    pub count: u32,
}

impl Payload for Fetch {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.statement);
        buf.put_wire_bytes(&self.format)?;
        buf.put_u32(self.count);
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            statement: reader.u32()?,
            format: reader.bytes()?,
            count: reader.u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchScroll {
    pub statement: u32,
    pub format: Bytes,
    pub count: u32,
    pub op: FetchOp,
    pub position: i32,
}

impl Payload for FetchScroll {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.statement);
        buf.put_wire_bytes(&self.format)?;
        buf.put_u32(self.count);
        buf.put_u32(self.op.as_u32());
        buf.put_i32(self.position);
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            statement: reader.u32()?,
            format: reader.bytes()?,
            count: reader.u32()?,
            op: FetchOp::try_from(reader.u32()?)?,
            position: reader.i32()?,
        })
    }
}

/// Fetch status: rows follow, or the cursor is exhausted.
pub mod fetch_status {
    pub const OK: u32 = 0;
    pub const NO_MORE_ROWS: u32 = 100;
}

/// Blob read outcomes reported in `Response::object` of a `GetSegment` reply.
pub mod segment_state {
    /// The last segment in the buffer is complete.
    pub const COMPLETE: u32 = 0;
    /// The buffer cut the last segment short.
    pub const PARTIAL: u32 = 1;
    /// The end of the blob was reached.
    pub const EOF: u32 = 2;
}

/// Batch of fetched rows. `status` is [`fetch_status::NO_MORE_ROWS`] once the
/// cursor moved past the end (or the beginning, for backward fetches).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u32,
    pub rows: Vec<Bytes>,
}

impl Payload for FetchResponse {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.status);
        buf.put_u32(self.rows.len() as u32);
        for row in &self.rows {
            buf.put_wire_bytes(row)?;
        }
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let status = reader.u32()?;
        let count = read_count(reader)?;
        let mut rows = Vec::with_capacity(count.min(256) as usize);
        for _ in 0..count {
            rows.push(reader.bytes()?);
        }
        Ok(Self { status, rows })
    }
}

/// Singleton output of `Execute2` or `ExecImmediate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlResponse {
    pub message: Option<Bytes>,
}

impl Payload for SqlResponse {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        match &self.message {
            Some(msg) => {
                buf.put_wire_bool(true);
                buf.put_wire_bytes(msg)
            }
            None => {
                buf.put_wire_bool(false);
                Ok(())
            }
        }
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let message = if reader.bool()? {
            Some(reader.bytes()?)
        } else {
            None
        };
        Ok(Self { message })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeStatement {
    pub statement: u32,
    pub option: FreeOption,
}

impl Payload for FreeStatement {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.statement);
        buf.put_u32(self.option.as_u32());
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            statement: reader.u32()?,
            option: FreeOption::try_from(reader.u32()?)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCursor {
    pub statement: u32,
    pub name: String,
}

impl Payload for SetCursor {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.statement);
        buf.put_wire_str(&self.name)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            statement: reader.u32()?,
            name: reader.string()?,
        })
    }
}

/// Body of every per-object info query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoQuery {
    pub object: u32,
    pub items: Bytes,
    pub buffer_length: u32,
}

impl Payload for InfoQuery {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.object);
        buf.put_wire_bytes(&self.items)?;
        buf.put_u32(self.buffer_length);
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            object: reader.u32()?,
            items: reader.bytes()?,
            buffer_length: reader.u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStart {
    pub service: u32,
    pub spb: Bytes,
}

impl Payload for ServiceStart {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.service);
        buf.put_wire_bytes(&self.spb)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            service: reader.u32()?,
            spb: reader.bytes()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub service: u32,
    pub send_items: Bytes,
    pub recv_items: Bytes,
    pub buffer_length: u32,
}

impl Payload for ServiceInfo {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.service);
        buf.put_wire_bytes(&self.send_items)?;
        buf.put_wire_bytes(&self.recv_items)?;
        buf.put_u32(self.buffer_length);
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            service: reader.u32()?,
            send_items: reader.bytes()?,
            recv_items: reader.bytes()?,
            buffer_length: reader.u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCreate {
    pub statement: u32,
    pub format: Bytes,
    pub parameters: Bytes,
}

impl Payload for BatchCreate {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.statement);
        buf.put_wire_bytes(&self.format)?;
        buf.put_wire_bytes(&self.parameters)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            statement: reader.u32()?,
            format: reader.bytes()?,
            parameters: reader.bytes()?,
        })
    }
}

/// Several row messages packed back to back, each at the format's aligned length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMsg {
    pub statement: u32,
    pub count: u32,
    pub data: Bytes,
}

impl Payload for BatchMsg {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.statement);
        buf.put_u32(self.count);
        buf.put_wire_bytes(&self.data)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            statement: reader.u32()?,
            count: reader.u32()?,
            data: reader.bytes()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchExec {
    pub statement: u32,
    pub transaction: u32,
}

impl Payload for BatchExec {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.statement);
        buf.put_u32(self.transaction);
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            statement: reader.u32()?,
            transaction: reader.u32()?,
        })
    }
}

/// A slice of the batch blob stream. Blob boundaries need not align with packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchBlobStream {
    pub statement: u32,
    pub data: Bytes,
}

impl Payload for BatchBlobStream {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.statement);
        buf.put_wire_bytes(&self.data)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            statement: reader.u32()?,
            data: reader.bytes()?,
        })
    }
}

/// Registers an already existing blob under a batch-local id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRegBlob {
    pub statement: u32,
    pub existing: u64,
    pub batch_id: u64,
}

impl Payload for BatchRegBlob {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.statement);
        buf.put_u64(self.existing);
        buf.put_u64(self.batch_id);
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            statement: reader.u32()?,
            existing: reader.u64()?,
            batch_id: reader.u64()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSetBpb {
    pub statement: u32,
    pub bpb: Bytes,
}

impl Payload for BatchSetBpb {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.statement);
        buf.put_wire_bytes(&self.bpb)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            statement: reader.u32()?,
            bpb: reader.bytes()?,
        })
    }
}

/// Per-row record counts in a completion state.
pub mod record_count {
    /// The row failed.
    pub const EXECUTE_FAILED: i32 = -1;
    /// The row succeeded but no count is available.
    pub const SUCCESS_NO_INFO: i32 = -2;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchError {
    pub index: u32,
    pub status: StatusVector,
}

/// Outcome of a batch execution: aggregate count plus sparse errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCompletionState {
    pub statement: u32,
    pub total: u32,
    /// Empty unless record counts were requested.
    pub record_counts: Vec<i32>,
    /// Rows that failed, with detail.
    pub errors: Vec<BatchError>,
    /// Rows that failed beyond the detailed error limit.
    pub simple_errors: Vec<u32>,
}

impl Payload for BatchCompletionState {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.statement);
        buf.put_u32(self.total);
        buf.put_u32(self.record_counts.len() as u32);
        for count in &self.record_counts {
            buf.put_i32(*count);
        }
        buf.put_u32(self.errors.len() as u32);
        for err in &self.errors {
            buf.put_u32(err.index);
            err.status.encode(buf)?;
        }
        buf.put_u32(self.simple_errors.len() as u32);
        for index in &self.simple_errors {
            buf.put_u32(*index);
        }
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let statement = reader.u32()?;
        let total = reader.u32()?;

        let count = read_count(reader)?;
        let mut record_counts = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            record_counts.push(reader.i32()?);
        }

        let count = read_count(reader)?;
        let mut errors = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            errors.push(BatchError {
                index: reader.u32()?,
                status: StatusVector::decode(reader)?,
            });
        }

        let count = read_count(reader)?;
        let mut simple_errors = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            simple_errors.push(reader.u32()?);
        }

        Ok(Self {
            statement,
            total,
            record_counts,
            errors,
            simple_errors,
        })
    }
}

/// Event name with the count the subscriber has already seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCount {
    pub name: String,
    pub count: u32,
}

fn put_event_counts(buf: &mut BytesMut, events: &[EventCount]) -> Result<(), ProtocolError> {
    buf.put_u32(events.len() as u32);
    for event in events {
        buf.put_wire_str(&event.name)?;
        buf.put_u32(event.count);
    }
    Ok(())
}

fn read_event_counts(reader: &mut WireReader<'_>) -> Result<Vec<EventCount>, ProtocolError> {
    let count = read_count(reader)?;
    let mut events = Vec::with_capacity(count.min(16) as usize);
    for _ in 0..count {
        events.push(EventCount {
            name: reader.string()?,
            count: reader.u32()?,
        });
    }
    Ok(events)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueEvents {
    pub attachment: u32,
    pub events: Vec<EventCount>,
    /// Client-chosen id echoed in the `Event` notification.
    pub local_id: u32,
}

impl Payload for QueEvents {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.attachment);
        put_event_counts(buf, &self.events)?;
        buf.put_u32(self.local_id);
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            attachment: reader.u32()?,
            events: read_event_counts(reader)?,
            local_id: reader.u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelEvents {
    pub attachment: u32,
    pub local_id: u32,
}

impl Payload for CancelEvents {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.attachment);
        buf.put_u32(self.local_id);
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            attachment: reader.u32()?,
            local_id: reader.u32()?,
        })
    }
}

/// Event notification delivered on the aux channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub local_id: u32,
    pub events: Vec<EventCount>,
}

impl Payload for Event {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.local_id);
        put_event_counts(buf, &self.events)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            local_id: reader.u32()?,
            events: read_event_counts(reader)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compile {
    pub attachment: u32,
    pub blr: Bytes,
}

impl Payload for Compile {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.attachment);
        buf.put_wire_bytes(&self.blr)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            attachment: reader.u32()?,
            blr: reader.bytes()?,
        })
    }
}

/// `Start`, `StartAndSend`, `Send`, `Receive` and `Unwind` on a compiled request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMessage {
    pub request: u32,
    pub transaction: u32,
    pub level: u32,
    pub msg_type: u32,
    pub message: Bytes,
}

impl Payload for RequestMessage {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.request);
        buf.put_u32(self.transaction);
        buf.put_u32(self.level);
        buf.put_u32(self.msg_type);
        buf.put_wire_bytes(&self.message)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            request: reader.u32()?,
            transaction: reader.u32()?,
            level: reader.u32()?,
            msg_type: reader.u32()?,
            message: reader.bytes()?,
        })
    }
}

/// Opaque plugin data (`TrustedAuth`, `CryptKeyCallback`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthData {
    pub data: Bytes,
}

impl Payload for AuthData {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_wire_bytes(&self.data)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            data: reader.bytes()?,
        })
    }
}

/// One auth round trip after the initial connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContAuth {
    pub data: Bytes,
    pub plugin: String,
    pub plugin_list: String,
    pub keys: Vec<String>,
}

impl Payload for ContAuth {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_wire_bytes(&self.data)?;
        buf.put_wire_str(&self.plugin)?;
        buf.put_wire_str(&self.plugin_list)?;
        put_strings(buf, &self.keys)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            data: reader.bytes()?,
            plugin: reader.string()?,
            plugin_list: reader.string()?,
            keys: read_strings(reader)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crypt {
    pub plugin: String,
    pub key: String,
}

impl Payload for Crypt {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_wire_str(&self.plugin)?;
        buf.put_wire_str(&self.key)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            plugin: reader.string()?,
            key: reader.string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancel {
    pub kind: CancelKind,
}

impl Payload for Cancel {
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.kind.as_u32());
        Ok(())
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: CancelKind::try_from(reader.u32()?)?,
        })
    }
}

/// A decoded frame. The arm is fully determined by the opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    // connection
    Connect(Connect),
    Accept(Accept),
    AcceptData(AcceptData),
    CondAccept(AcceptData),
    Reject,
    Disconnect,
    Exit,
    Response(Response),
    ConnectRequest(ConnectRequest),
    AuxConnect(AuxConnect),

    // attachment
    Attach(AttachDb),
    Create(AttachDb),
    Detach(ObjectRef),
    DropDatabase(ObjectRef),

    // transaction
    Transaction(StartTransaction),
    Commit(ObjectRef),
    Rollback(ObjectRef),
    Prepare(ObjectRef),
    Prepare2(Prepare2),
    CommitRetaining(ObjectRef),
    RollbackRetaining(ObjectRef),

    // blob
    OpenBlob(OpenBlob),
    CreateBlob(CreateBlob),
    GetSegment(GetSegment),
    PutSegment(BlobData),
    BatchSegments(BlobData),
    Seek(Seek),
    CancelBlob(ObjectRef),
    CloseBlob(ObjectRef),

    // statement
    AllocateStatement(ObjectRef),
    PrepareStatement(PrepareStatement),
    Execute(Execute),
    Execute2(Execute),
    ExecImmediate(ExecImmediate),
    Fetch(Fetch),
    FetchScroll(FetchScroll),
    FetchResponse(FetchResponse),
    SqlResponse(SqlResponse),
    FreeStatement(FreeStatement),
    SetCursor(SetCursor),

    // info
    InfoDatabase(InfoQuery),
    InfoTransaction(InfoQuery),
    InfoBlob(InfoQuery),
    InfoSql(InfoQuery),
    InfoRequest(InfoQuery),

    // batch
    BatchCreate(BatchCreate),
    BatchMsg(BatchMsg),
    BatchExec(BatchExec),
    BatchCancel(ObjectRef),
    BatchRelease(ObjectRef),
    BatchSync,
    BatchBlobStream(BatchBlobStream),
    BatchRegBlob(BatchRegBlob),
    BatchSetBpb(BatchSetBpb),
    BatchCompletionState(BatchCompletionState),

    // events
    QueEvents(QueEvents),
    CancelEvents(CancelEvents),
    Event(Event),

    // compiled requests
    Compile(Compile),
    Start(RequestMessage),
    StartAndSend(RequestMessage),
    Send(RequestMessage),
    Receive(RequestMessage),
    Unwind(RequestMessage),
    Release(ObjectRef),

    // service manager
    ServiceAttach(AttachDb),
    ServiceDetach(ObjectRef),
    ServiceStart(ServiceStart),
    ServiceInfo(ServiceInfo),

    // auth and crypt
    TrustedAuth(AuthData),
    ContAuth(ContAuth),
    Crypt(Crypt),
    CryptKeyCallback(AuthData),

    // control
    Ping,
    Cancel(Cancel),
    Dummy,
}

impl Packet {
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Connect(_) => Opcode::Connect,
            Packet::Accept(_) => Opcode::Accept,
            Packet::AcceptData(_) => Opcode::AcceptData,
            Packet::CondAccept(_) => Opcode::CondAccept,
            Packet::Reject => Opcode::Reject,
            Packet::Disconnect => Opcode::Disconnect,
            Packet::Exit => Opcode::Exit,
            Packet::Response(_) => Opcode::Response,
            Packet::ConnectRequest(_) => Opcode::ConnectRequest,
            Packet::AuxConnect(_) => Opcode::AuxConnect,
            Packet::Attach(_) => Opcode::Attach,
            Packet::Create(_) => Opcode::Create,
            Packet::Detach(_) => Opcode::Detach,
            Packet::DropDatabase(_) => Opcode::DropDatabase,
            Packet::Transaction(_) => Opcode::Transaction,
            Packet::Commit(_) => Opcode::Commit,
            Packet::Rollback(_) => Opcode::Rollback,
            Packet::Prepare(_) => Opcode::Prepare,
            Packet::Prepare2(_) => Opcode::Prepare2,
            Packet::CommitRetaining(_) => Opcode::CommitRetaining,
            Packet::RollbackRetaining(_) => Opcode::RollbackRetaining,
            Packet::OpenBlob(_) => Opcode::OpenBlob,
            Packet::CreateBlob(_) => Opcode::CreateBlob,
            Packet::GetSegment(_) => Opcode::GetSegment,
            Packet::PutSegment(_) => Opcode::PutSegment,
            Packet::BatchSegments(_) => Opcode::BatchSegments,
            Packet::Seek(_) => Opcode::Seek,
            Packet::CancelBlob(_) => Opcode::CancelBlob,
            Packet::CloseBlob(_) => Opcode::CloseBlob,
            Packet::AllocateStatement(_) => Opcode::AllocateStatement,
            Packet::PrepareStatement(_) => Opcode::PrepareStatement,
            Packet::Execute(_) => Opcode::Execute,
            Packet::Execute2(_) => Opcode::Execute2,
            Packet::ExecImmediate(_) => Opcode::ExecImmediate,
            Packet::Fetch(_) => Opcode::Fetch,
            Packet::FetchScroll(_) => Opcode::FetchScroll,
            Packet::FetchResponse(_) => Opcode::FetchResponse,
            Packet::SqlResponse(_) => Opcode::SqlResponse,
            Packet::FreeStatement(_) => Opcode::FreeStatement,
            Packet::SetCursor(_) => Opcode::SetCursor,
            Packet::InfoDatabase(_) => Opcode::InfoDatabase,
            Packet::InfoTransaction(_) => Opcode::InfoTransaction,
            Packet::InfoBlob(_) => Opcode::InfoBlob,
            Packet::InfoSql(_) => Opcode::InfoSql,
            Packet::InfoRequest(_) => Opcode::InfoRequest,
            Packet::BatchCreate(_) => Opcode::BatchCreate,
            Packet::BatchMsg(_) => Opcode::BatchMsg,
            Packet::BatchExec(_) => Opcode::BatchExec,
            Packet::BatchCancel(_) => Opcode::BatchCancel,
            Packet::BatchRelease(_) => Opcode::BatchRelease,
            Packet::BatchSync => Opcode::BatchSync,
            Packet::BatchBlobStream(_) => Opcode::BatchBlobStream,
            Packet::BatchRegBlob(_) => Opcode::BatchRegBlob,
            Packet::BatchSetBpb(_) => Opcode::BatchSetBpb,
            Packet::BatchCompletionState(_) => Opcode::BatchCompletionState,
            Packet::QueEvents(_) => Opcode::QueEvents,
            Packet::CancelEvents(_) => Opcode::CancelEvents,
            Packet::Event(_) => Opcode::Event,
            Packet::Compile(_) => Opcode::Compile,
            Packet::Start(_) => Opcode::Start,
            Packet::StartAndSend(_) => Opcode::StartAndSend,
            Packet::Send(_) => Opcode::Send,
            Packet::Receive(_) => Opcode::Receive,
            Packet::Unwind(_) => Opcode::Unwind,
            Packet::Release(_) => Opcode::Release,
            Packet::ServiceAttach(_) => Opcode::ServiceAttach,
            Packet::ServiceDetach(_) => Opcode::ServiceDetach,
            Packet::ServiceStart(_) => Opcode::ServiceStart,
            Packet::ServiceInfo(_) => Opcode::ServiceInfo,
            Packet::TrustedAuth(_) => Opcode::TrustedAuth,
            Packet::ContAuth(_) => Opcode::ContAuth,
            Packet::Crypt(_) => Opcode::Crypt,
            Packet::CryptKeyCallback(_) => Opcode::CryptKeyCallback,
            Packet::Ping => Opcode::Ping,
            Packet::Cancel(_) => Opcode::Cancel,
            Packet::Dummy => Opcode::Dummy,
        }
    }

    /// Writes the packet (opcode and fields) to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.opcode().as_u32());
        match self {
            Packet::Reject
            | Packet::Disconnect
            | Packet::Exit
            | Packet::BatchSync
            | Packet::Ping
            | Packet::Dummy => Ok(()),

            Packet::Connect(p) => p.write(buf),
            Packet::Accept(p) => p.write(buf),
            Packet::AcceptData(p) | Packet::CondAccept(p) => p.write(buf),
            Packet::Response(p) => p.write(buf),
            Packet::ConnectRequest(p) => p.write(buf),
            Packet::AuxConnect(p) => p.write(buf),

            Packet::Attach(p) | Packet::Create(p) | Packet::ServiceAttach(p) => p.write(buf),

            Packet::Detach(p)
            | Packet::DropDatabase(p)
            | Packet::Commit(p)
            | Packet::Rollback(p)
            | Packet::Prepare(p)
            | Packet::CommitRetaining(p)
            | Packet::RollbackRetaining(p)
            | Packet::CancelBlob(p)
            | Packet::CloseBlob(p)
            | Packet::AllocateStatement(p)
            | Packet::BatchCancel(p)
            | Packet::BatchRelease(p)
            | Packet::Release(p)
            | Packet::ServiceDetach(p) => p.write(buf),

            Packet::Transaction(p) => p.write(buf),
            Packet::Prepare2(p) => p.write(buf),
            Packet::OpenBlob(p) => p.write(buf),
            Packet::CreateBlob(p) => p.write(buf),
            Packet::GetSegment(p) => p.write(buf),
            Packet::PutSegment(p) | Packet::BatchSegments(p) => p.write(buf),
            Packet::Seek(p) => p.write(buf),

            Packet::PrepareStatement(p) => p.write(buf),
            Packet::Execute(p) | Packet::Execute2(p) => p.write(buf),
            Packet::ExecImmediate(p) => p.write(buf),
            Packet::Fetch(p) => p.write(buf),
            Packet::FetchScroll(p) => p.write(buf),
            Packet::FetchResponse(p) => p.write(buf),
            Packet::SqlResponse(p) => p.write(buf),
            Packet::FreeStatement(p) => p.write(buf),
            Packet::SetCursor(p) => p.write(buf),

            Packet::InfoDatabase(p)
            | Packet::InfoTransaction(p)
            | Packet::InfoBlob(p)
            | Packet::InfoSql(p)
            | Packet::InfoRequest(p) => p.write(buf),

            Packet::BatchCreate(p) => p.write(buf),
            Packet::BatchMsg(p) => p.write(buf),
            Packet::BatchExec(p) => p.write(buf),
            Packet::BatchBlobStream(p) => p.write(buf),
            Packet::BatchRegBlob(p) => p.write(buf),
            Packet::BatchSetBpb(p) => p.write(buf),
            Packet::BatchCompletionState(p) => p.write(buf),

            Packet::QueEvents(p) => p.write(buf),
            Packet::CancelEvents(p) => p.write(buf),
            Packet::Event(p) => p.write(buf),

            Packet::Compile(p) => p.write(buf),
            Packet::Start(p)
            | Packet::StartAndSend(p)
            | Packet::Send(p)
            | Packet::Receive(p)
            | Packet::Unwind(p) => p.write(buf),

            Packet::ServiceStart(p) => p.write(buf),
            Packet::ServiceInfo(p) => p.write(buf),

            Packet::TrustedAuth(p) | Packet::CryptKeyCallback(p) => p.write(buf),
            Packet::ContAuth(p) => p.write(buf),
            Packet::Crypt(p) => p.write(buf),
            Packet::Cancel(p) => p.write(buf),
        }
    }

    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(64);
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decodes one packet from the front of `data`, returning it with the
    /// number of bytes consumed. Short input yields `IncompleteFrame`.
    pub fn decode_prefix(data: &[u8]) -> Result<(Packet, usize), ProtocolError> {
        let mut reader = WireReader::new(data);
        let opcode = Opcode::try_from(reader.u32()?)?;
        let packet = Self::read_arm(opcode, &mut reader)?;
        Ok((packet, reader.position()))
    }

    /// Decodes exactly one packet; leftover bytes are an error.
    pub fn decode(data: &[u8]) -> Result<Packet, ProtocolError> {
        let (packet, used) = Self::decode_prefix(data)?;
        if used != data.len() {
            return Err(ProtocolError::TrailingBytes {
                count: data.len() - used,
            });
        }
        Ok(packet)
    }

    fn read_arm(opcode: Opcode, r: &mut WireReader<'_>) -> Result<Packet, ProtocolError> {
        let packet = match opcode {
            Opcode::Connect => Packet::Connect(Connect::read(r)?),
            Opcode::Accept => Packet::Accept(Accept::read(r)?),
            Opcode::AcceptData => Packet::AcceptData(AcceptData::read(r)?),
            Opcode::CondAccept => Packet::CondAccept(AcceptData::read(r)?),
            Opcode::Reject => Packet::Reject,
            Opcode::Disconnect => Packet::Disconnect,
            Opcode::Exit => Packet::Exit,
            Opcode::Response => Packet::Response(Response::read(r)?),
            Opcode::ConnectRequest => Packet::ConnectRequest(ConnectRequest::read(r)?),
            Opcode::AuxConnect => Packet::AuxConnect(AuxConnect::read(r)?),

            Opcode::Attach => Packet::Attach(AttachDb::read(r)?),
            Opcode::Create => Packet::Create(AttachDb::read(r)?),
            Opcode::Detach => Packet::Detach(ObjectRef::read(r)?),
            Opcode::DropDatabase => Packet::DropDatabase(ObjectRef::read(r)?),

            Opcode::Transaction => Packet::Transaction(StartTransaction::read(r)?),
            Opcode::Commit => Packet::Commit(ObjectRef::read(r)?),
            Opcode::Rollback => Packet::Rollback(ObjectRef::read(r)?),
            Opcode::Prepare => Packet::Prepare(ObjectRef::read(r)?),
            Opcode::Prepare2 => Packet::Prepare2(Prepare2::read(r)?),
            Opcode::CommitRetaining => Packet::CommitRetaining(ObjectRef::read(r)?),
            Opcode::RollbackRetaining => Packet::RollbackRetaining(ObjectRef::read(r)?),

            Opcode::OpenBlob => Packet::OpenBlob(OpenBlob::read(r)?),
            Opcode::CreateBlob => Packet::CreateBlob(CreateBlob::read(r)?),
            Opcode::GetSegment => Packet::GetSegment(GetSegment::read(r)?),
            Opcode::PutSegment => Packet::PutSegment(BlobData::read(r)?),
            Opcode::BatchSegments => Packet::BatchSegments(BlobData::read(r)?),
            Opcode::Seek => Packet::Seek(Seek::read(r)?),
            Opcode::CancelBlob => Packet::CancelBlob(ObjectRef::read(r)?),
            Opcode::CloseBlob => Packet::CloseBlob(ObjectRef::read(r)?),

            Opcode::AllocateStatement => Packet::AllocateStatement(ObjectRef::read(r)?),
            Opcode::PrepareStatement => Packet::PrepareStatement(PrepareStatement::read(r)?),
            Opcode::Execute => Packet::Execute(Execute::read(r)?),
            Opcode::Execute2 => Packet::Execute2(Execute::read(r)?),
            Opcode::ExecImmediate => Packet::ExecImmediate(ExecImmediate::read(r)?),
            Opcode::Fetch => Packet::Fetch(Fetch::read(r)?),
            Opcode::FetchScroll => Packet::FetchScroll(FetchScroll::read(r)?),
            Opcode::FetchResponse => Packet::FetchResponse(FetchResponse::read(r)?),
            Opcode::SqlResponse => Packet::SqlResponse(SqlResponse::read(r)?),
            Opcode::FreeStatement => Packet::FreeStatement(FreeStatement::read(r)?),
            Opcode::SetCursor => Packet::SetCursor(SetCursor::read(r)?),

            Opcode::InfoDatabase => Packet::InfoDatabase(InfoQuery::read(r)?),
            Opcode::InfoTransaction => Packet::InfoTransaction(InfoQuery::read(r)?),
            Opcode::InfoBlob => Packet::InfoBlob(InfoQuery::read(r)?),
            Opcode::InfoSql => Packet::InfoSql(InfoQuery::read(r)?),
            Opcode::InfoRequest => Packet::InfoRequest(InfoQuery::read(r)?),

            Opcode::BatchCreate => Packet::BatchCreate(BatchCreate::read(r)?),
            Opcode::BatchMsg => Packet::BatchMsg(BatchMsg::read(r)?),
            Opcode::BatchExec => Packet::BatchExec(BatchExec::read(r)?),
            Opcode::BatchCancel => Packet::BatchCancel(ObjectRef::read(r)?),
            Opcode::BatchRelease => Packet::BatchRelease(ObjectRef::read(r)?),
            Opcode::BatchSync => Packet::BatchSync,
            Opcode::BatchBlobStream => Packet::BatchBlobStream(BatchBlobStream::read(r)?),
            Opcode::BatchRegBlob => Packet::BatchRegBlob(BatchRegBlob::read(r)?),
            Opcode::BatchSetBpb => Packet::BatchSetBpb(BatchSetBpb::read(r)?),
            Opcode::BatchCompletionState => {
                Packet::BatchCompletionState(BatchCompletionState::read(r)?)
            }

            Opcode::QueEvents => Packet::QueEvents(QueEvents::read(r)?),
            Opcode::CancelEvents => Packet::CancelEvents(CancelEvents::read(r)?),
            Opcode::Event => Packet::Event(Event::read(r)?),

            Opcode::Compile => Packet::Compile(Compile::read(r)?),
            Opcode::Start => Packet::Start(RequestMessage::read(r)?),
            Opcode::StartAndSend => Packet::StartAndSend(RequestMessage::read(r)?),
            Opcode::Send => Packet::Send(RequestMessage::read(r)?),
            Opcode::Receive => Packet::Receive(RequestMessage::read(r)?),
            Opcode::Unwind => Packet::Unwind(RequestMessage::read(r)?),
            Opcode::Release => Packet::Release(ObjectRef::read(r)?),

            Opcode::ServiceAttach => Packet::ServiceAttach(AttachDb::read(r)?),
            Opcode::ServiceDetach => Packet::ServiceDetach(ObjectRef::read(r)?),
            Opcode::ServiceStart => Packet::ServiceStart(ServiceStart::read(r)?),
            Opcode::ServiceInfo => Packet::ServiceInfo(ServiceInfo::read(r)?),

            Opcode::TrustedAuth => Packet::TrustedAuth(AuthData::read(r)?),
            Opcode::ContAuth => Packet::ContAuth(ContAuth::read(r)?),
            Opcode::Crypt => Packet::Crypt(Crypt::read(r)?),
            Opcode::CryptKeyCallback => Packet::CryptKeyCallback(AuthData::read(r)?),

            Opcode::Ping => Packet::Ping,
            Opcode::Cancel => Packet::Cancel(Cancel::read(r)?),
            Opcode::Dummy => Packet::Dummy,
        };
        Ok(packet)
    }

    /// Returns whether a lazy client may defer this request.
    pub fn is_poolable(&self) -> bool {
        matches!(
            self,
            Packet::FreeStatement(_)
                | Packet::CloseBlob(_)
                | Packet::CancelBlob(_)
                | Packet::Release(_)
                | Packet::BatchRelease(_)
                | Packet::BatchCancel(_)
                | Packet::CancelEvents(_)
                | Packet::AllocateStatement(_)
        )
    }
}
