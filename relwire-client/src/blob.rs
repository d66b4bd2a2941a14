//! Blob handles.
//!
//! Segments move as `len:u16, data` runs: `write` packs several into one
//! `BatchSegments` packet and reads come back in the same shape.

use crate::error::ClientError;
use crate::port::Port;
use crate::proxy::{query_info, Handle};
use bytes::{BufMut, Bytes, BytesMut};
use relwire_protocol::packet::{
    segment_state, BlobData, CreateBlob, GetSegment, ObjectRef, OpenBlob, Seek, SeekMode,
};
use relwire_protocol::{InfoResponse, Packet, ParamBlock, ProtocolError};
use std::sync::Arc;

/// Largest single segment.
pub const MAX_SEGMENT: usize = u16::MAX as usize;

/// Payload size at which `write` starts a new packet.
const WRITE_CHUNK: usize = 256 * 1024;

/// Buffer length asked for by each segment read.
const READ_LENGTH: u32 = MAX_SEGMENT as u32 + 2;

/// Splits a `len:u16, data` run.
fn parse_segments(data: &Bytes) -> Result<Vec<Bytes>, ProtocolError> {
    let mut out = Vec::new();
    let mut at = 0;
    while at < data.len() {
        if at + 2 > data.len() {
            return Err(ProtocolError::IncompleteFrame { needed: 2 });
        }
        let len = u16::from_be_bytes([data[at], data[at + 1]]) as usize;
        let start = at + 2;
        if start + len > data.len() {
            return Err(ProtocolError::IncompleteFrame {
                needed: start + len - data.len(),
            });
        }
        out.push(data.slice(start..start + len));
        at = start + len;
    }
    Ok(out)
}

/// Outcome of one segment read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segments {
    pub segments: Vec<Bytes>,
    /// The last segment was cut short by the buffer length.
    pub partial: bool,
    pub eof: bool,
}

/// An open or newly created blob.
#[derive(Debug)]
pub struct Blob {
    port: Arc<Port>,
    handle: Handle,
    blob_id: u64,
    created: bool,
    eof: bool,
}

impl Blob {
    pub(crate) fn create(port: &Arc<Port>, transaction: u32, bpb: Option<&ParamBlock>) -> Result<Blob, ClientError> {
        let response = port.call(Packet::CreateBlob(CreateBlob {
            transaction,
            bpb: encode_bpb(bpb)?,
        }))?;
        Ok(Self::wrap(port, response.object, response.blob_id, true))
    }

    pub(crate) fn open(
        port: &Arc<Port>,
        transaction: u32,
        blob_id: u64,
        bpb: Option<&ParamBlock>,
    ) -> Result<Blob, ClientError> {
        let response = port.call(Packet::OpenBlob(OpenBlob {
            transaction,
            blob_id,
            bpb: encode_bpb(bpb)?,
        }))?;
        Ok(Self::wrap(port, response.object, blob_id, false))
    }

    fn wrap(port: &Arc<Port>, handle: u32, blob_id: u64, created: bool) -> Blob {
        tracing::debug!(
            "Blob {} {} as handle {}",
            blob_id,
            if created { "created" } else { "opened" },
            handle
        );
        Blob {
            port: port.clone(),
            handle: Handle::new("blob", handle),
            blob_id,
            created,
            eof: false,
        }
    }

    /// Id to store in a blob column.
    pub fn blob_id(&self) -> u64 {
        self.blob_id
    }

    pub fn handle_id(&self) -> Result<u32, ClientError> {
        self.handle.get()
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Writes one segment.
    pub fn put_segment(&self, data: &[u8]) -> Result<(), ClientError> {
        if data.len() > MAX_SEGMENT {
            return Err(ClientError::usage(format!(
                "segment of {} bytes exceeds {}",
                data.len(),
                MAX_SEGMENT
            )));
        }
        self.port
            .call(Packet::PutSegment(BlobData {
                blob: self.handle.get()?,
                data: Bytes::copy_from_slice(data),
            }))
            .map(|_| ())
    }

    /// Writes `data` as a run of maximal segments, several per packet.
    pub fn write(&self, data: &[u8]) -> Result<(), ClientError> {
        let blob = self.handle.get()?;
        let mut packets = Vec::new();
        let mut buf = BytesMut::new();
        for segment in data.chunks(MAX_SEGMENT) {
            if buf.len() + 2 + segment.len() > WRITE_CHUNK {
                packets.push(Packet::BatchSegments(BlobData {
                    blob,
                    data: buf.split().freeze(),
                }));
            }
            buf.put_u16(segment.len() as u16);
            buf.put_slice(segment);
        }
        if !buf.is_empty() {
            packets.push(Packet::BatchSegments(BlobData {
                blob,
                data: buf.freeze(),
            }));
        }
        for packet in packets {
            self.port.call(packet)?;
        }
        Ok(())
    }

    /// Reads up to `buffer_length` bytes of segments (headers included).
    pub fn get_segments(&mut self, buffer_length: u32) -> Result<Segments, ClientError> {
        let response = self.port.call(Packet::GetSegment(GetSegment {
            blob: self.handle.get()?,
            length: buffer_length,
        }))?;
        let segments = parse_segments(&response.data)?;
        let eof = response.object == segment_state::EOF;
        self.eof = eof;
        Ok(Segments {
            segments,
            partial: response.object == segment_state::PARTIAL,
            eof,
        })
    }

    /// Reads the rest of the blob.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>, ClientError> {
        let mut out = Vec::new();
        while !self.eof {
            let read = self.get_segments(READ_LENGTH)?;
            for segment in &read.segments {
                out.extend_from_slice(segment);
            }
        }
        Ok(out)
    }

    /// Moves the read position; returns the new one.
    pub fn seek(&mut self, mode: SeekMode, offset: i64) -> Result<u64, ClientError> {
        let position = self
            .port
            .call(Packet::Seek(Seek {
                blob: self.handle.get()?,
                mode,
                offset,
            }))?
            .blob_id;
        self.eof = false;
        Ok(position)
    }

    pub fn info(&self, items: &[u8]) -> Result<InfoResponse, ClientError> {
        query_info(&self.port, self.handle.get()?, items, Packet::InfoBlob)
    }

    /// Closes the blob; a created blob becomes visible to its transaction.
    pub fn close(&mut self) -> Result<(), ClientError> {
        let id = self.handle.get()?;
        self.handle.clear();
        self.port.defer(Packet::CloseBlob(ObjectRef::new(id)))
    }

    /// Discards a created blob.
    pub fn cancel(&mut self) -> Result<(), ClientError> {
        let id = self.handle.get()?;
        self.handle.clear();
        self.port.defer(Packet::CancelBlob(ObjectRef::new(id)))
    }
}

fn encode_bpb(bpb: Option<&ParamBlock>) -> Result<Bytes, ClientError> {
    match bpb {
        Some(bpb) => bpb.to_bytes().map_err(ClientError::Message),
        None => Ok(Bytes::new()),
    }
}
