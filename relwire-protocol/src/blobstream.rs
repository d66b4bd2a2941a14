//! Framing of blob data streamed into a batch.
//!
//! The stream is a sequence of records, each aligned to
//! [`MESSAGE_ALIGNMENT`]:
//!
//! ```text
//! blob_id: u64 | size: u32 | bpb_len: u32 | bpb | payload (size bytes) | pad
//! ```
//!
//! `size` is written as zero when the record is opened and patched once the
//! record is closed. A blob larger than one buffer continues in further
//! records carrying the same id and no parameter block. Payloads of
//! segmented blobs are a run of `len: u16 | data | pad to 2` segments; a
//! segment never straddles two records.

use crate::error::ProtocolError;
use crate::format::MESSAGE_ALIGNMENT;
use bytes::{BufMut, Bytes, BytesMut};

/// Fixed part of a record header.
pub const HEADER_LEN: usize = 16;

/// Alignment of each segment inside a segmented payload.
pub const SEGMENT_ALIGNMENT: usize = 2;

fn align(len: usize, to: usize) -> usize {
    (len + to - 1) / to * to
}

#[derive(Debug)]
struct OpenBlob {
    id: u64,
    segmented: bool,
    /// Offset of the current record's header, `None` until a record is open.
    header_at: Option<usize>,
}

/// Client-side buffer of blob records.
///
/// Full buffers are sealed into chunks ready to send; `flush` seals the rest.
#[derive(Debug)]
pub struct BlobStreamWriter {
    capacity: usize,
    buf: BytesMut,
    open: Option<OpenBlob>,
    ready: Vec<Bytes>,
}

impl BlobStreamWriter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(HEADER_LEN * 4);
        Self {
            capacity,
            buf: BytesMut::with_capacity(capacity),
            open: None,
            ready: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Id of the blob currently accepting data.
    pub fn current(&self) -> Option<u64> {
        self.open.as_ref().map(|o| o.id)
    }

    /// Bytes buffered and not yet sealed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Opens a new blob; the previous one, if any, is finished.
    pub fn start_blob(&mut self, id: u64, bpb: &[u8], segmented: bool) -> Result<(), ProtocolError> {
        self.finish_blob();
        let need = HEADER_LEN + bpb.len();
        if need + MESSAGE_ALIGNMENT > self.capacity {
            return Err(ProtocolError::FieldTooLarge {
                size: need as u32,
                max: self.capacity as u32,
            });
        }
        if self.buf.len() + need + MESSAGE_ALIGNMENT > self.capacity {
            self.seal();
        }
        let at = self.write_header(id, bpb);
        self.open = Some(OpenBlob {
            id,
            segmented,
            header_at: Some(at),
        });
        Ok(())
    }

    /// Appends data to the open blob. For segmented blobs each call is one
    /// segment.
    pub fn append(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let segmented = match &self.open {
            Some(open) => open.segmented,
            None => {
                return Err(ProtocolError::FormatMismatch(
                    "blob data without an open blob".to_string(),
                ))
            }
        };
        if segmented {
            if data.len() > u16::MAX as usize {
                return Err(ProtocolError::FieldTooLarge {
                    size: data.len() as u32,
                    max: u16::MAX as u32,
                });
            }
            let need = align(2 + data.len(), SEGMENT_ALIGNMENT);
            if HEADER_LEN + need + MESSAGE_ALIGNMENT > self.capacity {
                return Err(ProtocolError::FieldTooLarge {
                    size: data.len() as u32,
                    max: self.capacity as u32,
                });
            }
            self.reserve(need);
            self.buf.put_u16(data.len() as u16);
            self.buf.put_slice(data);
            self.pad_to(SEGMENT_ALIGNMENT);
            return Ok(());
        }

        let mut rest = data;
        while !rest.is_empty() {
            self.reserve(1);
            let room = self.capacity - MESSAGE_ALIGNMENT - self.buf.len();
            let take = room.min(rest.len());
            self.buf.put_slice(&rest[..take]);
            rest = &rest[take..];
        }
        Ok(())
    }

    /// Closes the open blob.
    pub fn finish_blob(&mut self) {
        self.close_record();
        self.open = None;
    }

    /// Seals everything buffered and returns the chunks to send, in order.
    /// An open blob stays open and continues in a new record.
    pub fn flush(&mut self) -> Vec<Bytes> {
        if !self.buf.is_empty() {
            self.seal();
        }
        std::mem::take(&mut self.ready)
    }

    /// Takes chunks sealed because the buffer filled up.
    pub fn take_ready(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.ready)
    }

    /// Drops buffered and sealed data.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.ready.clear();
        self.open = None;
    }

    fn write_header(&mut self, id: u64, bpb: &[u8]) -> usize {
        let at = self.buf.len();
        self.buf.put_u64(id);
        self.buf.put_u32(0);
        self.buf.put_u32(bpb.len() as u32);
        self.buf.put_slice(bpb);
        at
    }

    /// Makes room for `need` payload bytes in an open record.
    fn reserve(&mut self, need: usize) {
        let (id, record_open) = match &self.open {
            Some(open) => (open.id, open.header_at.is_some()),
            None => return,
        };
        let header = if record_open { 0 } else { HEADER_LEN };
        if self.buf.len() + header + need + MESSAGE_ALIGNMENT > self.capacity {
            self.seal();
        }
        let record_open = self.open.as_ref().is_some_and(|o| o.header_at.is_some());
        if !record_open {
            let at = self.write_header(id, &[]);
            if let Some(open) = self.open.as_mut() {
                open.header_at = Some(at);
            }
        }
    }

    fn close_record(&mut self) {
        let Some(at) = self.open.as_mut().and_then(|o| o.header_at.take()) else {
            return;
        };
        let bpb_len = u32::from_be_bytes([
            self.buf[at + 12],
            self.buf[at + 13],
            self.buf[at + 14],
            self.buf[at + 15],
        ]) as usize;
        let size = (self.buf.len() - at - HEADER_LEN - bpb_len) as u32;
        self.buf[at + 8..at + 12].copy_from_slice(&size.to_be_bytes());
        self.pad_to(MESSAGE_ALIGNMENT);
    }

    fn pad_to(&mut self, alignment: usize) {
        let target = align(self.buf.len(), alignment);
        self.buf.resize(target, 0);
    }

    fn seal(&mut self) {
        self.close_record();
        if !self.buf.is_empty() {
            self.ready.push(self.buf.split().freeze());
        }
    }
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRecord {
    pub id: u64,
    /// Empty on continuation records.
    pub bpb: Bytes,
    pub payload: Bytes,
}

/// Server-side incremental record parser.
#[derive(Debug, Default)]
pub struct BlobStreamParser {
    buf: BytesMut,
}

impl BlobStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet forming a whole record.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Returns the next whole record, or `None` if more data is needed.
    pub fn next_record(&mut self) -> Result<Option<BlobRecord>, ProtocolError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let b = &self.buf;
        let id = u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
        let size = u32::from_be_bytes([b[8], b[9], b[10], b[11]]) as usize;
        let bpb_len = u32::from_be_bytes([b[12], b[13], b[14], b[15]]) as usize;
        if size > crate::MAX_FIELD_SIZE as usize || bpb_len > u16::MAX as usize {
            return Err(ProtocolError::FieldTooLarge {
                size: size.max(bpb_len) as u32,
                max: crate::MAX_FIELD_SIZE,
            });
        }
        let end = HEADER_LEN + bpb_len + size;
        let total = align(end, MESSAGE_ALIGNMENT);
        if self.buf.len() < total {
            return Ok(None);
        }
        let mut record = self.buf.split_to(total);
        record.truncate(end);
        let _ = record.split_to(HEADER_LEN);
        let bpb = record.split_to(bpb_len).freeze();
        Ok(Some(BlobRecord {
            id,
            bpb,
            payload: record.freeze(),
        }))
    }
}

/// Splits a segmented payload into its segments.
pub fn split_segments(payload: &Bytes) -> Result<Vec<Bytes>, ProtocolError> {
    let mut segments = Vec::new();
    let mut pos = 0;
    while pos < payload.len() {
        if pos + 2 > payload.len() {
            return Err(ProtocolError::FormatMismatch(
                "truncated segment header".to_string(),
            ));
        }
        let len = u16::from_be_bytes([payload[pos], payload[pos + 1]]) as usize;
        let start = pos + 2;
        if start + len > payload.len() {
            return Err(ProtocolError::FormatMismatch(format!(
                "segment of {} bytes overruns the record",
                len
            )));
        }
        segments.push(payload.slice(start..start + len));
        pos = align(start + len, SEGMENT_ALIGNMENT);
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(chunks: &[Bytes]) -> Vec<BlobRecord> {
        let mut parser = BlobStreamParser::new();
        let mut records = Vec::new();
        for chunk in chunks {
            parser.extend(chunk);
            while let Some(record) = parser.next_record().unwrap() {
                records.push(record);
            }
        }
        assert_eq!(parser.pending(), 0);
        records
    }

    #[test]
    fn test_size_is_patched() {
        let mut writer = BlobStreamWriter::new(1024);
        writer.start_blob(7, &[2, 4, 0, 1, 1], false).unwrap();
        writer.append(b"hello").unwrap();
        writer.finish_blob();
        let chunks = writer.flush();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len() % MESSAGE_ALIGNMENT, 0);
        assert_eq!(&chunks[0][8..12], &5u32.to_be_bytes());

        let records = parse_all(&chunks);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 7);
        assert_eq!(&records[0].bpb[..], &[2, 4, 0, 1, 1]);
        assert_eq!(&records[0].payload[..], b"hello");
    }

    #[test]
    fn test_segments_keep_boundaries() {
        let mut writer = BlobStreamWriter::new(1024);
        writer.start_blob(1, &[], true).unwrap();
        writer.append(b"abc").unwrap();
        writer.append(b"").unwrap();
        writer.append(b"defg").unwrap();
        writer.start_blob(2, &[], true).unwrap();
        writer.append(b"z").unwrap();
        writer.finish_blob();

        let records = parse_all(&writer.flush());
        assert_eq!(records.len(), 2);
        let segments = split_segments(&records[0].payload).unwrap();
        assert_eq!(segments, vec![
            Bytes::from_static(b"abc"),
            Bytes::new(),
            Bytes::from_static(b"defg")
        ]);
        assert_eq!(split_segments(&records[1].payload).unwrap(), vec![Bytes::from_static(b"z")]);
    }

    #[test]
    fn test_large_stream_blob_continues() {
        let mut writer = BlobStreamWriter::new(128);
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        writer.start_blob(9, &[], false).unwrap();
        writer.append(&data).unwrap();
        assert!(writer.has_ready());
        writer.finish_blob();

        let chunks = writer.flush();
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= 128));

        let records = parse_all(&chunks);
        assert!(records.iter().all(|r| r.id == 9));
        assert!(records.iter().skip(1).all(|r| r.bpb.is_empty()));
        let joined: Vec<u8> = records.iter().flat_map(|r| r.payload.to_vec()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_flush_mid_blob() {
        let mut writer = BlobStreamWriter::new(1024);
        writer.start_blob(3, &[], true).unwrap();
        writer.append(b"one").unwrap();
        let first = writer.flush();
        writer.append(b"two").unwrap();
        writer.finish_blob();
        let second = writer.flush();

        let mut chunks = first;
        chunks.extend(second);
        let records = parse_all(&chunks);
        assert_eq!(records.len(), 2);
        assert_eq!(split_segments(&records[1].payload).unwrap(), vec![Bytes::from_static(b"two")]);
    }

    #[test]
    fn test_append_without_blob() {
        let mut writer = BlobStreamWriter::new(256);
        assert!(writer.append(b"x").is_err());
    }

    #[test]
    fn test_parser_waits_for_whole_record() {
        let mut writer = BlobStreamWriter::new(256);
        writer.start_blob(4, &[], false).unwrap();
        writer.append(b"0123456789").unwrap();
        writer.finish_blob();
        let chunk = writer.flush().remove(0);

        let mut parser = BlobStreamParser::new();
        parser.extend(&chunk[..20]);
        assert!(parser.next_record().unwrap().is_none());
        parser.extend(&chunk[20..]);
        let record = parser.next_record().unwrap().unwrap();
        assert_eq!(&record.payload[..], b"0123456789");
    }

    #[test]
    fn test_truncated_segment() {
        let payload = Bytes::from_static(&[0, 9, b'a']);
        assert!(split_segments(&payload).is_err());
    }
}
