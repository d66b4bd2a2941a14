//! Per-object info queries.
//!
//! A request is a list of item tags. A response is repeated
//! `tag:u8, len:u16, data` clumplets closed by [`items::END`], or by
//! [`items::TRUNCATED`] when the caller's buffer length was exceeded.

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Info item tags.
pub mod items {
    pub const END: u8 = 1;
    pub const TRUNCATED: u8 = 2;
    pub const ERROR: u8 = 3;

    // Database
    pub const DB_ID: u8 = 4;
    pub const DB_SERVER_VERSION: u8 = 12;
    pub const DB_ATTACHMENT_ID: u8 = 22;
    pub const DB_ACTIVE_TRANSACTIONS: u8 = 109;
    pub const DB_PROTOCOL_VERSION: u8 = 137;
    pub const DB_WIRE_CRYPT: u8 = 138;
    pub const DB_CREATION_DATE: u8 = 114;

    // Transaction
    pub const TRA_ID: u8 = 4;
    pub const TRA_ISOLATION: u8 = 8;
    pub const TRA_ACCESS: u8 = 9;
    pub const TRA_PENDING_WRITES: u8 = 10;

    // Blob
    pub const BLOB_NUM_SEGMENTS: u8 = 4;
    pub const BLOB_MAX_SEGMENT: u8 = 5;
    pub const BLOB_TOTAL_LENGTH: u8 = 6;
    pub const BLOB_TYPE: u8 = 7;

    // Statement
    pub const SQL_STMT_TYPE: u8 = 21;
    pub const SQL_RECORDS: u8 = 23;
    pub const SQL_INPUT_FORMAT: u8 = 30;
    pub const SQL_OUTPUT_FORMAT: u8 = 31;
    pub const SQL_CURSOR_NAME: u8 = 32;

    // Request
    pub const REQ_STATE: u8 = 4;
    pub const REQ_MESSAGE_TYPE: u8 = 5;

    // Service
    pub const SVC_LINE: u8 = 62;
    pub const SVC_SERVER_VERSION: u8 = 55;
}

/// Builds an info response, respecting the caller's buffer length.
#[derive(Debug)]
pub struct InfoWriter {
    buf: BytesMut,
    limit: usize,
    truncated: bool,
}

impl InfoWriter {
    pub fn new(buffer_length: u32) -> Self {
        Self {
            buf: BytesMut::new(),
            limit: buffer_length as usize,
            truncated: false,
        }
    }

    /// Appends one item. Once an item does not fit, every later one is dropped.
    pub fn push(&mut self, tag: u8, data: &[u8]) {
        if self.truncated {
            return;
        }
        // Keep one byte free for the terminator.
        if self.buf.len() + 3 + data.len() + 1 > self.limit || data.len() > u16::MAX as usize {
            self.truncated = true;
            return;
        }
        self.buf.put_u8(tag);
        self.buf.put_u16(data.len() as u16);
        self.buf.put_slice(data);
    }

    pub fn push_u32(&mut self, tag: u8, value: u32) {
        self.push(tag, &value.to_be_bytes());
    }

    pub fn push_i64(&mut self, tag: u8, value: i64) {
        self.push(tag, &value.to_be_bytes());
    }

    pub fn push_str(&mut self, tag: u8, value: &str) {
        self.push(tag, value.as_bytes());
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn finish(mut self) -> Bytes {
        if self.limit > self.buf.len() {
            self.buf.put_u8(if self.truncated {
                items::TRUNCATED
            } else {
                items::END
            });
        }
        self.buf.freeze()
    }
}

/// One decoded info item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoItem {
    pub tag: u8,
    pub data: Bytes,
}

impl InfoItem {
    pub fn as_u32(&self) -> Option<u32> {
        let raw: [u8; 4] = self.data.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(raw))
    }

    pub fn as_i64(&self) -> Option<i64> {
        let raw: [u8; 8] = self.data.as_ref().try_into().ok()?;
        Some(i64::from_be_bytes(raw))
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// Parsed info response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoResponse {
    pub items: Vec<InfoItem>,
    pub truncated: bool,
}

impl InfoResponse {
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut response = InfoResponse::default();
        let mut rest = data;
        while let Some((&tag, tail)) = rest.split_first() {
            match tag {
                items::END => return Ok(response),
                items::TRUNCATED => {
                    response.truncated = true;
                    return Ok(response);
                }
                _ => {}
            }
            if tail.len() < 2 {
                return Err(ProtocolError::MalformedInfo(format!(
                    "truncated length for item {}",
                    tag
                )));
            }
            let len = u16::from_be_bytes([tail[0], tail[1]]) as usize;
            let tail = &tail[2..];
            if tail.len() < len {
                return Err(ProtocolError::MalformedInfo(format!(
                    "item {} declares {} bytes, {} available",
                    tag,
                    len,
                    tail.len()
                )));
            }
            response.items.push(InfoItem {
                tag,
                data: Bytes::copy_from_slice(&tail[..len]),
            });
            rest = &tail[len..];
        }
        Err(ProtocolError::MalformedInfo("missing end marker".to_string()))
    }

    pub fn get(&self, tag: u8) -> Option<&InfoItem> {
        self.items.iter().find(|i| i.tag == tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_and_parse() {
        let mut writer = InfoWriter::new(256);
        writer.push_u32(items::DB_ATTACHMENT_ID, 42);
        writer.push_str(items::DB_SERVER_VERSION, "relwire-0.1");
        writer.push_i64(items::DB_CREATION_DATE, -1);
        let data = writer.finish();

        let parsed = InfoResponse::parse(&data).unwrap();
        assert!(!parsed.truncated);
        assert_eq!(parsed.items.len(), 3);
        assert_eq!(
            parsed.get(items::DB_ATTACHMENT_ID).unwrap().as_u32(),
            Some(42)
        );
        assert_eq!(
            parsed.get(items::DB_SERVER_VERSION).unwrap().as_str(),
            Some("relwire-0.1")
        );
        assert_eq!(
            parsed.get(items::DB_CREATION_DATE).unwrap().as_i64(),
            Some(-1)
        );
    }

    #[test]
    fn test_truncation() {
        let mut writer = InfoWriter::new(10);
        writer.push_u32(items::DB_ATTACHMENT_ID, 1);
        writer.push_str(items::DB_SERVER_VERSION, "too long to fit");
        writer.push_u32(items::DB_ACTIVE_TRANSACTIONS, 2);
        assert!(writer.is_truncated());

        let parsed = InfoResponse::parse(&writer.finish()).unwrap();
        assert!(parsed.truncated);
        assert_eq!(parsed.items.len(), 1);
    }

    #[test]
    fn test_missing_end_marker() {
        let data = [items::DB_ATTACHMENT_ID, 0, 1, 7];
        assert!(InfoResponse::parse(&data).is_err());
    }
}
