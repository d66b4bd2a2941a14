//! Tagged parameter blocks (DPB, TPB, BPB, SPB, batch parameters, user id).
//!
//! Layout: one version byte, then repeated `tag:u8, len:u16, data`.

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Current parameter block version.
pub const PB_VERSION: u8 = 2;

/// Database parameter block tags.
pub mod dpb {
    pub const USER_NAME: u8 = 28;
    pub const PASSWORD: u8 = 29;
    pub const CHARSET: u8 = 48;
    pub const PROCESS_NAME: u8 = 74;
    pub const PAGE_SIZE: u8 = 4;
    pub const AUTH_PLUGIN_LIST: u8 = 85;
    pub const AUTH_PLUGIN_NAME: u8 = 84;
    pub const SPECIFIC_AUTH_DATA: u8 = 86;
    pub const WIRE_CRYPT: u8 = 90;
    /// Key material for databases created with a required encryption key.
    pub const CRYPT_KEY: u8 = 91;
}

/// Transaction parameter block tags.
pub mod tpb {
    pub const CONSISTENCY: u8 = 1;
    pub const CONCURRENCY: u8 = 2;
    pub const READ_COMMITTED: u8 = 15;
    pub const WAIT: u8 = 6;
    pub const NOWAIT: u8 = 7;
    pub const READ: u8 = 8;
    pub const WRITE: u8 = 9;
}

/// Blob parameter block tags.
pub mod bpb {
    pub const TYPE: u8 = 4;
    pub const TYPE_SEGMENTED: u8 = 0;
    pub const TYPE_STREAM: u8 = 1;
}

/// Service parameter block tags.
pub mod spb {
    pub const USER_NAME: u8 = 28;
    pub const ACTION: u8 = 1;
    pub const DATABASE: u8 = 106;
    pub const ACTION_DISPLAY_USERS: u8 = 7;
    pub const ACTION_SERVER_VERSION: u8 = 8;
    pub const ACTION_LIST_DATABASES: u8 = 9;
}

/// Batch parameter tags.
pub mod batch {
    pub const MULTI_ERROR: u8 = 1;
    pub const RECORD_COUNTS: u8 = 2;
    pub const BUFFER_BYTES_SIZE: u8 = 3;
    pub const BLOB_POLICY: u8 = 4;
    pub const DETAILED_ERRORS: u8 = 5;

    pub const BLOB_NONE: u32 = 0;
    pub const BLOB_ID_ENGINE: u32 = 1;
    pub const BLOB_ID_USER: u32 = 2;
    pub const BLOB_STREAM: u32 = 3;
}

/// Connect-time user identification tags.
pub mod user_id {
    pub const LOGIN: u8 = 9;
    pub const HOST: u8 = 4;
    pub const PLUGIN_NAME: u8 = 10;
    pub const PLUGIN_LIST: u8 = 11;
    pub const SPECIFIC_DATA: u8 = 7;
    pub const CLIENT_CRYPT: u8 = 12;
}

/// A parsed or under-construction parameter block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamBlock {
    version: u8,
    items: Vec<(u8, Bytes)>,
}

impl Default for ParamBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl ParamBlock {
    pub fn new() -> Self {
        Self {
            version: PB_VERSION,
            items: Vec::new(),
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn with_bytes(mut self, tag: u8, data: impl Into<Bytes>) -> Self {
        self.push(tag, data);
        self
    }

    pub fn with_str(self, tag: u8, value: &str) -> Self {
        self.with_bytes(tag, Bytes::copy_from_slice(value.as_bytes()))
    }

    pub fn with_u32(self, tag: u8, value: u32) -> Self {
        self.with_bytes(tag, Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    /// Adds a tag with no data.
    pub fn with_flag(self, tag: u8) -> Self {
        self.with_bytes(tag, Bytes::new())
    }

    pub fn push(&mut self, tag: u8, data: impl Into<Bytes>) {
        self.items.push((tag, data.into()));
    }

    /// Replaces every occurrence of `tag` with a single new value.
    pub fn set(&mut self, tag: u8, data: impl Into<Bytes>) {
        self.items.retain(|(t, _)| *t != tag);
        self.items.push((tag, data.into()));
    }

    pub fn remove(&mut self, tag: u8) {
        self.items.retain(|(t, _)| *t != tag);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has(&self, tag: u8) -> bool {
        self.items.iter().any(|(t, _)| *t == tag)
    }

    /// Returns the first value for a tag.
    pub fn get(&self, tag: u8) -> Option<&Bytes> {
        self.items.iter().find(|(t, _)| *t == tag).map(|(_, d)| d)
    }

    pub fn get_str(&self, tag: u8) -> Option<String> {
        self.get(tag)
            .and_then(|d| std::str::from_utf8(d).ok())
            .map(str::to_string)
    }

    pub fn get_u32(&self, tag: u8) -> Option<u32> {
        let data = self.get(tag)?;
        let raw: [u8; 4] = data.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(raw))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &Bytes)> {
        self.items.iter().map(|(t, d)| (*t, d))
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(1 + self.items.len() * 8);
        buf.put_u8(self.version);
        for (tag, data) in &self.items {
            if data.len() > u16::MAX as usize {
                return Err(ProtocolError::MalformedBlock(format!(
                    "item {} is {} bytes",
                    tag,
                    data.len()
                )));
            }
            buf.put_u8(*tag);
            buf.put_u16(data.len() as u16);
            buf.put_slice(data);
        }
        Ok(buf.freeze())
    }

    /// Parses a block. An empty input is an empty block.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let Some((&version, mut rest)) = data.split_first() else {
            return Ok(Self::new());
        };
        if version != PB_VERSION {
            return Err(ProtocolError::MalformedBlock(format!(
                "unsupported version {}",
                version
            )));
        }
        let mut items = Vec::new();
        while let Some((&tag, tail)) = rest.split_first() {
            if tail.len() < 2 {
                return Err(ProtocolError::MalformedBlock(format!(
                    "truncated length for tag {}",
                    tag
                )));
            }
            let len = u16::from_be_bytes([tail[0], tail[1]]) as usize;
            let tail = &tail[2..];
            if tail.len() < len {
                return Err(ProtocolError::MalformedBlock(format!(
                    "tag {} declares {} bytes, {} available",
                    tag,
                    len,
                    tail.len()
                )));
            }
            items.push((tag, Bytes::copy_from_slice(&tail[..len])));
            rest = &tail[len..];
        }
        Ok(Self { version, items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_roundtrip() {
        let block = ParamBlock::new()
            .with_str(dpb::USER_NAME, "SYSDBA")
            .with_u32(dpb::PAGE_SIZE, 8192)
            .with_flag(tpb::WAIT);
        let bytes = block.to_bytes().unwrap();
        let parsed = ParamBlock::parse(&bytes).unwrap();

        assert_eq!(parsed, block);
        assert_eq!(parsed.get_str(dpb::USER_NAME).as_deref(), Some("SYSDBA"));
        assert_eq!(parsed.get_u32(dpb::PAGE_SIZE), Some(8192));
        assert!(parsed.has(tpb::WAIT));
        assert!(!parsed.has(tpb::NOWAIT));
    }

    #[test]
    fn test_empty_input() {
        let parsed = ParamBlock::parse(&[]).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_truncated_item() {
        let data = [PB_VERSION, dpb::USER_NAME, 0, 10, b'a'];
        assert!(matches!(
            ParamBlock::parse(&data),
            Err(ProtocolError::MalformedBlock(_))
        ));
    }

    #[test]
    fn test_bad_version() {
        assert!(ParamBlock::parse(&[9]).is_err());
    }

    #[test]
    fn test_set_replaces() {
        let mut block = ParamBlock::new()
            .with_str(dpb::AUTH_PLUGIN_NAME, "a")
            .with_str(dpb::AUTH_PLUGIN_NAME, "b");
        block.set(dpb::AUTH_PLUGIN_NAME, Bytes::from_static(b"c"));
        assert_eq!(block.iter().count(), 1);
        assert_eq!(block.get_str(dpb::AUTH_PLUGIN_NAME).as_deref(), Some("c"));

        block.remove(dpb::AUTH_PLUGIN_NAME);
        assert!(block.is_empty());
    }
}
