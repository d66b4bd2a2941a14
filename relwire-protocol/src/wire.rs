//! Primitive field encoding shared by every packet arm.
//!
//! Integers are big-endian and fixed width. Variable-length fields are a
//! 4-byte length followed by the raw bytes, without padding.

use crate::error::ProtocolError;
use crate::MAX_FIELD_SIZE;
use bytes::{BufMut, Bytes, BytesMut};

/// Cursor over a borrowed byte slice with bounds-checked reads.
///
/// Running out of data yields [`ProtocolError::IncompleteFrame`] so that
/// incremental decoders can wait for more input.
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let available = self.remaining();
        if available < n {
            return Err(ProtocolError::IncompleteFrame {
                needed: n - available,
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> Result<u64, ProtocolError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(self.u64()? as i64)
    }

    /// Reads a boolean; only 0 and 1 are accepted.
    pub fn bool(&mut self) -> Result<bool, ProtocolError> {
        match self.u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::InvalidBool(other)),
        }
    }

    /// Reads a length-prefixed byte string.
    pub fn bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.u32()?;
        if len > MAX_FIELD_SIZE {
            return Err(ProtocolError::FieldTooLarge {
                size: len,
                max: MAX_FIELD_SIZE,
            });
        }
        Ok(Bytes::copy_from_slice(self.take(len as usize)?))
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String, ProtocolError> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Reads a raw slice of fixed length (no length prefix).
    pub fn raw(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        self.take(n)
    }
}

/// Write-side helpers for the wire encoding.
pub trait WireWrite {
    fn put_wire_bool(&mut self, value: bool);
    fn put_wire_bytes(&mut self, value: &[u8]) -> Result<(), ProtocolError>;
    fn put_wire_str(&mut self, value: &str) -> Result<(), ProtocolError>;
}

impl WireWrite for BytesMut {
    fn put_wire_bool(&mut self, value: bool) {
        self.put_u32(u32::from(value));
    }

    fn put_wire_bytes(&mut self, value: &[u8]) -> Result<(), ProtocolError> {
        let len = value.len();
        if len > MAX_FIELD_SIZE as usize {
            return Err(ProtocolError::FieldTooLarge {
                size: len.min(u32::MAX as usize) as u32,
                max: MAX_FIELD_SIZE,
            });
        }
        self.put_u32(len as u32);
        self.put_slice(value);
        Ok(())
    }

    fn put_wire_str(&mut self, value: &str) -> Result<(), ProtocolError> {
        self.put_wire_bytes(value.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_layout() {
        let mut buf = BytesMut::new();
        buf.put_wire_str("abc").unwrap();
        assert_eq!(&buf[..], b"\x00\x00\x00\x03abc");

        let mut reader = WireReader::new(&buf);
        assert_eq!(reader.string().unwrap(), "abc");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_short_read_is_incomplete() {
        let data = [0u8, 0, 0, 9, b'x'];
        let mut reader = WireReader::new(&data);
        let err = reader.bytes().unwrap_err();
        assert!(matches!(err, ProtocolError::IncompleteFrame { needed: 8 }));
    }

    #[test]
    fn test_declared_length_over_limit() {
        let data = (MAX_FIELD_SIZE + 1).to_be_bytes();
        let mut reader = WireReader::new(&data);
        assert!(matches!(
            reader.bytes(),
            Err(ProtocolError::FieldTooLarge { .. })
        ));
    }

    #[test]
    fn test_bool_is_strict() {
        let data = 2u32.to_be_bytes();
        let mut reader = WireReader::new(&data);
        assert!(matches!(reader.bool(), Err(ProtocolError::InvalidBool(2))));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut buf = BytesMut::new();
        buf.put_wire_bytes(&[0xff, 0xfe]).unwrap();
        let mut reader = WireReader::new(&buf);
        assert!(matches!(reader.string(), Err(ProtocolError::InvalidUtf8)));
    }

    #[test]
    fn test_integers_big_endian() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_i64(-2);
        assert_eq!(&buf[..4], &[0, 0, 0, 1]);

        let mut reader = WireReader::new(&buf);
        assert_eq!(reader.u32().unwrap(), 1);
        assert_eq!(reader.i64().unwrap(), -2);
        assert_eq!(reader.position(), 12);
    }
}
