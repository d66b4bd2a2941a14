//! Incremental encoder and decoder for the packet stream.

use crate::crypt::WireCipher;
use crate::error::ProtocolError;
use crate::opcode::Opcode;
use crate::packet::Packet;
use bytes::{Buf, BytesMut};

/// Encodes packets, optionally through the send half of a wire cipher.
#[derive(Debug, Default)]
pub struct Encoder {
    cipher: Option<WireCipher>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encrypts everything encoded from now on.
    pub fn set_cipher(&mut self, cipher: WireCipher) {
        self.cipher = Some(cipher);
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn encode(&mut self, packet: &Packet) -> Result<BytesMut, ProtocolError> {
        let mut buf = packet.encode()?;
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.apply(&mut buf);
        }
        Ok(buf)
    }

    /// Plain encoding, no cipher.
    pub fn encode_plain(packet: &Packet) -> Result<BytesMut, ProtocolError> {
        packet.encode()
    }
}

/// Buffers received bytes and yields whole packets.
///
/// Bytes are decrypted as they are appended, so a cipher installed mid-stream
/// only affects data received after the switch.
#[derive(Debug)]
pub struct Decoder {
    buffer: BytesMut,
    cipher: Option<WireCipher>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            cipher: None,
        }
    }

    /// Appends received data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        let start = self.buffer.len();
        self.buffer.extend_from_slice(data);
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.apply(&mut self.buffer[start..]);
        }
    }

    /// Decrypts everything received from now on, including bytes already
    /// buffered but not yet decoded.
    pub fn set_cipher(&mut self, mut cipher: WireCipher) {
        cipher.apply(&mut self.buffer[..]);
        self.cipher = Some(cipher);
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Reads the leading opcode without consuming anything.
    pub fn peek_opcode(&self) -> Result<Option<Opcode>, ProtocolError> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let raw = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]);
        Opcode::try_from(raw).map(Some)
    }

    /// Decodes the next packet, or returns `Ok(None)` if it is not complete yet.
    pub fn decode_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        match Packet::decode_prefix(&self.buffer) {
            Ok((packet, used)) => {
                self.buffer.advance(used);
                Ok(Some(packet))
            }
            Err(e) if e.is_incomplete() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::CipherPair;
    use crate::packet::{AttachDb, ObjectRef};
    use bytes::Bytes;

    #[test]
    fn test_decode_across_chunks() {
        let packet = Packet::Attach(AttachDb {
            database: "mydb".into(),
            dpb: Bytes::from_static(&[2, 28, 0, 1, b'x']),
        });
        let bytes = Encoder::encode_plain(&packet).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&bytes[..3]);
        assert!(decoder.peek_opcode().unwrap().is_none());
        assert!(decoder.decode_packet().unwrap().is_none());

        decoder.extend(&bytes[3..10]);
        assert_eq!(decoder.peek_opcode().unwrap(), Some(Opcode::Attach));
        assert!(decoder.decode_packet().unwrap().is_none());
        assert_eq!(decoder.buffered(), 10);

        decoder.extend(&bytes[10..]);
        assert_eq!(decoder.decode_packet().unwrap(), Some(packet));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_multiple_packets_in_one_read() {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&Encoder::encode_plain(&Packet::Ping).unwrap());
        stream.extend_from_slice(&Encoder::encode_plain(&Packet::Commit(ObjectRef::new(4))).unwrap());

        let mut decoder = Decoder::new();
        decoder.extend(&stream);
        assert_eq!(decoder.decode_packet().unwrap(), Some(Packet::Ping));
        assert_eq!(
            decoder.decode_packet().unwrap(),
            Some(Packet::Commit(ObjectRef::new(4)))
        );
        assert_eq!(decoder.decode_packet().unwrap(), None);
    }

    #[test]
    fn test_unknown_opcode_is_fatal() {
        let mut decoder = Decoder::new();
        decoder.extend(&0xdead_u32.to_be_bytes());
        assert!(decoder.peek_opcode().is_err());
        assert!(matches!(
            decoder.decode_packet(),
            Err(ProtocolError::UnknownOpcode(0xdead))
        ));
    }

    #[test]
    fn test_encrypted_stream() {
        let key = b"negotiated";
        let client = CipherPair::for_client(key).unwrap();
        let server = CipherPair::for_server(key).unwrap();

        let mut encoder = Encoder::new();
        encoder.set_cipher(client.send);
        let first = encoder.encode(&Packet::Ping).unwrap();
        let second = encoder.encode(&Packet::Commit(ObjectRef::new(1))).unwrap();
        assert_ne!(&first[..], &Encoder::encode_plain(&Packet::Ping).unwrap()[..]);

        let mut decoder = Decoder::new();
        decoder.set_cipher(server.recv);
        decoder.extend(&first[..2]);
        decoder.extend(&first[2..]);
        decoder.extend(&second);
        assert_eq!(decoder.decode_packet().unwrap(), Some(Packet::Ping));
        assert_eq!(
            decoder.decode_packet().unwrap(),
            Some(Packet::Commit(ObjectRef::new(1)))
        );
    }
}
