//! Wire encryption.
//!
//! After a successful handshake both peers may switch every subsequent byte
//! of the stream through a symmetric stream cipher keyed by the session key
//! the auth plugin produced. The keystream is HMAC-SHA256 over a direction
//! label and a block counter, so each direction has its own keystream.

use crate::error::ProtocolError;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Name of the only supported wire cipher.
pub const CIPHER_PLUGIN: &str = "HmacCtr";

/// Key type produced by the SCRAM plugin.
pub const KEY_NAME: &str = "Scram";

const CLIENT_TO_SERVER: &[u8] = b"relwire c2s";
const SERVER_TO_CLIENT: &[u8] = b"relwire s2c";
const BLOCK: usize = 32;

/// One direction of the stream cipher.
#[derive(Clone)]
pub struct WireCipher {
    mac: HmacSha256,
    label: &'static [u8],
    counter: u64,
    block: [u8; BLOCK],
    offset: usize,
}

impl std::fmt::Debug for WireCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireCipher")
            .field("label", &String::from_utf8_lossy(self.label))
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

impl WireCipher {
    fn new(key: &[u8], label: &'static [u8]) -> Result<Self, ProtocolError> {
        if key.is_empty() {
            return Err(ProtocolError::InvalidKey);
        }
        let mac = HmacSha256::new_from_slice(key).map_err(|_| ProtocolError::InvalidKey)?;
        Ok(Self {
            mac,
            label,
            counter: 0,
            block: [0u8; BLOCK],
            offset: BLOCK,
        })
    }

    fn refill(&mut self) {
        let mut mac = self.mac.clone();
        mac.update(self.label);
        mac.update(&self.counter.to_be_bytes());
        self.block.copy_from_slice(&mac.finalize().into_bytes());
        self.counter += 1;
        self.offset = 0;
    }

    /// XORs the keystream into `data` in place. Encrypt and decrypt are the same.
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            if self.offset == BLOCK {
                self.refill();
            }
            *byte ^= self.block[self.offset];
            self.offset += 1;
        }
    }

    /// Total keystream bytes consumed.
    pub fn position(&self) -> u64 {
        if self.offset == BLOCK {
            self.counter * BLOCK as u64
        } else {
            (self.counter - 1) * BLOCK as u64 + self.offset as u64
        }
    }
}

/// Send and receive ciphers for one side of a connection.
#[derive(Debug, Clone)]
pub struct CipherPair {
    pub send: WireCipher,
    pub recv: WireCipher,
}

impl CipherPair {
    pub fn for_client(key: &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self {
            send: WireCipher::new(key, CLIENT_TO_SERVER)?,
            recv: WireCipher::new(key, SERVER_TO_CLIENT)?,
        })
    }

    pub fn for_server(key: &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self {
            send: WireCipher::new(key, SERVER_TO_CLIENT)?,
            recv: WireCipher::new(key, CLIENT_TO_SERVER)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_server_agree() {
        let key = b"session key material";
        let mut client = CipherPair::for_client(key).unwrap();
        let mut server = CipherPair::for_server(key).unwrap();

        let mut msg = b"attach mydb".to_vec();
        client.send.apply(&mut msg);
        assert_ne!(&msg[..], b"attach mydb");
        server.recv.apply(&mut msg);
        assert_eq!(&msg[..], b"attach mydb");

        let mut reply = b"ok".to_vec();
        server.send.apply(&mut reply);
        client.recv.apply(&mut reply);
        assert_eq!(&reply[..], b"ok");
    }

    #[test]
    fn test_directions_differ() {
        let key = b"k";
        let mut a = CipherPair::for_client(key).unwrap();
        let mut x = [0u8; 16];
        let mut y = [0u8; 16];
        a.send.apply(&mut x);
        a.recv.apply(&mut y);
        assert_ne!(x, y);
    }

    #[test]
    fn test_chunking_is_transparent() {
        let key = b"chunked";
        let mut whole = CipherPair::for_client(key).unwrap();
        let mut parts = CipherPair::for_client(key).unwrap();

        let mut a = vec![0x5au8; 100];
        let mut b = a.clone();
        whole.send.apply(&mut a);
        let (left, right) = b.split_at_mut(33);
        parts.send.apply(left);
        parts.send.apply(right);
        assert_eq!(a, b);
        assert_eq!(whole.send.position(), 100);
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(
            CipherPair::for_server(&[]),
            Err(ProtocolError::InvalidKey)
        ));
    }
}
