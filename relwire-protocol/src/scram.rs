//! SCRAM-SHA-256 primitives shared by both peers.
//!
//! Messages follow RFC 5802: comma separated `k=value` attributes. The
//! session key used for wire encryption is derived from the client key and
//! the auth message, which only a peer that completed the exchange knows.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Length of every SCRAM key and signature.
pub const KEY_LEN: usize = 32;

/// Iteration count used when deriving new verifiers.
pub const DEFAULT_ITERATIONS: u32 = 4096;

/// Hi() function - PBKDF2 with HMAC-SHA-256
pub fn salted_password(password: &str, salt: &[u8], iterations: u32) -> [u8; KEY_LEN] {
    let mut output = [0u8; KEY_LEN];
    // Output length is fixed at 32 bytes, which HMAC-SHA-256 always accepts.
    let _ = pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output);
    output
}

/// HMAC-SHA-256
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; KEY_LEN] {
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        // HMAC takes keys of any size
        Err(_) => return [0u8; KEY_LEN],
    };
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// SHA-256 hash
pub fn sha256(data: &[u8]) -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn xor(a: &[u8; KEY_LEN], b: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let mut result = [0u8; KEY_LEN];
    for i in 0..KEY_LEN {
        result[i] = a[i] ^ b[i];
    }
    result
}

pub fn client_key(salted: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    hmac_sha256(salted, b"Client Key")
}

pub fn server_key(salted: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    hmac_sha256(salted, b"Server Key")
}

/// Key for the wire cipher once both sides know the client key.
pub fn session_key(client_key: &[u8; KEY_LEN], auth_message: &str) -> [u8; KEY_LEN] {
    hmac_sha256(client_key, format!("session:{}", auth_message).as_bytes())
}

/// Digest checked by the single-round legacy plugin.
pub fn legacy_hash(login: &str, password: &str) -> String {
    hex::encode(sha256(format!("{}:{}", login, password).as_bytes()))
}

pub fn encode_b64(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub fn decode_b64(data: &str) -> Option<Vec<u8>> {
    BASE64.decode(data).ok()
}

/// Returns the value of attribute `key` in a SCRAM message.
pub fn attribute(message: &str, key: char) -> Option<&str> {
    message.split(',').find_map(|part| {
        let mut chars = part.chars();
        match (chars.next(), chars.next()) {
            (Some(k), Some('=')) if k == key => Some(&part[2..]),
            _ => None,
        }
    })
}

/// Random nonce, base64 encoded.
pub fn nonce() -> String {
    use rand::Rng;
    let bytes: [u8; 18] = rand::thread_rng().gen();
    BASE64.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute() {
        let msg = "r=abc,s=c2FsdA==,i=4096";
        assert_eq!(attribute(msg, 'r'), Some("abc"));
        assert_eq!(attribute(msg, 's'), Some("c2FsdA=="));
        assert_eq!(attribute(msg, 'i'), Some("4096"));
        assert_eq!(attribute(msg, 'p'), None);
        assert_eq!(attribute("n,,n=user,r=x", 'n'), Some("user"));
    }

    #[test]
    fn test_proof_recovers_client_key() {
        let salted = salted_password("pencil", b"salt", 16);
        let ck = client_key(&salted);
        let stored = sha256(&ck);
        let signature = hmac_sha256(&stored, b"auth message");
        let proof = xor(&ck, &signature);
        // What the server does with the proof it receives
        let recovered = xor(&proof, &signature);
        assert_eq!(sha256(&recovered), stored);
    }

    #[test]
    fn test_session_key_depends_on_exchange() {
        let ck = client_key(&salted_password("pw", b"salt", 8));
        assert_ne!(session_key(&ck, "a"), session_key(&ck, "b"));
        assert_eq!(session_key(&ck, "a"), session_key(&ck, "a"));
    }

    #[test]
    fn test_legacy_hash() {
        let hash = legacy_hash("ALICE", "secret");
        assert_eq!(hash.len(), 64);
        assert_ne!(hash, legacy_hash("ALICE", "other"));
        assert_ne!(hash, legacy_hash("BOB", "secret"));
    }

    #[test]
    fn test_nonce_is_random() {
        assert_ne!(nonce(), nonce());
        assert_eq!(decode_b64(&nonce()).unwrap().len(), 18);
    }
}
