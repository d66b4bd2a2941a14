//! Client halves of the authentication plugins.

use crate::error::ClientError;
use bytes::Bytes;
use relwire_protocol::scram;

/// Multi-round SCRAM plugin; yields a wire encryption key.
pub const SCRAM_PLUGIN: &str = "Scram_Sha256";

/// Single-round digest plugin; yields no key.
pub const LEGACY_PLUGIN: &str = "Legacy_Hash";

/// One side of a login exchange.
pub trait ClientPlugin: Send {
    fn name(&self) -> &'static str;

    /// Produces the next message from the server's last one (empty at the start).
    fn step(&mut self, data: &[u8]) -> Result<Bytes, ClientError>;

    /// Checks the data the server sent with its acceptance.
    fn verify(&mut self, _data: &[u8]) -> Result<(), ClientError> {
        Ok(())
    }

    fn session_key(&self) -> Option<Vec<u8>> {
        None
    }
}

pub fn create_plugin(name: &str, login: &str, password: &str) -> Option<Box<dyn ClientPlugin>> {
    match name {
        SCRAM_PLUGIN => Some(Box::new(ScramClient::new(login, password))),
        LEGACY_PLUGIN => Some(Box::new(LegacyHashClient::new(login, password))),
        _ => None,
    }
}

enum ScramState {
    Initial,
    FirstSent {
        client_first_bare: String,
        client_nonce: String,
    },
    FinalSent {
        server_signature: [u8; scram::KEY_LEN],
        session_key: [u8; scram::KEY_LEN],
    },
    Verified {
        session_key: [u8; scram::KEY_LEN],
    },
}

/// SCRAM-SHA-256 client state machine.
pub struct ScramClient {
    login: String,
    password: String,
    state: ScramState,
}

fn malformed(what: &str) -> ClientError {
    ClientError::Auth(format!("malformed SCRAM {}", what))
}

impl ScramClient {
    pub fn new(login: &str, password: &str) -> Self {
        Self {
            login: login.to_string(),
            password: password.to_string(),
            state: ScramState::Initial,
        }
    }

    /// Answers `r=<nonce>,s=<salt>,i=<iterations>` with the proof.
    fn client_final(
        &self,
        server_first: &str,
        client_first_bare: &str,
        client_nonce: &str,
    ) -> Result<(String, ScramState), ClientError> {
        let nonce = scram::attribute(server_first, 'r').ok_or_else(|| malformed("nonce"))?;
        if !nonce.starts_with(client_nonce) {
            return Err(ClientError::Auth("server nonce does not extend ours".into()));
        }
        let salt = scram::attribute(server_first, 's')
            .and_then(scram::decode_b64)
            .ok_or_else(|| malformed("salt"))?;
        let iterations: u32 = scram::attribute(server_first, 'i')
            .and_then(|i| i.parse().ok())
            .ok_or_else(|| malformed("iteration count"))?;

        let salted = scram::salted_password(&self.password, &salt, iterations);
        let client_key = scram::client_key(&salted);
        let stored_key = scram::sha256(&client_key);
        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
        let signature = scram::hmac_sha256(&stored_key, auth_message.as_bytes());
        let proof = scram::xor(&client_key, &signature);

        let state = ScramState::FinalSent {
            server_signature: scram::hmac_sha256(
                &scram::server_key(&salted),
                auth_message.as_bytes(),
            ),
            session_key: scram::session_key(&client_key, &auth_message),
        };
        Ok((
            format!("{},p={}", without_proof, scram::encode_b64(&proof)),
            state,
        ))
    }
}

impl ClientPlugin for ScramClient {
    fn name(&self) -> &'static str {
        SCRAM_PLUGIN
    }

    fn step(&mut self, data: &[u8]) -> Result<Bytes, ClientError> {
        match &self.state {
            ScramState::Initial => {
                let client_nonce = scram::nonce();
                let client_first_bare = format!("n={},r={}", self.login, client_nonce);
                let message = format!("n,,{}", client_first_bare);
                self.state = ScramState::FirstSent {
                    client_first_bare,
                    client_nonce,
                };
                Ok(Bytes::from(message.into_bytes()))
            }
            ScramState::FirstSent {
                client_first_bare,
                client_nonce,
            } => {
                let server_first =
                    std::str::from_utf8(data).map_err(|_| malformed("server-first"))?;
                let (message, state) =
                    self.client_final(server_first, client_first_bare, client_nonce)?;
                self.state = state;
                Ok(Bytes::from(message.into_bytes()))
            }
            ScramState::FinalSent { .. } | ScramState::Verified { .. } => {
                Err(ClientError::Auth("SCRAM exchange already finished".into()))
            }
        }
    }

    fn verify(&mut self, data: &[u8]) -> Result<(), ClientError> {
        let ScramState::FinalSent {
            server_signature,
            session_key,
        } = &self.state
        else {
            return Err(ClientError::Auth("server accepted an unfinished SCRAM exchange".into()));
        };
        let message = std::str::from_utf8(data).map_err(|_| malformed("server-final"))?;
        let claimed = scram::attribute(message, 'v')
            .and_then(scram::decode_b64)
            .ok_or_else(|| malformed("server signature"))?;
        if claimed.as_slice() != server_signature.as_slice() {
            return Err(ClientError::Auth("server signature mismatch".into()));
        }
        self.state = ScramState::Verified {
            session_key: *session_key,
        };
        Ok(())
    }

    fn session_key(&self) -> Option<Vec<u8>> {
        match &self.state {
            ScramState::Verified { session_key } => Some(session_key.to_vec()),
            _ => None,
        }
    }
}

/// Sends a digest of login and password in one round.
pub struct LegacyHashClient {
    digest: String,
}

impl LegacyHashClient {
    pub fn new(login: &str, password: &str) -> Self {
        Self {
            digest: scram::legacy_hash(login, password),
        }
    }
}

impl ClientPlugin for LegacyHashClient {
    fn name(&self) -> &'static str {
        LEGACY_PLUGIN
    }

    fn step(&mut self, _data: &[u8]) -> Result<Bytes, ClientError> {
        Ok(Bytes::from(self.digest.clone().into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Server half driven by hand with the shared primitives.
    fn server_first(client_first: &str, salt: &[u8]) -> String {
        let nonce = scram::attribute(client_first, 'r').unwrap();
        format!("r={}SERVER,s={},i=64", nonce, scram::encode_b64(salt))
    }

    #[test]
    fn test_scram_exchange_produces_key() {
        let mut client = ScramClient::new("ALICE", "secret");
        let first = String::from_utf8(client.step(&[]).unwrap().to_vec()).unwrap();
        assert!(first.starts_with("n,,n=ALICE,r="));
        let bare = first.strip_prefix("n,,").unwrap().to_string();

        let sf = server_first(&bare, b"pepper");
        let last = String::from_utf8(client.step(sf.as_bytes()).unwrap().to_vec()).unwrap();
        assert!(last.starts_with("c=biws,r="));
        assert!(client.session_key().is_none());

        // What the server checks and sends back
        let salted = scram::salted_password("secret", b"pepper", 64);
        let without_proof = last.rsplit_once(",p=").unwrap().0;
        let auth_message = format!("{},{},{}", bare, sf, without_proof);
        let stored = scram::sha256(&scram::client_key(&salted));
        let proof = scram::decode_b64(scram::attribute(&last, 'p').unwrap()).unwrap();
        let signature = scram::hmac_sha256(&stored, auth_message.as_bytes());
        let recovered = scram::xor(&proof.try_into().unwrap(), &signature);
        assert_eq!(scram::sha256(&recovered), stored);

        let v = scram::hmac_sha256(&scram::server_key(&salted), auth_message.as_bytes());
        client
            .verify(format!("v={}", scram::encode_b64(&v)).as_bytes())
            .unwrap();
        assert_eq!(
            client.session_key().unwrap(),
            scram::session_key(&recovered, &auth_message).to_vec()
        );
    }

    #[test]
    fn test_scram_rejects_forged_server() {
        let mut client = ScramClient::new("ALICE", "secret");
        let first = String::from_utf8(client.step(&[]).unwrap().to_vec()).unwrap();
        let sf = server_first(first.strip_prefix("n,,").unwrap(), b"salt");
        client.step(sf.as_bytes()).unwrap();
        let forged = format!("v={}", scram::encode_b64(&[0u8; 32]));
        assert!(matches!(client.verify(forged.as_bytes()), Err(ClientError::Auth(_))));
        assert!(client.session_key().is_none());
    }

    #[test]
    fn test_scram_rejects_foreign_nonce() {
        let mut client = ScramClient::new("ALICE", "secret");
        client.step(&[]).unwrap();
        let err = client.step(b"r=someoneelse,s=c2FsdA==,i=64").unwrap_err();
        assert!(matches!(err, ClientError::Auth(_)));
    }

    #[test]
    fn test_legacy_digest() {
        let mut client = LegacyHashClient::new("ALICE", "secret");
        let data = client.step(&[]).unwrap();
        assert_eq!(data, Bytes::from(scram::legacy_hash("ALICE", "secret")));
        assert!(client.session_key().is_none());
    }

    #[test]
    fn test_create_plugin() {
        assert_eq!(create_plugin(SCRAM_PLUGIN, "A", "B").unwrap().name(), SCRAM_PLUGIN);
        assert_eq!(create_plugin(LEGACY_PLUGIN, "A", "B").unwrap().name(), LEGACY_PLUGIN);
        assert!(create_plugin("Kerberos", "A", "B").is_none());
    }
}
