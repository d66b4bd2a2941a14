//! Server side of the authentication handshake.
//!
//! The client names the plugins it can run, in preference order. The server
//! keeps the ones it is configured for, in the client's order, and drives
//! them one at a time. A plugin can accept, ask for another round trip, pass
//! the attempt to the next plugin, or reject it. Whatever the reason, the
//! client only ever sees one generic login failure; the detail goes to the
//! server log.

use crate::config::{ThrottleConfig, UserSecret};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use relwire_protocol::scram;
use std::collections::{BTreeMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Multi-round SCRAM plugin; produces a session key.
pub const SCRAM_PLUGIN: &str = "Scram_Sha256";

/// Single-round digest plugin; no session key.
pub const LEGACY_PLUGIN: &str = "Legacy_Hash";

/// Result of feeding one message to a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Identity verified; the data is the plugin's final message.
    Success(Bytes),
    /// Send the data to the client and wait for its reply.
    MoreData(Bytes),
    /// This plugin cannot handle the login; try the next one.
    Continue,
    Fail,
}

/// One authentication mechanism, instantiated per attempt.
pub trait ServerPlugin: Send {
    fn name(&self) -> &'static str;

    fn step(&mut self, login: &str, data: &[u8]) -> AuthStep;

    /// Key for wire encryption, once the plugin succeeded.
    fn session_key(&self) -> Option<Vec<u8>> {
        None
    }
}

impl UserSecret {
    /// Derives verifier material from a clear-text password.
    pub fn from_password(login: &str, password: &str) -> Self {
        let salt: [u8; 16] = rand::random();
        Self::derive(login, password, &salt, scram::DEFAULT_ITERATIONS)
    }

    pub fn derive(login: &str, password: &str, salt: &[u8], iterations: u32) -> Self {
        let salted = scram::salted_password(password, salt, iterations);
        let client_key = scram::client_key(&salted);
        Self {
            salt: hex::encode(salt),
            iterations,
            stored_key: hex::encode(scram::sha256(&client_key)),
            server_key: hex::encode(scram::server_key(&salted)),
            legacy_hash: Some(scram::legacy_hash(login, password)),
        }
    }
}

/// Known users, keyed by login.
#[derive(Debug, Default)]
pub struct UserStore {
    users: BTreeMap<String, UserSecret>,
}

impl UserStore {
    pub fn new(users: BTreeMap<String, UserSecret>) -> Self {
        Self { users }
    }

    pub fn get(&self, login: &str) -> Option<&UserSecret> {
        self.users.get(login)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

struct ScramKeys {
    salt: Vec<u8>,
    iterations: u32,
    stored_key: [u8; scram::KEY_LEN],
    server_key: [u8; scram::KEY_LEN],
}

fn decode_key(hex_key: &str) -> Option<[u8; scram::KEY_LEN]> {
    hex::decode(hex_key).ok()?.try_into().ok()
}

impl ScramKeys {
    fn from_secret(secret: &UserSecret) -> Option<Self> {
        Some(Self {
            salt: hex::decode(&secret.salt).ok()?,
            iterations: secret.iterations,
            stored_key: decode_key(&secret.stored_key)?,
            server_key: decode_key(&secret.server_key)?,
        })
    }
}

enum ScramState {
    Initial,
    Challenged {
        keys: ScramKeys,
        client_first_bare: String,
        server_first: String,
        nonce: String,
    },
    Done {
        session_key: [u8; scram::KEY_LEN],
    },
    Failed,
}

/// SCRAM-SHA-256 server state machine.
pub struct ScramServer {
    users: Arc<UserStore>,
    state: ScramState,
}

impl ScramServer {
    pub fn new(users: Arc<UserStore>) -> Self {
        Self {
            users,
            state: ScramState::Initial,
        }
    }

    /// Handles `n,,n=<user>,r=<client-nonce>`.
    fn client_first(&mut self, login: &str, data: &[u8]) -> AuthStep {
        let Ok(message) = std::str::from_utf8(data) else {
            return AuthStep::Fail;
        };
        let Some(bare) = message.strip_prefix("n,,") else {
            tracing::warn!("SCRAM client-first without a supported GS2 header");
            return AuthStep::Fail;
        };
        let (Some(user), Some(client_nonce)) = (scram::attribute(bare, 'n'), scram::attribute(bare, 'r'))
        else {
            return AuthStep::Fail;
        };
        if user != login {
            tracing::warn!("SCRAM user {} does not match login {}", user, login);
            return AuthStep::Fail;
        }
        let Some(secret) = self.users.get(login) else {
            return AuthStep::Continue;
        };
        let Some(keys) = ScramKeys::from_secret(secret) else {
            tracing::error!("SCRAM verifier for {} is malformed", login);
            return AuthStep::Continue;
        };

        let nonce = format!("{}{}", client_nonce, scram::nonce());
        let server_first = format!(
            "r={},s={},i={}",
            nonce,
            scram::encode_b64(&keys.salt),
            keys.iterations
        );
        let reply = Bytes::from(server_first.clone().into_bytes());
        self.state = ScramState::Challenged {
            keys,
            client_first_bare: bare.to_string(),
            server_first,
            nonce,
        };
        AuthStep::MoreData(reply)
    }

    /// Handles `c=biws,r=<nonce>,p=<proof>`.
    fn client_final(&mut self, data: &[u8]) -> AuthStep {
        let ScramState::Challenged {
            keys,
            client_first_bare,
            server_first,
            nonce,
        } = std::mem::replace(&mut self.state, ScramState::Failed)
        else {
            return AuthStep::Fail;
        };
        let Ok(message) = std::str::from_utf8(data) else {
            return AuthStep::Fail;
        };
        if scram::attribute(message, 'r') != Some(nonce.as_str()) {
            tracing::warn!("SCRAM nonce mismatch");
            return AuthStep::Fail;
        }
        let Some(proof) = scram::attribute(message, 'p')
            .and_then(scram::decode_b64)
            .and_then(|p| <[u8; scram::KEY_LEN]>::try_from(p).ok())
        else {
            return AuthStep::Fail;
        };
        let Some(without_proof) = message.rsplit_once(",p=").map(|(head, _)| head) else {
            return AuthStep::Fail;
        };

        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
        let signature = scram::hmac_sha256(&keys.stored_key, auth_message.as_bytes());
        let client_key = scram::xor(&proof, &signature);
        if scram::sha256(&client_key) != keys.stored_key {
            tracing::warn!("SCRAM proof rejected");
            return AuthStep::Fail;
        }

        let server_signature = scram::hmac_sha256(&keys.server_key, auth_message.as_bytes());
        self.state = ScramState::Done {
            session_key: scram::session_key(&client_key, &auth_message),
        };
        AuthStep::Success(Bytes::from(
            format!("v={}", scram::encode_b64(&server_signature)).into_bytes(),
        ))
    }
}

impl ServerPlugin for ScramServer {
    fn name(&self) -> &'static str {
        SCRAM_PLUGIN
    }

    fn step(&mut self, login: &str, data: &[u8]) -> AuthStep {
        match self.state {
            ScramState::Initial if data.is_empty() => AuthStep::MoreData(Bytes::new()),
            ScramState::Initial => self.client_first(login, data),
            ScramState::Challenged { .. } => self.client_final(data),
            ScramState::Done { .. } | ScramState::Failed => AuthStep::Fail,
        }
    }

    fn session_key(&self) -> Option<Vec<u8>> {
        match &self.state {
            ScramState::Done { session_key } => Some(session_key.to_vec()),
            _ => None,
        }
    }
}

/// Single-round plugin comparing a salted digest of the password.
pub struct LegacyHashServer {
    users: Arc<UserStore>,
}

impl LegacyHashServer {
    pub fn new(users: Arc<UserStore>) -> Self {
        Self { users }
    }
}

impl ServerPlugin for LegacyHashServer {
    fn name(&self) -> &'static str {
        LEGACY_PLUGIN
    }

    fn step(&mut self, login: &str, data: &[u8]) -> AuthStep {
        if data.is_empty() {
            return AuthStep::MoreData(Bytes::new());
        }
        let Some(expected) = self.users.get(login).and_then(|u| u.legacy_hash.as_deref()) else {
            return AuthStep::Continue;
        };
        if constant_time_eq(expected.as_bytes(), data) {
            AuthStep::Success(Bytes::new())
        } else {
            AuthStep::Fail
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn create_plugin(name: &str, users: &Arc<UserStore>) -> Option<Box<dyn ServerPlugin>> {
    match name {
        SCRAM_PLUGIN => Some(Box::new(ScramServer::new(users.clone()))),
        LEGACY_PLUGIN => Some(Box::new(LegacyHashServer::new(users.clone()))),
        _ => None,
    }
}

/// What the dispatcher should do after a handshake step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted { plugin: String, data: Bytes },
    Challenge { plugin: String, data: Bytes },
    Failed,
}

/// State of one connection's authentication.
pub struct AuthSession {
    login: String,
    candidates: VecDeque<String>,
    active: Option<Box<dyn ServerPlugin>>,
    users: Arc<UserStore>,
    session_key: Option<Vec<u8>>,
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("login", &self.login)
            .field("candidates", &self.candidates)
            .finish_non_exhaustive()
    }
}

impl AuthSession {
    /// Intersects the lists, keeping the client's order.
    pub fn new(
        login: &str,
        client_plugins: &[String],
        server_plugins: &[String],
        users: Arc<UserStore>,
    ) -> Self {
        let candidates = client_plugins
            .iter()
            .filter(|p| server_plugins.contains(p))
            .filter(|p| create_plugin(p, &users).is_some())
            .cloned()
            .collect();
        Self {
            login: login.to_string(),
            candidates,
            active: None,
            users,
            session_key: None,
        }
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    /// Whether `plugin` is still among the candidates.
    pub fn offers(&self, plugin: &str) -> bool {
        self.candidates.iter().any(|p| p == plugin)
    }

    pub fn current_plugin(&self) -> Option<&str> {
        self.candidates.front().map(String::as_str)
    }

    pub fn session_key(&self) -> Option<&[u8]> {
        self.session_key.as_deref()
    }

    /// Feeds the client's data for `plugin` to the active plugin.
    pub fn step(&mut self, plugin: &str, data: &[u8]) -> AuthOutcome {
        if !plugin.is_empty() && self.current_plugin() != Some(plugin) {
            // The client may skip ahead, never back.
            if !self.candidates.iter().any(|p| p == plugin) {
                tracing::warn!("login {}: plugin {} was not offered", self.login, plugin);
                return AuthOutcome::Failed;
            }
            while self.current_plugin() != Some(plugin) {
                self.candidates.pop_front();
                self.active = None;
            }
        }

        let Some(name) = self.candidates.front().cloned() else {
            tracing::warn!("login {}: no common authentication plugin", self.login);
            return AuthOutcome::Failed;
        };
        if self.active.is_none() {
            self.active = create_plugin(&name, &self.users);
        }
        let Some(active) = self.active.as_mut() else {
            return AuthOutcome::Failed;
        };

        match active.step(&self.login, data) {
            AuthStep::Success(data) => {
                self.session_key = active.session_key();
                tracing::debug!("login {} accepted by {}", self.login, name);
                AuthOutcome::Accepted { plugin: name, data }
            }
            AuthStep::MoreData(data) => AuthOutcome::Challenge { plugin: name, data },
            AuthStep::Continue => {
                tracing::debug!("login {}: {} passed, trying next plugin", self.login, name);
                self.candidates.pop_front();
                self.active = None;
                match self.candidates.front() {
                    Some(next) => AuthOutcome::Challenge {
                        plugin: next.clone(),
                        data: Bytes::new(),
                    },
                    None => {
                        tracing::warn!("login {}: every plugin declined", self.login);
                        AuthOutcome::Failed
                    }
                }
            }
            AuthStep::Fail => {
                tracing::warn!("login {} rejected by {}", self.login, name);
                AuthOutcome::Failed
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FailureWindow {
    started: Instant,
    count: u32,
}

/// Delays attempts from logins and addresses that keep failing.
#[derive(Debug)]
pub struct AuthThrottle {
    config: ThrottleConfig,
    failures: DashMap<String, FailureWindow>,
    last_sweep: Mutex<Instant>,
}

impl AuthThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            failures: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Drops expired windows, at most once per window length.
    fn sweep(&self) {
        let window = self.config.window();
        {
            let mut last = self.last_sweep.lock();
            if last.elapsed() <= window {
                return;
            }
            *last = Instant::now();
        }
        let before = self.failures.len();
        self.failures.retain(|_, w| w.started.elapsed() <= window);
        let evicted = before.saturating_sub(self.failures.len());
        if evicted > 0 {
            tracing::debug!("throttle dropped {} expired windows", evicted);
        }
    }

    fn keys(login: &str, ip: IpAddr) -> [String; 2] {
        [format!("login:{}", login), format!("ip:{}", ip)]
    }

    /// Delay to impose before evaluating an attempt.
    pub fn delay(&self, login: &str, ip: IpAddr) -> Duration {
        let window = self.config.window();
        let limited = Self::keys(login, ip).iter().any(|key| {
            self.failures.get(key).is_some_and(|w| {
                w.started.elapsed() <= window && w.count >= self.config.failure_limit
            })
        });
        if limited {
            self.config.penalty()
        } else {
            Duration::ZERO
        }
    }

    pub fn record_failure(&self, login: &str, ip: IpAddr) {
        self.sweep();
        let window = self.config.window();
        for key in Self::keys(login, ip) {
            let mut entry = self.failures.entry(key).or_insert(FailureWindow {
                started: Instant::now(),
                count: 0,
            });
            if entry.started.elapsed() > window {
                *entry = FailureWindow {
                    started: Instant::now(),
                    count: 0,
                };
            }
            entry.count += 1;
        }
    }

    pub fn record_success(&self, login: &str, ip: IpAddr) {
        for key in Self::keys(login, ip) {
            self.failures.remove(&key);
        }
    }

    /// Failures currently counted for a login.
    pub fn failures(&self, login: &str) -> u32 {
        let window = self.config.window();
        self.failures
            .get(&format!("login:{}", login))
            .filter(|w| w.started.elapsed() <= window)
            .map(|w| w.count)
            .unwrap_or(0)
    }

    /// Logins and addresses with a failure window on record.
    pub fn tracked(&self) -> usize {
        self.failures.len()
    }
}
