//! Protocol negotiation, login and wire encryption.

use super::Dispatcher;
use crate::auth::{AuthOutcome, AuthSession};
use crate::config::WireCrypt;
use crate::error::ServerError;
use crate::port::{Phase, Port, PortState};
use relwire_protocol::crypt::{CIPHER_PLUGIN, KEY_NAME};
use relwire_protocol::packet::{
    ptype, AcceptData, AuthData, Connect, ConnectRequest, ContAuth, Crypt, Response,
};
use relwire_protocol::pblock::user_id;
use relwire_protocol::status::codes;
use relwire_protocol::{CipherPair, Opcode, Packet, ParamBlock, StatusVector, PROTOCOL_VERSION};
use std::sync::Arc;

fn crypt_refused(reason: impl Into<String>) -> ServerError {
    ServerError::Rejected(StatusVector::error(codes::WIRE_CRYPT_REQUIRED).with_str(reason))
}

fn split_plugins(list: &str) -> Vec<String> {
    list.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Dispatcher {
    fn crypt_keys(&self, state: &PortState) -> Vec<String> {
        if self.config.crypt.wire_crypt != WireCrypt::Disabled
            && state.client_crypt != WireCrypt::Disabled
        {
            vec![KEY_NAME.to_string()]
        } else {
            Vec::new()
        }
    }

    fn throttle_pause(&self, port: &Port, login: &str) {
        let delay = self.throttle.delay(login, port.remote_addr.ip());
        if !delay.is_zero() {
            tracing::debug!("[{}] delaying login of {} by {:?}", port.id, login, delay);
            std::thread::sleep(delay);
        }
    }

    pub(super) fn connect(
        &self,
        port: &Arc<Port>,
        state: &mut PortState,
        req: Connect,
    ) -> Result<Option<Packet>, ServerError> {
        if state.phase != Phase::Pending {
            return Err(ServerError::UnexpectedPacket(Opcode::Connect));
        }

        let floor = self.config.network.min_protocol_version;
        let chosen = req
            .versions
            .iter()
            .filter(|o| o.version >= floor && o.version <= PROTOCOL_VERSION)
            .max_by_key(|o| (o.version, o.weight));
        let Some(offer) = chosen else {
            tracing::warn!(
                "[{}] no acceptable protocol version from {} (floor {})",
                port.id,
                port.remote_addr,
                floor
            );
            let _ = port.send(Packet::Reject);
            self.disconnect(port, state);
            return Ok(None);
        };
        let lazy = self.config.network.lazy
            && offer.min_type <= ptype::LAZY
            && ptype::LAZY <= offer.max_type;
        state.protocol_version = offer.version;
        state.ptype = if lazy { ptype::LAZY } else { ptype::SYNC };

        let ident = ParamBlock::parse(&req.user_id)?;
        let login = ident.get_str(user_id::LOGIN).unwrap_or_default();
        let plugin = ident.get_str(user_id::PLUGIN_NAME).unwrap_or_default();
        let mut plugins = ident
            .get_str(user_id::PLUGIN_LIST)
            .map(|l| split_plugins(&l))
            .unwrap_or_default();
        if plugins.is_empty() && !plugin.is_empty() {
            plugins.push(plugin.clone());
        }
        let data = ident.get(user_id::SPECIFIC_DATA).cloned().unwrap_or_default();
        let client_crypt = ident
            .get_u32(user_id::CLIENT_CRYPT)
            .and_then(WireCrypt::from_u32)
            .unwrap_or_default();

        let server_crypt = self.config.crypt.wire_crypt;
        if (server_crypt == WireCrypt::Required && client_crypt == WireCrypt::Disabled)
            || (client_crypt == WireCrypt::Required && server_crypt == WireCrypt::Disabled)
        {
            tracing::warn!(
                "[{}] wire crypt mismatch: server {:?}, client {:?}",
                port.id,
                server_crypt,
                client_crypt
            );
            return Err(ServerError::WireCryptRequired);
        }

        tracing::debug!(
            "[{}] connect from {} as {:?}: protocol {}, ptype {}, plugins {:?}",
            port.id,
            port.remote_addr,
            login,
            state.protocol_version,
            state.ptype,
            plugins
        );
        state.user = login.clone();
        state.client_crypt = client_crypt;
        state.phase = Phase::Authenticating;

        self.throttle_pause(port, &login);
        let mut session =
            AuthSession::new(&login, &plugins, &self.config.auth.plugins, self.users.clone());
        // First-round data only counts for the plugin it was produced by.
        let outcome = if session.offers(&plugin) {
            session.step(&plugin, &data)
        } else {
            session.step("", &[])
        };
        state.auth = Some(session);
        self.auth_outcome(port, state, outcome, true)
    }

    pub(super) fn cont_auth(
        &self,
        port: &Arc<Port>,
        state: &mut PortState,
        req: ContAuth,
    ) -> Result<Option<Packet>, ServerError> {
        self.auth_round(port, state, &req.plugin, &req.data, Opcode::ContAuth)
    }

    pub(super) fn trusted_auth(
        &self,
        port: &Arc<Port>,
        state: &mut PortState,
        req: AuthData,
    ) -> Result<Option<Packet>, ServerError> {
        self.auth_round(port, state, "", &req.data, Opcode::TrustedAuth)
    }

    fn auth_round(
        &self,
        port: &Arc<Port>,
        state: &mut PortState,
        plugin: &str,
        data: &[u8],
        opcode: Opcode,
    ) -> Result<Option<Packet>, ServerError> {
        if state.phase != Phase::Authenticating {
            return Err(ServerError::UnexpectedPacket(opcode));
        }
        let login = state.user.clone();
        self.throttle_pause(port, &login);
        let outcome = match state.auth.as_mut() {
            Some(session) => session.step(plugin, data),
            None => AuthOutcome::Failed,
        };
        self.auth_outcome(port, state, outcome, false)
    }

    fn auth_outcome(
        &self,
        port: &Arc<Port>,
        state: &mut PortState,
        outcome: AuthOutcome,
        after_connect: bool,
    ) -> Result<Option<Packet>, ServerError> {
        let ip = port.remote_addr.ip();
        match outcome {
            AuthOutcome::Accepted { plugin, data } => {
                self.throttle.record_success(&state.user, ip);
                let key = state
                    .auth
                    .take()
                    .and_then(|session| session.session_key().map(<[u8]>::to_vec));
                let required = self.config.crypt.wire_crypt == WireCrypt::Required
                    || state.client_crypt == WireCrypt::Required;
                if required && key.is_none() {
                    tracing::warn!(
                        "[{}] {} authenticated with {} which yields no wire key",
                        port.id,
                        state.user,
                        plugin
                    );
                    return Err(ServerError::WireCryptRequired);
                }
                let keys = if key.is_some() {
                    self.crypt_keys(state)
                } else {
                    Vec::new()
                };
                state.crypt_pending = required;
                state.session_key = key;
                state.phase = Phase::Accepted;
                tracing::info!(
                    "[{}] {} logged in from {} using {}",
                    port.id,
                    state.user,
                    port.remote_addr,
                    plugin
                );
                if after_connect {
                    Ok(Some(Packet::AcceptData(AcceptData {
                        version: state.protocol_version,
                        ptype: state.ptype,
                        plugin,
                        authenticated: true,
                        data,
                        keys,
                    })))
                } else {
                    Ok(Some(Packet::Response(Response::with_data(data))))
                }
            }
            AuthOutcome::Challenge { plugin, data } => {
                let keys = self.crypt_keys(state);
                if after_connect {
                    Ok(Some(Packet::CondAccept(AcceptData {
                        version: state.protocol_version,
                        ptype: state.ptype,
                        plugin,
                        authenticated: false,
                        data,
                        keys,
                    })))
                } else {
                    Ok(Some(Packet::ContAuth(ContAuth {
                        data,
                        plugin,
                        plugin_list: String::new(),
                        keys,
                    })))
                }
            }
            AuthOutcome::Failed => {
                self.throttle.record_failure(&state.user, ip);
                if let Some(metrics) = &self.metrics {
                    metrics.auth_failures_total.inc();
                }
                tracing::warn!(
                    "[{}] login failed for {:?} from {}",
                    port.id,
                    state.user,
                    port.remote_addr
                );
                state.auth = None;
                Err(ServerError::LoginFailed)
            }
        }
    }

    pub(super) fn crypt(
        &self,
        port: &Arc<Port>,
        state: &mut PortState,
        req: Crypt,
    ) -> Result<Option<Packet>, ServerError> {
        if state.encrypted {
            return Err(ServerError::invalid("wire encryption is already active"));
        }
        if req.plugin != CIPHER_PLUGIN || req.key != KEY_NAME {
            return Err(crypt_refused(format!(
                "unsupported wire cipher {} with key {}",
                req.plugin, req.key
            )));
        }
        if self.config.crypt.wire_crypt == WireCrypt::Disabled {
            return Err(crypt_refused("wire encryption is disabled on this server"));
        }
        let key = state
            .session_key
            .as_deref()
            .ok_or_else(|| crypt_refused("login produced no wire key"))?;
        let pair = CipherPair::for_server(key)?;

        // The reply is the last plain frame in this direction.
        port.send(Packet::Response(Response::ok()))?;
        port.install_cipher(pair.send)?;
        state.recv_cipher = Some(pair.recv);
        state.encrypted = true;
        state.crypt_pending = false;
        tracing::info!("[{}] wire encryption on ({})", port.id, CIPHER_PLUGIN);
        Ok(None)
    }

    pub(super) fn connect_request(
        &self,
        port: &Arc<Port>,
        _state: &mut PortState,
        req: ConnectRequest,
    ) -> Result<Option<Packet>, ServerError> {
        if port.has_aux() {
            return Err(ServerError::invalid("aux channel is already connected"));
        }
        let token = self.registry.issue_aux_token(port);
        tracing::debug!(
            "[{}] aux channel token issued ({:?}, attachment {})",
            port.id,
            req.kind,
            req.attachment
        );
        Ok(Some(Packet::Response(Response {
            blob_id: token,
            ..Response::default()
        })))
    }
}
