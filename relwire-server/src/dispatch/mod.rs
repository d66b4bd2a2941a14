//! Request dispatcher.
//!
//! A worker calls [`Dispatcher::run_port`] with exclusive use of the port:
//! it locks the connection state and handles every queued packet in
//! order. Each request produces at most one reply. Engine and handle
//! errors go back in the reply's status vector and the connection stays
//! usable; anything that desynchronizes the stream closes the port and
//! tears down every object it owns.

mod batch;
mod events;
mod handshake;
mod objects;
mod statement;

use crate::auth::{AuthThrottle, UserStore};
use crate::config::Config;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::port::{Inbound, Phase, Port, PortState};
use crate::registry::PortRegistry;
use bytes::Bytes;
use relwire_engine::{Engine, EngineError};
use relwire_protocol::info::{items, InfoWriter};
use relwire_protocol::{Opcode, Packet, Response};
use std::sync::Arc;
use std::time::Instant;

/// Maps packets to engine calls.
pub struct Dispatcher {
    engine: Arc<dyn Engine>,
    config: Arc<Config>,
    users: Arc<UserStore>,
    throttle: AuthThrottle,
    registry: Arc<PortRegistry>,
    metrics: Option<Metrics>,
}

/// Reply carrying only a new object id.
fn object_reply(id: u32) -> Option<Packet> {
    Some(Packet::Response(Response::with_object(id)))
}

fn ok_reply() -> Option<Packet> {
    Some(Packet::Response(Response::ok()))
}

/// Answers an info request item by item. Items nobody knows are reported
/// as [`items::ERROR`]; the answer stops once the caller's buffer is full.
fn collect_info<F>(requested: &[u8], buffer_length: u32, mut answer: F) -> Result<Bytes, ServerError>
where
    F: FnMut(u8, &mut InfoWriter) -> Result<bool, EngineError>,
{
    let mut writer = InfoWriter::new(buffer_length);
    for &item in requested {
        if item == items::END {
            break;
        }
        if !answer(item, &mut writer)? {
            writer.push(items::ERROR, &[item]);
        }
        if writer.is_truncated() {
            break;
        }
    }
    Ok(writer.finish())
}

impl Dispatcher {
    pub fn new(
        engine: Arc<dyn Engine>,
        config: Arc<Config>,
        registry: Arc<PortRegistry>,
        metrics: Option<Metrics>,
    ) -> Self {
        let users = Arc::new(UserStore::new(config.auth.users.clone()));
        let throttle = AuthThrottle::new(config.auth.throttle.clone());
        Self {
            engine,
            config,
            users,
            throttle,
            registry,
            metrics,
        }
    }

    pub fn throttle(&self) -> &AuthThrottle {
        &self.throttle
    }

    /// Handles everything queued on `port`.
    pub fn run_port(&self, port: &Arc<Port>) {
        let mut state = port.lock_state();
        while let Some(item) = port.pop_inbound() {
            if state.phase == Phase::Disconnected {
                // The reader may be waiting on a Crypt decision.
                port.take_crypt_ack();
                continue;
            }
            match item {
                Inbound::Packet(packet) => self.process(port, &mut state, packet),
                Inbound::Malformed(e) => {
                    tracing::warn!("[{}] malformed packet: {}", port.id, e);
                    self.fail(port, &mut state, Opcode::Dummy, ServerError::Protocol(e));
                }
                Inbound::Closed => {
                    tracing::debug!("[{}] peer closed the connection", port.id);
                    self.disconnect(port, &mut state);
                }
            }
        }
    }

    fn process(&self, port: &Arc<Port>, state: &mut PortState, packet: Packet) {
        let opcode = packet.opcode();
        tracing::debug!("[{}] <- {:?}", port.id, opcode);
        let started = Instant::now();
        port.cancel.reset();

        let crypt_ack = if matches!(packet, Packet::Crypt(_)) {
            port.take_crypt_ack()
        } else {
            None
        };

        let result = self.dispatch(port, state, packet);

        if let Some(ack) = crypt_ack {
            let _ = ack.send(state.recv_cipher.take());
        }
        if let Some(metrics) = &self.metrics {
            let label = format!("{:?}", opcode);
            metrics.packets_total.with_label_values(&[&label]).inc();
            metrics
                .operation_duration
                .with_label_values(&[&label])
                .observe(started.elapsed().as_secs_f64());
        }

        match result {
            Ok(Some(reply)) => {
                if port.send(reply).is_err() {
                    self.disconnect(port, state);
                }
            }
            Ok(None) => {}
            Err(e) => self.fail(port, state, opcode, e),
        }
    }

    /// Reports a failed request, closing the port if the failure is fatal.
    fn fail(&self, port: &Arc<Port>, state: &mut PortState, opcode: Opcode, err: ServerError) {
        let status = err.status();
        if let Some(metrics) = &self.metrics {
            let code = status.primary_code().unwrap_or(0).to_string();
            metrics.errors_total.with_label_values(&[&code]).inc();
        }
        if err.is_fatal() {
            tracing::warn!("[{}] {:?} failed, closing connection: {}", port.id, opcode, err);
            let _ = port.send(Packet::Response(Response::error(status)));
            self.disconnect(port, state);
        } else {
            tracing::debug!("[{}] {:?} failed: {}", port.id, opcode, err);
            if port.send(Packet::Response(Response::error(status))).is_err() {
                self.disconnect(port, state);
            }
        }
    }

    /// Tears the port down. Safe to call more than once.
    pub fn disconnect(&self, port: &Arc<Port>, state: &mut PortState) {
        if state.phase == Phase::Disconnected {
            return;
        }
        let was_accepted = state.phase == Phase::Accepted;
        state.phase = Phase::Disconnected;
        state.auth = None;
        state.session_key = None;
        state.handles.release_all();
        port.close();
        self.registry.remove(&port.id);
        if let Some(metrics) = &self.metrics {
            metrics.connections_active.dec();
        }
        tracing::info!(
            "[{}] disconnected {} (user {}, {} packets in, {} out, {}accepted)",
            port.id,
            port.remote_addr,
            if state.user.is_empty() { "-" } else { &state.user },
            port.packets_in(),
            port.packets_out(),
            if was_accepted { "" } else { "never " }
        );
    }

    fn check_phase(state: &PortState, packet: &Packet) -> Result<(), ServerError> {
        let opcode = packet.opcode();
        match state.phase {
            Phase::Pending | Phase::Authenticating => match packet {
                Packet::Connect(_)
                | Packet::ContAuth(_)
                | Packet::TrustedAuth(_)
                | Packet::Disconnect
                | Packet::Exit
                | Packet::Ping
                | Packet::Dummy => Ok(()),
                _ => Err(ServerError::NotAuthenticated(opcode)),
            },
            Phase::Accepted if state.crypt_pending => match packet {
                Packet::Crypt(_)
                | Packet::Disconnect
                | Packet::Exit
                | Packet::Ping
                | Packet::Dummy => Ok(()),
                _ => Err(ServerError::WireCryptRequired),
            },
            Phase::Accepted => Ok(()),
            Phase::Disconnected => Err(ServerError::Broken),
        }
    }

    fn dispatch(
        &self,
        port: &Arc<Port>,
        state: &mut PortState,
        packet: Packet,
    ) -> Result<Option<Packet>, ServerError> {
        Self::check_phase(state, &packet)?;
        match packet {
            // connection
            Packet::Connect(req) => self.connect(port, state, req),
            Packet::ContAuth(req) => self.cont_auth(port, state, req),
            Packet::TrustedAuth(req) => self.trusted_auth(port, state, req),
            Packet::Crypt(req) => self.crypt(port, state, req),
            Packet::ConnectRequest(req) => self.connect_request(port, state, req),
            Packet::Disconnect | Packet::Exit => {
                self.disconnect(port, state);
                Ok(None)
            }
            Packet::Ping => Ok(ok_reply()),
            Packet::Dummy => Ok(None),

            // attachment
            Packet::Attach(req) => self.attach(port, state, req, false),
            Packet::Create(req) => self.attach(port, state, req, true),
            Packet::Detach(req) => self.detach(state, req.id, false),
            Packet::DropDatabase(req) => self.detach(state, req.id, true),

            // transaction
            Packet::Transaction(req) => self.start_transaction(state, req),
            Packet::Commit(req) => self.end_transaction(state, req.id, true),
            Packet::Rollback(req) => self.end_transaction(state, req.id, false),
            Packet::CommitRetaining(req) => self.retain_transaction(state, req.id, true),
            Packet::RollbackRetaining(req) => self.retain_transaction(state, req.id, false),
            Packet::Prepare(req) => self.prepare_transaction(state, req.id, &[]),
            Packet::Prepare2(req) => self.prepare_transaction(state, req.transaction, &req.message),

            // blob
            Packet::OpenBlob(req) => self.open_blob(state, req),
            Packet::CreateBlob(req) => self.create_blob(state, req),
            Packet::GetSegment(req) => self.get_segment(state, req),
            Packet::PutSegment(req) => self.put_segment(state, req),
            Packet::BatchSegments(req) => self.batch_segments(state, req),
            Packet::Seek(req) => self.seek_blob(state, req),
            Packet::CancelBlob(req) => self.finish_blob(state, req.id, true),
            Packet::CloseBlob(req) => self.finish_blob(state, req.id, false),

            // statement
            Packet::AllocateStatement(req) => self.allocate_statement(state, req.id),
            Packet::PrepareStatement(req) => self.prepare_statement(state, req),
            Packet::Execute(req) => self.execute(port, state, req, false),
            Packet::Execute2(req) => self.execute(port, state, req, true),
            Packet::ExecImmediate(req) => self.exec_immediate(port, state, req),
            Packet::Fetch(req) => self.fetch(port, state, req),
            Packet::FetchScroll(req) => self.fetch_scroll(port, state, req),
            Packet::FreeStatement(req) => self.free_statement(state, req),
            Packet::SetCursor(req) => self.set_cursor(state, req),

            // info
            Packet::InfoDatabase(req) => self.info_database(state, req),
            Packet::InfoTransaction(req) => self.info_transaction(state, req),
            Packet::InfoBlob(req) => self.info_blob(state, req),
            Packet::InfoSql(req) => self.info_sql(state, req),
            Packet::InfoRequest(req) => self.info_request(state, req),

            // batch
            Packet::BatchCreate(req) => self.batch_create(state, req),
            Packet::BatchMsg(req) => self.batch_msg(state, req),
            Packet::BatchBlobStream(req) => self.batch_blob_stream(state, req),
            Packet::BatchRegBlob(req) => self.batch_reg_blob(state, req),
            Packet::BatchSetBpb(req) => self.batch_set_bpb(state, req),
            Packet::BatchExec(req) => self.batch_exec(port, state, req),
            Packet::BatchCancel(req) => self.batch_cancel(state, req.id),
            Packet::BatchRelease(req) => self.batch_release(state, req.id),
            Packet::BatchSync => Ok(ok_reply()),

            // events
            Packet::QueEvents(req) => self.que_events(port, state, req),
            Packet::CancelEvents(req) => self.cancel_events(state, req),

            // compiled requests
            Packet::Compile(req) => self.compile(state, req),
            Packet::Start(req) => self.start_request(state, req, false),
            Packet::StartAndSend(req) => self.start_request(state, req, true),
            Packet::Send(req) => self.send_request(state, req),
            Packet::Receive(req) => self.receive_request(state, req),
            Packet::Unwind(req) => self.unwind_request(state, req),
            Packet::Release(req) => self.release_request(state, req.id),

            // service manager
            Packet::ServiceAttach(req) => self.service_attach(state, req),
            Packet::ServiceDetach(req) => self.service_detach(state, req.id),
            Packet::ServiceStart(req) => self.service_start(state, req),
            Packet::ServiceInfo(req) => self.service_info(state, req),

            // Cancel is applied by the reader; one that got here came too late.
            Packet::Cancel(_) => Ok(None),

            Packet::Accept(_)
            | Packet::AcceptData(_)
            | Packet::CondAccept(_)
            | Packet::Reject
            | Packet::Response(_)
            | Packet::AuxConnect(_)
            | Packet::FetchResponse(_)
            | Packet::SqlResponse(_)
            | Packet::BatchCompletionState(_)
            | Packet::Event(_)
            | Packet::CryptKeyCallback(_) => Err(ServerError::UnexpectedPacket(packet.opcode())),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::SCRAM_PLUGIN;
    use crate::config::UserSecret;
    use crate::port::Outbound;
    use relwire_engine::MemoryEngine;
    use relwire_protocol::packet::{
        ptype, AttachDb, Connect, ContAuth, ObjectRef, ProtocolOffer, StartTransaction,
    };
    use relwire_protocol::pblock::user_id;
    use relwire_protocol::status::codes;
    use relwire_protocol::{scram, ParamBlock, PROTOCOL_VERSION};
    use tokio::sync::mpsc;

    pub(crate) struct Harness {
        pub dispatcher: Dispatcher,
        pub port: Arc<Port>,
        pub rx: mpsc::UnboundedReceiver<Outbound>,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_config(Config::default())
        }

        pub fn with_config(mut config: Config) -> Self {
            config.auth.users.insert(
                "ALICE".to_string(),
                UserSecret::derive("ALICE", "secret", b"0123456789abcdef", 64),
            );
            let engine = MemoryEngine::new()
                .with_database("db")
                .with_keyed_database("vault", "k3y");
            let registry = Arc::new(PortRegistry::new());
            let dispatcher =
                Dispatcher::new(Arc::new(engine), Arc::new(config), registry.clone(), None);
            let (tx, rx) = mpsc::unbounded_channel();
            let port = Arc::new(Port::new("127.0.0.1:5000".parse().unwrap(), tx, 64));
            registry.register(port.clone());
            Self {
                dispatcher,
                port,
                rx,
            }
        }

        /// Runs one packet and returns the frames it produced.
        pub fn call(&mut self, packet: Packet) -> Vec<Packet> {
            self.port.push_inbound(Inbound::Packet(packet));
            self.dispatcher.run_port(&self.port);
            let mut out = Vec::new();
            while let Ok(item) = self.rx.try_recv() {
                if let Outbound::Frame(p) = item {
                    out.push(p);
                }
            }
            out
        }

        pub fn response(&mut self, packet: Packet) -> Response {
            match self.call(packet).pop() {
                Some(Packet::Response(r)) => r,
                other => panic!("expected a response, got {:?}", other),
            }
        }

        pub fn ok(&mut self, packet: Packet) -> Response {
            let r = self.response(packet);
            assert!(!r.status.is_error(), "unexpected error: {}", r.status);
            r
        }

        /// Connects and logs in as ALICE through SCRAM.
        pub fn login(&mut self) {
            let client_first = format!("n,,n=ALICE,r={}", scram::nonce());
            let user_id = ParamBlock::new()
                .with_str(user_id::LOGIN, "ALICE")
                .with_str(user_id::PLUGIN_NAME, SCRAM_PLUGIN)
                .with_str(user_id::PLUGIN_LIST, SCRAM_PLUGIN)
                .with_bytes(user_id::SPECIFIC_DATA, client_first.clone().into_bytes())
                .to_bytes()
                .unwrap();
            let reply = self.call(Packet::Connect(Connect {
                versions: vec![ProtocolOffer {
                    version: PROTOCOL_VERSION,
                    min_type: ptype::SYNC,
                    max_type: ptype::LAZY,
                    weight: 1,
                }],
                user_id,
            }));
            let server_first = match reply.as_slice() {
                [Packet::CondAccept(a)] => String::from_utf8(a.data.to_vec()).unwrap(),
                other => panic!("unexpected {:?}", other),
            };

            let bare = &client_first[3..];
            let nonce = scram::attribute(&server_first, 'r').unwrap();
            let salt = scram::decode_b64(scram::attribute(&server_first, 's').unwrap()).unwrap();
            let iterations: u32 = scram::attribute(&server_first, 'i').unwrap().parse().unwrap();
            let salted = scram::salted_password("secret", &salt, iterations);
            let ck = scram::client_key(&salted);
            let final_bare = format!("c=biws,r={}", nonce);
            let auth_message = format!("{},{},{}", bare, server_first, final_bare);
            let sig = scram::hmac_sha256(&scram::sha256(&ck), auth_message.as_bytes());
            let proof = scram::encode_b64(&scram::xor(&ck, &sig));
            let client_final = format!("{},p={}", final_bare, proof);

            self.ok(Packet::ContAuth(ContAuth {
                data: Bytes::from(client_final.into_bytes()),
                plugin: SCRAM_PLUGIN.to_string(),
                plugin_list: String::new(),
                keys: Vec::new(),
            }));
        }

        pub fn attach(&mut self) -> u32 {
            self.ok(Packet::Attach(AttachDb {
                database: "db".to_string(),
                dpb: Bytes::new(),
            }))
            .object
        }

        pub fn start(&mut self, attachment: u32) -> u32 {
            self.ok(Packet::Transaction(StartTransaction {
                attachment,
                tpb: Bytes::new(),
            }))
            .object
        }
    }

    #[test]
    fn test_requests_before_login_are_fatal() {
        let mut h = Harness::new();
        let r = h.response(Packet::Attach(AttachDb {
            database: "db".into(),
            dpb: Bytes::new(),
        }));
        assert_eq!(r.status.primary_code(), Some(codes::PROTOCOL));
        assert!(h.port.is_broken() || h.port.lock_state().phase == Phase::Disconnected);
    }

    #[test]
    fn test_ping_before_login() {
        let mut h = Harness::new();
        h.ok(Packet::Ping);
        assert_eq!(h.port.lock_state().phase, Phase::Pending);
    }

    #[test]
    fn test_attach_commit_then_bad_handle() {
        let mut h = Harness::new();
        h.login();
        let attachment = h.attach();
        assert!(attachment > 0);
        let txn = h.start(attachment);
        assert!(txn > 0);

        h.ok(Packet::Commit(ObjectRef::new(txn)));
        let again = h.response(Packet::Commit(ObjectRef::new(txn)));
        assert_eq!(again.status.primary_code(), Some(codes::BAD_TRANS_HANDLE));
        // still usable
        h.ok(Packet::Ping);
    }

    #[test]
    fn test_unexpected_server_packet_closes() {
        let mut h = Harness::new();
        h.login();
        let r = h.response(Packet::Reject);
        assert!(r.status.is_error());
        assert_eq!(h.port.lock_state().phase, Phase::Disconnected);
    }

    #[test]
    fn test_closed_tears_down() {
        let mut h = Harness::new();
        h.login();
        let attachment = h.attach();
        h.start(attachment);
        h.port.push_inbound(Inbound::Closed);
        h.dispatcher.run_port(&h.port);
        let state = h.port.lock_state();
        assert_eq!(state.phase, Phase::Disconnected);
        assert!(state.handles.is_empty());
    }

    #[test]
    fn test_info_collects_known_items() {
        let data = collect_info(&[items::DB_ID, 250, items::END], 64, |item, w| {
            if item == items::DB_ID {
                w.push_str(item, "db");
                Ok(true)
            } else {
                Ok(false)
            }
        })
        .unwrap();
        let parsed = relwire_protocol::InfoResponse::parse(&data).unwrap();
        assert_eq!(parsed.get(items::DB_ID).unwrap().as_str(), Some("db"));
        assert!(parsed.get(items::ERROR).is_some());
    }
}
