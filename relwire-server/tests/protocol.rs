//! Raw protocol sessions against a running server.

use bytes::Bytes;
use relwire_engine::MemoryEngine;
use relwire_protocol::packet::{
    ptype, AttachDb, Cancel, CancelKind, Connect, ObjectRef, ProtocolOffer, StartTransaction,
};
use relwire_protocol::pblock::user_id;
use relwire_protocol::status::codes;
use relwire_protocol::{scram, Decoder, Encoder, Packet, ParamBlock, Response};
use relwire_server::config::ThrottleConfig;
use relwire_server::{Config, Server, UserSecret};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const LEGACY_PLUGIN: &str = "Legacy_Hash";

struct Running {
    server: Arc<Server>,
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Running {
    async fn start(throttle: ThrottleConfig) -> Running {
        let mut config = Config::default();
        config.network.bind_addr = "127.0.0.1:0".parse().unwrap();
        config.metrics.enabled = false;
        config.auth.throttle = throttle;
        config
            .auth
            .users
            .insert("alice".to_string(), UserSecret::from_password("alice", "secret"));
        let server = Arc::new(Server::new(
            config,
            Arc::new(MemoryEngine::new().with_database("db")),
        ));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = {
            let server = server.clone();
            tokio::spawn(async move {
                server.serve(listener).await.unwrap();
            })
        };
        Running { server, addr, task }
    }

    async fn stop(self) {
        self.server.shutdown();
        self.task.await.unwrap();
    }
}

struct Session {
    stream: TcpStream,
    decoder: Decoder,
}

impl Session {
    async fn open(addr: SocketAddr) -> Session {
        Session {
            stream: TcpStream::connect(addr).await.unwrap(),
            decoder: Decoder::new(),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let bytes = Encoder::encode_plain(packet).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    /// Next packet, or `None` once the server closed the connection.
    async fn receive(&mut self) -> Option<Packet> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(packet) = self.decoder.decode_packet().unwrap() {
                return Some(packet);
            }
            let n = self.stream.read(&mut buf).await.unwrap();
            if n == 0 {
                return None;
            }
            self.decoder.extend(&buf[..n]);
        }
    }

    async fn call(&mut self, packet: &Packet) -> Response {
        self.send(packet).await;
        match self.receive().await {
            Some(Packet::Response(r)) => r,
            other => panic!("unexpected {:?}", other),
        }
    }

    async fn login(&mut self, password: &str) -> Packet {
        let ident = ParamBlock::new()
            .with_str(user_id::LOGIN, "alice")
            .with_str(user_id::PLUGIN_NAME, LEGACY_PLUGIN)
            .with_str(user_id::PLUGIN_LIST, LEGACY_PLUGIN)
            .with_str(user_id::SPECIFIC_DATA, &scram::legacy_hash("alice", password));
        self.send(&Packet::Connect(Connect {
            versions: vec![ProtocolOffer {
                version: relwire_protocol::PROTOCOL_VERSION,
                min_type: ptype::SYNC,
                max_type: ptype::SYNC,
                weight: 1,
            }],
            user_id: ident.to_bytes().unwrap(),
        }))
        .await;
        self.receive().await.unwrap()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_attach_commit_then_bad_handle() {
    let running = Running::start(ThrottleConfig::default()).await;
    let mut session = Session::open(running.addr).await;
    match session.login("secret").await {
        Packet::AcceptData(accept) => {
            assert!(accept.authenticated);
            assert_eq!(accept.ptype, ptype::SYNC);
        }
        other => panic!("unexpected {:?}", other),
    }

    let attach = session
        .call(&Packet::Attach(AttachDb {
            database: "db".to_string(),
            dpb: Bytes::new(),
        }))
        .await;
    assert!(!attach.status.is_error());
    assert!(attach.object > 0);

    let txn = session
        .call(&Packet::Transaction(StartTransaction {
            attachment: attach.object,
            tpb: Bytes::new(),
        }))
        .await;
    assert!(!txn.status.is_error());
    assert!(txn.object > 0);

    let commit = session.call(&Packet::Commit(ObjectRef::new(txn.object))).await;
    assert!(!commit.status.is_error());
    let again = session.call(&Packet::Commit(ObjectRef::new(txn.object))).await;
    assert_eq!(again.status.primary_code(), Some(codes::BAD_TRANS_HANDLE));

    // The engine error left the connection usable.
    let ping = session.call(&Packet::Ping).await;
    assert!(!ping.status.is_error());

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abort_tears_down_idle_port() {
    let running = Running::start(ThrottleConfig::default()).await;
    let mut session = Session::open(running.addr).await;
    assert!(matches!(session.login("secret").await, Packet::AcceptData(_)));
    let attach = session
        .call(&Packet::Attach(AttachDb {
            database: "db".to_string(),
            dpb: Bytes::new(),
        }))
        .await;
    let txn = session
        .call(&Packet::Transaction(StartTransaction {
            attachment: attach.object,
            tpb: Bytes::new(),
        }))
        .await;
    assert!(!txn.status.is_error());
    assert_eq!(running.server.connections(), 1);

    // Nothing else is sent after the abort.
    session
        .send(&Packet::Cancel(Cancel {
            kind: CancelKind::Abort,
        }))
        .await;
    let closed = tokio::time::timeout(Duration::from_secs(5), session.receive()).await;
    assert!(matches!(closed, Ok(None)), "socket stayed open: {:?}", closed);

    let deadline = Instant::now() + Duration::from_secs(5);
    while running.server.connections() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(running.server.connections(), 0);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_logins_are_throttled() {
    let penalty = Duration::from_millis(400);
    let running = Running::start(ThrottleConfig {
        failure_limit: 2,
        window_secs: 30,
        penalty_ms: penalty.as_millis() as u64,
    })
    .await;

    for _ in 0..2 {
        let mut session = Session::open(running.addr).await;
        match session.login("wrong").await {
            Packet::Response(r) => assert_eq!(r.status.primary_code(), Some(codes::LOGIN)),
            other => panic!("unexpected {:?}", other),
        }
    }

    let mut session = Session::open(running.addr).await;
    let started = Instant::now();
    match session.login("wrong").await {
        Packet::Response(r) => assert_eq!(r.status.primary_code(), Some(codes::LOGIN)),
        other => panic!("unexpected {:?}", other),
    }
    assert!(started.elapsed() >= penalty);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_opcode_closes_connection() {
    let running = Running::start(ThrottleConfig::default()).await;
    let mut session = Session::open(running.addr).await;
    session.stream.write_all(&[0xff, 0xff, 0xff, 0x7f]).await.unwrap();

    // At most one error response, then the server hangs up.
    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let mut buf = [0u8; 256];
            match session.stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(outcome.is_ok(), "connection stayed open");

    running.stop().await;
}
