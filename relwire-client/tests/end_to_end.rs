//! Client against a live server on the loopback interface.

use bytes::Bytes;
use relwire_client::{
    Attachment, BatchOptions, CancelKind, ClientError, ConnectionConfig, Port, Service,
    StatementType, Value, WireCrypt,
};
use relwire_engine::MemoryEngine;
use relwire_protocol::pblock::spb;
use relwire_protocol::status::codes;
use relwire_server::{Config, Server, UserSecret};
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

const USER: &str = "alice";
const PASSWORD: &str = "secret";

struct TestServer {
    addr: SocketAddr,
    server: Arc<Server>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    fn start() -> TestServer {
        let mut config = Config::default();
        config.metrics.enabled = false;
        config.network.bind_addr = "127.0.0.1:0".parse().unwrap();
        config
            .auth
            .users
            .insert(USER.to_string(), UserSecret::from_password(USER, PASSWORD));
        let engine = MemoryEngine::new()
            .with_database("main")
            .with_keyed_database("vault", Bytes::from_static(b"k3y"));
        let server = Arc::new(Server::new(config, Arc::new(engine)));

        let (tx, rx) = mpsc::channel();
        let thread = {
            let server = server.clone();
            std::thread::spawn(move || {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                    .unwrap();
                runtime.block_on(async move {
                    let listener = server.bind().await.unwrap();
                    tx.send(listener.local_addr().unwrap()).unwrap();
                    server.serve(listener).await.unwrap();
                });
            })
        };
        let addr = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        TestServer {
            addr,
            server,
            thread: Some(thread),
        }
    }

    fn config(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.addr)
            .with_credentials(USER, PASSWORD)
            .with_process_name("end_to_end")
    }

    fn connect(&self) -> Arc<Port> {
        relwire_client::connect(self.config()).unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn int(value: &Value) -> i64 {
    value.as_i64().unwrap()
}

/// Creates `name` with ids 1..=rows.
fn seed(att: &Attachment, name: &str, rows: i32) {
    let mut txn = att.start_transaction().unwrap();
    att.execute_immediate(
        Some(&txn),
        &format!("CREATE TABLE {} (id INTEGER PRIMARY KEY, label VARCHAR(20))", name),
    )
    .unwrap();
    let insert = att
        .prepare(Some(&txn), &format!("INSERT INTO {} VALUES (?, ?)", name))
        .unwrap();
    assert_eq!(insert.statement_type(), StatementType::Insert);
    for id in 1..=rows {
        let affected = insert
            .execute(&txn, &[Value::Integer(id), Value::Text(format!("row {}", id))])
            .unwrap();
        assert_eq!(affected, 1);
    }
    txn.commit().unwrap();
}

#[test]
fn test_login_negotiates_encryption() {
    let server = TestServer::start();
    let port = server.connect();
    assert!(port.is_encrypted());
    assert!(port.is_lazy());
    assert_eq!(port.protocol_version(), relwire_protocol::PROTOCOL_VERSION);
    port.ping().unwrap();
    port.close().unwrap();
    assert!(port.is_broken());
}

#[test]
fn test_plain_session_when_crypt_disabled() {
    let server = TestServer::start();
    let port = relwire_client::connect(
        server
            .config()
            .with_wire_crypt(WireCrypt::Disabled)
            .with_lazy(false),
    )
    .unwrap();
    assert!(!port.is_encrypted());
    assert!(!port.is_lazy());
    let mut att = Attachment::attach(&port, "main").unwrap();
    att.detach().unwrap();
}

#[test]
fn test_wrong_password_rejected() {
    let server = TestServer::start();
    let err = relwire_client::connect(ConnectionConfig::new(server.addr).with_credentials(USER, "nope"))
        .unwrap_err();
    assert!(
        matches!(err, ClientError::Auth(_) | ClientError::Rejected(_) | ClientError::Engine(_)),
        "unexpected error {:?}",
        err
    );
}

#[test]
fn test_transaction_commit_and_released_handle() {
    let server = TestServer::start();
    let port = server.connect();
    let att = Attachment::attach(&port, "main").unwrap();
    seed(&att, "people", 3);

    let mut txn = att.start_transaction().unwrap();
    let count = att.prepare(Some(&txn), "SELECT COUNT(*) FROM people").unwrap();
    let mut cursor = count.open_cursor(&txn, &[], false).unwrap();
    let rows = cursor.collect_rows().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(int(&rows[0][0]), 3);
    cursor.close().unwrap();

    txn.commit().unwrap();
    assert!(!txn.is_active());
    assert!(matches!(txn.commit(), Err(ClientError::Released("transaction"))));
}

#[test]
fn test_rollback_discards_rows() {
    let server = TestServer::start();
    let port = server.connect();
    let att = Attachment::attach(&port, "main").unwrap();
    seed(&att, "scratch", 2);

    let mut txn = att.start_transaction().unwrap();
    att.execute_immediate(Some(&txn), "DELETE FROM scratch").unwrap();
    txn.rollback().unwrap();

    let txn = att.start_transaction().unwrap();
    let select = att.prepare(Some(&txn), "SELECT * FROM scratch").unwrap();
    let rows = select.open_cursor(&txn, &[], false).unwrap().collect_rows().unwrap();
    assert_eq!(rows.len(), 2);
}

#[test]
fn test_lazy_requests_surface_at_next_call() {
    let server = TestServer::start();
    let port = server.connect();
    let att = Attachment::attach(&port, "main").unwrap();
    seed(&att, "items", 1);

    let txn = att.start_transaction().unwrap();
    let mut select = att.prepare(Some(&txn), "SELECT * FROM items").unwrap();
    let mut cursor = select.open_cursor(&txn, &[], false).unwrap();
    assert!(cursor.next().unwrap().is_some());
    cursor.close().unwrap();
    select.free().unwrap();
    assert_eq!(port.deferred_len(), 2);

    // The queued frees ride along with the next round trip.
    port.ping().unwrap();
    assert_eq!(port.deferred_len(), 0);
    assert!(matches!(select.id(), Err(ClientError::Released("statement"))));
}

#[test]
fn test_prepare_error_is_engine_error() {
    let server = TestServer::start();
    let port = server.connect();
    let att = Attachment::attach(&port, "main").unwrap();
    let txn = att.start_transaction().unwrap();
    let err = att.prepare(Some(&txn), "SELEKT nonsense").unwrap_err();
    assert_eq!(err.gds_code(), Some(codes::SQL_SYNTAX));

    // The connection stays usable.
    port.ping().unwrap();
    assert_eq!(port.deferred_len(), 0);
}

#[test]
fn test_scrollable_cursor_moves() {
    let server = TestServer::start();
    let port = server.connect();
    let att = Attachment::attach(&port, "main").unwrap();
    seed(&att, "scroll", 10);

    let txn = att.start_transaction().unwrap();
    let select = att.prepare(Some(&txn), "SELECT * FROM scroll").unwrap();
    assert_eq!(select.statement_type(), StatementType::Select);
    let mut cursor = select.open_cursor(&txn, &[], true).unwrap();
    assert!(cursor.is_scrollable());

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(int(&cursor.next().unwrap().unwrap()[0]));
    }
    assert_eq!(seen, vec![1, 2, 3, 4]);

    assert_eq!(int(&cursor.prior().unwrap().unwrap()[0]), 3);
    assert_eq!(int(&cursor.prior().unwrap().unwrap()[0]), 2);
    assert_eq!(int(&cursor.relative(3).unwrap().unwrap()[0]), 5);
    assert_eq!(int(&cursor.relative(-3).unwrap().unwrap()[0]), 2);
    assert_eq!(int(&cursor.next().unwrap().unwrap()[0]), 3);

    assert_eq!(int(&cursor.last().unwrap().unwrap()[0]), 10);
    assert!(cursor.next().unwrap().is_none());
    assert!(cursor.is_eof());

    assert_eq!(int(&cursor.first().unwrap().unwrap()[0]), 1);
    assert!(cursor.prior().unwrap().is_none());
    assert!(cursor.is_bof());

    assert_eq!(int(&cursor.absolute(7).unwrap().unwrap()[0]), 7);
    assert_eq!(int(&cursor.next().unwrap().unwrap()[0]), 8);
}

#[test]
fn test_batch_reports_failed_rows() {
    let server = TestServer::start();
    let port = server.connect();
    let att = Attachment::attach(&port, "main").unwrap();
    let mut txn = att.start_transaction().unwrap();
    att.execute_immediate(Some(&txn), "CREATE TABLE keys (id INTEGER PRIMARY KEY)")
        .unwrap();
    let insert = att.prepare(Some(&txn), "INSERT INTO keys VALUES (?)").unwrap();
    let mut batch = insert
        .create_batch(
            BatchOptions::default()
                .with_multi_error(true)
                .with_record_counts(true)
                .with_detailed_errors(8),
        )
        .unwrap();
    for id in [1, 2, 2, 3] {
        batch.add(&[Value::Integer(id)]).unwrap();
    }
    let state = batch.execute(&txn).unwrap();
    assert_eq!(state.total, 4);
    assert!(!state.is_success());
    assert_eq!(state.failed(), vec![2]);
    assert_eq!(state.record_counts, vec![1, 1, -1, 1]);
    assert_eq!(
        state.error_at(2).and_then(|s| s.primary_code()),
        Some(codes::UNIQUE_KEY_VIOLATION)
    );
    batch.release().unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_blob_write_then_read() {
    let server = TestServer::start();
    let port = server.connect();
    let att = Attachment::attach(&port, "main").unwrap();
    let txn = att.start_transaction().unwrap();

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let mut blob = txn.create_blob(None).unwrap();
    assert!(blob.is_created());
    blob.write(&payload).unwrap();
    let blob_id = blob.blob_id();
    blob.close().unwrap();

    let mut reader = txn.open_blob(blob_id, None).unwrap();
    assert_eq!(reader.read_to_end().unwrap(), payload);
    assert!(reader.is_eof());
    reader.close().unwrap();
}

#[test]
fn test_event_fires_after_commit() {
    let server = TestServer::start();
    let port = server.connect();
    let att = Attachment::attach(&port, "main").unwrap();

    let (tx, rx) = mpsc::channel();
    let events = att
        .queue_events(&[("placed", 0)], move |counts| {
            let _ = tx.send(counts.to_vec());
        })
        .unwrap();
    assert_eq!(port.event_subscriptions(), 1);

    let mut txn = att.start_transaction().unwrap();
    att.execute_immediate(Some(&txn), "POST_EVENT 'placed'").unwrap();
    // Nothing is delivered before the commit.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    txn.commit().unwrap();

    let counts = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].name, "placed");
    assert_eq!(counts[0].count, 1);
    assert!(events.is_fired());
    assert!(!events.cancel().unwrap());
}

#[test]
fn test_cancelled_event_never_fires() {
    let server = TestServer::start();
    let port = server.connect();
    let att = Attachment::attach(&port, "main").unwrap();

    let (tx, rx) = mpsc::channel::<()>();
    let events = att
        .queue_events(&[("ignored", 0)], move |_| {
            let _ = tx.send(());
        })
        .unwrap();
    assert!(events.cancel().unwrap());
    assert_eq!(port.event_subscriptions(), 0);

    let mut txn = att.start_transaction().unwrap();
    att.execute_immediate(Some(&txn), "POST_EVENT 'ignored'").unwrap();
    txn.commit().unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn test_cancel_interrupts_running_statement() {
    let server = TestServer::start();
    let port = server.connect();
    let att = Arc::new(Attachment::attach(&port, "main").unwrap());
    let txn = att.start_transaction().unwrap();

    let canceller = {
        let att = att.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            att.cancel_operation(CancelKind::Raise)
        })
    };
    let err = att.execute_immediate(Some(&txn), "DELAY 5000").unwrap_err();
    assert!(matches!(err, ClientError::Engine(_)), "unexpected error {:?}", err);
    canceller.join().unwrap().unwrap();

    // Still usable after the cancelled call.
    port.ping().unwrap();
}

#[test]
fn test_keyed_database_uses_key_callback() {
    let server = TestServer::start();
    let port = server.connect();
    port.set_key_callback(|database| {
        (database == "vault").then(|| Bytes::from_static(b"k3y"))
    });
    let mut att = Attachment::attach(&port, "vault").unwrap();
    att.detach().unwrap();

    let port = server.connect();
    port.set_key_callback(|_| Some(Bytes::from_static(b"wrong")));
    assert!(Attachment::attach(&port, "vault").is_err());
    port.ping().unwrap();
}

#[test]
fn test_service_lists_databases() {
    let server = TestServer::start();
    let port = server.connect();
    let mut service = Service::attach(&port).unwrap();
    service.start(spb::ACTION_LIST_DATABASES).unwrap();
    let lines = service.lines().unwrap();
    assert!(lines.iter().any(|l| l == "main"));
    assert!(lines.iter().any(|l| l == "vault"));
    assert!(!service.server_version().unwrap().is_empty());
    service.detach().unwrap();
}
