//! TCP listener and per-connection I/O tasks.
//!
//! Every connection gets a reader task and a writer task. The reader turns
//! bytes into packets and hands them to the port's inbound queue; requests
//! then run on the worker pool. The first packet decides what a connection
//! is: `AuxConnect` makes it the async sibling of an existing port, anything
//! else makes it a new main port.

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::pool::{PortRunner, WorkerPool};
use crate::port::{Inbound, Outbound, Port};
use crate::registry::PortRegistry;
use relwire_engine::Engine;
use relwire_protocol::packet::{AuxConnect, CancelKind};
use relwire_protocol::status::codes;
use relwire_protocol::{Decoder, Encoder, Opcode, Packet, ProtocolError, Response, StatusVector};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};

const READ_BUFFER: usize = 8192;

/// State shared by the accept loop and connection tasks.
struct Shared {
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<PortRegistry>,
    pool: Arc<WorkerPool>,
    metrics: Option<Metrics>,
}

/// The relwire server.
pub struct Server {
    shared: Arc<Shared>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a server over `engine`. Workers start immediately.
    pub fn new(config: Config, engine: Arc<dyn Engine>) -> Self {
        let config = Arc::new(config);
        let metrics = if config.metrics.enabled {
            match Metrics::new() {
                Ok(m) => Some(m),
                Err(e) => {
                    tracing::error!("Failed to create metrics registry: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let registry = Arc::new(PortRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            engine,
            config.clone(),
            registry.clone(),
            metrics.clone(),
        ));
        let runner: PortRunner = {
            let dispatcher = dispatcher.clone();
            Arc::new(move |port: &Arc<Port>| dispatcher.run_port(port))
        };
        let pool = Arc::new(WorkerPool::new(
            config.pool.clone(),
            runner,
            metrics.clone(),
        ));
        let (shutdown, _) = broadcast::channel(1);

        Self {
            shared: Arc::new(Shared {
                config,
                dispatcher,
                registry,
                pool,
                metrics,
            }),
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        Ok(TcpListener::bind(self.shared.config.network.bind_addr).await?)
    }

    /// Binds the configured address and serves until [`Server::shutdown`].
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local = listener.local_addr()?;
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", local);

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                tracing::debug!("[{}] set_nodelay: {}", addr, e);
                            }
                            let shared = self.shared.clone();
                            let conn_shutdown = self.shutdown.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, shared, conn_shutdown).await {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.drain().await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stops the workers, then tears down every port still connected.
    async fn drain(&self) {
        let pool = self.shared.pool.clone();
        if tokio::task::spawn_blocking(move || pool.shutdown()).await.is_err() {
            tracing::error!("Worker pool shutdown panicked");
        }
        let ports = self.shared.registry.drain();
        if !ports.is_empty() {
            tracing::info!("Disconnecting {} remaining connections", ports.len());
        }
        for port in ports {
            let _ = port.send(Packet::Response(Response::error(
                StatusVector::error(codes::SHUTDOWN).with_str("server shutting down"),
            )));
            let mut state = port.lock_state();
            self.shared.dispatcher.disconnect(&port, &mut state);
        }
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of connected main ports.
    pub fn connections(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn metrics(&self) -> Option<&Metrics> {
        self.shared.metrics.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }
}

enum Read {
    Data(usize),
    Eof,
    Idle,
    Closed,
    Shutdown,
}

/// Waits for more bytes, the idle deadline, port close or server shutdown.
async fn read_more(
    reader: &mut OwnedReadHalf,
    buf: &mut [u8],
    idle: Duration,
    port: Option<&Port>,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<Read, ServerError> {
    let closed = async {
        match port {
            Some(port) => port.closed().await,
            None => std::future::pending::<()>().await,
        }
    };
    let idle_wait = async {
        if idle.is_zero() {
            std::future::pending::<()>().await
        } else {
            tokio::time::sleep(idle).await
        }
    };
    tokio::select! {
        result = reader.read(buf) => match result? {
            0 => Ok(Read::Eof),
            n => Ok(Read::Data(n)),
        },
        _ = closed => Ok(Read::Closed),
        _ = idle_wait => Ok(Read::Idle),
        _ = shutdown.recv() => Ok(Read::Shutdown),
    }
}

/// Drains the outbound channel into the socket.
async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outbound>, addr: SocketAddr) {
    let mut encoder = Encoder::new();
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Frame(packet) => {
                let bytes = match encoder.encode(&packet) {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::error!("[{}] encoding {:?}: {}", addr, packet.opcode(), e);
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(&bytes).await {
                    tracing::debug!("[{}] write error: {}", addr, e);
                    break;
                }
            }
            Outbound::InstallCipher(cipher) => encoder.set_cipher(cipher),
            Outbound::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    let (mut reader, writer) = stream.into_split();
    let idle = shared.config.network.idle_timeout();
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; READ_BUFFER];

    // The first packet decides the role of the connection.
    let first = loop {
        match decoder.decode_packet() {
            Ok(Some(packet)) => break packet,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("[{}] malformed first packet: {}", addr, e);
                return Err(e.into());
            }
        }
        match read_more(&mut reader, &mut buf, idle, None, &mut shutdown).await? {
            Read::Data(n) => decoder.extend(&buf[..n]),
            Read::Eof | Read::Idle | Read::Closed | Read::Shutdown => return Ok(()),
        }
    };

    if let Packet::AuxConnect(req) = first {
        return serve_aux(req, reader, writer, decoder, addr, shared, shutdown).await;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let max = shared.config.network.max_connections;
    if shared.registry.len() >= max {
        tracing::warn!("Connection limit reached, rejecting {}", addr);
        let _ = tx.send(Outbound::Frame(Packet::Reject));
        drop(tx);
        write_loop(writer, rx, addr).await;
        return Ok(());
    }

    let port = Arc::new(Port::new(addr, tx, shared.config.network.max_handles));
    shared.registry.register(port.clone());
    if let Some(metrics) = &shared.metrics {
        metrics.connections_total.inc();
        metrics.connections_active.inc();
    }
    tracing::info!("[{}] client connected from {}", port.id, addr);
    tokio::spawn(write_loop(writer, rx, addr));

    let result = serve_main(&port, first, reader, decoder, idle, &shared, &mut shutdown).await;
    if result.is_err() {
        deliver(&port, &shared, Inbound::Closed);
    }
    result
}

fn deliver(port: &Arc<Port>, shared: &Shared, item: Inbound) {
    port.push_inbound(item);
    shared.pool.schedule(port);
}

/// Applies a cancel outside the worker; an abort schedules the teardown.
fn apply_cancel(port: &Arc<Port>, shared: &Shared, kind: CancelKind) {
    match port.apply_cancel(kind) {
        Ok(true) => shared.pool.schedule(port),
        Ok(false) => {}
        Err(e) => tracing::debug!("[{}] cancel refused: {}", port.id, e),
    }
}

/// Routes one packet read from a main connection. Returns `false` when the
/// reader must stop.
async fn route(port: &Arc<Port>, shared: &Shared, decoder: &mut Decoder, packet: Packet) -> bool {
    match packet {
        Packet::Cancel(req) => {
            apply_cancel(port, shared, req.kind);
            true
        }
        Packet::Crypt(_) => {
            // Bytes after the Crypt frame are encrypted; hold off decoding
            // until the worker has decided.
            let (ack, decided) = oneshot::channel();
            port.set_crypt_ack(ack);
            deliver(port, shared, Inbound::Packet(packet));
            match decided.await {
                Ok(Some(cipher)) => {
                    decoder.set_cipher(cipher);
                    true
                }
                Ok(None) => true,
                Err(_) => false,
            }
        }
        other => {
            deliver(port, shared, Inbound::Packet(other));
            true
        }
    }
}

async fn serve_main(
    port: &Arc<Port>,
    first: Packet,
    mut reader: OwnedReadHalf,
    mut decoder: Decoder,
    idle: Duration,
    shared: &Arc<Shared>,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    if !route(port, shared, &mut decoder, first).await {
        return Ok(());
    }
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        loop {
            match decoder.decode_packet() {
                Ok(Some(packet)) => {
                    if !route(port, shared, &mut decoder, packet).await {
                        return Ok(());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    deliver(port, shared, Inbound::Malformed(e));
                    return Ok(());
                }
            }
        }

        match read_more(&mut reader, &mut buf, idle, Some(port), shutdown).await? {
            Read::Data(n) => decoder.extend(&buf[..n]),
            Read::Eof => {
                tracing::debug!("[{}] connection closed by client", port.id);
                deliver(port, shared, Inbound::Closed);
                return Ok(());
            }
            Read::Idle => {
                if port.is_scheduled() || port.idle_duration() < idle {
                    continue;
                }
                tracing::info!("[{}] idle timeout", port.id);
                deliver(port, shared, Inbound::Closed);
                return Ok(());
            }
            Read::Closed => return Ok(()),
            Read::Shutdown => return Err(ServerError::ShuttingDown),
        }
    }
}

/// Serves the async sibling of a main port: events go out, and cancel or
/// ping requests apply to the main port without waiting for its worker.
async fn serve_aux(
    req: AuxConnect,
    mut reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    mut decoder: Decoder,
    addr: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(writer, rx, addr));

    let port = match shared.registry.claim_aux_token(req.token) {
        Some(port) if port.set_aux(tx.clone()) => port,
        _ => {
            tracing::warn!("[{}] aux connection with an unknown token", addr);
            let status = StatusVector::error(codes::NETWORK_ERROR).with_str("invalid aux token");
            let _ = tx.send(Outbound::Frame(Packet::Response(Response::error(status))));
            let _ = tx.send(Outbound::Close);
            let _ = writer_task.await;
            return Ok(());
        }
    };
    tracing::info!("[{}] aux channel connected from {}", port.id, addr);
    let _ = tx.send(Outbound::Frame(Packet::Response(Response::ok())));

    let mut buf = vec![0u8; READ_BUFFER];
    let result = loop {
        // Only cancel and ping belong here; refuse anything else on its
        // opcode instead of buffering a payload we would discard.
        match decoder.peek_opcode() {
            Ok(Some(Opcode::Cancel | Opcode::Ping)) | Ok(None) => {}
            Ok(Some(opcode)) => {
                tracing::warn!("[{}] unexpected {:?} on aux channel", port.id, opcode);
                break Err(ProtocolError::UnexpectedOpcode(opcode).into());
            }
            Err(e) => break Err(e.into()),
        }
        match decoder.decode_packet() {
            Ok(Some(Packet::Cancel(cancel))) => {
                apply_cancel(&port, &shared, cancel.kind);
                continue;
            }
            Ok(Some(Packet::Ping)) => {
                let _ = tx.send(Outbound::Frame(Packet::Response(Response::ok())));
                continue;
            }
            Ok(Some(other)) => {
                tracing::warn!("[{}] unexpected {:?} on aux channel", port.id, other.opcode());
                break Err(ProtocolError::UnexpectedOpcode(other.opcode()).into());
            }
            Ok(None) => {}
            Err(e) => break Err(e.into()),
        }
        // The aux channel lives as long as its main port, idle or not.
        match read_more(&mut reader, &mut buf, Duration::ZERO, Some(&port), &mut shutdown).await {
            Ok(Read::Data(n)) => decoder.extend(&buf[..n]),
            Ok(_) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    tracing::debug!("[{}] aux channel closed", port.id);
    port.clear_aux();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use relwire_engine::MemoryEngine;

    fn test_server() -> Server {
        let mut config = Config::default();
        config.network.bind_addr = "127.0.0.1:0".parse().unwrap();
        Server::new(config, Arc::new(MemoryEngine::new().with_database("db")))
    }

    async fn roundtrip(stream: &mut TcpStream, packet: &Packet) -> Packet {
        let bytes = Encoder::encode_plain(packet).unwrap();
        stream.write_all(&bytes).await.unwrap();
        let mut decoder = Decoder::new();
        let mut buf = [0u8; 1024];
        loop {
            if let Some(p) = decoder.decode_packet().unwrap() {
                return p;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed the connection");
            decoder.extend(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_server_basic() {
        let server = test_server();
        assert!(!server.is_running());
        assert_eq!(server.connections(), 0);
        assert!(server.metrics().is_some());
    }

    #[tokio::test]
    async fn test_ping_and_shutdown() {
        let server = Arc::new(test_server());
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let running = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        let mut stream = TcpStream::connect(addr).await.unwrap();
        match roundtrip(&mut stream, &Packet::Ping).await {
            Packet::Response(r) => assert!(!r.status.is_error()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(server.connections(), 1);

        server.shutdown();
        running.await.unwrap().unwrap();
        assert!(!server.is_running());
        assert_eq!(server.connections(), 0);
    }

    #[tokio::test]
    async fn test_unknown_aux_token() {
        let server = Arc::new(test_server());
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let running = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        let mut stream = TcpStream::connect(addr).await.unwrap();
        match roundtrip(&mut stream, &Packet::AuxConnect(AuxConnect { token: 42 })).await {
            Packet::Response(r) => assert!(r.status.is_error()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(server.connections(), 0);

        server.shutdown();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = Config::default();
        config.network.bind_addr = "127.0.0.1:0".parse().unwrap();
        config.network.max_connections = 1;
        let server = Arc::new(Server::new(config, Arc::new(MemoryEngine::new())));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let running = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        let mut first = TcpStream::connect(addr).await.unwrap();
        roundtrip(&mut first, &Packet::Ping).await;
        let mut second = TcpStream::connect(addr).await.unwrap();
        assert_eq!(roundtrip(&mut second, &Packet::Ping).await, Packet::Reject);

        server.shutdown();
        running.await.unwrap().unwrap();
    }
}
