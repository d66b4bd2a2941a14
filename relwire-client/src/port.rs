//! Client end of a connection.
//!
//! A port owns the main socket, the codec state on both directions, the
//! queue of deferred packets and, once events are used, the aux channel.
//! Two locks guard it: the channel lock covers reading, the deferred queue
//! and every request/response exchange; the write lock covers only the
//! outbound socket so a cancel can be pushed while a request is pending.

use crate::auth::{create_plugin, ClientPlugin};
use crate::connection::{ConnectionConfig, TcpTransport, Transport, WireCrypt};
use crate::error::ClientError;
use crate::events::{AuxChannel, EventRegistry};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use relwire_protocol::crypt::{CIPHER_PLUGIN, KEY_NAME};
use relwire_protocol::packet::{
    ptype, AcceptData, AuthData, Cancel, CancelKind, Connect, ContAuth, Crypt, ProtocolOffer,
    Response,
};
use relwire_protocol::pblock::user_id;
use relwire_protocol::{
    CipherPair, Decoder, Encoder, Opcode, Packet, ParamBlock, MIN_PROTOCOL_VERSION,
    PROTOCOL_VERSION,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Supplies the key of an encrypted database, by name.
pub type KeyCallback = Box<dyn Fn(&str) -> Option<Bytes> + Send + Sync>;

#[derive(Debug)]
struct Deferred {
    packet: Packet,
    sent: bool,
}

struct Channel {
    reader: Box<dyn Transport>,
    decoder: Decoder,
    deferred: VecDeque<Deferred>,
    buf: Vec<u8>,
}

struct Writer {
    transport: Box<dyn Transport>,
    encoder: Encoder,
}

/// What the handshake settled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub protocol_version: u32,
    pub ptype: u32,
    /// Plugin that authenticated the login.
    pub plugin: String,
    pub encrypted: bool,
}

/// Turns a reply into a response, mapping a failed status to `Engine`.
pub(crate) fn expect_response(packet: Packet) -> Result<Response, ClientError> {
    match packet {
        Packet::Response(r) if r.status.is_error() => Err(ClientError::Engine(r.status)),
        Packet::Response(r) => Ok(r),
        other => Err(ClientError::UnexpectedPacket(other.opcode())),
    }
}

/// Replies to one exchange, read under the channel lock.
pub(crate) struct Replies<'a> {
    port: &'a Port,
    channel: &'a mut Channel,
}

impl Replies<'_> {
    pub fn packet(&mut self) -> Result<Packet, ClientError> {
        self.port.read_packet(self.channel)
    }

    pub fn response(&mut self) -> Result<Response, ClientError> {
        expect_response(self.packet()?)
    }
}

/// A connection to a relwire server.
pub struct Port {
    config: ConnectionConfig,
    session: Session,
    channel: Mutex<Channel>,
    writer: Mutex<Writer>,
    broken: AtomicBool,
    cancel_active: AtomicBool,
    key_callback: RwLock<Option<KeyCallback>>,
    pub(crate) aux: Mutex<Option<AuxChannel>>,
    pub(crate) events: Arc<EventRegistry>,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("addr", &self.config.addr)
            .field("session", &self.session)
            .field("broken", &self.broken.load(Ordering::Relaxed))
            .finish()
    }
}

impl Port {
    /// Connects over TCP and logs in.
    pub fn connect(config: ConnectionConfig) -> Result<Arc<Port>, ClientError> {
        let transport = TcpTransport::connect(config.addr, config.connect_timeout)
            .map_err(ClientError::from_io)?;
        transport.set_read_timeout(config.request_timeout.filter(|t| !t.is_zero()))?;
        let (reader, writer) = transport.split()?;
        Self::establish(config, Box::new(reader), Box::new(writer))
    }

    /// Logs in over an already open transport pair.
    pub fn establish(
        config: ConnectionConfig,
        reader: Box<dyn Transport>,
        writer: Box<dyn Transport>,
    ) -> Result<Arc<Port>, ClientError> {
        let buf_len = config.read_buffer_size;
        let mut port = Port {
            config,
            session: Session::default(),
            channel: Mutex::new(Channel {
                reader,
                decoder: Decoder::new(),
                deferred: VecDeque::new(),
                buf: vec![0; buf_len],
            }),
            writer: Mutex::new(Writer {
                transport: writer,
                encoder: Encoder::new(),
            }),
            broken: AtomicBool::new(false),
            cancel_active: AtomicBool::new(false),
            key_callback: RwLock::new(None),
            aux: Mutex::new(None),
            events: Arc::new(EventRegistry::new()),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
        };
        port.session = port.login()?;
        tracing::info!(
            "Connected to {} (protocol {}, {}, {}{})",
            port.config.addr,
            port.session.protocol_version,
            if port.is_lazy() { "lazy" } else { "sync" },
            port.session.plugin,
            if port.session.encrypted { ", encrypted" } else { "" }
        );
        Ok(Arc::new(port))
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn protocol_version(&self) -> u32 {
        self.session.protocol_version
    }

    pub fn is_lazy(&self) -> bool {
        self.session.ptype == ptype::LAZY
    }

    pub fn is_encrypted(&self) -> bool {
        self.session.encrypted
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    /// Number of deferred packets whose responses are still unread.
    pub fn deferred_len(&self) -> usize {
        self.channel.lock().deferred.len()
    }

    /// Event subscriptions that have neither fired nor been cancelled.
    pub fn event_subscriptions(&self) -> usize {
        self.events.len()
    }

    /// Registers the source of keys for encrypted databases.
    pub fn set_key_callback<F>(&self, callback: F)
    where
        F: Fn(&str) -> Option<Bytes> + Send + Sync + 'static,
    {
        *self.key_callback.write() = Some(Box::new(callback));
    }

    pub(crate) fn check_live(&self) -> Result<(), ClientError> {
        if self.is_broken() {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(())
    }

    fn track<T>(&self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        if let Err(e) = &result {
            if e.is_network() && !self.broken.swap(true, Ordering::AcqRel) {
                tracing::warn!("Connection to {} broken: {}", self.config.addr, e);
            }
        }
        result
    }

    fn write<'p, I>(&self, packets: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = &'p Packet>,
    {
        let mut writer = self.writer.lock();
        let mut buf = BytesMut::new();
        let mut count = 0u64;
        for packet in packets {
            tracing::debug!("-> {:?}", packet.opcode());
            match writer.encoder.encode(packet) {
                Ok(frame) => buf.extend_from_slice(&frame),
                // Earlier frames already advanced the keystream.
                Err(e) if count > 0 && writer.encoder.is_encrypted() => {
                    return Err(ClientError::Protocol(e))
                }
                Err(e) => return Err(ClientError::Message(e)),
            }
            count += 1;
        }
        if buf.is_empty() {
            return Ok(());
        }
        writer.transport.send(&buf).map_err(ClientError::from_io)?;
        self.packets_sent.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    fn read_packet(&self, channel: &mut Channel) -> Result<Packet, ClientError> {
        loop {
            if let Some(packet) = channel.decoder.decode_packet()? {
                self.packets_received.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("<- {:?}", packet.opcode());
                match packet {
                    Packet::Dummy => continue,
                    Packet::CryptKeyCallback(request) => {
                        self.answer_key_request(&request.data)?;
                        continue;
                    }
                    other => return Ok(other),
                }
            }
            let Channel {
                reader,
                decoder,
                buf,
                ..
            } = channel;
            let n = reader.receive(buf).map_err(ClientError::from_io)?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            decoder.extend(&buf[..n]);
        }
    }

    fn answer_key_request(&self, name: &[u8]) -> Result<(), ClientError> {
        let name = String::from_utf8_lossy(name);
        let key = self
            .key_callback
            .read()
            .as_ref()
            .and_then(|callback| callback(&name))
            .unwrap_or_default();
        if key.is_empty() {
            tracing::warn!("No key available for database {}", name);
        }
        self.write([&Packet::CryptKeyCallback(AuthData { data: key })])
    }

    /// Sends unsent deferred packets and reads every deferred response.
    fn flush_locked(&self, channel: &mut Channel) -> Result<(), ClientError> {
        if channel.deferred.is_empty() {
            return Ok(());
        }
        self.write(
            channel
                .deferred
                .iter()
                .filter(|d| !d.sent)
                .map(|d| &d.packet),
        )?;
        for entry in channel.deferred.iter_mut() {
            entry.sent = true;
        }

        let mut first_error = None;
        while let Some(entry) = channel.deferred.pop_front() {
            let opcode = entry.packet.opcode();
            match self.read_packet(channel)? {
                Packet::Response(r) if r.status.is_error() => {
                    tracing::warn!("Deferred {:?} failed: {}", opcode, r.status);
                    if first_error.is_none() {
                        first_error = Some(ClientError::Deferred {
                            opcode,
                            status: r.status,
                        });
                    }
                }
                Packet::Response(_) => {}
                other => return Err(ClientError::UnexpectedPacket(other.opcode())),
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drains the deferred queue now.
    pub fn flush(&self) -> Result<(), ClientError> {
        self.check_live()?;
        let mut channel = self.channel.lock();
        let result = self.flush_locked(&mut channel);
        self.track(result)
    }

    /// Sends `packets` in one write and hands the replies to `read`.
    ///
    /// The deferred queue is drained first; a deferred failure is returned
    /// before anything in `packets` is sent.
    pub(crate) fn transact<T, F>(&self, packets: &[Packet], read: F) -> Result<T, ClientError>
    where
        F: FnOnce(&mut Replies<'_>) -> Result<T, ClientError>,
    {
        self.check_live()?;
        let mut channel = self.channel.lock();
        let result = self.flush_locked(&mut channel).and_then(|_| {
            self.write(packets)?;
            read(&mut Replies {
                port: self,
                channel: &mut channel,
            })
        });
        self.track(result)
    }

    /// One request, one plain response.
    pub(crate) fn call(&self, packet: Packet) -> Result<Response, ClientError> {
        self.transact(std::slice::from_ref(&packet), |replies| replies.response())
    }

    /// Several requests in one write, one response each, returned in
    /// order. Only a network failure aborts the exchange.
    pub(crate) fn pipeline(
        &self,
        packets: Vec<Packet>,
    ) -> Result<Vec<Result<Response, ClientError>>, ClientError> {
        let count = packets.len();
        self.transact(&packets, |replies| {
            let mut out = Vec::with_capacity(count);
            for _ in 0..count {
                match replies.response() {
                    Err(e) if e.is_network() => return Err(e),
                    reply => out.push(reply),
                }
            }
            Ok(out)
        })
    }

    /// Queues a poolable request in lazy mode, or runs it now otherwise.
    pub(crate) fn defer(&self, packet: Packet) -> Result<(), ClientError> {
        if !self.is_lazy() {
            return self.call(packet).map(|_| ());
        }
        self.check_live()?;
        tracing::debug!("Deferring {:?}", packet.opcode());
        self.channel.lock().deferred.push_back(Deferred {
            packet,
            sent: false,
        });
        Ok(())
    }

    /// Sends a packet the server does not answer. Deferred packets go out
    /// first so the server sees them in issue order.
    pub(crate) fn post(&self, packet: Packet) -> Result<(), ClientError> {
        self.check_live()?;
        let mut channel = self.channel.lock();
        let result = self.write(
            channel
                .deferred
                .iter()
                .filter(|d| !d.sent)
                .map(|d| &d.packet)
                .chain(std::iter::once(&packet)),
        );
        if result.is_ok() {
            for entry in channel.deferred.iter_mut() {
                entry.sent = true;
            }
        }
        self.track(result)
    }

    pub fn ping(&self) -> Result<(), ClientError> {
        self.call(Packet::Ping).map(|_| ())
    }

    /// Cancels or toggles cancellation of the running request.
    ///
    /// Safe to call from another thread while a request is pending. Uses
    /// the aux channel when one is open.
    pub fn cancel(&self, kind: CancelKind) -> Result<(), ClientError> {
        self.check_live()?;
        if self.cancel_active.swap(true, Ordering::AcqRel) {
            return Err(ClientError::AsyncInProgress);
        }
        let packet = Packet::Cancel(Cancel { kind });
        let sent = {
            let mut aux = self.aux.lock();
            match aux.as_mut() {
                Some(channel) => Some(channel.send(&packet)),
                None => None,
            }
        };
        let result = match sent {
            Some(result) => result,
            None => self.write([&packet]),
        };
        self.cancel_active.store(false, Ordering::Release);
        tracing::debug!("Cancel {:?} sent", kind);
        self.track(result)
    }

    /// Flushes, says goodbye and closes every socket.
    pub fn close(&self) -> Result<(), ClientError> {
        if self.is_broken() {
            self.shutdown();
            return Ok(());
        }
        let result = {
            let mut channel = self.channel.lock();
            self.flush_locked(&mut channel)
                .and_then(|_| self.write([&Packet::Disconnect]))
        };
        self.broken.store(true, Ordering::Release);
        self.shutdown();
        tracing::debug!("Disconnected from {}", self.config.addr);
        result
    }

    fn shutdown(&self) {
        if let Some(aux) = self.aux.lock().take() {
            aux.close();
        }
        if let Err(e) = self.writer.lock().transport.shutdown() {
            tracing::debug!("shutdown of {}: {}", self.config.addr, e);
        }
    }

    fn login(&self) -> Result<Session, ClientError> {
        let config = &self.config;
        let Some(first_name) = config.auth_plugins.first() else {
            return Err(ClientError::usage("no authentication plugin configured"));
        };
        let mut plugin = self.plugin(first_name)?;
        let first_data = plugin.step(&[])?;

        let ident = ParamBlock::new()
            .with_str(user_id::LOGIN, &config.user)
            .with_str(user_id::PLUGIN_NAME, plugin.name())
            .with_str(user_id::PLUGIN_LIST, &config.auth_plugins.join(","))
            .with_bytes(user_id::SPECIFIC_DATA, first_data)
            .with_u32(user_id::CLIENT_CRYPT, config.wire_crypt.as_u32());
        let max_type = if config.lazy { ptype::LAZY } else { ptype::SYNC };
        let versions = (MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION)
            .rev()
            .map(|version| ProtocolOffer {
                version,
                min_type: ptype::SYNC,
                max_type,
                weight: version,
            })
            .collect();
        let connect = Packet::Connect(Connect {
            versions,
            user_id: ident.to_bytes().map_err(ClientError::Message)?,
        });

        let mut channel = self.channel.lock();
        self.write([&connect])?;
        let (accept, authenticated) = match self.read_packet(&mut channel)? {
            Packet::AcceptData(a) => (a, true),
            Packet::CondAccept(a) => (a, false),
            Packet::Reject => {
                return Err(ClientError::Rejected(
                    "no common protocol version".to_string(),
                ))
            }
            other => {
                // A successful plain response is not a valid answer either.
                expect_response(other)?;
                return Err(ClientError::UnexpectedPacket(Opcode::Response));
            }
        };
        let AcceptData {
            version,
            ptype,
            plugin: server_plugin,
            data,
            mut keys,
            ..
        } = accept;

        if authenticated {
            if server_plugin != plugin.name() {
                plugin = self.plugin(&server_plugin)?;
            }
            plugin.verify(&data)?;
        } else {
            self.authenticate(&mut channel, &mut plugin, server_plugin, data, &mut keys)?;
        }

        let mut session = Session {
            protocol_version: version,
            ptype,
            plugin: plugin.name().to_string(),
            encrypted: false,
        };
        let offered = keys.iter().any(|k| k == KEY_NAME);
        match plugin.session_key() {
            Some(key) if offered && config.wire_crypt != WireCrypt::Disabled => {
                self.start_crypt(&mut channel, &key)?;
                session.encrypted = true;
            }
            _ if config.wire_crypt == WireCrypt::Required => {
                return Err(ClientError::Auth(
                    "wire encryption is required but was not negotiated".to_string(),
                ));
            }
            _ => {}
        }
        Ok(session)
    }

    fn plugin(&self, name: &str) -> Result<Box<dyn ClientPlugin>, ClientError> {
        if !self.config.auth_plugins.iter().any(|p| p == name) {
            return Err(ClientError::Auth(format!("server chose unoffered plugin {}", name)));
        }
        create_plugin(name, &self.config.user, &self.config.password)
            .ok_or_else(|| ClientError::Auth(format!("unsupported plugin {}", name)))
    }

    /// Continues the login until the server accepts or refuses it.
    fn authenticate(
        &self,
        channel: &mut Channel,
        plugin: &mut Box<dyn ClientPlugin>,
        mut server_plugin: String,
        mut data: Bytes,
        keys: &mut Vec<String>,
    ) -> Result<(), ClientError> {
        loop {
            if server_plugin != plugin.name() {
                tracing::debug!("Server moved login to {}", server_plugin);
                *plugin = self.plugin(&server_plugin)?;
            }
            let reply = plugin.step(&data)?;
            self.write([&Packet::ContAuth(ContAuth {
                data: reply,
                plugin: plugin.name().to_string(),
                plugin_list: String::new(),
                keys: Vec::new(),
            })])?;
            match self.read_packet(channel)? {
                Packet::ContAuth(more) => {
                    server_plugin = more.plugin;
                    data = more.data;
                    if !more.keys.is_empty() {
                        *keys = more.keys;
                    }
                }
                other => {
                    let accepted = expect_response(other)?;
                    return plugin.verify(&accepted.data);
                }
            }
        }
    }

    fn start_crypt(&self, channel: &mut Channel, key: &[u8]) -> Result<(), ClientError> {
        let pair = CipherPair::for_client(key)?;
        self.write([&Packet::Crypt(Crypt {
            plugin: CIPHER_PLUGIN.to_string(),
            key: KEY_NAME.to_string(),
        })])?;
        expect_response(self.read_packet(channel)?)?;
        self.writer.lock().encoder.set_cipher(pair.send);
        channel.decoder.set_cipher(pair.recv);
        Ok(())
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        self.shutdown();
    }
}
