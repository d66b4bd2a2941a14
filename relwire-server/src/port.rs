//! Server-side connection state.
//!
//! A port is shared between the tokio tasks that move bytes and the worker
//! thread that runs its requests. The handle tables and flags sit behind
//! the state lock, which only the worker running the port holds. Outbound
//! frames go through a separate writer lock so cancel and ping replies can
//! be sent while a long request holds the state.

use crate::auth::AuthSession;
use crate::config::WireCrypt;
use crate::error::ServerError;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use relwire_engine::{
    CancelToken, EngineAttachment, EngineBlob, EngineCursor, EngineRequest, EngineService,
    EngineStatement, EngineTransaction,
};
use relwire_protocol::blobstream::BlobStreamParser;
use relwire_protocol::packet::CancelKind;
use relwire_protocol::{HandleTable, MessageFormat, ObjectKind, Packet, ProtocolError, WireCipher};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use uuid::Uuid;

/// Work for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(Packet),
    /// Encrypt every frame after this point.
    InstallCipher(WireCipher),
    Close,
}

/// Work for the worker running a port.
#[derive(Debug)]
pub enum Inbound {
    Packet(Packet),
    /// The byte stream could not be decoded; the port must go.
    Malformed(ProtocolError),
    /// The peer went away.
    Closed,
}

/// Lifecycle of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for `Connect`.
    Pending,
    /// Auth plugins are exchanging data.
    Authenticating,
    Accepted,
    Disconnected,
}

pub struct AttachmentEntry {
    pub engine: Arc<dyn EngineAttachment>,
    pub database: String,
}

pub struct TransactionEntry {
    pub engine: Arc<dyn EngineTransaction>,
    pub attachment: u32,
}

pub struct BlobEntry {
    pub engine: Arc<dyn EngineBlob>,
    pub attachment: u32,
    pub transaction: u32,
    /// Created blobs are cancelled on teardown, opened ones closed.
    pub created: bool,
}

/// An open cursor and the transaction it reads in.
pub struct CursorEntry {
    pub engine: Arc<dyn EngineCursor>,
    pub transaction: u32,
}

/// Streamed blob assembled from batch records.
#[derive(Debug, Default)]
pub struct PendingBlob {
    pub bpb: Bytes,
    pub chunks: Vec<Bytes>,
}

/// Server half of a batch: messages and blobs collected until `BatchExec`.
pub struct BatchState {
    pub format: MessageFormat,
    pub multi_error: bool,
    pub record_counts: bool,
    pub blob_policy: u32,
    pub detailed_errors: usize,
    pub buffer_limit: usize,
    pub messages: Vec<Bytes>,
    pub buffered: usize,
    pub stream: BlobStreamParser,
    /// Streamed blobs by batch-local id, in arrival order.
    pub blobs: BTreeMap<u64, PendingBlob>,
    /// Batch-local ids registered for existing blobs.
    pub registered: HashMap<u64, u64>,
    pub default_bpb: Bytes,
    /// First failure of a request that has no reply; reported by `BatchExec`.
    pub latched: Option<relwire_protocol::StatusVector>,
}

impl BatchState {
    /// Drops collected data; the batch itself stays usable.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.buffered = 0;
        self.stream.clear();
        self.blobs.clear();
        self.registered.clear();
        self.latched = None;
    }

    pub fn latch(&mut self, status: relwire_protocol::StatusVector) {
        if self.latched.is_none() {
            self.latched = Some(status);
        }
    }
}

pub struct StatementEntry {
    pub attachment: u32,
    pub engine: Option<Arc<dyn EngineStatement>>,
    pub cursor: Option<CursorEntry>,
    /// Format rows are fetched in, once the client has named one.
    pub out_format: Option<MessageFormat>,
    pub batch: Option<BatchState>,
}

impl StatementEntry {
    /// Closes the cursor, if one is open.
    pub fn close_cursor(&mut self) -> Result<(), ServerError> {
        match self.cursor.take() {
            Some(cursor) => Ok(cursor.engine.close()?),
            None => Ok(()),
        }
    }
}

pub struct RequestEntry {
    pub engine: Arc<dyn EngineRequest>,
    pub attachment: u32,
}

pub struct EventEntry {
    pub engine: Arc<dyn EngineAttachment>,
    pub attachment: u32,
    pub local_id: u32,
    pub subscription: u64,
    /// Set by whichever of the callback and the cancel gets there first.
    pub claimed: Arc<AtomicBool>,
}

pub struct ServiceEntry {
    pub engine: Arc<dyn EngineService>,
}

/// All handle tables of one connection.
pub struct Handles {
    pub attachments: HandleTable<AttachmentEntry>,
    pub transactions: HandleTable<TransactionEntry>,
    pub blobs: HandleTable<BlobEntry>,
    pub statements: HandleTable<StatementEntry>,
    pub requests: HandleTable<RequestEntry>,
    pub events: HandleTable<EventEntry>,
    pub services: HandleTable<ServiceEntry>,
}

impl Handles {
    pub fn new(max_handles: u32) -> Self {
        let cap = max_handles as usize;
        Self {
            attachments: HandleTable::with_cap(ObjectKind::Attachment, cap),
            transactions: HandleTable::with_cap(ObjectKind::Transaction, cap),
            blobs: HandleTable::with_cap(ObjectKind::Blob, cap),
            statements: HandleTable::with_cap(ObjectKind::Statement, cap),
            requests: HandleTable::with_cap(ObjectKind::Request, cap),
            events: HandleTable::with_cap(ObjectKind::Event, cap),
            services: HandleTable::with_cap(ObjectKind::Service, cap),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
            && self.transactions.is_empty()
            && self.blobs.is_empty()
            && self.statements.is_empty()
            && self.requests.is_empty()
            && self.events.is_empty()
            && self.services.is_empty()
    }

    /// Releases everything owned by `attachment`, or everything on the
    /// connection when `None`: events, requests, statements, blobs, then
    /// transactions (rolled back). Attachments themselves are left to the
    /// caller, services are released only on full teardown.
    ///
    /// Engine failures are logged and do not stop the teardown.
    pub fn release_owned(&mut self, attachment: Option<u32>) {
        let owned = |owner: u32| attachment.map_or(true, |a| a == owner);

        for id in self.events.ids() {
            let Ok(entry) = self.events.get(id) else { continue };
            if !owned(entry.attachment) {
                continue;
            }
            if let Ok(entry) = self.events.release(id) {
                if !entry.claimed.swap(true, Ordering::AcqRel) {
                    if let Err(e) = entry.engine.cancel_events(entry.subscription) {
                        tracing::warn!("cancelling event subscription {}: {}", id, e);
                    }
                }
            }
        }

        for id in self.requests.ids() {
            if self.requests.get(id).is_ok_and(|r| owned(r.attachment)) {
                let _ = self.requests.release(id);
            }
        }

        for id in self.statements.ids() {
            if !self.statements.get(id).is_ok_and(|s| owned(s.attachment)) {
                continue;
            }
            if let Ok(mut entry) = self.statements.release(id) {
                if let Err(e) = entry.close_cursor() {
                    tracing::warn!("closing cursor of statement {}: {}", id, e);
                }
                if let Some(stmt) = entry.engine.take() {
                    if let Err(e) = stmt.free() {
                        tracing::warn!("freeing statement {}: {}", id, e);
                    }
                }
            }
        }

        for id in self.blobs.ids() {
            if !self.blobs.get(id).is_ok_and(|b| owned(b.attachment)) {
                continue;
            }
            if let Ok(entry) = self.blobs.release(id) {
                let result = if entry.created {
                    entry.engine.cancel()
                } else {
                    entry.engine.close()
                };
                if let Err(e) = result {
                    tracing::warn!("releasing blob {}: {}", id, e);
                }
            }
        }

        for id in self.transactions.ids() {
            if !self.transactions.get(id).is_ok_and(|t| owned(t.attachment)) {
                continue;
            }
            if let Ok(entry) = self.transactions.release(id) {
                if entry.engine.is_active() {
                    tracing::debug!("rolling back transaction {} on teardown", id);
                    if let Err(e) = entry.engine.rollback() {
                        tracing::warn!("rolling back transaction {}: {}", id, e);
                    }
                }
            }
        }

        if attachment.is_none() {
            for (id, entry) in self.services.drain() {
                if let Err(e) = entry.engine.detach() {
                    tracing::warn!("detaching service {}: {}", id, e);
                }
            }
        }
    }

    /// Releases every handle, detaching attachments last.
    pub fn release_all(&mut self) {
        self.release_owned(None);
        for (id, entry) in self.attachments.drain() {
            if let Err(e) = entry.engine.detach() {
                tracing::warn!("detaching attachment {} ({}): {}", id, entry.database, e);
            }
        }
    }

    /// Releases the blobs and cursors tied to a finished transaction.
    pub fn release_transaction_objects(&mut self, transaction: u32) {
        for id in self.blobs.ids() {
            if !self.blobs.get(id).is_ok_and(|b| b.transaction == transaction) {
                continue;
            }
            if let Ok(entry) = self.blobs.release(id) {
                let result = if entry.created {
                    entry.engine.cancel()
                } else {
                    entry.engine.close()
                };
                if let Err(e) = result {
                    tracing::debug!("blob {} after end of transaction: {}", id, e);
                }
            }
        }
        for id in self.statements.ids() {
            if let Ok(entry) = self.statements.get_mut(id) {
                if entry.cursor.as_ref().is_some_and(|c| c.transaction == transaction) {
                    if let Err(e) = entry.close_cursor() {
                        tracing::debug!("cursor of statement {}: {}", id, e);
                    }
                }
            }
        }
    }
}

/// State guarded by the connection lock.
pub struct PortState {
    pub phase: Phase,
    pub protocol_version: u32,
    pub ptype: u32,
    pub user: String,
    pub auth: Option<AuthSession>,
    pub client_crypt: WireCrypt,
    pub session_key: Option<Vec<u8>>,
    /// Auth succeeded but encryption is mandatory and not yet on.
    pub crypt_pending: bool,
    pub encrypted: bool,
    /// Receive cipher waiting to be handed to the reader task.
    pub recv_cipher: Option<WireCipher>,
    /// Target of a prepare addressed to [`relwire_protocol::packet::LAST_OBJECT`].
    pub last_statement: u32,
    pub handles: Handles,
}

impl PortState {
    fn new(max_handles: u32) -> Self {
        Self {
            phase: Phase::Pending,
            protocol_version: 0,
            ptype: 0,
            user: String::new(),
            auth: None,
            client_crypt: WireCrypt::Enabled,
            session_key: None,
            crypt_pending: false,
            encrypted: false,
            recv_cipher: None,
            last_statement: 0,
            handles: Handles::new(max_handles),
        }
    }
}

/// One client connection.
pub struct Port {
    pub id: Uuid,
    pub remote_addr: SocketAddr,
    state: Mutex<PortState>,
    inbound: Mutex<VecDeque<Inbound>>,
    arrived: Condvar,
    writer: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    aux: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    /// Polled by long-running engine calls.
    pub cancel: CancelToken,
    async_busy: AtomicBool,
    scheduled: AtomicBool,
    broken: AtomicBool,
    closed: Notify,
    crypt_ack: Mutex<Option<oneshot::Sender<Option<WireCipher>>>>,
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    created_at: Instant,
    last_activity: Mutex<Instant>,
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("broken", &self.is_broken())
            .finish_non_exhaustive()
    }
}

impl Port {
    pub fn new(
        remote_addr: SocketAddr,
        writer: mpsc::UnboundedSender<Outbound>,
        max_handles: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            state: Mutex::new(PortState::new(max_handles)),
            inbound: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
            writer: Mutex::new(Some(writer)),
            aux: Mutex::new(None),
            cancel: CancelToken::new(),
            async_busy: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            closed: Notify::new(),
            crypt_ack: Mutex::new(None),
            packets_in: AtomicU64::new(0),
            packets_out: AtomicU64::new(0),
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Locks the connection state. Only the worker running the port does this.
    pub fn lock_state(&self) -> MutexGuard<'_, PortState> {
        self.state.lock()
    }

    // Inbound queue

    pub fn push_inbound(&self, item: Inbound) {
        if matches!(item, Inbound::Packet(_)) {
            self.packets_in.fetch_add(1, Ordering::Relaxed);
        }
        *self.last_activity.lock() = Instant::now();
        self.inbound.lock().push_back(item);
        self.arrived.notify_all();
    }

    pub fn pop_inbound(&self) -> Option<Inbound> {
        self.inbound.lock().pop_front()
    }

    pub fn has_inbound(&self) -> bool {
        !self.inbound.lock().is_empty()
    }

    /// Blocks the running worker until the next inbound item or the timeout.
    pub fn wait_inbound(&self, timeout: Duration) -> Option<Inbound> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inbound.lock();
        loop {
            if let Some(item) = queue.pop_front() {
                return Some(item);
            }
            if self.arrived.wait_until(&mut queue, deadline).timed_out() {
                return queue.pop_front();
            }
        }
    }

    // Outbound

    fn send_on(
        &self,
        channel: &Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
        item: Outbound,
    ) -> Result<(), ServerError> {
        let guard = channel.lock();
        let sender = guard.as_ref().ok_or(ServerError::Broken)?;
        sender.send(item).map_err(|_| ServerError::Broken)
    }

    /// Queues a frame on the main channel.
    pub fn send(&self, packet: Packet) -> Result<(), ServerError> {
        tracing::debug!("[{}] -> {:?}", self.id, packet.opcode());
        match self.send_on(&self.writer, Outbound::Frame(packet)) {
            Ok(()) => {
                self.packets_out.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.mark_broken();
                Err(e)
            }
        }
    }

    pub fn install_cipher(&self, cipher: WireCipher) -> Result<(), ServerError> {
        self.send_on(&self.writer, Outbound::InstallCipher(cipher))
    }

    pub fn set_aux(&self, sender: mpsc::UnboundedSender<Outbound>) -> bool {
        let mut aux = self.aux.lock();
        if aux.is_some() {
            return false;
        }
        *aux = Some(sender);
        true
    }

    pub fn has_aux(&self) -> bool {
        self.aux.lock().is_some()
    }

    pub fn clear_aux(&self) {
        if let Some(sender) = self.aux.lock().take() {
            let _ = sender.send(Outbound::Close);
        }
    }

    /// Queues a frame on the aux channel.
    pub fn send_aux(&self, packet: Packet) -> Result<(), ServerError> {
        self.send_on(&self.aux, Outbound::Frame(packet))
    }

    /// Stops both writers and wakes the reader.
    pub fn close(&self) {
        if let Some(sender) = self.writer.lock().take() {
            let _ = sender.send(Outbound::Close);
        }
        self.clear_aux();
        self.crypt_ack.lock().take();
        self.closed.notify_one();
    }

    /// Resolves once [`Port::close`] has been called.
    pub async fn closed(&self) {
        self.closed.notified().await
    }

    // Flags

    pub fn mark_broken(&self) {
        if !self.broken.swap(true, Ordering::AcqRel) {
            tracing::warn!("[{}] connection from {} is broken", self.id, self.remote_addr);
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Claims the port for the worker pool. Fails if already queued or running.
    pub fn try_schedule(&self) -> bool {
        self.scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn unschedule(&self) {
        self.scheduled.store(false, Ordering::Release);
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Applies an out-of-band cancel. Only one may be in flight at a time.
    ///
    /// Returns `true` after an abort: the port is broken and must be
    /// scheduled so a worker tears it down.
    pub fn apply_cancel(&self, kind: CancelKind) -> Result<bool, ServerError> {
        if self
            .async_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ServerError::AsyncInProgress);
        }
        tracing::debug!("[{}] cancel {:?}", self.id, kind);
        let aborted = match kind {
            CancelKind::Raise => {
                self.cancel.cancel();
                false
            }
            CancelKind::Disable => {
                self.cancel.set_enabled(false);
                false
            }
            CancelKind::Enable => {
                self.cancel.set_enabled(true);
                false
            }
            CancelKind::Abort => {
                self.mark_broken();
                self.push_inbound(Inbound::Closed);
                true
            }
        };
        self.async_busy.store(false, Ordering::Release);
        Ok(aborted)
    }

    pub fn set_crypt_ack(&self, ack: oneshot::Sender<Option<WireCipher>>) {
        *self.crypt_ack.lock() = Some(ack);
    }

    pub fn take_crypt_ack(&self) -> Option<oneshot::Sender<Option<WireCipher>>> {
        self.crypt_ack.lock().take()
    }

    // Statistics

    pub fn packets_in(&self) -> u64 {
        self.packets_in.load(Ordering::Relaxed)
    }

    pub fn packets_out(&self) -> u64 {
        self.packets_out.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_duration(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}
