//! Event subscriptions and the aux channel that delivers them.
//!
//! A subscription fires at most once. Delivery on the aux thread and an
//! explicit cancel race for the same slot; whichever claims it first wins
//! and the other becomes a no-op.

use crate::connection::{TcpTransport, Transport};
use crate::error::ClientError;
use crate::port::{expect_response, Port};
use parking_lot::Mutex;
use relwire_protocol::packet::{AuxConnect, CancelEvents, ChannelKind, ConnectRequest, EventCount, QueEvents};
use relwire_protocol::{Decoder, Encoder, HandleTable, ObjectKind, Packet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Invoked once with the counts reported by the server.
pub type EventCallback = Box<dyn FnOnce(&[EventCount]) + Send>;

pub(crate) struct EventSlot {
    claimed: AtomicBool,
    fired: AtomicBool,
    callback: Mutex<Option<EventCallback>>,
}

impl EventSlot {
    fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }
}

/// Live subscriptions of one port, keyed by local id.
pub(crate) struct EventRegistry {
    slots: Mutex<HandleTable<Arc<EventSlot>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HandleTable::new(ObjectKind::Event)),
        }
    }

    fn register(&self, callback: EventCallback) -> Result<(u32, Arc<EventSlot>), ClientError> {
        let slot = Arc::new(EventSlot {
            claimed: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
        });
        let id = self
            .slots
            .lock()
            .allocate(slot.clone())
            .map_err(|e| ClientError::usage(e.to_string()))?;
        Ok((id, slot))
    }

    fn release(&self, local_id: u32) {
        let _ = self.slots.lock().release(local_id);
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Delivers one event notification.
    fn fire(&self, local_id: u32, counts: &[EventCount]) {
        let slot = match self.slots.lock().get(local_id) {
            Ok(slot) => slot.clone(),
            Err(_) => {
                tracing::debug!("Event for unknown subscription {}", local_id);
                return;
            }
        };
        if !slot.claim() {
            tracing::debug!("Subscription {} was cancelled first", local_id);
            return;
        }
        self.release(local_id);
        slot.fired.store(true, Ordering::Release);
        let callback = slot.callback.lock().take();
        if let Some(callback) = callback {
            callback(counts);
        }
    }
}

/// Second connection used for event delivery and out-of-band cancel.
pub(crate) struct AuxChannel {
    writer: Box<dyn Transport>,
    thread: Option<JoinHandle<()>>,
}

impl AuxChannel {
    pub fn send(&mut self, packet: &Packet) -> Result<(), ClientError> {
        let frame = Encoder::encode_plain(packet).map_err(ClientError::Message)?;
        self.writer.send(&frame).map_err(ClientError::from_io)
    }

    pub fn close(mut self) {
        if let Err(e) = self.writer.shutdown() {
            tracing::debug!("aux shutdown: {}", e);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Aux channel thread panicked");
            }
        }
    }
}

fn read_one(reader: &mut dyn Transport, decoder: &mut Decoder) -> Result<Packet, ClientError> {
    let mut buf = [0u8; 512];
    loop {
        if let Some(packet) = decoder.decode_packet()? {
            return Ok(packet);
        }
        let n = reader.receive(&mut buf).map_err(ClientError::from_io)?;
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        decoder.extend(&buf[..n]);
    }
}

fn aux_loop(mut reader: TcpTransport, mut decoder: Decoder, registry: Arc<EventRegistry>) {
    loop {
        match read_one(&mut reader, &mut decoder) {
            Ok(Packet::Event(event)) => registry.fire(event.local_id, &event.events),
            Ok(Packet::Response(r)) if r.status.is_error() => {
                tracing::warn!("Aux channel error: {}", r.status)
            }
            Ok(other) => tracing::debug!("Aux channel: ignoring {:?}", other.opcode()),
            Err(ClientError::ConnectionClosed) => break,
            Err(e) => {
                tracing::debug!("Aux channel stopped: {}", e);
                break;
            }
        }
    }
}

impl Port {
    /// Opens the aux channel if it is not open yet.
    pub(crate) fn ensure_aux(&self, attachment: u32) -> Result<(), ClientError> {
        if self.aux.lock().is_some() {
            return Ok(());
        }
        let token = self
            .call(Packet::ConnectRequest(ConnectRequest {
                kind: ChannelKind::Async,
                attachment,
            }))?
            .blob_id;

        let config = self.config();
        let transport = TcpTransport::connect(config.addr, config.connect_timeout)
            .map_err(ClientError::from_io)?;
        transport.set_read_timeout(config.request_timeout.filter(|t| !t.is_zero()))?;
        let (mut reader, mut writer) = transport.split()?;
        let hello = Encoder::encode_plain(&Packet::AuxConnect(AuxConnect { token }))
            .map_err(ClientError::Message)?;
        writer.send(&hello).map_err(ClientError::from_io)?;
        let mut decoder = Decoder::new();
        expect_response(read_one(&mut reader, &mut decoder)?)?;
        // Events may be far apart.
        reader.set_read_timeout(None)?;

        let registry = self.events.clone();
        let thread = std::thread::Builder::new()
            .name("relwire-aux".to_string())
            .spawn(move || aux_loop(reader, decoder, registry))?;
        tracing::debug!("Aux channel open to {}", config.addr);

        let mut aux = self.aux.lock();
        if let Some(previous) = aux.replace(AuxChannel {
            writer: Box::new(writer),
            thread: Some(thread),
        }) {
            previous.close();
        }
        Ok(())
    }
}

/// A queued event subscription.
pub struct Events {
    port: Arc<Port>,
    attachment: u32,
    local_id: u32,
    slot: Arc<EventSlot>,
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Events")
            .field("attachment", &self.attachment)
            .field("local_id", &self.local_id)
            .field("fired", &self.is_fired())
            .finish()
    }
}

impl Events {
    pub(crate) fn queue(
        port: &Arc<Port>,
        attachment: u32,
        events: Vec<EventCount>,
        callback: EventCallback,
    ) -> Result<Events, ClientError> {
        if events.is_empty() {
            return Err(ClientError::usage("no event names given"));
        }
        port.ensure_aux(attachment)?;
        let (local_id, slot) = port.events.register(callback)?;
        let queued = port.call(Packet::QueEvents(QueEvents {
            attachment,
            events,
            local_id,
        }));
        if let Err(e) = queued {
            if slot.claim() {
                port.events.release(local_id);
            }
            return Err(e);
        }
        Ok(Events {
            port: port.clone(),
            attachment,
            local_id,
            slot,
        })
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// True once the callback has been delivered.
    pub fn is_fired(&self) -> bool {
        self.slot.fired.load(Ordering::Acquire)
    }

    /// Withdraws the subscription. Returns false if it had already fired
    /// or been cancelled.
    pub fn cancel(&self) -> Result<bool, ClientError> {
        if !self.slot.claim() {
            return Ok(false);
        }
        self.port.events.release(self.local_id);
        self.slot.callback.lock().take();
        self.port.defer(Packet::CancelEvents(CancelEvents {
            attachment: self.attachment,
            local_id: self.local_id,
        }))?;
        Ok(true)
    }
}
