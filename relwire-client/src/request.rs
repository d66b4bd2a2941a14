//! Compiled requests.

use crate::error::ClientError;
use crate::port::Port;
use crate::proxy::{query_info, same_port, Handle};
use crate::transaction::Transaction;
use bytes::Bytes;
use relwire_protocol::packet::{ObjectRef, RequestMessage};
use relwire_protocol::{InfoResponse, Packet};
use std::sync::Arc;

/// A request compiled on an attachment.
#[derive(Debug)]
pub struct Request {
    port: Arc<Port>,
    handle: Handle,
}

impl Request {
    pub(crate) fn new(port: &Arc<Port>, id: u32) -> Request {
        Request {
            port: port.clone(),
            handle: Handle::new("request", id),
        }
    }

    pub fn id(&self) -> Result<u32, ClientError> {
        self.handle.get()
    }

    fn message(&self, transaction: u32, level: u32, msg_type: u32, message: &[u8]) -> Result<RequestMessage, ClientError> {
        Ok(RequestMessage {
            request: self.handle.get()?,
            transaction,
            level,
            msg_type,
            message: Bytes::copy_from_slice(message),
        })
    }

    fn transaction_id(&self, txn: &Transaction) -> Result<u32, ClientError> {
        same_port(&self.port, txn.port(), "transaction")?;
        txn.id()
    }

    pub fn start(&self, txn: &Transaction, level: u32) -> Result<(), ClientError> {
        let msg = self.message(self.transaction_id(txn)?, level, 0, &[])?;
        self.port.call(Packet::Start(msg)).map(|_| ())
    }

    /// Starts and sends the first message in one round trip.
    pub fn start_and_send(&self, txn: &Transaction, level: u32, msg_type: u32, message: &[u8]) -> Result<(), ClientError> {
        let msg = self.message(self.transaction_id(txn)?, level, msg_type, message)?;
        self.port.call(Packet::StartAndSend(msg)).map(|_| ())
    }

    pub fn send(&self, level: u32, msg_type: u32, message: &[u8]) -> Result<(), ClientError> {
        let msg = self.message(0, level, msg_type, message)?;
        self.port.call(Packet::Send(msg)).map(|_| ())
    }

    pub fn receive(&self, level: u32, msg_type: u32) -> Result<Bytes, ClientError> {
        let msg = self.message(0, level, msg_type, &[])?;
        Ok(self.port.call(Packet::Receive(msg))?.data)
    }

    pub fn unwind(&self, level: u32) -> Result<(), ClientError> {
        let msg = self.message(0, level, 0, &[])?;
        self.port.call(Packet::Unwind(msg)).map(|_| ())
    }

    pub fn info(&self, items: &[u8]) -> Result<InfoResponse, ClientError> {
        query_info(&self.port, self.handle.get()?, items, Packet::InfoRequest)
    }

    /// Releases the request. Deferred in lazy mode.
    pub fn release(&mut self) -> Result<(), ClientError> {
        let id = self.handle.get()?;
        self.handle.clear();
        self.port.defer(Packet::Release(ObjectRef::new(id)))
    }
}
