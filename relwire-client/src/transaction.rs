//! Transactions.

use crate::blob::Blob;
use crate::error::ClientError;
use crate::port::Port;
use crate::proxy::{query_info, Handle};
use bytes::Bytes;
use relwire_protocol::packet::{ObjectRef, Prepare2, StartTransaction};
use relwire_protocol::{InfoResponse, Packet, ParamBlock};
use std::sync::Arc;

/// A transaction started on an attachment.
///
/// Commit and rollback release the handle; the retaining variants keep it.
#[derive(Debug)]
pub struct Transaction {
    port: Arc<Port>,
    handle: Handle,
    attachment: u32,
}

impl Transaction {
    pub(crate) fn start(port: &Arc<Port>, attachment: u32, tpb: &ParamBlock) -> Result<Transaction, ClientError> {
        let id = port
            .call(Packet::Transaction(StartTransaction {
                attachment,
                tpb: tpb.to_bytes().map_err(ClientError::Message)?,
            }))?
            .object;
        tracing::debug!("Transaction {} started on attachment {}", id, attachment);
        Ok(Transaction {
            port: port.clone(),
            handle: Handle::new("transaction", id),
            attachment,
        })
    }

    pub fn id(&self) -> Result<u32, ClientError> {
        self.handle.get()
    }

    pub fn attachment_id(&self) -> u32 {
        self.attachment
    }

    pub fn port(&self) -> &Arc<Port> {
        &self.port
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_released()
    }

    fn finish(&mut self, packet: fn(ObjectRef) -> Packet) -> Result<(), ClientError> {
        let id = self.handle.get()?;
        self.port.call(packet(ObjectRef::new(id)))?;
        self.handle.clear();
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), ClientError> {
        self.finish(Packet::Commit)
    }

    pub fn rollback(&mut self) -> Result<(), ClientError> {
        self.finish(Packet::Rollback)
    }

    pub fn commit_retaining(&self) -> Result<(), ClientError> {
        self.port
            .call(Packet::CommitRetaining(ObjectRef::new(self.id()?)))
            .map(|_| ())
    }

    pub fn rollback_retaining(&self) -> Result<(), ClientError> {
        self.port
            .call(Packet::RollbackRetaining(ObjectRef::new(self.id()?)))
            .map(|_| ())
    }

    /// First phase of a two-phase commit, optionally with a recovery message.
    pub fn prepare(&self, message: Option<&[u8]>) -> Result<(), ClientError> {
        let id = self.id()?;
        let packet = match message {
            Some(message) => Packet::Prepare2(Prepare2 {
                transaction: id,
                message: Bytes::copy_from_slice(message),
            }),
            None => Packet::Prepare(ObjectRef::new(id)),
        };
        self.port.call(packet).map(|_| ())
    }

    pub fn info(&self, items: &[u8]) -> Result<InfoResponse, ClientError> {
        query_info(&self.port, self.id()?, items, Packet::InfoTransaction)
    }

    /// Creates a blob for writing.
    pub fn create_blob(&self, bpb: Option<&ParamBlock>) -> Result<Blob, ClientError> {
        Blob::create(&self.port, self.id()?, bpb)
    }

    /// Opens an existing blob for reading.
    pub fn open_blob(&self, blob_id: u64, bpb: Option<&ParamBlock>) -> Result<Blob, ClientError> {
        Blob::open(&self.port, self.id()?, blob_id, bpb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::tests::Script;
    use relwire_protocol::packet::{ptype, Response};
    use relwire_protocol::status::codes;
    use relwire_protocol::StatusVector;

    fn started(script: &Script) -> Transaction {
        let port = script.port(ptype::SYNC);
        script.reply(Packet::Response(Response::with_object(2)));
        Transaction::start(&port, 1, &ParamBlock::new()).unwrap()
    }

    #[test]
    fn test_commit_releases() {
        let script = Script::new();
        let mut txn = started(&script);
        script.reply(Packet::Response(Response::ok()));
        txn.commit().unwrap();
        assert!(!txn.is_active());
        assert!(matches!(txn.commit(), Err(ClientError::Released("transaction"))));
    }

    #[test]
    fn test_failed_commit_keeps_handle() {
        let script = Script::new();
        let mut txn = started(&script);
        script.reply(Packet::Response(Response::error(StatusVector::error(
            codes::TRANSACTION_STATE,
        ))));
        let err = txn.commit().unwrap_err();
        assert_eq!(err.gds_code(), Some(codes::TRANSACTION_STATE));
        assert!(txn.is_active());
    }

    #[test]
    fn test_prepare_with_message() {
        let script = Script::new();
        let txn = started(&script);
        script.clear_sent();
        script.reply(Packet::Response(Response::ok()));
        txn.prepare(Some(b"recovery")).unwrap();
        assert_eq!(
            script.sent(),
            vec![Packet::Prepare2(Prepare2 {
                transaction: 2,
                message: Bytes::from_static(b"recovery"),
            })]
        );
    }
}
