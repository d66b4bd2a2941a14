//! Attachments, transactions, blobs, compiled requests and services.

use super::{collect_info, object_reply, ok_reply, Dispatcher};
use crate::error::ServerError;
use crate::port::{
    AttachmentEntry, BlobEntry, Inbound, Port, PortState, RequestEntry, ServiceEntry,
    TransactionEntry,
};
use bytes::{BufMut, Bytes, BytesMut};
use relwire_engine::{AttachParams, EngineError, EngineTransaction};
use relwire_protocol::info::items;
use relwire_protocol::packet::{
    AttachDb, AuthData, BlobData, Compile, CreateBlob, GetSegment, InfoQuery, OpenBlob,
    segment_state, RequestMessage, Response, Seek, ServiceInfo, ServiceStart, StartTransaction,
};
use relwire_protocol::pblock::dpb;
use relwire_protocol::{InfoWriter, Packet, ParamBlock};
use std::sync::Arc;

impl Dispatcher {
    fn transaction(
        state: &PortState,
        id: u32,
    ) -> Result<(Arc<dyn EngineTransaction>, u32), ServerError> {
        let entry = state.handles.transactions.get(id)?;
        Ok((entry.engine.clone(), entry.attachment))
    }

    /// Asks the client for a database key and waits for the answer.
    fn request_crypt_key(&self, port: &Arc<Port>, database: &str) -> Result<Bytes, ServerError> {
        tracing::debug!("[{}] asking client for the key of {}", port.id, database);
        port.send(Packet::CryptKeyCallback(AuthData {
            data: Bytes::copy_from_slice(database.as_bytes()),
        }))?;
        match port.wait_inbound(self.config.crypt.key_callback_timeout()) {
            Some(Inbound::Packet(Packet::CryptKeyCallback(reply))) if !reply.data.is_empty() => {
                Ok(reply.data)
            }
            Some(Inbound::Packet(Packet::CryptKeyCallback(_))) | None => {
                Err(EngineError::KeyRequired {
                    name: database.to_string(),
                }
                .into())
            }
            Some(Inbound::Packet(other)) => Err(ServerError::UnexpectedPacket(other.opcode())),
            Some(Inbound::Malformed(e)) => Err(e.into()),
            Some(Inbound::Closed) => Err(ServerError::Broken),
        }
    }

    pub(super) fn attach(
        &self,
        port: &Arc<Port>,
        state: &mut PortState,
        req: AttachDb,
        create: bool,
    ) -> Result<Option<Packet>, ServerError> {
        let block = ParamBlock::parse(&req.dpb)?;
        let mut params = AttachParams {
            user: state.user.clone(),
            crypt_key: block.get(dpb::CRYPT_KEY).cloned(),
            dpb: block,
        };
        if !create && params.crypt_key.is_none() && self.engine.requires_key(&req.database) {
            params.crypt_key = Some(self.request_crypt_key(port, &req.database)?);
        }

        let attachment = if create {
            self.engine.create(&req.database, &params)?
        } else {
            self.engine.attach(&req.database, &params)?
        };
        let id = match state.handles.attachments.allocate(AttachmentEntry {
            engine: attachment.clone(),
            database: req.database.clone(),
        }) {
            Ok(id) => id,
            Err(e) => {
                let _ = attachment.detach();
                return Err(e.into());
            }
        };
        tracing::info!(
            "[{}] {} {} {} as attachment {}",
            port.id,
            state.user,
            if create { "created" } else { "attached" },
            req.database,
            id
        );
        Ok(object_reply(id))
    }

    pub(super) fn detach(
        &self,
        state: &mut PortState,
        id: u32,
        drop_database: bool,
    ) -> Result<Option<Packet>, ServerError> {
        let engine = state.handles.attachments.get(id)?.engine.clone();
        state.handles.release_owned(Some(id));
        if drop_database {
            engine.drop_database()?;
        } else {
            engine.detach()?;
        }
        let entry = state.handles.attachments.release(id)?;
        tracing::debug!("attachment {} on {} released", id, entry.database);
        Ok(ok_reply())
    }

    pub(super) fn start_transaction(
        &self,
        state: &mut PortState,
        req: StartTransaction,
    ) -> Result<Option<Packet>, ServerError> {
        let attachment = state.handles.attachments.get(req.attachment)?.engine.clone();
        let tpb = ParamBlock::parse(&req.tpb)?;
        let txn = attachment.start_transaction(&tpb)?;
        match state.handles.transactions.allocate(TransactionEntry {
            engine: txn.clone(),
            attachment: req.attachment,
        }) {
            Ok(id) => Ok(object_reply(id)),
            Err(e) => {
                let _ = txn.rollback();
                Err(e.into())
            }
        }
    }

    pub(super) fn end_transaction(
        &self,
        state: &mut PortState,
        id: u32,
        commit: bool,
    ) -> Result<Option<Packet>, ServerError> {
        let (txn, _) = Self::transaction(state, id)?;
        if commit {
            txn.commit()?;
        } else {
            txn.rollback()?;
        }
        state.handles.release_transaction_objects(id);
        state.handles.transactions.release(id)?;
        Ok(ok_reply())
    }

    pub(super) fn retain_transaction(
        &self,
        state: &mut PortState,
        id: u32,
        commit: bool,
    ) -> Result<Option<Packet>, ServerError> {
        let (txn, _) = Self::transaction(state, id)?;
        if commit {
            txn.commit_retaining()?;
        } else {
            txn.rollback_retaining()?;
        }
        Ok(ok_reply())
    }

    pub(super) fn prepare_transaction(
        &self,
        state: &mut PortState,
        id: u32,
        message: &[u8],
    ) -> Result<Option<Packet>, ServerError> {
        let (txn, _) = Self::transaction(state, id)?;
        txn.prepare(message)?;
        Ok(ok_reply())
    }

    // Blobs

    fn allocate_blob(
        state: &mut PortState,
        engine: Arc<dyn relwire_engine::EngineBlob>,
        attachment: u32,
        transaction: u32,
        created: bool,
    ) -> Result<u32, ServerError> {
        match state.handles.blobs.allocate(BlobEntry {
            engine: engine.clone(),
            attachment,
            transaction,
            created,
        }) {
            Ok(id) => Ok(id),
            Err(e) => {
                let _ = if created {
                    engine.cancel()
                } else {
                    engine.close()
                };
                Err(e.into())
            }
        }
    }

    pub(super) fn open_blob(
        &self,
        state: &mut PortState,
        req: OpenBlob,
    ) -> Result<Option<Packet>, ServerError> {
        let (txn, attachment) = Self::transaction(state, req.transaction)?;
        let owner = state.handles.attachments.get(attachment)?.engine.clone();
        let bpb = ParamBlock::parse(&req.bpb)?;
        let blob = owner.open_blob(&txn, req.blob_id, &bpb)?;
        let id = Self::allocate_blob(state, blob, attachment, req.transaction, false)?;
        Ok(Some(Packet::Response(Response {
            object: id,
            blob_id: req.blob_id,
            ..Response::default()
        })))
    }

    pub(super) fn create_blob(
        &self,
        state: &mut PortState,
        req: CreateBlob,
    ) -> Result<Option<Packet>, ServerError> {
        let (txn, attachment) = Self::transaction(state, req.transaction)?;
        let owner = state.handles.attachments.get(attachment)?.engine.clone();
        let bpb = ParamBlock::parse(&req.bpb)?;
        let blob = owner.create_blob(&txn, &bpb)?;
        let blob_id = blob.id();
        let id = Self::allocate_blob(state, blob, attachment, req.transaction, true)?;
        Ok(Some(Packet::Response(Response {
            object: id,
            blob_id,
            ..Response::default()
        })))
    }

    /// Fills the caller's buffer with `len:u16, data` segments.
    pub(super) fn get_segment(
        &self,
        state: &mut PortState,
        req: GetSegment,
    ) -> Result<Option<Packet>, ServerError> {
        let blob = state.handles.blobs.get(req.blob)?.engine.clone();
        let mut buf = BytesMut::new();
        let mut remaining = req.length.min(u32::from(u16::MAX) + 2) as usize;
        let mut outcome = segment_state::COMPLETE;
        while remaining > 2 {
            match blob.get_segment(remaining - 2) {
                Ok(segment) => {
                    buf.put_u16(segment.data.len() as u16);
                    buf.put_slice(&segment.data);
                    remaining -= 2 + segment.data.len();
                    if !segment.complete {
                        outcome = segment_state::PARTIAL;
                        break;
                    }
                }
                Err(EngineError::BlobEof) => {
                    outcome = segment_state::EOF;
                    break;
                }
                Err(e) if buf.is_empty() => return Err(e.into()),
                Err(e) => {
                    tracing::debug!("blob {} read stopped early: {}", req.blob, e);
                    break;
                }
            }
        }
        Ok(Some(Packet::Response(Response {
            object: outcome,
            data: buf.freeze(),
            ..Response::default()
        })))
    }

    pub(super) fn put_segment(
        &self,
        state: &mut PortState,
        req: BlobData,
    ) -> Result<Option<Packet>, ServerError> {
        let blob = state.handles.blobs.get(req.blob)?.engine.clone();
        blob.put_segment(&req.data)?;
        Ok(ok_reply())
    }

    /// Writes several `len:u16, data` segments sent in one packet.
    pub(super) fn batch_segments(
        &self,
        state: &mut PortState,
        req: BlobData,
    ) -> Result<Option<Packet>, ServerError> {
        let blob = state.handles.blobs.get(req.blob)?.engine.clone();
        let mut rest: &[u8] = &req.data;
        while !rest.is_empty() {
            if rest.len() < 2 {
                return Err(ServerError::invalid("truncated segment header"));
            }
            let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            let Some(data) = rest.get(2..2 + len) else {
                return Err(ServerError::invalid(format!(
                    "segment of {} bytes exceeds the packet",
                    len
                )));
            };
            blob.put_segment(data)?;
            rest = &rest[2 + len..];
        }
        Ok(ok_reply())
    }

    pub(super) fn seek_blob(
        &self,
        state: &mut PortState,
        req: Seek,
    ) -> Result<Option<Packet>, ServerError> {
        let blob = state.handles.blobs.get(req.blob)?.engine.clone();
        let position = blob.seek(req.mode, req.offset)?;
        Ok(Some(Packet::Response(Response {
            blob_id: position,
            ..Response::default()
        })))
    }

    pub(super) fn finish_blob(
        &self,
        state: &mut PortState,
        id: u32,
        cancel: bool,
    ) -> Result<Option<Packet>, ServerError> {
        let blob = state.handles.blobs.get(id)?.engine.clone();
        if cancel {
            blob.cancel()?;
        } else {
            blob.close()?;
        }
        state.handles.blobs.release(id)?;
        Ok(ok_reply())
    }

    // Compiled requests

    pub(super) fn compile(
        &self,
        state: &mut PortState,
        req: Compile,
    ) -> Result<Option<Packet>, ServerError> {
        let attachment = state.handles.attachments.get(req.attachment)?.engine.clone();
        let request = attachment.compile_request(&req.blr)?;
        let id = state.handles.requests.allocate(RequestEntry {
            engine: request,
            attachment: req.attachment,
        })?;
        Ok(object_reply(id))
    }

    pub(super) fn start_request(
        &self,
        state: &mut PortState,
        req: RequestMessage,
        send: bool,
    ) -> Result<Option<Packet>, ServerError> {
        let request = state.handles.requests.get(req.request)?.engine.clone();
        let (txn, _) = Self::transaction(state, req.transaction)?;
        request.start(&txn, req.level)?;
        if send {
            request.send(req.msg_type, &req.message)?;
        }
        Ok(ok_reply())
    }

    pub(super) fn send_request(
        &self,
        state: &mut PortState,
        req: RequestMessage,
    ) -> Result<Option<Packet>, ServerError> {
        let request = state.handles.requests.get(req.request)?.engine.clone();
        request.send(req.msg_type, &req.message)?;
        Ok(ok_reply())
    }

    pub(super) fn receive_request(
        &self,
        state: &mut PortState,
        req: RequestMessage,
    ) -> Result<Option<Packet>, ServerError> {
        let request = state.handles.requests.get(req.request)?.engine.clone();
        let data = request.receive(req.msg_type)?;
        Ok(Some(Packet::Response(Response::with_data(data))))
    }

    pub(super) fn unwind_request(
        &self,
        state: &mut PortState,
        req: RequestMessage,
    ) -> Result<Option<Packet>, ServerError> {
        let request = state.handles.requests.get(req.request)?.engine.clone();
        request.unwind(req.level)?;
        Ok(ok_reply())
    }

    pub(super) fn release_request(
        &self,
        state: &mut PortState,
        id: u32,
    ) -> Result<Option<Packet>, ServerError> {
        state.handles.requests.release(id)?;
        Ok(ok_reply())
    }

    // Service manager

    pub(super) fn service_attach(
        &self,
        state: &mut PortState,
        req: AttachDb,
    ) -> Result<Option<Packet>, ServerError> {
        let params = AttachParams {
            user: state.user.clone(),
            dpb: ParamBlock::parse(&req.dpb)?,
            crypt_key: None,
        };
        let service = self.engine.service_attach(&req.database, &params)?;
        let id = match state.handles.services.allocate(ServiceEntry {
            engine: service.clone(),
        }) {
            Ok(id) => id,
            Err(e) => {
                let _ = service.detach();
                return Err(e.into());
            }
        };
        Ok(object_reply(id))
    }

    pub(super) fn service_detach(
        &self,
        state: &mut PortState,
        id: u32,
    ) -> Result<Option<Packet>, ServerError> {
        let service = state.handles.services.get(id)?.engine.clone();
        service.detach()?;
        state.handles.services.release(id)?;
        Ok(ok_reply())
    }

    pub(super) fn service_start(
        &self,
        state: &mut PortState,
        req: ServiceStart,
    ) -> Result<Option<Packet>, ServerError> {
        let service = state.handles.services.get(req.service)?.engine.clone();
        service.start(&ParamBlock::parse(&req.spb)?)?;
        Ok(ok_reply())
    }

    pub(super) fn service_info(
        &self,
        state: &mut PortState,
        req: ServiceInfo,
    ) -> Result<Option<Packet>, ServerError> {
        let service = state.handles.services.get(req.service)?.engine.clone();
        let mut writer = InfoWriter::new(req.buffer_length);
        service.query(&req.recv_items, &mut writer)?;
        Ok(Some(Packet::Response(Response::with_data(writer.finish()))))
    }

    // Info

    pub(super) fn info_database(
        &self,
        state: &mut PortState,
        req: InfoQuery,
    ) -> Result<Option<Packet>, ServerError> {
        let attachment = state.handles.attachments.get(req.object)?.engine.clone();
        let protocol_version = state.protocol_version;
        let encrypted = state.encrypted;
        let data = collect_info(&req.items, req.buffer_length, |item, writer| match item {
            items::DB_PROTOCOL_VERSION => {
                writer.push_u32(item, protocol_version);
                Ok(true)
            }
            items::DB_WIRE_CRYPT => {
                writer.push(item, &[u8::from(encrypted)]);
                Ok(true)
            }
            _ => attachment.info(item, writer),
        })?;
        Ok(Some(Packet::Response(Response::with_data(data))))
    }

    pub(super) fn info_transaction(
        &self,
        state: &mut PortState,
        req: InfoQuery,
    ) -> Result<Option<Packet>, ServerError> {
        let (txn, _) = Self::transaction(state, req.object)?;
        let data = collect_info(&req.items, req.buffer_length, |item, w| txn.info(item, w))?;
        Ok(Some(Packet::Response(Response::with_data(data))))
    }

    pub(super) fn info_blob(
        &self,
        state: &mut PortState,
        req: InfoQuery,
    ) -> Result<Option<Packet>, ServerError> {
        let blob = state.handles.blobs.get(req.object)?.engine.clone();
        let data = collect_info(&req.items, req.buffer_length, |item, w| blob.info(item, w))?;
        Ok(Some(Packet::Response(Response::with_data(data))))
    }

    pub(super) fn info_request(
        &self,
        state: &mut PortState,
        req: InfoQuery,
    ) -> Result<Option<Packet>, ServerError> {
        let request = state.handles.requests.get(req.object)?.engine.clone();
        let data = collect_info(&req.items, req.buffer_length, |item, w| request.info(item, w))?;
        Ok(Some(Packet::Response(Response::with_data(data))))
    }
}
