//! Batched execution.
//!
//! Row messages and blob stream data arrive without replies; a failure in
//! one of them is latched on the batch and reported by the next
//! `BatchExec`, which answers with a single completion state.

use super::{ok_reply, Dispatcher};
use crate::error::ServerError;
use crate::port::{BatchState, PendingBlob, Port, PortState};
use bytes::Bytes;
use relwire_engine::{EngineAttachment, EngineError, EngineTransaction};
use relwire_protocol::blobstream::{split_segments, BlobStreamParser};
use relwire_protocol::packet::{
    record_count, BatchBlobStream, BatchCompletionState, BatchCreate, BatchError, BatchExec,
    BatchMsg, BatchRegBlob, BatchSetBpb,
};
use relwire_protocol::pblock::{batch, bpb};
use relwire_protocol::status::codes;
use relwire_protocol::{MessageFormat, Packet, ParamBlock, ProtocolError, StatusVector, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const DEFAULT_BUFFER_BYTES: usize = 16 * 1024 * 1024;
const MAX_BUFFER_BYTES: usize = 256 * 1024 * 1024;
const DEFAULT_DETAILED_ERRORS: usize = 64;

fn no_batch(id: u32) -> ServerError {
    ServerError::Rejected(
        StatusVector::error(codes::BAD_BATCH_HANDLE)
            .with_str(format!("statement {} has no batch", id)),
    )
}

fn policy_error(reason: &str) -> ServerError {
    ServerError::Rejected(StatusVector::error(codes::BATCH_BLOB_POLICY).with_str(reason))
}

fn flag(params: &ParamBlock, tag: u8) -> bool {
    params.has(tag) && params.get_u32(tag) != Some(0)
}

/// Collected input of one execution, taken out of the batch.
struct Pending {
    messages: Vec<Bytes>,
    blobs: BTreeMap<u64, PendingBlob>,
    registered: HashMap<u64, u64>,
}

impl Dispatcher {
    fn batch_mut(state: &mut PortState, id: u32) -> Result<&mut BatchState, ServerError> {
        state
            .handles
            .statements
            .get_mut(id)?
            .batch
            .as_mut()
            .ok_or_else(|| no_batch(id))
    }

    /// Runs a reply-less batch operation, latching its failure.
    fn latching<F>(state: &mut PortState, statement: u32, op: &str, f: F) -> Option<Packet>
    where
        F: FnOnce(&mut BatchState) -> Result<(), ServerError>,
    {
        let id = Self::statement_id(state, statement);
        match Self::batch_mut(state, id) {
            Ok(entry) => {
                if let Err(e) = f(&mut *entry) {
                    tracing::debug!("{} on statement {} failed: {}", op, id, e);
                    entry.latch(e.status());
                }
            }
            Err(e) => tracing::warn!("{} on statement {} dropped: {}", op, id, e),
        }
        None
    }

    pub(super) fn batch_create(
        &self,
        state: &mut PortState,
        req: BatchCreate,
    ) -> Result<Option<Packet>, ServerError> {
        let id = Self::statement_id(state, req.statement);
        let (statement, _) = Self::prepared(state, id)?;
        let format = if req.format.is_empty() {
            statement.input_format()
        } else {
            MessageFormat::from_bytes(&req.format)?
        };
        let params = ParamBlock::parse(&req.parameters)?;
        let blob_policy = params.get_u32(batch::BLOB_POLICY).unwrap_or(batch::BLOB_NONE);
        if blob_policy > batch::BLOB_STREAM {
            return Err(ServerError::invalid(format!("unknown blob policy {}", blob_policy)));
        }
        if blob_policy == batch::BLOB_NONE && format.blob_fields().next().is_some() {
            return Err(policy_error("message has blob fields but blobs are disabled"));
        }
        let buffer_limit = params
            .get_u32(batch::BUFFER_BYTES_SIZE)
            .map_or(DEFAULT_BUFFER_BYTES, |n| n as usize)
            .clamp(format.aligned_length().max(1), MAX_BUFFER_BYTES);

        let created = BatchState {
            multi_error: flag(&params, batch::MULTI_ERROR),
            record_counts: flag(&params, batch::RECORD_COUNTS),
            blob_policy,
            detailed_errors: params
                .get_u32(batch::DETAILED_ERRORS)
                .map_or(DEFAULT_DETAILED_ERRORS, |n| n as usize),
            buffer_limit,
            format,
            messages: Vec::new(),
            buffered: 0,
            stream: BlobStreamParser::new(),
            blobs: BTreeMap::new(),
            registered: HashMap::new(),
            default_bpb: Bytes::new(),
            latched: None,
        };
        tracing::debug!(
            "statement {}: batch created (multi_error={}, blob_policy={}, limit={})",
            id,
            created.multi_error,
            blob_policy,
            buffer_limit
        );
        state.handles.statements.get_mut(id)?.batch = Some(created);
        Ok(ok_reply())
    }

    pub(super) fn batch_msg(
        &self,
        state: &mut PortState,
        req: BatchMsg,
    ) -> Result<Option<Packet>, ServerError> {
        Ok(Self::latching(state, req.statement, "BatchMsg", |entry| {
            let len = entry.format.aligned_length();
            let count = req.count as usize;
            if req.data.len() != count * len {
                return Err(ProtocolError::FormatMismatch(format!(
                    "{} messages of {} bytes sent as {} bytes",
                    count,
                    len,
                    req.data.len()
                ))
                .into());
            }
            if entry.buffered + req.data.len() > entry.buffer_limit {
                return Err(ServerError::Rejected(
                    StatusVector::error(codes::BATCH_TOO_BIG).with_number(entry.buffer_limit as i64),
                ));
            }
            entry.buffered += req.data.len();
            entry
                .messages
                .extend((0..count).map(|i| req.data.slice(i * len..(i + 1) * len)));
            Ok(())
        }))
    }

    pub(super) fn batch_blob_stream(
        &self,
        state: &mut PortState,
        req: BatchBlobStream,
    ) -> Result<Option<Packet>, ServerError> {
        Ok(Self::latching(state, req.statement, "BatchBlobStream", |entry| {
            if entry.blob_policy != batch::BLOB_STREAM {
                return Err(policy_error("blob streaming is not enabled"));
            }
            if entry.buffered + req.data.len() > entry.buffer_limit {
                return Err(ServerError::Rejected(
                    StatusVector::error(codes::BATCH_TOO_BIG).with_number(entry.buffer_limit as i64),
                ));
            }
            entry.buffered += req.data.len();
            entry.stream.extend(&req.data);
            while let Some(record) = entry.stream.next_record()? {
                let blob = entry.blobs.entry(record.id).or_insert_with(|| PendingBlob {
                    bpb: record.bpb.clone(),
                    chunks: Vec::new(),
                });
                if !record.payload.is_empty() {
                    blob.chunks.push(record.payload);
                }
            }
            Ok(())
        }))
    }

    pub(super) fn batch_reg_blob(
        &self,
        state: &mut PortState,
        req: BatchRegBlob,
    ) -> Result<Option<Packet>, ServerError> {
        Ok(Self::latching(state, req.statement, "BatchRegBlob", |entry| {
            if entry.blob_policy == batch::BLOB_NONE {
                return Err(policy_error("blobs are disabled for this batch"));
            }
            if entry.blobs.contains_key(&req.batch_id)
                || entry.registered.insert(req.batch_id, req.existing).is_some()
            {
                return Err(ServerError::Rejected(
                    StatusVector::error(codes::BATCH_BLOB_ID)
                        .with_str(format!("blob id {} is already in use", req.batch_id)),
                ));
            }
            Ok(())
        }))
    }

    pub(super) fn batch_set_bpb(
        &self,
        state: &mut PortState,
        req: BatchSetBpb,
    ) -> Result<Option<Packet>, ServerError> {
        Ok(Self::latching(state, req.statement, "BatchSetBpb", |entry| {
            ParamBlock::parse(&req.bpb)?;
            entry.default_bpb = req.bpb.clone();
            Ok(())
        }))
    }

    /// Creates the streamed blobs and returns batch id to engine id.
    fn materialize_blobs(
        attachment: &Arc<dyn EngineAttachment>,
        txn: &Arc<dyn EngineTransaction>,
        default_bpb: &Bytes,
        pending: &mut Pending,
    ) -> Result<HashMap<u64, u64>, ServerError> {
        let mut ids = std::mem::take(&mut pending.registered);
        for (local, blob) in std::mem::take(&mut pending.blobs) {
            let raw = if blob.bpb.is_empty() { default_bpb } else { &blob.bpb };
            let params = ParamBlock::parse(raw)?;
            let segmented = params.get_u32(bpb::TYPE) != Some(u32::from(bpb::TYPE_STREAM));
            let created = attachment.create_blob(txn, &params)?;
            let written = blob.chunks.iter().try_for_each(|chunk| -> Result<(), ServerError> {
                if segmented {
                    for segment in split_segments(chunk)? {
                        created.put_segment(&segment)?;
                    }
                } else {
                    created.put_segment(chunk)?;
                }
                Ok(())
            });
            if let Err(e) = written {
                let _ = created.cancel();
                return Err(e);
            }
            created.close()?;
            ids.insert(local, created.id());
        }
        Ok(ids)
    }

    /// Decodes a message and swaps batch blob ids for engine ids.
    fn bind_row(
        format: &MessageFormat,
        message: &[u8],
        policy: u32,
        blob_ids: &HashMap<u64, u64>,
    ) -> Result<Vec<Value>, StatusVector> {
        let mut row = format
            .decode_row(message)
            .map_err(|e| ServerError::from(e).status())?;
        if policy == batch::BLOB_ID_ENGINE {
            return Ok(row);
        }
        for idx in format.blob_fields() {
            if let Some(Value::Blob(local)) = row.get(idx) {
                let local = *local;
                match blob_ids.get(&local) {
                    Some(engine_id) => row[idx] = Value::Blob(*engine_id),
                    None => {
                        return Err(StatusVector::error(codes::BATCH_BLOB_ID)
                            .with_number(local as i64))
                    }
                }
            }
        }
        Ok(row)
    }

    pub(super) fn batch_exec(
        &self,
        port: &Arc<Port>,
        state: &mut PortState,
        req: BatchExec,
    ) -> Result<Option<Packet>, ServerError> {
        let id = Self::statement_id(state, req.statement);
        let (statement, attachment_id) = Self::prepared(state, id)?;
        let txn = Self::owned_transaction(state, req.transaction, attachment_id)?;
        let attachment = state.handles.attachments.get(attachment_id)?.engine.clone();

        let entry = Self::batch_mut(state, id)?;
        let latched = entry.latched.take();
        let incomplete = entry.stream.pending();
        let mut pending = Pending {
            messages: std::mem::take(&mut entry.messages),
            blobs: std::mem::take(&mut entry.blobs),
            registered: std::mem::take(&mut entry.registered),
        };
        entry.clear();
        let format = entry.format.clone();
        let default_bpb = entry.default_bpb.clone();
        let (multi_error, record_counts, policy, detailed) = (
            entry.multi_error,
            entry.record_counts,
            entry.blob_policy,
            entry.detailed_errors,
        );

        if let Some(status) = latched {
            return Err(ServerError::Rejected(status));
        }
        if incomplete > 0 {
            return Err(ServerError::invalid(format!(
                "blob stream ends inside a record ({} bytes left)",
                incomplete
            )));
        }

        let blob_ids = Self::materialize_blobs(&attachment, &txn, &default_bpb, &mut pending)?;
        let bound: Vec<Result<Vec<Value>, StatusVector>> = pending
            .messages
            .iter()
            .map(|m| Self::bind_row(&format, m, policy, &blob_ids))
            .collect();

        let results: Vec<Result<u64, StatusVector>> = if multi_error {
            let valid: Vec<Vec<Value>> = bound.iter().filter_map(|b| b.as_ref().ok().cloned()).collect();
            let mut executed = statement.execute_batch(&txn, &valid, &port.cancel)?.into_iter();
            bound
                .into_iter()
                .map(|b| match b {
                    Ok(_) => executed
                        .next()
                        .unwrap_or_else(|| Err(EngineError::Internal("missing batch result".into())))
                        .map_err(|e| e.status()),
                    Err(status) => Err(status),
                })
                .collect()
        } else {
            let mut results = Vec::with_capacity(bound.len());
            for b in bound {
                let result = match b {
                    Ok(row) => match statement.execute(&txn, &row, &port.cancel) {
                        Ok(outcome) => Ok(outcome.affected),
                        Err(EngineError::Cancelled) => return Err(EngineError::Cancelled.into()),
                        Err(e) => Err(e.status()),
                    },
                    Err(status) => Err(status),
                };
                let failed = result.is_err();
                results.push(result);
                if failed {
                    break;
                }
            }
            results
        };

        let mut completion = BatchCompletionState {
            statement: id,
            total: results.len() as u32,
            record_counts: Vec::new(),
            errors: Vec::new(),
            simple_errors: Vec::new(),
        };
        for (index, result) in results.into_iter().enumerate() {
            let index = index as u32;
            match result {
                Ok(count) => {
                    if record_counts {
                        completion
                            .record_counts
                            .push(i32::try_from(count).unwrap_or(i32::MAX));
                    }
                }
                Err(status) => {
                    if record_counts {
                        completion.record_counts.push(record_count::EXECUTE_FAILED);
                    }
                    if completion.errors.len() < detailed {
                        completion.errors.push(BatchError { index, status });
                    } else {
                        completion.simple_errors.push(index);
                    }
                }
            }
        }
        tracing::debug!(
            "statement {}: batch ran {} rows, {} failed",
            id,
            completion.total,
            completion.errors.len() + completion.simple_errors.len()
        );
        Ok(Some(Packet::BatchCompletionState(completion)))
    }

    pub(super) fn batch_cancel(
        &self,
        state: &mut PortState,
        statement: u32,
    ) -> Result<Option<Packet>, ServerError> {
        let id = Self::statement_id(state, statement);
        Self::batch_mut(state, id)?.clear();
        Ok(ok_reply())
    }

    pub(super) fn batch_release(
        &self,
        state: &mut PortState,
        statement: u32,
    ) -> Result<Option<Packet>, ServerError> {
        let id = Self::statement_id(state, statement);
        let entry = state.handles.statements.get_mut(id)?;
        if entry.batch.take().is_none() {
            return Err(no_batch(id));
        }
        Ok(ok_reply())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::Harness;
    use super::*;
    use bytes::{BufMut, BytesMut};
    use relwire_protocol::blobstream::BlobStreamWriter;
    use relwire_protocol::packet::{
        Execute, Fetch, FetchResponse, ObjectRef, PrepareStatement, GetSegment, OpenBlob,
    };
    use relwire_protocol::{Field, FieldType, Response};

    struct Fixture {
        h: Harness,
        t: u32,
        s: u32,
    }

    /// Table `items`, a transaction, and a statement prepared with `sql`.
    fn fixture(ddl: &str, sql: &str) -> Fixture {
        let mut h = Harness::new();
        h.login();
        let a = h.attach();
        let t = h.start(a);
        let s = h.ok(Packet::AllocateStatement(ObjectRef::new(a))).object;
        for text in [ddl, sql] {
            h.ok(Packet::PrepareStatement(PrepareStatement {
                transaction: t,
                statement: s,
                dialect: 3,
                sql: text.to_string(),
                items: Bytes::new(),
                buffer_length: 0,
            }));
            if text == ddl {
                h.ok(Packet::Execute(Execute {
                    statement: s,
                    transaction: t,
                    in_format: Bytes::new(),
                    in_message: Bytes::new(),
                    out_format: Bytes::new(),
                    cursor_flags: 0,
                }));
            }
        }
        Fixture { h, t, s }
    }

    fn create(f: &mut Fixture, params: ParamBlock) -> Response {
        f.h.response(Packet::BatchCreate(BatchCreate {
            statement: f.s,
            format: Bytes::new(),
            parameters: params.to_bytes().unwrap(),
        }))
    }

    fn send_rows(f: &mut Fixture, format: &MessageFormat, rows: &[Vec<Value>]) {
        let mut data = BytesMut::new();
        for row in rows {
            data.put_slice(&format.encode_row(row).unwrap());
        }
        let frames = f.h.call(Packet::BatchMsg(BatchMsg {
            statement: f.s,
            count: rows.len() as u32,
            data: data.freeze(),
        }));
        assert!(frames.is_empty());
    }

    fn exec(f: &mut Fixture) -> BatchCompletionState {
        match f.h.call(Packet::BatchExec(BatchExec {
            statement: f.s,
            transaction: f.t,
        }))
        .pop()
        {
            Some(Packet::BatchCompletionState(c)) => c,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn id_format() -> MessageFormat {
        MessageFormat::new(vec![Field::new("ID", FieldType::Integer)])
    }

    fn ids(range: std::ops::RangeInclusive<i32>) -> Vec<Vec<Value>> {
        range.map(|i| vec![Value::Integer(i)]).collect()
    }

    #[test]
    fn test_multi_error_reports_failed_rows() {
        let mut f = fixture(
            "CREATE TABLE items (id INTEGER PRIMARY KEY)",
            "INSERT INTO items (id) VALUES (?)",
        );
        let params = ParamBlock::new()
            .with_u32(batch::MULTI_ERROR, 1)
            .with_u32(batch::RECORD_COUNTS, 1);
        assert!(!create(&mut f, params).status.is_error());

        let mut rows = ids(1..=5);
        rows[3] = vec![Value::Integer(2)];
        send_rows(&mut f, &id_format(), &rows);
        let done = exec(&mut f);
        assert_eq!(done.total, 5);
        assert_eq!(done.record_counts, vec![1, 1, 1, record_count::EXECUTE_FAILED, 1]);
        assert_eq!(done.errors.len(), 1);
        assert_eq!(done.errors[0].index, 3);
        assert_eq!(
            done.errors[0].status.primary_code(),
            Some(codes::UNIQUE_KEY_VIOLATION)
        );
    }

    #[test]
    fn test_stops_at_first_error_without_multi_error() {
        let mut f = fixture(
            "CREATE TABLE items (id INTEGER PRIMARY KEY)",
            "INSERT INTO items (id) VALUES (?)",
        );
        create(&mut f, ParamBlock::new());
        let mut rows = ids(1..=5);
        rows[1] = vec![Value::Integer(1)];
        send_rows(&mut f, &id_format(), &rows);
        let done = exec(&mut f);
        assert_eq!(done.total, 2);
        assert!(done.record_counts.is_empty());
        assert_eq!(done.errors[0].index, 1);
    }

    #[test]
    fn test_detailed_error_limit() {
        let mut f = fixture(
            "CREATE TABLE items (id INTEGER PRIMARY KEY)",
            "INSERT INTO items (id) VALUES (?)",
        );
        let params = ParamBlock::new()
            .with_u32(batch::MULTI_ERROR, 1)
            .with_u32(batch::DETAILED_ERRORS, 1);
        create(&mut f, params);
        send_rows(&mut f, &id_format(), &vec![vec![Value::Integer(7)]; 4]);
        let done = exec(&mut f);
        assert_eq!(done.total, 4);
        assert_eq!(done.errors.len(), 1);
        assert_eq!(done.simple_errors, vec![2, 3]);
    }

    #[test]
    fn test_batch_is_reusable_after_exec() {
        let mut f = fixture(
            "CREATE TABLE items (id INTEGER PRIMARY KEY)",
            "INSERT INTO items (id) VALUES (?)",
        );
        create(&mut f, ParamBlock::new());
        send_rows(&mut f, &id_format(), &ids(1..=2));
        assert_eq!(exec(&mut f).total, 2);
        send_rows(&mut f, &id_format(), &ids(3..=3));
        assert_eq!(exec(&mut f).total, 1);
        // cancel drops collected rows
        send_rows(&mut f, &id_format(), &ids(4..=9));
        f.h.ok(Packet::BatchCancel(ObjectRef::new(f.s)));
        assert_eq!(exec(&mut f).total, 0);
    }

    #[test]
    fn test_bad_message_is_latched() {
        let mut f = fixture(
            "CREATE TABLE items (id INTEGER PRIMARY KEY)",
            "INSERT INTO items (id) VALUES (?)",
        );
        create(&mut f, ParamBlock::new());
        let frames = f.h.call(Packet::BatchMsg(BatchMsg {
            statement: f.s,
            count: 2,
            data: Bytes::from_static(&[0u8; 3]),
        }));
        assert!(frames.is_empty());
        let r = f.h.response(Packet::BatchExec(BatchExec {
            statement: f.s,
            transaction: f.t,
        }));
        assert_eq!(r.status.primary_code(), Some(codes::MESSAGE_FORMAT));
        // the latch is cleared by the failed exec
        assert_eq!(exec(&mut f).total, 0);
    }

    #[test]
    fn test_blob_fields_need_a_policy() {
        let mut f = fixture(
            "CREATE TABLE docs (id INTEGER, body BLOB)",
            "INSERT INTO docs (id, body) VALUES (?, ?)",
        );
        let r = create(&mut f, ParamBlock::new());
        assert_eq!(r.status.primary_code(), Some(codes::BATCH_BLOB_POLICY));
    }

    #[test]
    fn test_release_then_exec() {
        let mut f = fixture(
            "CREATE TABLE items (id INTEGER PRIMARY KEY)",
            "INSERT INTO items (id) VALUES (?)",
        );
        create(&mut f, ParamBlock::new());
        f.h.ok(Packet::BatchRelease(ObjectRef::new(f.s)));
        let r = f.h.response(Packet::BatchExec(BatchExec {
            statement: f.s,
            transaction: f.t,
        }));
        assert_eq!(r.status.primary_code(), Some(codes::BAD_BATCH_HANDLE));
    }

    #[test]
    fn test_streamed_blobs() {
        let mut f = fixture(
            "CREATE TABLE docs (id INTEGER, body BLOB)",
            "INSERT INTO docs (id, body) VALUES (?, ?)",
        );
        let params = ParamBlock::new()
            .with_u32(batch::MULTI_ERROR, 1)
            .with_u32(batch::BLOB_POLICY, batch::BLOB_STREAM);
        assert!(!create(&mut f, params).status.is_error());

        let mut writer = BlobStreamWriter::new(64);
        writer.start_blob(10, &[], true).unwrap();
        writer.append(b"first").unwrap();
        writer.append(b"second").unwrap();
        writer.finish_blob();
        writer.start_blob(11, &[], true).unwrap();
        writer.append(b"other").unwrap();
        writer.finish_blob();
        for chunk in writer.flush() {
            let frames = f.h.call(Packet::BatchBlobStream(BatchBlobStream {
                statement: f.s,
                data: chunk,
            }));
            assert!(frames.is_empty());
        }

        let format = MessageFormat::new(vec![
            Field::new("ID", FieldType::Integer),
            Field::new("BODY", FieldType::Blob),
        ]);
        send_rows(
            &mut f,
            &format,
            &[
                vec![Value::Integer(1), Value::Blob(10)],
                vec![Value::Integer(2), Value::Blob(99)],
                vec![Value::Integer(3), Value::Blob(11)],
            ],
        );
        let done = exec(&mut f);
        assert_eq!(done.total, 3);
        assert_eq!(done.errors.len(), 1);
        assert_eq!(done.errors[0].index, 1);
        assert_eq!(done.errors[0].status.primary_code(), Some(codes::BATCH_BLOB_ID));
    }

    #[test]
    fn test_stream_rejected_without_stream_policy() {
        let mut f = fixture(
            "CREATE TABLE docs (id INTEGER, body BLOB)",
            "INSERT INTO docs (id, body) VALUES (?, ?)",
        );
        create(
            &mut f,
            ParamBlock::new().with_u32(batch::BLOB_POLICY, batch::BLOB_ID_USER),
        );
        f.h.call(Packet::BatchBlobStream(BatchBlobStream {
            statement: f.s,
            data: Bytes::from_static(&[0u8; 16]),
        }));
        let r = f.h.response(Packet::BatchExec(BatchExec {
            statement: f.s,
            transaction: f.t,
        }));
        assert_eq!(r.status.primary_code(), Some(codes::BATCH_BLOB_POLICY));
    }

    #[test]
    fn test_registered_blob_is_bound() {
        let mut f = fixture(
            "CREATE TABLE docs (id INTEGER, body BLOB)",
            "INSERT INTO docs (id, body) VALUES (?, ?)",
        );
        let created = f.h.ok(Packet::CreateBlob(relwire_protocol::packet::CreateBlob {
            transaction: f.t,
            bpb: Bytes::new(),
        }));
        f.h.ok(Packet::PutSegment(relwire_protocol::packet::BlobData {
            blob: created.object,
            data: Bytes::from_static(b"kept"),
        }));
        f.h.ok(Packet::CloseBlob(ObjectRef::new(created.object)));

        create(
            &mut f,
            ParamBlock::new().with_u32(batch::BLOB_POLICY, batch::BLOB_ID_USER),
        );
        f.h.call(Packet::BatchRegBlob(BatchRegBlob {
            statement: f.s,
            existing: created.blob_id,
            batch_id: 5,
        }));
        let format = MessageFormat::new(vec![
            Field::new("ID", FieldType::Integer),
            Field::new("BODY", FieldType::Blob),
        ]);
        send_rows(&mut f, &format, &[vec![Value::Integer(1), Value::Blob(5)]]);
        let done = exec(&mut f);
        assert_eq!(done.total, 1);
        assert!(done.errors.is_empty());

        // the row now refers to the engine blob
        let a = f.h.port.lock_state().handles.statements.get(f.s).unwrap().attachment;
        let q = f.h.ok(Packet::AllocateStatement(ObjectRef::new(a))).object;
        f.h.ok(Packet::PrepareStatement(PrepareStatement {
            transaction: f.t,
            statement: q,
            dialect: 3,
            sql: "SELECT * FROM docs".into(),
            items: Bytes::new(),
            buffer_length: 0,
        }));
        f.h.ok(Packet::Execute(Execute {
            statement: q,
            transaction: f.t,
            in_format: Bytes::new(),
            in_message: Bytes::new(),
            out_format: Bytes::new(),
            cursor_flags: 0,
        }));
        let rows = match f.h.call(Packet::Fetch(Fetch {
            statement: q,
            format: Bytes::new(),
            count: 1,
        }))
        .pop()
        {
            Some(Packet::FetchResponse(FetchResponse { rows, .. })) => rows,
            other => panic!("unexpected {:?}", other),
        };
        let row = format.decode_row(&rows[0]).unwrap();
        let Value::Blob(blob_id) = row[1].clone() else {
            panic!("unexpected {:?}", row)
        };
        assert_eq!(blob_id, created.blob_id);
        let opened = f.h.ok(Packet::OpenBlob(OpenBlob {
            transaction: f.t,
            blob_id,
            bpb: Bytes::new(),
        }));
        let read = f.h.ok(Packet::GetSegment(GetSegment {
            blob: opened.object,
            length: 64,
        }));
        assert_eq!(&read.data[2..], b"kept");
    }
}
