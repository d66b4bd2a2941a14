//! Batched execution of one prepared statement.
//!
//! Rows are buffered locally and sent in `BatchMsg` packets whenever the
//! ring fills. Neither rows nor streamed blob data get a reply; the
//! server keeps the first failure and reports it from `execute`.

use crate::blob::MAX_SEGMENT;
use crate::error::ClientError;
use crate::port::{expect_response, Port};
use crate::proxy::{same_port, Handle};
use crate::transaction::Transaction;
use bytes::{BufMut, Bytes, BytesMut};
use relwire_protocol::blobstream::BlobStreamWriter;
use relwire_protocol::packet::{
    BatchBlobStream, BatchCreate, BatchError, BatchExec, BatchMsg, BatchRegBlob, BatchSetBpb,
    ObjectRef,
};
use relwire_protocol::pblock::{batch, bpb};
use relwire_protocol::{MessageFormat, Packet, ParamBlock, StatusVector, Value};
use std::sync::Arc;

/// Default size of the local row ring.
pub const DEFAULT_RING_BYTES: usize = 256 * 1024;

/// Smallest blob stream buffer; one full segment must fit.
const MIN_BLOB_BUFFER: usize = 2 * (MAX_SEGMENT + 64);

/// How blob columns of batch rows are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlobPolicy {
    /// The message has no blob columns.
    #[default]
    None,
    /// Rows carry ids of blobs created beforehand.
    IdEngine,
    /// Rows carry batch-local ids bound with `register_blob`.
    IdUser,
    /// Blob data is streamed with the batch under batch-local ids.
    Stream,
}

impl BlobPolicy {
    pub fn as_u32(self) -> u32 {
        match self {
            BlobPolicy::None => batch::BLOB_NONE,
            BlobPolicy::IdEngine => batch::BLOB_ID_ENGINE,
            BlobPolicy::IdUser => batch::BLOB_ID_USER,
            BlobPolicy::Stream => batch::BLOB_STREAM,
        }
    }
}

/// Batch creation options.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Keep executing after a failed row.
    pub multi_error: bool,
    /// Report per-row affected counts.
    pub record_counts: bool,
    /// Failures reported with a full status; the rest as indices only.
    pub detailed_errors: Option<u32>,
    /// Server-side buffer limit in bytes.
    pub buffer_bytes: Option<u32>,
    pub blob_policy: BlobPolicy,
    /// Size of the local row ring in bytes.
    pub ring_bytes: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            multi_error: false,
            record_counts: false,
            detailed_errors: None,
            buffer_bytes: None,
            blob_policy: BlobPolicy::None,
            ring_bytes: DEFAULT_RING_BYTES,
        }
    }
}

impl BatchOptions {
    pub fn with_multi_error(mut self, on: bool) -> Self {
        self.multi_error = on;
        self
    }

    pub fn with_record_counts(mut self, on: bool) -> Self {
        self.record_counts = on;
        self
    }

    pub fn with_detailed_errors(mut self, limit: u32) -> Self {
        self.detailed_errors = Some(limit);
        self
    }

    pub fn with_buffer_bytes(mut self, bytes: u32) -> Self {
        self.buffer_bytes = Some(bytes);
        self
    }

    pub fn with_blob_policy(mut self, policy: BlobPolicy) -> Self {
        self.blob_policy = policy;
        self
    }

    pub fn with_ring_bytes(mut self, bytes: usize) -> Self {
        self.ring_bytes = bytes;
        self
    }

    fn to_param_block(&self) -> ParamBlock {
        let mut params = ParamBlock::new()
            .with_u32(batch::MULTI_ERROR, u32::from(self.multi_error))
            .with_u32(batch::RECORD_COUNTS, u32::from(self.record_counts))
            .with_u32(batch::BLOB_POLICY, self.blob_policy.as_u32());
        if let Some(limit) = self.detailed_errors {
            params = params.with_u32(batch::DETAILED_ERRORS, limit);
        }
        if let Some(bytes) = self.buffer_bytes {
            params = params.with_u32(batch::BUFFER_BYTES_SIZE, bytes);
        }
        params
    }
}

/// Result of one batch execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionState {
    /// Rows the server processed.
    pub total: u32,
    /// Affected rows per message when requested; `-1` marks a failure.
    pub record_counts: Vec<i32>,
    pub errors: Vec<BatchError>,
    /// Failed messages beyond the detailed error limit.
    pub simple_errors: Vec<u32>,
}

impl CompletionState {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.simple_errors.is_empty()
    }

    /// Indices of every failed message, ascending.
    pub fn failed(&self) -> Vec<u32> {
        let mut failed: Vec<u32> = self
            .errors
            .iter()
            .map(|e| e.index)
            .chain(self.simple_errors.iter().copied())
            .collect();
        failed.sort_unstable();
        failed
    }

    pub fn error_at(&self, index: u32) -> Option<&StatusVector> {
        self.errors.iter().find(|e| e.index == index).map(|e| &e.status)
    }
}

/// A batch bound to a prepared statement.
#[derive(Debug)]
pub struct Batch {
    port: Arc<Port>,
    handle: Handle,
    format: MessageFormat,
    policy: BlobPolicy,
    rows: BytesMut,
    pending: u32,
    ring_rows: u32,
    blobs: BlobStreamWriter,
    next_blob_id: u64,
}

impl Batch {
    pub(crate) fn create(
        port: &Arc<Port>,
        statement: u32,
        format: MessageFormat,
        options: BatchOptions,
    ) -> Result<Batch, ClientError> {
        port.call(Packet::BatchCreate(BatchCreate {
            statement,
            format: format.to_bytes().map_err(ClientError::Message)?,
            parameters: options
                .to_param_block()
                .to_bytes()
                .map_err(ClientError::Message)?,
        }))?;
        let row_len = format.aligned_length().max(1);
        let ring_rows = u32::try_from((options.ring_bytes / row_len).max(1)).unwrap_or(u32::MAX);
        tracing::debug!(
            "Batch on statement {}: {} rows per message, blob policy {:?}",
            statement,
            ring_rows,
            options.blob_policy
        );
        Ok(Batch {
            port: port.clone(),
            handle: Handle::new("batch", statement),
            format,
            policy: options.blob_policy,
            rows: BytesMut::new(),
            pending: 0,
            ring_rows,
            blobs: BlobStreamWriter::new(options.ring_bytes.max(MIN_BLOB_BUFFER)),
            next_blob_id: 1,
        })
    }

    pub fn statement_id(&self) -> Result<u32, ClientError> {
        self.handle.get()
    }

    pub fn format(&self) -> &MessageFormat {
        &self.format
    }

    /// Rows buffered locally and not yet sent.
    pub fn pending_rows(&self) -> u32 {
        self.pending
    }

    /// Queues one row.
    pub fn add(&mut self, values: &[Value]) -> Result<(), ClientError> {
        self.handle.get()?;
        let row = self.format.encode_row(values).map_err(ClientError::Message)?;
        let start = self.rows.len();
        self.rows.put_slice(&row);
        self.rows.resize(start + self.format.aligned_length(), 0);
        self.pending += 1;
        if self.pending >= self.ring_rows {
            self.send_rows()?;
        }
        Ok(())
    }

    fn send_rows(&mut self) -> Result<(), ClientError> {
        if self.pending == 0 {
            return Ok(());
        }
        let packet = Packet::BatchMsg(BatchMsg {
            statement: self.handle.get()?,
            count: self.pending,
            data: self.rows.split().freeze(),
        });
        self.pending = 0;
        self.port.post(packet)
    }

    fn send_blob_chunks(&mut self, chunks: Vec<Bytes>) -> Result<(), ClientError> {
        let statement = self.handle.get()?;
        for data in chunks {
            self.port
                .post(Packet::BatchBlobStream(BatchBlobStream { statement, data }))?;
        }
        Ok(())
    }

    fn require_stream(&self) -> Result<(), ClientError> {
        if self.policy == BlobPolicy::Stream {
            Ok(())
        } else {
            Err(ClientError::usage("blob streaming needs the Stream blob policy"))
        }
    }

    fn allocate_blob_id(&mut self) -> u64 {
        let id = self.next_blob_id;
        self.next_blob_id += 1;
        id
    }

    /// Opens a streamed blob; returns the id to put in the row.
    pub fn start_blob(&mut self, params: Option<&ParamBlock>) -> Result<u64, ClientError> {
        self.require_stream()?;
        let (raw, segmented) = match params {
            Some(params) => (
                params.to_bytes().map_err(ClientError::Message)?,
                params.get_u32(bpb::TYPE) != Some(u32::from(bpb::TYPE_STREAM)),
            ),
            None => (Bytes::new(), true),
        };
        let id = self.allocate_blob_id();
        self.blobs
            .start_blob(id, &raw, segmented)
            .map_err(ClientError::Message)?;
        Ok(id)
    }

    /// Appends to the open streamed blob. Segmented blobs take one
    /// segment per call.
    pub fn append_blob(&mut self, data: &[u8]) -> Result<(), ClientError> {
        self.require_stream()?;
        self.blobs.append(data).map_err(ClientError::Message)?;
        let ready = self.blobs.take_ready();
        self.send_blob_chunks(ready)
    }

    /// Streams a whole blob; returns the id to put in the row.
    pub fn add_blob(&mut self, data: &[u8], params: Option<&ParamBlock>) -> Result<u64, ClientError> {
        let id = self.start_blob(params)?;
        for segment in data.chunks(MAX_SEGMENT) {
            self.append_blob(segment)?;
        }
        self.blobs.finish_blob();
        Ok(id)
    }

    /// Binds an existing blob to a batch-local id.
    pub fn register_blob(&mut self, existing: u64) -> Result<u64, ClientError> {
        if self.policy == BlobPolicy::None {
            return Err(ClientError::usage("blobs are disabled for this batch"));
        }
        let batch_id = self.allocate_blob_id();
        self.port.post(Packet::BatchRegBlob(BatchRegBlob {
            statement: self.handle.get()?,
            existing,
            batch_id,
        }))?;
        Ok(batch_id)
    }

    /// Parameters for streamed blobs that carry none of their own.
    pub fn set_default_bpb(&mut self, params: &ParamBlock) -> Result<(), ClientError> {
        self.port.post(Packet::BatchSetBpb(BatchSetBpb {
            statement: self.handle.get()?,
            bpb: params.to_bytes().map_err(ClientError::Message)?,
        }))
    }

    /// Sends what is buffered and runs the batch.
    pub fn execute(&mut self, txn: &Transaction) -> Result<CompletionState, ClientError> {
        same_port(&self.port, txn.port(), "transaction")?;
        let statement = self.handle.get()?;
        self.blobs.finish_blob();
        let chunks = self.blobs.flush();
        self.send_blob_chunks(chunks)?;
        self.send_rows()?;

        let packet = Packet::BatchExec(BatchExec {
            statement,
            transaction: txn.id()?,
        });
        let completion = self.port.transact(std::slice::from_ref(&packet), |replies| {
            match replies.packet()? {
                Packet::BatchCompletionState(state) => Ok(state),
                other => {
                    let opcode = other.opcode();
                    expect_response(other)?;
                    Err(ClientError::UnexpectedPacket(opcode))
                }
            }
        })?;
        let state = CompletionState {
            total: completion.total,
            record_counts: completion.record_counts,
            errors: completion.errors,
            simple_errors: completion.simple_errors,
        };
        if !state.is_success() {
            tracing::debug!("Batch on statement {}: rows {:?} failed", statement, state.failed());
        }
        Ok(state)
    }

    /// Drops everything queued, locally and on the server.
    pub fn cancel(&mut self) -> Result<(), ClientError> {
        let statement = self.handle.get()?;
        self.rows.clear();
        self.pending = 0;
        self.blobs.clear();
        self.port.defer(Packet::BatchCancel(ObjectRef::new(statement)))
    }

    /// Releases the batch; the statement stays prepared.
    pub fn release(&mut self) -> Result<(), ClientError> {
        let statement = self.handle.get()?;
        self.handle.clear();
        self.rows.clear();
        self.pending = 0;
        self.blobs.clear();
        self.port.defer(Packet::BatchRelease(ObjectRef::new(statement)))
    }
}
