//! The engine boundary.
//!
//! The server drives an engine exclusively through these traits. Objects are
//! reference counted so the server can keep them in its handle tables while
//! the engine keeps its own bookkeeping. All calls are synchronous and may
//! block; long-running calls poll a [`CancelToken`].

use crate::error::EngineError;
use bytes::Bytes;
use relwire_protocol::info::InfoWriter;
use relwire_protocol::packet::{EventCount, SeekMode};
use relwire_protocol::{FetchOp, MessageFormat, ParamBlock, Value};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag that asks a running engine call to stop.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Raises the flag. Ignored while cancellation is disabled.
    pub fn cancel(&self) {
        if self.enabled.load(Ordering::Acquire) {
            self.flag.store(true, Ordering::Release);
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.flag.store(false, Ordering::Release);
        }
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Fails with [`EngineError::Cancelled`] and clears the flag if raised.
    pub fn check(&self) -> Result<(), EngineError> {
        if self.flag.swap(false, Ordering::AcqRel) {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

/// Identity and options supplied at attach time.
#[derive(Debug, Clone, Default)]
pub struct AttachParams {
    pub user: String,
    pub dpb: ParamBlock,
    /// Key obtained through the crypt-key callback, if the database needs one.
    pub crypt_key: Option<Bytes>,
}

/// Called once when one of the subscribed events is posted.
pub type EventCallback = Box<dyn FnOnce(Vec<EventCount>) + Send>;

/// Outcome of executing a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutcome {
    /// Singleton output row, for statements that produce one.
    pub row: Option<Vec<Value>>,
    pub affected: u64,
}

/// Statement type as reported by info queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatementType {
    Select = 1,
    Insert = 2,
    Update = 3,
    Delete = 4,
    Ddl = 5,
    ExecProcedure = 8,
}

/// Segment returned by a blob read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobSegment {
    pub data: Bytes,
    /// False when the caller's buffer cut the segment short.
    pub complete: bool,
}

/// Entry point of an engine.
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Whether attaching to `database` requires a key from the client.
    fn requires_key(&self, database: &str) -> bool;

    fn attach(
        &self,
        database: &str,
        params: &AttachParams,
    ) -> Result<Arc<dyn EngineAttachment>, EngineError>;

    fn create(
        &self,
        database: &str,
        params: &AttachParams,
    ) -> Result<Arc<dyn EngineAttachment>, EngineError>;

    fn service_attach(
        &self,
        service: &str,
        params: &AttachParams,
    ) -> Result<Arc<dyn EngineService>, EngineError>;
}

pub trait EngineAttachment: Send + Sync {
    fn id(&self) -> u64;

    fn database(&self) -> &str;

    fn start_transaction(&self, tpb: &ParamBlock) -> Result<Arc<dyn EngineTransaction>, EngineError>;

    fn prepare_statement(
        &self,
        transaction: Option<&Arc<dyn EngineTransaction>>,
        sql: &str,
        dialect: u32,
    ) -> Result<Arc<dyn EngineStatement>, EngineError>;

    /// Prepares, executes and frees a statement in one call.
    fn execute_immediate(
        &self,
        transaction: Option<&Arc<dyn EngineTransaction>>,
        sql: &str,
        input: &[Value],
        cancel: &CancelToken,
    ) -> Result<ExecOutcome, EngineError>;

    fn open_blob(
        &self,
        transaction: &Arc<dyn EngineTransaction>,
        blob_id: u64,
        bpb: &ParamBlock,
    ) -> Result<Arc<dyn EngineBlob>, EngineError>;

    fn create_blob(
        &self,
        transaction: &Arc<dyn EngineTransaction>,
        bpb: &ParamBlock,
    ) -> Result<Arc<dyn EngineBlob>, EngineError>;

    fn compile_request(&self, blr: &[u8]) -> Result<Arc<dyn EngineRequest>, EngineError>;

    /// Subscribes to events; returns the engine's subscription id.
    fn que_events(&self, events: &[EventCount], callback: EventCallback)
        -> Result<u64, EngineError>;

    /// Removes a subscription. Unknown ids are ignored.
    fn cancel_events(&self, subscription: u64) -> Result<(), EngineError>;

    /// Writes one info item; returns `false` for items the engine does not know.
    fn info(&self, item: u8, writer: &mut InfoWriter) -> Result<bool, EngineError>;

    fn drop_database(&self) -> Result<(), EngineError>;

    fn detach(&self) -> Result<(), EngineError>;
}

pub trait EngineTransaction: Send + Sync {
    fn id(&self) -> u64;

    fn is_active(&self) -> bool;

    fn commit(&self) -> Result<(), EngineError>;

    fn commit_retaining(&self) -> Result<(), EngineError>;

    fn rollback(&self) -> Result<(), EngineError>;

    fn rollback_retaining(&self) -> Result<(), EngineError>;

    /// First phase of a two-phase commit, with an optional recovery message.
    fn prepare(&self, message: &[u8]) -> Result<(), EngineError>;

    fn info(&self, item: u8, writer: &mut InfoWriter) -> Result<bool, EngineError>;

    fn as_any(&self) -> &dyn Any;
}

pub trait EngineStatement: Send + Sync {
    fn statement_type(&self) -> StatementType;

    fn input_format(&self) -> MessageFormat;

    fn output_format(&self) -> MessageFormat;

    fn execute(
        &self,
        transaction: &Arc<dyn EngineTransaction>,
        input: &[Value],
        cancel: &CancelToken,
    ) -> Result<ExecOutcome, EngineError>;

    fn open_cursor(
        &self,
        transaction: &Arc<dyn EngineTransaction>,
        input: &[Value],
        scrollable: bool,
        cancel: &CancelToken,
    ) -> Result<Arc<dyn EngineCursor>, EngineError>;

    /// Executes once per row; one result per row, in order.
    fn execute_batch(
        &self,
        transaction: &Arc<dyn EngineTransaction>,
        rows: &[Vec<Value>],
        cancel: &CancelToken,
    ) -> Result<Vec<Result<u64, EngineError>>, EngineError> {
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            cancel.check()?;
            results.push(self.execute(transaction, row, cancel).map(|o| o.affected));
        }
        Ok(results)
    }

    fn set_cursor_name(&self, name: &str) -> Result<(), EngineError>;

    fn cursor_name(&self) -> Option<String>;

    fn info(&self, item: u8, writer: &mut InfoWriter) -> Result<bool, EngineError>;

    /// Releases engine resources; the statement must be prepared again before use.
    fn free(&self) -> Result<(), EngineError>;
}

pub trait EngineCursor: Send + Sync {
    fn is_scrollable(&self) -> bool;

    /// Moves the cursor and returns the row under it, or `None` past either end.
    fn fetch(
        &self,
        op: FetchOp,
        position: i32,
        cancel: &CancelToken,
    ) -> Result<Option<Vec<Value>>, EngineError>;

    fn close(&self) -> Result<(), EngineError>;
}

pub trait EngineBlob: Send + Sync {
    fn id(&self) -> u64;

    fn get_segment(&self, max_len: usize) -> Result<BlobSegment, EngineError>;

    fn put_segment(&self, data: &[u8]) -> Result<(), EngineError>;

    /// Repositions a stream blob and returns the new offset.
    fn seek(&self, mode: SeekMode, offset: i64) -> Result<u64, EngineError>;

    fn info(&self, item: u8, writer: &mut InfoWriter) -> Result<bool, EngineError>;

    /// Finishes the blob; a created blob becomes visible under its id.
    fn close(&self) -> Result<(), EngineError>;

    /// Discards a created blob.
    fn cancel(&self) -> Result<(), EngineError>;
}

pub trait EngineRequest: Send + Sync {
    fn start(&self, transaction: &Arc<dyn EngineTransaction>, level: u32)
        -> Result<(), EngineError>;

    fn send(&self, msg_type: u32, message: &[u8]) -> Result<(), EngineError>;

    fn receive(&self, msg_type: u32) -> Result<Bytes, EngineError>;

    fn unwind(&self, level: u32) -> Result<(), EngineError>;

    fn info(&self, item: u8, writer: &mut InfoWriter) -> Result<bool, EngineError>;
}

pub trait EngineService: Send + Sync {
    fn start(&self, spb: &ParamBlock) -> Result<(), EngineError>;

    /// Writes pending output for the receive items.
    fn query(&self, recv_items: &[u8], writer: &mut InfoWriter) -> Result<(), EngineError>;

    fn detach(&self) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());

        let remote = token.clone();
        remote.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(EngineError::Cancelled)));
        // check() consumes the request
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_cancel_disabled() {
        let token = CancelToken::new();
        token.set_enabled(false);
        token.cancel();
        assert!(!token.is_cancelled());

        token.set_enabled(true);
        token.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!token.is_cancelled());
    }
}
