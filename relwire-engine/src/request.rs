//! Compiled requests.
//!
//! The in-memory engine does not interpret request bytecode. A started
//! request echoes back the last message sent to it for each message type.

use crate::api::{EngineRequest, EngineTransaction};
use crate::error::EngineError;
use bytes::Bytes;
use parking_lot::Mutex;
use relwire_protocol::info::{items, InfoWriter};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct RequestState {
    active: bool,
    level: u32,
    messages: HashMap<u32, Bytes>,
    last_type: Option<u32>,
}

pub struct MemoryRequest {
    blr: Bytes,
    state: Mutex<RequestState>,
}

impl MemoryRequest {
    pub fn compile(blr: &[u8]) -> Result<Self, EngineError> {
        if blr.is_empty() {
            return Err(EngineError::syntax("empty request"));
        }
        Ok(Self {
            blr: Bytes::copy_from_slice(blr),
            state: Mutex::new(RequestState::default()),
        })
    }

    pub fn blr(&self) -> &[u8] {
        &self.blr
    }

    fn inactive() -> EngineError {
        EngineError::RequestState {
            reason: "request is not started".to_string(),
        }
    }
}

impl EngineRequest for MemoryRequest {
    fn start(&self, transaction: &Arc<dyn EngineTransaction>, level: u32) -> Result<(), EngineError> {
        if !transaction.is_active() {
            return Err(EngineError::TransactionState {
                reason: format!("transaction {} is not active", transaction.id()),
            });
        }
        let mut state = self.state.lock();
        state.active = true;
        state.level = level;
        state.messages.clear();
        state.last_type = None;
        Ok(())
    }

    fn send(&self, msg_type: u32, message: &[u8]) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(Self::inactive());
        }
        state.messages.insert(msg_type, Bytes::copy_from_slice(message));
        state.last_type = Some(msg_type);
        Ok(())
    }

    fn receive(&self, msg_type: u32) -> Result<Bytes, EngineError> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(Self::inactive());
        }
        state.last_type = Some(msg_type);
        Ok(state.messages.get(&msg_type).cloned().unwrap_or_default())
    }

    fn unwind(&self, level: u32) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(Self::inactive());
        }
        if level != state.level {
            return Err(EngineError::RequestState {
                reason: format!("request runs at level {}, not {}", state.level, level),
            });
        }
        state.active = false;
        state.messages.clear();
        Ok(())
    }

    fn info(&self, item: u8, writer: &mut InfoWriter) -> Result<bool, EngineError> {
        let state = self.state.lock();
        match item {
            items::REQ_STATE => writer.push_u32(item, u32::from(state.active)),
            items::REQ_MESSAGE_TYPE => writer.push_u32(item, state.last_type.unwrap_or(0)),
            _ => return Ok(false),
        }
        Ok(true)
    }
}
