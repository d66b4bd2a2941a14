//! Service manager of the in-memory engine.

use crate::api::EngineService;
use crate::error::EngineError;
use crate::memory::{Registry, ENGINE_VERSION};
use parking_lot::Mutex;
use relwire_protocol::info::{items, InfoWriter};
use relwire_protocol::pblock::spb;
use relwire_protocol::ParamBlock;
use std::collections::VecDeque;

/// Runs one action at a time and hands its output out line by line.
pub struct MemoryService {
    databases: Registry,
    user: String,
    output: Mutex<VecDeque<String>>,
}

impl MemoryService {
    pub(crate) fn new(databases: Registry, user: String) -> Self {
        Self {
            databases,
            user,
            output: Mutex::new(VecDeque::new()),
        }
    }

    fn collect(&self, action: u8) -> Result<Vec<String>, EngineError> {
        let mut lines = Vec::new();
        match action {
            spb::ACTION_SERVER_VERSION => lines.push(ENGINE_VERSION.to_string()),
            spb::ACTION_LIST_DATABASES => {
                lines.extend(self.databases.iter().map(|e| e.key().clone()));
                lines.sort();
            }
            spb::ACTION_DISPLAY_USERS => {
                for entry in self.databases.iter() {
                    for user in entry.value().attachments.lock().values() {
                        lines.push(format!("{}@{}", user, entry.key()));
                    }
                }
                lines.sort();
            }
            other => {
                return Err(EngineError::ServiceUnknown {
                    action: u32::from(other),
                })
            }
        }
        Ok(lines)
    }
}

impl EngineService for MemoryService {
    fn start(&self, params: &ParamBlock) -> Result<(), EngineError> {
        let action = params
            .get(spb::ACTION)
            .and_then(|d| d.first().copied())
            .ok_or(EngineError::ServiceUnknown { action: 0 })?;
        let lines = self.collect(action)?;
        tracing::debug!("service action {} by {} produced {} lines", action, self.user, lines.len());
        self.output.lock().extend(lines);
        Ok(())
    }

    fn query(&self, recv_items: &[u8], writer: &mut InfoWriter) -> Result<(), EngineError> {
        for &item in recv_items {
            match item {
                items::SVC_LINE => {
                    // An empty line marks the end of the output.
                    let line = self.output.lock().pop_front().unwrap_or_default();
                    writer.push_str(item, &line);
                }
                items::SVC_SERVER_VERSION => writer.push_str(item, ENGINE_VERSION),
                other => writer.push(items::ERROR, &[other]),
            }
        }
        Ok(())
    }

    fn detach(&self) -> Result<(), EngineError> {
        self.output.lock().clear();
        Ok(())
    }
}
