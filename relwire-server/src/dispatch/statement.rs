//! Statements and cursors.

use super::{collect_info, object_reply, ok_reply, Dispatcher};
use crate::error::ServerError;
use crate::port::{CursorEntry, Port, PortState, StatementEntry};
use bytes::Bytes;
use relwire_engine::{EngineStatement, EngineTransaction, StatementType};
use relwire_protocol::packet::{
    cursor_flags, fetch_status, Execute, ExecImmediate, Fetch, FetchResponse, FetchScroll,
    FreeOption, FreeStatement, InfoQuery, PrepareStatement, Response, SetCursor, SqlResponse,
    LAST_OBJECT,
};
use relwire_protocol::status::codes;
use relwire_protocol::{FetchOp, MessageFormat, Packet, StatusVector, Value};
use std::sync::Arc;

/// Upper bound on rows returned by one fetch.
const MAX_FETCH_ROWS: u32 = 256;

fn unprepared(id: u32) -> ServerError {
    ServerError::Rejected(
        StatusVector::error(codes::BAD_STMT_HANDLE)
            .with_str(format!("statement {} is not prepared", id)),
    )
}

fn decode_input(
    statement: &dyn EngineStatement,
    format: &[u8],
    message: &[u8],
) -> Result<Vec<Value>, ServerError> {
    let format = if format.is_empty() {
        statement.input_format()
    } else {
        MessageFormat::from_bytes(format)?
    };
    Ok(format.decode_row(message)?)
}

impl Dispatcher {
    /// Maps [`LAST_OBJECT`] to the most recently allocated statement.
    pub(super) fn statement_id(state: &PortState, id: u32) -> u32 {
        if id == LAST_OBJECT {
            state.last_statement
        } else {
            id
        }
    }

    pub(super) fn prepared(
        state: &PortState,
        id: u32,
    ) -> Result<(Arc<dyn EngineStatement>, u32), ServerError> {
        let entry = state.handles.statements.get(id)?;
        let engine = entry.engine.clone().ok_or_else(|| unprepared(id))?;
        Ok((engine, entry.attachment))
    }

    /// Looks up a transaction that must belong to `attachment`.
    pub(super) fn owned_transaction(
        state: &PortState,
        id: u32,
        attachment: u32,
    ) -> Result<Arc<dyn EngineTransaction>, ServerError> {
        let entry = state.handles.transactions.get(id)?;
        if entry.attachment != attachment {
            return Err(relwire_engine::EngineError::ForeignTransaction.into());
        }
        Ok(entry.engine.clone())
    }

    pub(super) fn allocate_statement(
        &self,
        state: &mut PortState,
        attachment: u32,
    ) -> Result<Option<Packet>, ServerError> {
        state.handles.attachments.get(attachment)?;
        let id = state.handles.statements.allocate(StatementEntry {
            attachment,
            engine: None,
            cursor: None,
            out_format: None,
            batch: None,
        })?;
        state.last_statement = id;
        Ok(object_reply(id))
    }

    pub(super) fn prepare_statement(
        &self,
        state: &mut PortState,
        req: PrepareStatement,
    ) -> Result<Option<Packet>, ServerError> {
        let id = Self::statement_id(state, req.statement);
        let attachment_id = state.handles.statements.get(id)?.attachment;
        let attachment = state.handles.attachments.get(attachment_id)?.engine.clone();
        let txn = match req.transaction {
            0 => None,
            t => Some(Self::owned_transaction(state, t, attachment_id)?),
        };

        let prepared = attachment.prepare_statement(txn.as_ref(), &req.sql, req.dialect)?;

        let entry = state.handles.statements.get_mut(id)?;
        if let Err(e) = entry.close_cursor() {
            tracing::debug!("statement {}: closing old cursor failed: {}", id, e);
        }
        if let Some(old) = entry.engine.replace(prepared.clone()) {
            let _ = old.free();
        }
        entry.out_format = None;
        entry.batch = None;

        let data = collect_info(&req.items, req.buffer_length, |item, w| {
            prepared.info(item, w)
        })?;
        Ok(Some(Packet::Response(Response {
            object: id,
            data,
            ..Response::default()
        })))
    }

    /// `Execute` opens a cursor for selects; `Execute2` runs a singleton
    /// and sends the row back in a `SqlResponse` ahead of the reply.
    pub(super) fn execute(
        &self,
        port: &Arc<Port>,
        state: &mut PortState,
        req: Execute,
        execute2: bool,
    ) -> Result<Option<Packet>, ServerError> {
        let id = Self::statement_id(state, req.statement);
        let (statement, attachment) = Self::prepared(state, id)?;
        let txn = Self::owned_transaction(state, req.transaction, attachment)?;
        let input = decode_input(statement.as_ref(), &req.in_format, &req.in_message)?;

        if statement.statement_type() == StatementType::Select && !execute2 {
            if state.handles.statements.get(id)?.cursor.is_some() {
                return Err(ServerError::invalid(format!(
                    "statement {} already has an open cursor",
                    id
                )));
            }
            let scrollable = req.cursor_flags & cursor_flags::SCROLLABLE != 0;
            let cursor = statement.open_cursor(&txn, &input, scrollable, &port.cancel)?;
            let out_format = if req.out_format.is_empty() {
                None
            } else {
                Some(MessageFormat::from_bytes(&req.out_format)?)
            };
            let entry = state.handles.statements.get_mut(id)?;
            entry.cursor = Some(CursorEntry {
                engine: cursor,
                transaction: req.transaction,
            });
            if out_format.is_some() {
                entry.out_format = out_format;
            }
            return Ok(ok_reply());
        }

        let outcome = statement.execute(&txn, &input, &port.cancel)?;
        if execute2 {
            let format = if req.out_format.is_empty() {
                statement.output_format()
            } else {
                MessageFormat::from_bytes(&req.out_format)?
            };
            let message = match &outcome.row {
                Some(row) if !format.is_empty() => Some(format.encode_row(row)?),
                _ => None,
            };
            port.send(Packet::SqlResponse(SqlResponse { message }))?;
        }
        Ok(Some(Packet::Response(Response {
            blob_id: outcome.affected,
            ..Response::default()
        })))
    }

    pub(super) fn exec_immediate(
        &self,
        port: &Arc<Port>,
        state: &mut PortState,
        req: ExecImmediate,
    ) -> Result<Option<Packet>, ServerError> {
        let attachment = state.handles.attachments.get(req.attachment)?.engine.clone();
        let txn = match req.transaction {
            0 => None,
            t => Some(Self::owned_transaction(state, t, req.attachment)?),
        };
        let input = if req.in_format.is_empty() {
            Vec::new()
        } else {
            MessageFormat::from_bytes(&req.in_format)?.decode_row(&req.in_message)?
        };

        let outcome = attachment.execute_immediate(txn.as_ref(), &req.sql, &input, &port.cancel)?;
        if !req.out_format.is_empty() {
            let format = MessageFormat::from_bytes(&req.out_format)?;
            let message = match &outcome.row {
                Some(row) => Some(format.encode_row(row)?),
                None => None,
            };
            port.send(Packet::SqlResponse(SqlResponse { message }))?;
        }
        Ok(Some(Packet::Response(Response {
            blob_id: outcome.affected,
            ..Response::default()
        })))
    }

    /// Resolves the cursor and row format for a fetch, remembering a
    /// format the client names.
    fn fetch_target(
        state: &mut PortState,
        id: u32,
        format: &Bytes,
    ) -> Result<(CursorHandle, MessageFormat), ServerError> {
        let (statement, _) = Self::prepared(state, id)?;
        let entry = state.handles.statements.get_mut(id)?;
        let cursor = entry
            .cursor
            .as_ref()
            .map(|c| c.engine.clone())
            .ok_or(relwire_engine::EngineError::NoCursor)?;
        if !format.is_empty() {
            entry.out_format = Some(MessageFormat::from_bytes(format)?);
        }
        let format = entry
            .out_format
            .clone()
            .unwrap_or_else(|| statement.output_format());
        Ok((cursor, format))
    }

    fn fetch_rows(
        port: &Port,
        cursor: &CursorHandle,
        format: &MessageFormat,
        op: FetchOp,
        position: i32,
        count: u32,
    ) -> Result<Option<Packet>, ServerError> {
        let mut rows = Vec::new();
        let mut status = fetch_status::OK;
        for _ in 0..count.clamp(1, MAX_FETCH_ROWS) {
            match cursor.fetch(op, position, &port.cancel)? {
                Some(row) => rows.push(format.encode_row(&row)?),
                None => {
                    status = fetch_status::NO_MORE_ROWS;
                    break;
                }
            }
        }
        Ok(Some(Packet::FetchResponse(FetchResponse { status, rows })))
    }

    pub(super) fn fetch(
        &self,
        port: &Arc<Port>,
        state: &mut PortState,
        req: Fetch,
    ) -> Result<Option<Packet>, ServerError> {
        let id = Self::statement_id(state, req.statement);
        let (cursor, format) = Self::fetch_target(state, id, &req.format)?;
        Self::fetch_rows(port, &cursor, &format, FetchOp::Next, 0, req.count)
    }

    /// Next and prior fetch up to `count` rows; positioned operations
    /// return the single row they land on.
    pub(super) fn fetch_scroll(
        &self,
        port: &Arc<Port>,
        state: &mut PortState,
        req: FetchScroll,
    ) -> Result<Option<Packet>, ServerError> {
        let id = Self::statement_id(state, req.statement);
        let (cursor, format) = Self::fetch_target(state, id, &req.format)?;
        let count = match req.op {
            FetchOp::Next | FetchOp::Prior => req.count,
            _ => 1,
        };
        Self::fetch_rows(port, &cursor, &format, req.op, req.position, count)
    }

    pub(super) fn free_statement(
        &self,
        state: &mut PortState,
        req: FreeStatement,
    ) -> Result<Option<Packet>, ServerError> {
        let id = Self::statement_id(state, req.statement);
        match req.option {
            FreeOption::Close => {
                // Closing a statement without a cursor is not an error.
                let entry = state.handles.statements.get_mut(id)?;
                if let Err(e) = entry.close_cursor() {
                    tracing::debug!("statement {}: close: {}", id, e);
                }
            }
            FreeOption::Unprepare => {
                let entry = state.handles.statements.get_mut(id)?;
                let _ = entry.close_cursor();
                entry.batch = None;
                entry.out_format = None;
                if let Some(engine) = entry.engine.take() {
                    engine.free()?;
                }
            }
            FreeOption::Drop => {
                let mut entry = state.handles.statements.release(id)?;
                let _ = entry.close_cursor();
                if let Some(engine) = entry.engine.take() {
                    if let Err(e) = engine.free() {
                        tracing::debug!("statement {}: free: {}", id, e);
                    }
                }
                if state.last_statement == id {
                    state.last_statement = 0;
                }
            }
        }
        Ok(Some(Packet::Response(Response::with_object(id))))
    }

    pub(super) fn set_cursor(
        &self,
        state: &mut PortState,
        req: SetCursor,
    ) -> Result<Option<Packet>, ServerError> {
        let id = Self::statement_id(state, req.statement);
        let (statement, _) = Self::prepared(state, id)?;
        statement.set_cursor_name(&req.name)?;
        Ok(ok_reply())
    }

    pub(super) fn info_sql(
        &self,
        state: &mut PortState,
        req: InfoQuery,
    ) -> Result<Option<Packet>, ServerError> {
        let id = Self::statement_id(state, req.object);
        let (statement, _) = Self::prepared(state, id)?;
        let data = collect_info(&req.items, req.buffer_length, |item, w| {
            statement.info(item, w)
        })?;
        Ok(Some(Packet::Response(Response::with_data(data))))
    }
}

type CursorHandle = Arc<dyn relwire_engine::EngineCursor>;
