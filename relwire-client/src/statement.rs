//! Prepared statements.

use crate::attachment::SQL_DIALECT;
use crate::batch::{Batch, BatchOptions};
use crate::cursor::Cursor;
use crate::error::ClientError;
use crate::port::{expect_response, Port};
use crate::proxy::{query_info, same_port, Handle, INFO_BUFFER_LENGTH};
use crate::transaction::Transaction;
use bytes::Bytes;
use relwire_protocol::info::items;
use relwire_protocol::packet::{
    cursor_flags, Execute, FreeOption, FreeStatement, ObjectRef, PrepareStatement, Response,
    SetCursor, SqlResponse, LAST_OBJECT,
};
use relwire_protocol::{InfoResponse, MessageFormat, Opcode, Packet, Value};
use std::sync::Arc;

const PREPARE_ITEMS: [u8; 3] = [
    items::SQL_STMT_TYPE,
    items::SQL_INPUT_FORMAT,
    items::SQL_OUTPUT_FORMAT,
];

/// Kind of statement reported by prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementType {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    ExecProcedure,
    Other(u32),
}

impl From<u32> for StatementType {
    fn from(value: u32) -> Self {
        match value {
            1 => StatementType::Select,
            2 => StatementType::Insert,
            3 => StatementType::Update,
            4 => StatementType::Delete,
            5 => StatementType::Ddl,
            8 => StatementType::ExecProcedure,
            other => StatementType::Other(other),
        }
    }
}

/// A statement allocated on an attachment and prepared once.
#[derive(Debug)]
pub struct Statement {
    port: Arc<Port>,
    handle: Handle,
    attachment: u32,
    statement_type: StatementType,
    input: MessageFormat,
    output: MessageFormat,
}

fn prepare_packet(statement: u32, transaction: u32, sql: &str) -> Packet {
    Packet::PrepareStatement(PrepareStatement {
        transaction,
        statement,
        dialect: SQL_DIALECT,
        sql: sql.to_string(),
        items: Bytes::from_static(&PREPARE_ITEMS),
        buffer_length: INFO_BUFFER_LENGTH,
    })
}

fn drop_packet(id: u32) -> Packet {
    Packet::FreeStatement(FreeStatement {
        statement: id,
        option: FreeOption::Drop,
    })
}

impl Statement {
    /// Allocates and prepares. In lazy mode both requests travel in one
    /// write, the prepare naming the just-allocated statement.
    pub(crate) fn prepare(
        port: &Arc<Port>,
        attachment: u32,
        transaction: u32,
        sql: &str,
    ) -> Result<Statement, ClientError> {
        let (id, prepared) = if port.is_lazy() {
            let replies = port.pipeline(vec![
                Packet::AllocateStatement(ObjectRef::new(attachment)),
                prepare_packet(LAST_OBJECT, transaction, sql),
            ])?;
            let [allocated, prepared]: [Result<Response, ClientError>; 2] = replies
                .try_into()
                .map_err(|_| ClientError::UnexpectedPacket(Opcode::Response))?;
            (allocated?.object, prepared)
        } else {
            let id = port
                .call(Packet::AllocateStatement(ObjectRef::new(attachment)))?
                .object;
            (id, port.call(prepare_packet(id, transaction, sql)))
        };

        let response = match prepared {
            Ok(response) => response,
            Err(e) => {
                if let Err(free) = port.defer(drop_packet(id)) {
                    tracing::debug!("Dropping statement {} after failed prepare: {}", id, free);
                }
                return Err(e);
            }
        };
        let info = InfoResponse::parse(&response.data)?;
        let format = |tag| -> Result<MessageFormat, ClientError> {
            match info.get(tag) {
                Some(item) => Ok(MessageFormat::from_bytes(&item.data)?),
                None => Ok(MessageFormat::new(Vec::new())),
            }
        };
        let statement_type = info
            .get(items::SQL_STMT_TYPE)
            .and_then(|i| i.as_u32())
            .map(StatementType::from)
            .ok_or_else(|| ClientError::usage("prepare returned no statement type"))?;
        let statement = Statement {
            port: port.clone(),
            handle: Handle::new("statement", id),
            attachment,
            statement_type,
            input: format(items::SQL_INPUT_FORMAT)?,
            output: format(items::SQL_OUTPUT_FORMAT)?,
        };
        tracing::debug!("Statement {} prepared as {:?}", id, statement.statement_type);
        Ok(statement)
    }

    pub fn id(&self) -> Result<u32, ClientError> {
        self.handle.get()
    }

    pub fn attachment_id(&self) -> u32 {
        self.attachment
    }

    pub fn statement_type(&self) -> StatementType {
        self.statement_type
    }

    pub fn input_format(&self) -> &MessageFormat {
        &self.input
    }

    pub fn output_format(&self) -> &MessageFormat {
        &self.output
    }

    fn execute_packet(&self, txn: &Transaction, params: &[Value], flags: u32) -> Result<Execute, ClientError> {
        same_port(&self.port, txn.port(), "transaction")?;
        Ok(Execute {
            statement: self.handle.get()?,
            transaction: txn.id()?,
            in_format: Bytes::new(),
            in_message: self.input.encode_row(params).map_err(ClientError::Message)?,
            out_format: Bytes::new(),
            cursor_flags: flags,
        })
    }

    /// Executes a non-select statement; returns the affected rows.
    pub fn execute(&self, txn: &Transaction, params: &[Value]) -> Result<u64, ClientError> {
        if self.statement_type == StatementType::Select {
            return Err(ClientError::usage("a select must be run with open_cursor"));
        }
        let packet = Packet::Execute(self.execute_packet(txn, params, 0)?);
        Ok(self.port.call(packet)?.blob_id)
    }

    /// Executes and returns the single output row, if the statement
    /// produced one.
    pub fn execute_returning(
        &self,
        txn: &Transaction,
        params: &[Value],
    ) -> Result<(u64, Option<Vec<Value>>), ClientError> {
        let packet = Packet::Execute2(self.execute_packet(txn, params, 0)?);
        let (response, message) = self.port.transact(std::slice::from_ref(&packet), |replies| {
            match replies.packet()? {
                Packet::SqlResponse(SqlResponse { message }) => Ok((replies.response()?, message)),
                other => Ok((expect_response(other)?, None)),
            }
        })?;
        let row = match message {
            Some(message) => Some(self.output.decode_row(&message)?),
            None => None,
        };
        Ok((response.blob_id, row))
    }

    /// Opens a cursor over the rows of a select.
    pub fn open_cursor(&self, txn: &Transaction, params: &[Value], scrollable: bool) -> Result<Cursor, ClientError> {
        if self.statement_type != StatementType::Select {
            return Err(ClientError::usage("only a select opens a cursor"));
        }
        let flags = if scrollable { cursor_flags::SCROLLABLE } else { 0 };
        let packet = Packet::Execute(self.execute_packet(txn, params, flags)?);
        self.port.call(packet)?;
        Ok(Cursor::new(
            &self.port,
            self.handle.get()?,
            self.output.clone(),
            scrollable,
        ))
    }

    pub fn set_cursor_name(&self, name: &str) -> Result<(), ClientError> {
        self.port
            .call(Packet::SetCursor(SetCursor {
                statement: self.handle.get()?,
                name: name.to_string(),
            }))
            .map(|_| ())
    }

    pub fn info(&self, items: &[u8]) -> Result<InfoResponse, ClientError> {
        query_info(&self.port, self.handle.get()?, items, Packet::InfoSql)
    }

    /// Creates a batch bound to this statement's input format.
    pub fn create_batch(&self, options: BatchOptions) -> Result<Batch, ClientError> {
        Batch::create(&self.port, self.handle.get()?, self.input.clone(), options)
    }

    /// Drops the statement on the server. Deferred in lazy mode.
    pub fn free(&mut self) -> Result<(), ClientError> {
        let id = self.handle.get()?;
        self.handle.clear();
        self.port.defer(drop_packet(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::tests::Script;
    use relwire_protocol::info::InfoWriter;
    use relwire_protocol::packet::ptype;
    use relwire_protocol::status::codes;
    use relwire_protocol::{Field, FieldType, StatusVector};

    fn prepare_reply(id: u32, stmt_type: u32, input: &MessageFormat) -> Packet {
        let mut writer = InfoWriter::new(INFO_BUFFER_LENGTH);
        writer.push_u32(items::SQL_STMT_TYPE, stmt_type);
        writer.push(items::SQL_INPUT_FORMAT, &input.to_bytes().unwrap());
        writer.push(
            items::SQL_OUTPUT_FORMAT,
            &MessageFormat::new(Vec::new()).to_bytes().unwrap(),
        );
        Packet::Response(Response {
            object: id,
            data: writer.finish(),
            ..Response::default()
        })
    }

    fn id_format() -> MessageFormat {
        MessageFormat::new(vec![Field::new("ID", FieldType::Integer).not_null()])
    }

    #[test]
    fn test_lazy_prepare_is_one_write() {
        let script = Script::new();
        let port = script.port(ptype::LAZY);
        script.reply(Packet::Response(Response::with_object(6)));
        script.reply(prepare_reply(6, 2, &id_format()));
        let stmt = Statement::prepare(&port, 1, 0, "INSERT INTO T VALUES (?)").unwrap();
        assert_eq!(stmt.id().unwrap(), 6);
        assert_eq!(stmt.statement_type(), StatementType::Insert);
        assert_eq!(stmt.input_format(), &id_format());

        let sent = script.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], Packet::AllocateStatement(ObjectRef::new(1)));
        let Packet::PrepareStatement(prepare) = &sent[1] else {
            panic!("expected PrepareStatement");
        };
        assert_eq!(prepare.statement, LAST_OBJECT);
    }

    #[test]
    fn test_failed_prepare_drops_statement() {
        let script = Script::new();
        let port = script.port(ptype::LAZY);
        script.reply(Packet::Response(Response::with_object(6)));
        script.reply(Packet::Response(Response::error(StatusVector::error(
            codes::SQL_SYNTAX,
        ))));
        let err = Statement::prepare(&port, 1, 0, "SELEC").unwrap_err();
        assert_eq!(err.gds_code(), Some(codes::SQL_SYNTAX));
        assert_eq!(port.deferred_len(), 1);
    }

    #[test]
    fn test_sync_prepare_names_statement() {
        let script = Script::new();
        let port = script.port(ptype::SYNC);
        script.reply(Packet::Response(Response::with_object(3)));
        script.reply(prepare_reply(3, 1, &MessageFormat::new(Vec::new())));
        let stmt = Statement::prepare(&port, 1, 0, "SELECT * FROM T").unwrap();
        assert_eq!(stmt.statement_type(), StatementType::Select);
        let sent = script.sent();
        let Packet::PrepareStatement(prepare) = &sent[1] else {
            panic!("expected PrepareStatement");
        };
        assert_eq!(prepare.statement, 3);
    }

    #[test]
    fn test_statement_type_codes() {
        assert_eq!(StatementType::from(1), StatementType::Select);
        assert_eq!(StatementType::from(8), StatementType::ExecProcedure);
        assert_eq!(StatementType::from(99), StatementType::Other(99));
    }
}
