//! Database attachments.

use crate::error::ClientError;
use crate::events::{EventCallback, Events};
use crate::port::Port;
use crate::proxy::{query_info, same_port, Handle};
use crate::request::Request;
use crate::statement::Statement;
use crate::transaction::Transaction;
use bytes::Bytes;
use relwire_protocol::packet::{AttachDb, CancelKind, Compile, EventCount, ExecImmediate, ObjectRef, SqlResponse};
use relwire_protocol::pblock::{dpb, tpb};
use relwire_protocol::{InfoResponse, MessageFormat, Packet, ParamBlock, Value};
use std::sync::Arc;

/// SQL dialect sent with statements.
pub const SQL_DIALECT: u32 = 3;

/// A database opened over a port.
#[derive(Debug)]
pub struct Attachment {
    port: Arc<Port>,
    handle: Handle,
    database: String,
}

impl Attachment {
    /// Attaches to an existing database.
    pub fn attach(port: &Arc<Port>, database: &str) -> Result<Attachment, ClientError> {
        Self::open(port, database, ParamBlock::new(), false)
    }

    /// Attaches with extra parameters, e.g. a database key under
    /// `dpb::CRYPT_KEY`.
    pub fn attach_with(
        port: &Arc<Port>,
        database: &str,
        params: ParamBlock,
    ) -> Result<Attachment, ClientError> {
        Self::open(port, database, params, false)
    }

    /// Creates a database and attaches to it.
    pub fn create(port: &Arc<Port>, database: &str) -> Result<Attachment, ClientError> {
        Self::open(port, database, ParamBlock::new(), true)
    }

    fn open(
        port: &Arc<Port>,
        database: &str,
        mut params: ParamBlock,
        create: bool,
    ) -> Result<Attachment, ClientError> {
        let config = port.config();
        if !params.has(dpb::USER_NAME) {
            params.set(dpb::USER_NAME, Bytes::copy_from_slice(config.user.as_bytes()));
        }
        if let Some(name) = &config.process_name {
            if !params.has(dpb::PROCESS_NAME) {
                params.set(dpb::PROCESS_NAME, Bytes::copy_from_slice(name.as_bytes()));
            }
        }
        let req = AttachDb {
            database: database.to_string(),
            dpb: params.to_bytes().map_err(ClientError::Message)?,
        };
        let packet = if create {
            Packet::Create(req)
        } else {
            Packet::Attach(req)
        };
        let id = port.call(packet)?.object;
        tracing::debug!("Attached to {} as {}", database, id);
        Ok(Attachment {
            port: port.clone(),
            handle: Handle::new("attachment", id),
            database: database.to_string(),
        })
    }

    pub fn id(&self) -> Result<u32, ClientError> {
        self.handle.get()
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn port(&self) -> &Arc<Port> {
        &self.port
    }

    /// Starts a read-write concurrency transaction that waits on conflicts.
    pub fn start_transaction(&self) -> Result<Transaction, ClientError> {
        let tpb = ParamBlock::new()
            .with_flag(tpb::CONCURRENCY)
            .with_flag(tpb::WRITE)
            .with_flag(tpb::WAIT);
        self.start_transaction_with(&tpb)
    }

    pub fn start_transaction_with(&self, tpb: &ParamBlock) -> Result<Transaction, ClientError> {
        Transaction::start(&self.port, self.id()?, tpb)
    }

    /// Allocates and prepares a statement.
    pub fn prepare(&self, txn: Option<&Transaction>, sql: &str) -> Result<Statement, ClientError> {
        let txn_id = self.transaction_id(txn)?;
        Statement::prepare(&self.port, self.id()?, txn_id, sql)
    }

    fn transaction_id(&self, txn: Option<&Transaction>) -> Result<u32, ClientError> {
        match txn {
            Some(txn) => {
                same_port(&self.port, txn.port(), "transaction")?;
                txn.id()
            }
            None => Ok(0),
        }
    }

    /// Runs a statement without preparing it; returns the affected rows.
    pub fn execute_immediate(&self, txn: Option<&Transaction>, sql: &str) -> Result<u64, ClientError> {
        self.execute_immediate_with(txn, sql, None, None)
            .map(|(affected, _)| affected)
    }

    /// Runs a statement with optional input and output messages.
    pub fn execute_immediate_with(
        &self,
        txn: Option<&Transaction>,
        sql: &str,
        input: Option<(&MessageFormat, &[Value])>,
        output: Option<&MessageFormat>,
    ) -> Result<(u64, Option<Vec<Value>>), ClientError> {
        let (in_format, in_message) = match input {
            Some((format, values)) => (
                format.to_bytes().map_err(ClientError::Message)?,
                format.encode_row(values).map_err(ClientError::Message)?,
            ),
            None => (Bytes::new(), Bytes::new()),
        };
        let out_format = match output {
            Some(format) => format.to_bytes().map_err(ClientError::Message)?,
            None => Bytes::new(),
        };
        let packet = Packet::ExecImmediate(ExecImmediate {
            attachment: self.id()?,
            transaction: self.transaction_id(txn)?,
            dialect: SQL_DIALECT,
            sql: sql.to_string(),
            in_format,
            in_message,
            out_format,
        });
        let (response, message) = self.port.transact(std::slice::from_ref(&packet), |replies| {
            match replies.packet()? {
                Packet::SqlResponse(SqlResponse { message }) => Ok((replies.response()?, message)),
                other => Ok((crate::port::expect_response(other)?, None)),
            }
        })?;
        let row = match (output, message) {
            (Some(format), Some(message)) => Some(format.decode_row(&message)?),
            _ => None,
        };
        Ok((response.blob_id, row))
    }

    /// Compiles a request from its bytecode.
    pub fn compile(&self, blr: &[u8]) -> Result<Request, ClientError> {
        let id = self
            .port
            .call(Packet::Compile(Compile {
                attachment: self.id()?,
                blr: Bytes::copy_from_slice(blr),
            }))?
            .object;
        Ok(Request::new(&self.port, id))
    }

    /// Subscribes to events; `callback` runs once on the aux thread.
    pub fn queue_events<F>(&self, events: &[(&str, u32)], callback: F) -> Result<Events, ClientError>
    where
        F: FnOnce(&[EventCount]) + Send + 'static,
    {
        let events = events
            .iter()
            .map(|(name, count)| EventCount {
                name: name.to_string(),
                count: *count,
            })
            .collect();
        let callback: EventCallback = Box::new(callback);
        Events::queue(&self.port, self.id()?, events, callback)
    }

    pub fn info(&self, items: &[u8]) -> Result<InfoResponse, ClientError> {
        query_info(&self.port, self.id()?, items, Packet::InfoDatabase)
    }

    pub fn ping(&self) -> Result<(), ClientError> {
        self.port.ping()
    }

    pub fn cancel_operation(&self, kind: CancelKind) -> Result<(), ClientError> {
        self.port.cancel(kind)
    }

    /// Detaches. The server rolls back any transactions still open.
    pub fn detach(&mut self) -> Result<(), ClientError> {
        let id = self.handle.get()?;
        self.port.call(Packet::Detach(ObjectRef::new(id)))?;
        self.handle.clear();
        tracing::debug!("Detached from {}", self.database);
        Ok(())
    }

    pub fn drop_database(&mut self) -> Result<(), ClientError> {
        let id = self.handle.get()?;
        self.port.call(Packet::DropDatabase(ObjectRef::new(id)))?;
        self.handle.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::tests::Script;
    use relwire_protocol::packet::{ptype, Response};

    #[test]
    fn test_attach_sends_user() {
        let script = Script::new();
        let port = script.port(ptype::SYNC);
        script.reply(Packet::Response(Response::with_object(3)));
        let attachment = Attachment::attach(&port, "main").unwrap();
        assert_eq!(attachment.id().unwrap(), 3);

        let sent = script.sent();
        let Packet::Attach(req) = &sent[0] else {
            panic!("expected Attach, got {:?}", sent[0]);
        };
        assert_eq!(req.database, "main");
        let params = ParamBlock::parse(&req.dpb).unwrap();
        assert_eq!(params.get_str(dpb::USER_NAME).as_deref(), Some("ALICE"));
    }

    #[test]
    fn test_detach_releases_handle() {
        let script = Script::new();
        let port = script.port(ptype::SYNC);
        script.reply(Packet::Response(Response::with_object(1)));
        let mut attachment = Attachment::attach(&port, "main").unwrap();
        script.reply(Packet::Response(Response::ok()));
        attachment.detach().unwrap();
        assert!(matches!(attachment.detach(), Err(ClientError::Released("attachment"))));
        assert!(matches!(
            attachment.start_transaction(),
            Err(ClientError::Released("attachment"))
        ));
    }

    #[test]
    fn test_execute_immediate_reads_row() {
        let script = Script::new();
        let port = script.port(ptype::SYNC);
        script.reply(Packet::Response(Response::with_object(1)));
        let attachment = Attachment::attach(&port, "main").unwrap();

        let format = MessageFormat::new(vec![relwire_protocol::Field::new(
            "N",
            relwire_protocol::FieldType::Integer,
        )]);
        script.reply(Packet::SqlResponse(SqlResponse {
            message: Some(format.encode_row(&[Value::Integer(5)]).unwrap()),
        }));
        script.reply(Packet::Response(Response {
            blob_id: 1,
            ..Response::default()
        }));
        let (affected, row) = attachment
            .execute_immediate_with(None, "SELECT COUNT(*) FROM T", None, Some(&format))
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(row, Some(vec![Value::Integer(5)]));
    }
}
