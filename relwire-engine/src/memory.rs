//! In-process reference engine.
//!
//! Databases live in memory for the life of the process. Writes are buffered
//! per transaction and applied atomically on commit; readers inside a
//! transaction see committed rows plus their own pending writes.

use crate::api::{
    AttachParams, CancelToken, Engine, EngineAttachment, EngineBlob, EngineRequest,
    EngineService, EngineStatement, EngineTransaction, EventCallback, ExecOutcome,
};
use crate::blob::MemoryBlob;
use crate::database::{Database, Table};
use crate::error::EngineError;
use crate::request::MemoryRequest;
use crate::service::MemoryService;
use crate::statement::{value_matches, MemoryStatement};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use relwire_protocol::info::{items, InfoWriter};
use relwire_protocol::packet::EventCount;
use relwire_protocol::pblock::{bpb, tpb};
use relwire_protocol::{ParamBlock, Value};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) type Registry = Arc<DashMap<String, Arc<Database>>>;

/// Engine version reported through info and service queries.
pub const ENGINE_VERSION: &str = concat!("relwire-memory ", env!("CARGO_PKG_VERSION"));

/// The in-memory engine.
pub struct MemoryEngine {
    databases: Registry,
    next_attachment: AtomicU64,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            databases: Arc::new(DashMap::new()),
            next_attachment: AtomicU64::new(0),
        }
    }

    /// Pre-creates an empty database.
    pub fn with_database(self, name: &str) -> Self {
        self.databases
            .insert(name.to_string(), Arc::new(Database::new(name)));
        self
    }

    /// Pre-creates a database that only attaches when the client supplies `key`.
    pub fn with_keyed_database(self, name: &str, key: impl Into<Bytes>) -> Self {
        self.databases.insert(
            name.to_string(),
            Arc::new(Database::new(name).with_key(key)),
        );
        self
    }

    pub fn database(&self, name: &str) -> Option<Arc<Database>> {
        self.databases.get(name).map(|db| db.clone())
    }

    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn open(&self, db: Arc<Database>, params: &AttachParams) -> Arc<dyn EngineAttachment> {
        let id = self.next_attachment.fetch_add(1, Ordering::Relaxed) + 1;
        db.attachments.lock().insert(id, params.user.clone());
        tracing::debug!("attachment {} opened on {} by {}", id, db.name, params.user);
        Arc::new(MemoryAttachment {
            id,
            db,
            registry: self.databases.clone(),
            active_transactions: Arc::new(AtomicU64::new(0)),
            detached: AtomicBool::new(false),
        })
    }
}

impl Engine for MemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    fn version(&self) -> &str {
        ENGINE_VERSION
    }

    fn requires_key(&self, database: &str) -> bool {
        self.databases
            .get(database)
            .map(|db| db.key.is_some())
            .unwrap_or(false)
    }

    fn attach(
        &self,
        database: &str,
        params: &AttachParams,
    ) -> Result<Arc<dyn EngineAttachment>, EngineError> {
        let db = self
            .database(database)
            .ok_or_else(|| EngineError::DatabaseNotFound {
                name: database.to_string(),
            })?;
        if let Some(key) = &db.key {
            if params.crypt_key.as_ref() != Some(key) {
                return Err(EngineError::KeyRequired {
                    name: database.to_string(),
                });
            }
        }
        Ok(self.open(db, params))
    }

    fn create(
        &self,
        database: &str,
        params: &AttachParams,
    ) -> Result<Arc<dyn EngineAttachment>, EngineError> {
        let db = match self.databases.entry(database.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EngineError::DatabaseExists {
                    name: database.to_string(),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let db = Arc::new(Database::new(database));
                slot.insert(db.clone());
                db
            }
        };
        tracing::info!("created database {}", database);
        Ok(self.open(db, params))
    }

    fn service_attach(
        &self,
        service: &str,
        params: &AttachParams,
    ) -> Result<Arc<dyn EngineService>, EngineError> {
        if service != "service_mgr" {
            return Err(EngineError::DatabaseNotFound {
                name: service.to_string(),
            });
        }
        Ok(Arc::new(MemoryService::new(
            self.databases.clone(),
            params.user.clone(),
        )))
    }
}

/// One attachment to a database.
pub struct MemoryAttachment {
    id: u64,
    db: Arc<Database>,
    registry: Registry,
    active_transactions: Arc<AtomicU64>,
    detached: AtomicBool,
}

impl MemoryAttachment {
    fn check_live(&self) -> Result<(), EngineError> {
        if self.detached.load(Ordering::Acquire) {
            return Err(EngineError::DatabaseNotFound {
                name: self.db.name.clone(),
            });
        }
        Ok(())
    }

    fn memory_transaction<'a>(
        &self,
        transaction: &'a Arc<dyn EngineTransaction>,
    ) -> Result<&'a MemoryTransaction, EngineError> {
        let txn = MemoryTransaction::downcast(transaction)?;
        if !Arc::ptr_eq(&txn.db, &self.db) {
            return Err(EngineError::ForeignTransaction);
        }
        Ok(txn)
    }
}

impl EngineAttachment for MemoryAttachment {
    fn id(&self) -> u64 {
        self.id
    }

    fn database(&self) -> &str {
        &self.db.name
    }

    fn start_transaction(&self, params: &ParamBlock) -> Result<Arc<dyn EngineTransaction>, EngineError> {
        self.check_live()?;
        let isolation = if params.has(tpb::READ_COMMITTED) {
            tpb::READ_COMMITTED
        } else if params.has(tpb::CONSISTENCY) {
            tpb::CONSISTENCY
        } else {
            tpb::CONCURRENCY
        };
        let read_only = params.has(tpb::READ) && !params.has(tpb::WRITE);
        self.active_transactions.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(MemoryTransaction {
            id: self.db.allocate_transaction_id(),
            db: self.db.clone(),
            isolation,
            read_only,
            active_counter: self.active_transactions.clone(),
            state: Mutex::new(TxnState::default()),
        }))
    }

    fn prepare_statement(
        &self,
        _transaction: Option<&Arc<dyn EngineTransaction>>,
        sql: &str,
        _dialect: u32,
    ) -> Result<Arc<dyn EngineStatement>, EngineError> {
        self.check_live()?;
        Ok(Arc::new(MemoryStatement::prepare(self.db.clone(), sql)?))
    }

    fn execute_immediate(
        &self,
        transaction: Option<&Arc<dyn EngineTransaction>>,
        sql: &str,
        input: &[Value],
        cancel: &CancelToken,
    ) -> Result<ExecOutcome, EngineError> {
        self.check_live()?;
        let statement = MemoryStatement::prepare(self.db.clone(), sql)?;
        match transaction {
            Some(txn) => {
                self.memory_transaction(txn)?;
                statement.execute(txn, input, cancel)
            }
            None => {
                // Autocommit
                let txn = self.start_transaction(&ParamBlock::new())?;
                match statement.execute(&txn, input, cancel) {
                    Ok(outcome) => {
                        txn.commit()?;
                        Ok(outcome)
                    }
                    Err(e) => {
                        txn.rollback()?;
                        Err(e)
                    }
                }
            }
        }
    }

    fn open_blob(
        &self,
        transaction: &Arc<dyn EngineTransaction>,
        blob_id: u64,
        _bpb: &ParamBlock,
    ) -> Result<Arc<dyn EngineBlob>, EngineError> {
        self.check_live()?;
        self.memory_transaction(transaction)?.check_active()?;
        let stored = self.db.blob(blob_id)?;
        Ok(Arc::new(MemoryBlob::open(blob_id, stored)))
    }

    fn create_blob(
        &self,
        transaction: &Arc<dyn EngineTransaction>,
        params: &ParamBlock,
    ) -> Result<Arc<dyn EngineBlob>, EngineError> {
        self.check_live()?;
        self.memory_transaction(transaction)?.check_active()?;
        let stream = match params.get_u32(bpb::TYPE) {
            None => false,
            Some(t) if t == u32::from(bpb::TYPE_SEGMENTED) => false,
            Some(t) if t == u32::from(bpb::TYPE_STREAM) => true,
            Some(other) => {
                return Err(EngineError::BadBpb {
                    reason: format!("unknown blob type {}", other),
                })
            }
        };
        let id = self.db.allocate_blob_id();
        Ok(Arc::new(MemoryBlob::create(id, stream, self.db.clone())))
    }

    fn compile_request(&self, blr: &[u8]) -> Result<Arc<dyn EngineRequest>, EngineError> {
        self.check_live()?;
        Ok(Arc::new(MemoryRequest::compile(blr)?))
    }

    fn que_events(
        &self,
        events: &[EventCount],
        callback: EventCallback,
    ) -> Result<u64, EngineError> {
        self.check_live()?;
        if events.is_empty() {
            return Err(EngineError::syntax("empty event list"));
        }
        Ok(self.db.events.subscribe(self.id, events, callback))
    }

    fn cancel_events(&self, subscription: u64) -> Result<(), EngineError> {
        self.db.events.cancel(subscription);
        Ok(())
    }

    fn info(&self, item: u8, writer: &mut InfoWriter) -> Result<bool, EngineError> {
        match item {
            items::DB_ID => writer.push_str(item, &self.db.name),
            items::DB_SERVER_VERSION => writer.push_str(item, ENGINE_VERSION),
            items::DB_ATTACHMENT_ID => writer.push_i64(item, self.id as i64),
            items::DB_ACTIVE_TRANSACTIONS => writer.push_u32(
                item,
                self.active_transactions.load(Ordering::Acquire) as u32,
            ),
            items::DB_CREATION_DATE => writer.push_i64(item, self.db.created.timestamp()),
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn drop_database(&self) -> Result<(), EngineError> {
        self.check_live()?;
        let others = self.db.attachments.lock().len();
        if others > 1 {
            return Err(EngineError::TransactionState {
                reason: format!("database {} has {} other attachments", self.db.name, others - 1),
            });
        }
        self.registry.remove(&self.db.name);
        self.detach()?;
        tracing::info!("dropped database {}", self.db.name);
        Ok(())
    }

    fn detach(&self) -> Result<(), EngineError> {
        if self.detached.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.db.attachments.lock().remove(&self.id);
        self.db.events.cancel_attachment(self.id);
        tracing::debug!("attachment {} detached from {}", self.id, self.db.name);
        Ok(())
    }
}

/// Buffered write.
#[derive(Debug, Clone)]
enum Write {
    Insert {
        table: String,
        row: Vec<Value>,
    },
    Delete {
        table: String,
        filter: Option<(usize, Value)>,
    },
}

impl Write {
    fn table(&self) -> &str {
        match self {
            Write::Insert { table, .. } | Write::Delete { table, .. } => table,
        }
    }
}

#[derive(Debug, Default)]
struct TxnState {
    finished: bool,
    prepared: bool,
    writes: Vec<Write>,
    events: Vec<String>,
    prepare_message: Option<Bytes>,
}

/// A transaction on one database.
pub struct MemoryTransaction {
    id: u64,
    pub(crate) db: Arc<Database>,
    isolation: u8,
    read_only: bool,
    active_counter: Arc<AtomicU64>,
    state: Mutex<TxnState>,
}

fn apply_write(table: &mut Table, write: &Write) -> Result<u64, EngineError> {
    match write {
        Write::Insert { row, .. } => {
            if let Some(pk) = table.primary_key() {
                if table.rows.iter().any(|r| value_matches(&r[pk], &row[pk])) {
                    return Err(EngineError::UniqueViolation {
                        table: table.name.clone(),
                        key: format!("{:?}", row[pk]),
                    });
                }
            }
            table.rows.push(row.clone());
            Ok(1)
        }
        Write::Delete { filter, .. } => {
            let before = table.rows.len();
            match filter {
                None => table.rows.clear(),
                Some((col, value)) => table.rows.retain(|r| !value_matches(&r[*col], value)),
            }
            Ok((before - table.rows.len()) as u64)
        }
    }
}

impl MemoryTransaction {
    pub(crate) fn downcast(
        transaction: &Arc<dyn EngineTransaction>,
    ) -> Result<&MemoryTransaction, EngineError> {
        transaction
            .as_any()
            .downcast_ref::<MemoryTransaction>()
            .ok_or(EngineError::ForeignTransaction)
    }

    pub(crate) fn check_active(&self) -> Result<(), EngineError> {
        if self.state.lock().finished {
            return Err(EngineError::TransactionState {
                reason: format!("transaction {} is not active", self.id),
            });
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), EngineError> {
        self.check_active()?;
        if self.read_only {
            return Err(EngineError::TransactionState {
                reason: "attempted update during read-only transaction".to_string(),
            });
        }
        Ok(())
    }

    /// Committed rows of `table` with this transaction's pending writes replayed.
    pub(crate) fn visible(&self, table: &str) -> Result<Table, EngineError> {
        let mut snapshot = self
            .db
            .tables
            .read()
            .get(table)
            .cloned()
            .ok_or_else(|| EngineError::TableNotFound {
                table: table.to_string(),
            })?;
        let state = self.state.lock();
        for write in state.writes.iter().filter(|w| w.table() == table) {
            apply_write(&mut snapshot, write)?;
        }
        Ok(snapshot)
    }

    pub(crate) fn insert(&self, table: &str, row: Vec<Value>) -> Result<u64, EngineError> {
        self.check_writable()?;
        let write = Write::Insert {
            table: table.to_string(),
            row,
        };
        // Validate against what this transaction currently sees.
        let mut snapshot = self.visible(table)?;
        apply_write(&mut snapshot, &write)?;
        self.state.lock().writes.push(write);
        Ok(1)
    }

    pub(crate) fn delete(
        &self,
        table: &str,
        filter: Option<(usize, Value)>,
    ) -> Result<u64, EngineError> {
        self.check_writable()?;
        let write = Write::Delete {
            table: table.to_string(),
            filter,
        };
        let mut snapshot = self.visible(table)?;
        let affected = apply_write(&mut snapshot, &write)?;
        self.state.lock().writes.push(write);
        Ok(affected)
    }

    pub(crate) fn post_event(&self, name: &str) -> Result<(), EngineError> {
        self.check_active()?;
        self.state.lock().events.push(name.to_string());
        Ok(())
    }

    /// Applies pending writes to the database. Nothing is applied on error.
    fn apply(&self) -> Result<Vec<String>, EngineError> {
        let mut state = self.state.lock();
        if state.finished {
            return Err(EngineError::TransactionState {
                reason: format!("transaction {} is not active", self.id),
            });
        }
        {
            let mut tables = self.db.tables.write();
            let mut staged: HashMap<String, Table> = HashMap::new();
            for write in &state.writes {
                let name = write.table();
                if !staged.contains_key(name) {
                    let current = tables
                        .get(name)
                        .cloned()
                        .ok_or_else(|| EngineError::TableNotFound {
                            table: name.to_string(),
                        })?;
                    staged.insert(name.to_string(), current);
                }
                if let Some(table) = staged.get_mut(name) {
                    apply_write(table, write)?;
                }
            }
            for (name, table) in staged {
                tables.insert(name, table);
            }
        }
        state.writes.clear();
        Ok(std::mem::take(&mut state.events))
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        if !state.finished {
            state.finished = true;
            self.active_counter.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn pending_writes(&self) -> usize {
        self.state.lock().writes.len()
    }
}

impl EngineTransaction for MemoryTransaction {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_active(&self) -> bool {
        !self.state.lock().finished
    }

    fn commit(&self) -> Result<(), EngineError> {
        let events = self.apply()?;
        self.finish();
        self.db.events.post(&events);
        Ok(())
    }

    fn commit_retaining(&self) -> Result<(), EngineError> {
        let events = self.apply()?;
        self.db.events.post(&events);
        Ok(())
    }

    fn rollback(&self) -> Result<(), EngineError> {
        self.check_active()?;
        {
            let mut state = self.state.lock();
            state.writes.clear();
            state.events.clear();
        }
        self.finish();
        Ok(())
    }

    fn rollback_retaining(&self) -> Result<(), EngineError> {
        self.check_active()?;
        let mut state = self.state.lock();
        state.writes.clear();
        state.events.clear();
        Ok(())
    }

    fn prepare(&self, message: &[u8]) -> Result<(), EngineError> {
        self.check_active()?;
        let mut state = self.state.lock();
        if state.prepared {
            return Err(EngineError::TransactionState {
                reason: format!("transaction {} is already prepared", self.id),
            });
        }
        state.prepared = true;
        if !message.is_empty() {
            state.prepare_message = Some(Bytes::copy_from_slice(message));
        }
        Ok(())
    }

    fn info(&self, item: u8, writer: &mut InfoWriter) -> Result<bool, EngineError> {
        match item {
            items::TRA_ID => writer.push_i64(item, self.id as i64),
            items::TRA_ISOLATION => writer.push(item, &[self.isolation]),
            items::TRA_ACCESS => writer.push(
                item,
                &[if self.read_only { tpb::READ } else { tpb::WRITE }],
            ),
            items::TRA_PENDING_WRITES => writer.push_u32(item, self.pending_writes() as u32),
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        // An abandoned transaction behaves as rolled back.
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relwire_protocol::info::InfoResponse;
    use std::sync::mpsc;

    fn setup() -> (MemoryEngine, Arc<dyn EngineAttachment>) {
        let engine = MemoryEngine::new().with_database("mydb");
        let att = engine.attach("mydb", &AttachParams::default()).unwrap();
        att.execute_immediate(
            None,
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, name VARCHAR(20))",
            &[],
            &CancelToken::new(),
        )
        .unwrap();
        (engine, att)
    }

    fn insert(att: &Arc<dyn EngineAttachment>, txn: &Arc<dyn EngineTransaction>, id: i32) -> Result<ExecOutcome, EngineError> {
        att.execute_immediate(
            Some(txn),
            "INSERT INTO orders VALUES (?, ?)",
            &[Value::Integer(id), Value::Text(format!("order {}", id))],
            &CancelToken::new(),
        )
    }

    fn count(att: &Arc<dyn EngineAttachment>, txn: Option<&Arc<dyn EngineTransaction>>) -> i64 {
        let outcome = att
            .execute_immediate(txn, "SELECT COUNT(*) FROM orders", &[], &CancelToken::new())
            .unwrap();
        outcome.row.unwrap()[0].as_i64().unwrap()
    }

    #[test]
    fn test_attach_unknown_database() {
        let engine = MemoryEngine::new();
        assert!(matches!(
            engine.attach("nope", &AttachParams::default()),
            Err(EngineError::DatabaseNotFound { .. })
        ));
    }

    #[test]
    fn test_create_twice() {
        let engine = MemoryEngine::new();
        engine.create("fresh", &AttachParams::default()).unwrap();
        assert!(matches!(
            engine.create("fresh", &AttachParams::default()),
            Err(EngineError::DatabaseExists { .. })
        ));
        assert_eq!(engine.database_names(), vec!["fresh".to_string()]);
    }

    #[test]
    fn test_keyed_database() {
        let engine = MemoryEngine::new().with_keyed_database("secure", Bytes::from_static(b"k1"));
        assert!(engine.requires_key("secure"));
        assert!(!engine.requires_key("other"));
        assert!(matches!(
            engine.attach("secure", &AttachParams::default()),
            Err(EngineError::KeyRequired { .. })
        ));
        let params = AttachParams {
            crypt_key: Some(Bytes::from_static(b"k1")),
            ..AttachParams::default()
        };
        assert!(engine.attach("secure", &params).is_ok());
    }

    #[test]
    fn test_writes_visible_after_commit() {
        let (_engine, att) = setup();
        let txn = att.start_transaction(&ParamBlock::new()).unwrap();
        insert(&att, &txn, 1).unwrap();
        insert(&att, &txn, 2).unwrap();

        assert_eq!(count(&att, Some(&txn)), 2);
        assert_eq!(count(&att, None), 0);

        txn.commit().unwrap();
        assert!(!txn.is_active());
        assert_eq!(count(&att, None), 2);
        assert!(txn.commit().is_err());
    }

    #[test]
    fn test_rollback_discards() {
        let (_engine, att) = setup();
        let txn = att.start_transaction(&ParamBlock::new()).unwrap();
        insert(&att, &txn, 1).unwrap();
        txn.rollback().unwrap();
        assert_eq!(count(&att, None), 0);
    }

    #[test]
    fn test_primary_key_violation() {
        let (_engine, att) = setup();
        let txn = att.start_transaction(&ParamBlock::new()).unwrap();
        insert(&att, &txn, 1).unwrap();
        let err = insert(&att, &txn, 1).unwrap_err();
        assert!(matches!(err, EngineError::UniqueViolation { .. }));
        // The transaction stays usable.
        insert(&att, &txn, 2).unwrap();
        txn.commit().unwrap();
        assert_eq!(count(&att, None), 2);
    }

    #[test]
    fn test_conflicting_commits() {
        let (_engine, att) = setup();
        let a = att.start_transaction(&ParamBlock::new()).unwrap();
        let b = att.start_transaction(&ParamBlock::new()).unwrap();
        insert(&att, &a, 5).unwrap();
        insert(&att, &b, 5).unwrap();
        a.commit().unwrap();
        assert!(matches!(b.commit(), Err(EngineError::UniqueViolation { .. })));
        assert!(b.is_active());
        b.rollback().unwrap();
    }

    #[test]
    fn test_read_only_transaction() {
        let (_engine, att) = setup();
        let txn = att
            .start_transaction(&ParamBlock::new().with_flag(tpb::READ))
            .unwrap();
        assert!(matches!(
            insert(&att, &txn, 1),
            Err(EngineError::TransactionState { .. })
        ));
    }

    #[test]
    fn test_events_delivered_on_commit() {
        let (_engine, att) = setup();
        let (tx, rx) = mpsc::channel();
        att.que_events(
            &[EventCount {
                name: "placed".into(),
                count: 0,
            }],
            Box::new(move |counts| tx.send(counts).unwrap()),
        )
        .unwrap();

        let txn = att.start_transaction(&ParamBlock::new()).unwrap();
        att.execute_immediate(Some(&txn), "POST_EVENT 'placed'", &[], &CancelToken::new())
            .unwrap();
        assert!(rx.try_recv().is_err());
        txn.commit().unwrap();
        let counts = rx.try_recv().unwrap();
        assert_eq!(counts[0].count, 1);
    }

    #[test]
    fn test_transaction_info() {
        let (_engine, att) = setup();
        let txn = att.start_transaction(&ParamBlock::new()).unwrap();
        insert(&att, &txn, 1).unwrap();

        let mut writer = InfoWriter::new(128);
        for item in [items::TRA_ID, items::TRA_PENDING_WRITES] {
            assert!(txn.info(item, &mut writer).unwrap());
        }
        assert!(!txn.info(200, &mut writer).unwrap());
        let info = InfoResponse::parse(&writer.finish()).unwrap();
        assert_eq!(info.get(items::TRA_PENDING_WRITES).unwrap().as_u32(), Some(1));

        let mut writer = InfoWriter::new(64);
        att.info(items::DB_ACTIVE_TRANSACTIONS, &mut writer).unwrap();
        let info = InfoResponse::parse(&writer.finish()).unwrap();
        assert_eq!(info.get(items::DB_ACTIVE_TRANSACTIONS).unwrap().as_u32(), Some(1));
    }

    #[test]
    fn test_drop_database() {
        let (engine, att) = setup();
        att.drop_database().unwrap();
        assert!(engine.database("mydb").is_none());
        assert!(att.start_transaction(&ParamBlock::new()).is_err());
    }
}
