//! Prepared statements and cursors of the in-memory engine.

use crate::api::{
    CancelToken, EngineCursor, EngineStatement, EngineTransaction, ExecOutcome, StatementType,
};
use crate::database::{Database, Table};
use crate::error::EngineError;
use crate::memory::MemoryTransaction;
use crate::sql::{self, ColumnDef, Command, Expr, Filter};
use parking_lot::Mutex;
use relwire_protocol::format::Field;
use relwire_protocol::info::{items, InfoWriter};
use relwire_protocol::{FetchOp, FieldType, MessageFormat, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DELAY_STEP: Duration = Duration::from_millis(10);

/// Equality used for filters and key checks. Integers compare across widths.
pub(crate) fn value_matches(a: &Value, b: &Value) -> bool {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Converts a supplied value to the column's type.
fn coerce(value: Value, column: &ColumnDef) -> Result<Value, EngineError> {
    let mismatch = |v: &Value| {
        EngineError::syntax(format!(
            "value {:?} does not fit column {} of type {:?}",
            v, column.name, column.field_type
        ))
    };
    match (&column.field_type, value) {
        (_, Value::Null) if column.nullable => Ok(Value::Null),
        (_, Value::Null) => Err(EngineError::syntax(format!(
            "column {} does not accept NULL",
            column.name
        ))),
        (FieldType::Integer, Value::Integer(v)) => Ok(Value::Integer(v)),
        (FieldType::Integer, Value::BigInt(v)) => i32::try_from(v)
            .map(Value::Integer)
            .map_err(|_| mismatch(&Value::BigInt(v))),
        (FieldType::BigInt, Value::Integer(v)) => Ok(Value::BigInt(i64::from(v))),
        (FieldType::BigInt, Value::BigInt(v)) => Ok(Value::BigInt(v)),
        (FieldType::Double, Value::Double(v)) => Ok(Value::Double(v)),
        (FieldType::Double, Value::Integer(v)) => Ok(Value::Double(f64::from(v))),
        (FieldType::Double, Value::BigInt(v)) => Ok(Value::Double(v as f64)),
        (FieldType::Varchar(max), Value::Text(s)) => {
            if s.len() > *max as usize {
                Err(EngineError::syntax(format!(
                    "string of {} bytes exceeds VARCHAR({}) column {}",
                    s.len(),
                    max,
                    column.name
                )))
            } else {
                Ok(Value::Text(s))
            }
        }
        (FieldType::Blob, Value::Blob(id)) => Ok(Value::Blob(id)),
        (_, other) => Err(mismatch(&other)),
    }
}

fn field_of(column: &ColumnDef) -> Field {
    Field {
        name: column.name.clone(),
        field_type: column.field_type,
        nullable: column.nullable,
    }
}

/// Resolves the statement's expressions to values, consuming `input` in order.
struct Params<'a> {
    input: &'a [Value],
    next: usize,
}

impl<'a> Params<'a> {
    fn new(input: &'a [Value], expected: usize) -> Result<Self, EngineError> {
        if input.len() != expected {
            return Err(EngineError::syntax(format!(
                "expected {} parameters, got {}",
                expected,
                input.len()
            )));
        }
        Ok(Self { input, next: 0 })
    }

    fn resolve(&mut self, expr: &Expr) -> Value {
        match expr {
            Expr::Literal(v) => v.clone(),
            Expr::Param => {
                let v = self.input.get(self.next).cloned().unwrap_or(Value::Null);
                self.next += 1;
                v
            }
        }
    }
}

/// Table schema captured at prepare time.
#[derive(Debug, Clone)]
struct Shape {
    columns: Vec<ColumnDef>,
}

impl Shape {
    fn of(db: &Database, table: &str) -> Result<Self, EngineError> {
        let tables = db.tables.read();
        let t = tables.get(table).ok_or_else(|| EngineError::TableNotFound {
            table: table.to_string(),
        })?;
        Ok(Self {
            columns: t.columns.clone(),
        })
    }

    fn index(&self, name: &str) -> Result<usize, EngineError> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| EngineError::ColumnNotFound {
                column: name.to_string(),
            })
    }
}

/// A prepared statement.
pub struct MemoryStatement {
    db: Arc<Database>,
    command: Command,
    shape: Option<Shape>,
    input_format: MessageFormat,
    output_format: MessageFormat,
    cursor_name: Mutex<Option<String>>,
    records: AtomicU64,
}

impl MemoryStatement {
    pub fn prepare(db: Arc<Database>, text: &str) -> Result<Self, EngineError> {
        let command = sql::parse(text)?;
        let shape = match &command {
            Command::Insert { table, .. }
            | Command::Select { table, .. }
            | Command::SelectCount { table, .. }
            | Command::Delete { table, .. } => Some(Shape::of(&db, table)?),
            _ => None,
        };

        let filter_input = |filter: &Option<Filter>, shape: &Shape| -> Result<Vec<Field>, EngineError> {
            match filter {
                Some(f) => {
                    let column = &shape.columns[shape.index(&f.column)?];
                    Ok(match f.value {
                        Expr::Param => vec![field_of(column)],
                        Expr::Literal(_) => Vec::new(),
                    })
                }
                None => Ok(Vec::new()),
            }
        };

        let (input, output) = match (&command, &shape) {
            (Command::Insert { columns, values, .. }, Some(shape)) => {
                let targets = Self::insert_targets(shape, columns.as_deref(), values.len())?;
                let input = targets
                    .iter()
                    .zip(values)
                    .filter(|(_, e)| **e == Expr::Param)
                    .map(|(idx, _)| field_of(&shape.columns[*idx]))
                    .collect();
                (input, Vec::new())
            }
            (Command::Select { filter, .. }, Some(shape)) => (
                filter_input(filter, shape)?,
                shape.columns.iter().map(field_of).collect(),
            ),
            (Command::SelectCount { filter, .. }, Some(shape)) => (
                filter_input(filter, shape)?,
                vec![Field::new("COUNT", FieldType::BigInt).not_null()],
            ),
            (Command::Delete { filter, .. }, Some(shape)) => {
                (filter_input(filter, shape)?, Vec::new())
            }
            _ => (Vec::new(), Vec::new()),
        };

        Ok(Self {
            db,
            command,
            shape,
            input_format: MessageFormat::new(input),
            output_format: MessageFormat::new(output),
            cursor_name: Mutex::new(None),
            records: AtomicU64::new(0),
        })
    }

    fn insert_targets(
        shape: &Shape,
        columns: Option<&[String]>,
        value_count: usize,
    ) -> Result<Vec<usize>, EngineError> {
        let targets: Vec<usize> = match columns {
            Some(names) => names
                .iter()
                .map(|n| shape.index(n))
                .collect::<Result<_, _>>()?,
            None => (0..shape.columns.len()).collect(),
        };
        if targets.len() != value_count {
            return Err(EngineError::syntax(format!(
                "{} columns but {} values",
                targets.len(),
                value_count
            )));
        }
        Ok(targets)
    }

    fn transaction<'a>(
        &self,
        transaction: &'a Arc<dyn EngineTransaction>,
    ) -> Result<&'a MemoryTransaction, EngineError> {
        let txn = MemoryTransaction::downcast(transaction)?;
        if !Arc::ptr_eq(&txn.db, &self.db) {
            return Err(EngineError::ForeignTransaction);
        }
        txn.check_active()?;
        Ok(txn)
    }

    fn shape(&self) -> Result<&Shape, EngineError> {
        self.shape
            .as_ref()
            .ok_or_else(|| EngineError::Internal("statement has no table".to_string()))
    }

    fn resolve_filter(
        &self,
        filter: &Option<Filter>,
        params: &mut Params<'_>,
    ) -> Result<Option<(usize, Value)>, EngineError> {
        match filter {
            Some(f) => {
                let idx = self.shape()?.index(&f.column)?;
                Ok(Some((idx, params.resolve(&f.value))))
            }
            None => Ok(None),
        }
    }

    fn matching_rows(
        &self,
        txn: &MemoryTransaction,
        table: &str,
        filter: &Option<Filter>,
        input: &[Value],
        cancel: &CancelToken,
    ) -> Result<Vec<Vec<Value>>, EngineError> {
        let mut params = Params::new(input, self.command.param_count())?;
        let predicate = self.resolve_filter(filter, &mut params)?;
        let snapshot: Table = txn.visible(table)?;
        let mut rows = Vec::new();
        for (i, row) in snapshot.rows.into_iter().enumerate() {
            if i % 1024 == 0 {
                cancel.check()?;
            }
            let keep = match &predicate {
                Some((col, value)) => row.get(*col).map(|v| value_matches(v, value)).unwrap_or(false),
                None => true,
            };
            if keep {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn delay(millis: u64, cancel: &CancelToken) -> Result<(), EngineError> {
        let deadline = Instant::now() + Duration::from_millis(millis);
        loop {
            cancel.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(DELAY_STEP.min(deadline - now));
        }
    }
}

impl EngineStatement for MemoryStatement {
    fn statement_type(&self) -> StatementType {
        match self.command {
            Command::Select { .. } | Command::SelectCount { .. } => StatementType::Select,
            Command::Insert { .. } => StatementType::Insert,
            Command::Delete { .. } => StatementType::Delete,
            Command::CreateTable { .. } | Command::DropTable { .. } => StatementType::Ddl,
            Command::PostEvent { .. } | Command::Delay { .. } => StatementType::ExecProcedure,
        }
    }

    fn input_format(&self) -> MessageFormat {
        self.input_format.clone()
    }

    fn output_format(&self) -> MessageFormat {
        self.output_format.clone()
    }

    fn execute(
        &self,
        transaction: &Arc<dyn EngineTransaction>,
        input: &[Value],
        cancel: &CancelToken,
    ) -> Result<ExecOutcome, EngineError> {
        cancel.check()?;
        let txn = self.transaction(transaction)?;
        let outcome = match &self.command {
            Command::CreateTable { table, columns } => {
                let mut tables = self.db.tables.write();
                if tables.contains_key(table) {
                    return Err(EngineError::TableExists {
                        table: table.clone(),
                    });
                }
                tables.insert(table.clone(), Table::new(table.clone(), columns.clone()));
                tracing::debug!("created table {} in {}", table, self.db.name);
                ExecOutcome::default()
            }
            Command::DropTable { table } => {
                if self.db.tables.write().remove(table).is_none() {
                    return Err(EngineError::TableNotFound {
                        table: table.clone(),
                    });
                }
                ExecOutcome::default()
            }
            Command::Insert {
                table,
                columns,
                values,
            } => {
                let shape = self.shape()?;
                let targets = Self::insert_targets(shape, columns.as_deref(), values.len())?;
                let mut params = Params::new(input, self.command.param_count())?;
                let mut row = vec![Value::Null; shape.columns.len()];
                for (idx, expr) in targets.iter().zip(values) {
                    row[*idx] = params.resolve(expr);
                }
                let row = row
                    .into_iter()
                    .zip(&shape.columns)
                    .map(|(v, c)| coerce(v, c))
                    .collect::<Result<Vec<_>, _>>()?;
                ExecOutcome {
                    row: None,
                    affected: txn.insert(table, row)?,
                }
            }
            Command::Select { table, filter } => {
                let rows = self.matching_rows(txn, table, filter, input, cancel)?;
                ExecOutcome {
                    row: rows.into_iter().next(),
                    affected: 0,
                }
            }
            Command::SelectCount { table, filter } => {
                let rows = self.matching_rows(txn, table, filter, input, cancel)?;
                ExecOutcome {
                    row: Some(vec![Value::BigInt(rows.len() as i64)]),
                    affected: 0,
                }
            }
            Command::Delete { table, filter } => {
                let mut params = Params::new(input, self.command.param_count())?;
                let predicate = self.resolve_filter(filter, &mut params)?;
                ExecOutcome {
                    row: None,
                    affected: txn.delete(table, predicate)?,
                }
            }
            Command::PostEvent { name } => {
                txn.post_event(name)?;
                ExecOutcome::default()
            }
            Command::Delay { millis } => {
                Self::delay(*millis, cancel)?;
                ExecOutcome::default()
            }
        };
        self.records.store(outcome.affected, Ordering::Relaxed);
        Ok(outcome)
    }

    fn open_cursor(
        &self,
        transaction: &Arc<dyn EngineTransaction>,
        input: &[Value],
        scrollable: bool,
        cancel: &CancelToken,
    ) -> Result<Arc<dyn EngineCursor>, EngineError> {
        let txn = self.transaction(transaction)?;
        let rows = match &self.command {
            Command::Select { table, filter } => {
                self.matching_rows(txn, table, filter, input, cancel)?
            }
            Command::SelectCount { table, filter } => {
                let n = self.matching_rows(txn, table, filter, input, cancel)?.len();
                vec![vec![Value::BigInt(n as i64)]]
            }
            _ => return Err(EngineError::NoCursor),
        };
        Ok(Arc::new(MemoryCursor::new(rows, scrollable)))
    }

    fn set_cursor_name(&self, name: &str) -> Result<(), EngineError> {
        if !matches!(self.command, Command::Select { .. }) {
            return Err(EngineError::NoCursor);
        }
        *self.cursor_name.lock() = Some(name.to_string());
        Ok(())
    }

    fn cursor_name(&self) -> Option<String> {
        self.cursor_name.lock().clone()
    }

    fn info(&self, item: u8, writer: &mut InfoWriter) -> Result<bool, EngineError> {
        match item {
            items::SQL_STMT_TYPE => writer.push_u32(item, self.statement_type() as u32),
            items::SQL_RECORDS => writer.push_i64(item, self.records.load(Ordering::Relaxed) as i64),
            items::SQL_INPUT_FORMAT => writer.push(item, &self.input_format.to_bytes()?),
            items::SQL_OUTPUT_FORMAT => writer.push(item, &self.output_format.to_bytes()?),
            items::SQL_CURSOR_NAME => {
                let name = self.cursor_name().unwrap_or_default();
                writer.push_str(item, &name)
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn free(&self) -> Result<(), EngineError> {
        self.cursor_name.lock().take();
        self.records.store(0, Ordering::Relaxed);
        Ok(())
    }
}

/// Cursor over a snapshot taken when it was opened.
///
/// The position runs from -1 (before the first row) to `rows.len()` (after
/// the last). Moving off either end parks the cursor there.
pub struct MemoryCursor {
    rows: Vec<Vec<Value>>,
    scrollable: bool,
    position: Mutex<i64>,
    closed: AtomicBool,
}

impl MemoryCursor {
    pub fn new(rows: Vec<Vec<Value>>, scrollable: bool) -> Self {
        Self {
            rows,
            scrollable,
            position: Mutex::new(-1),
            closed: AtomicBool::new(false),
        }
    }

    fn target(&self, current: i64, op: FetchOp, position: i32) -> i64 {
        let n = self.rows.len() as i64;
        let pos = i64::from(position);
        let target = match op {
            FetchOp::Next => current + 1,
            FetchOp::Prior => current - 1,
            FetchOp::First => 0,
            FetchOp::Last => n - 1,
            FetchOp::Absolute if pos > 0 => pos - 1,
            FetchOp::Absolute if pos < 0 => n + pos,
            FetchOp::Absolute => -1,
            FetchOp::Relative => current + pos,
        };
        target.clamp(-1, n)
    }
}

impl EngineCursor for MemoryCursor {
    fn is_scrollable(&self) -> bool {
        self.scrollable
    }

    fn fetch(
        &self,
        op: FetchOp,
        position: i32,
        cancel: &CancelToken,
    ) -> Result<Option<Vec<Value>>, EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::NoCursor);
        }
        if !self.scrollable && op != FetchOp::Next {
            return Err(EngineError::NotScrollable);
        }
        cancel.check()?;
        let mut current = self.position.lock();
        let target = self.target(*current, op, position);
        *current = target;
        if target < 0 {
            return Ok(None);
        }
        Ok(self.rows.get(target as usize).cloned())
    }

    fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(EngineError::NoCursor);
        }
        Ok(())
    }
}
