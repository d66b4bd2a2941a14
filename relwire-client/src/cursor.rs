//! Client cursor over an open select.
//!
//! Rows are prefetched in batches that grow while the caller keeps moving
//! in one direction. The server cursor therefore runs ahead of what the
//! caller has seen; `lag` is that distance in rows (server position minus
//! logical position). Any move that does not continue the current
//! direction first reconciles the two with a relative fetch.

use crate::error::ClientError;
use crate::port::{expect_response, Port};
use crate::proxy::Handle;
use bytes::Bytes;
use relwire_protocol::packet::{
    fetch_status, Fetch, FetchOp, FetchResponse, FetchScroll, FreeOption, FreeStatement,
};
use relwire_protocol::{MessageFormat, Packet, Value};
use std::collections::VecDeque;
use std::sync::Arc;

/// Upper bound on rows requested by one prefetch.
pub const DEFAULT_MAX_BATCH: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

impl Direction {
    fn step(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }
}

/// Cursor opened by `Statement::open_cursor`.
#[derive(Debug)]
pub struct Cursor {
    port: Arc<Port>,
    handle: Handle,
    format: MessageFormat,
    scrollable: bool,
    buffer: VecDeque<Vec<Value>>,
    direction: Direction,
    lag: i64,
    batch: u32,
    max_batch: u32,
    /// The server reported the end in the current direction.
    exhausted: bool,
    bof: bool,
    eof: bool,
}

impl Cursor {
    pub(crate) fn new(port: &Arc<Port>, statement: u32, format: MessageFormat, scrollable: bool) -> Cursor {
        Cursor {
            port: port.clone(),
            handle: Handle::new("cursor", statement),
            format,
            scrollable,
            buffer: VecDeque::new(),
            direction: Direction::Forward,
            lag: 0,
            batch: 1,
            max_batch: DEFAULT_MAX_BATCH,
            exhausted: false,
            bof: true,
            eof: false,
        }
    }

    /// Caps the prefetch batch (at least one row).
    pub fn with_max_batch(mut self, rows: u32) -> Self {
        self.max_batch = rows.max(1);
        self
    }

    pub fn format(&self) -> &MessageFormat {
        &self.format
    }

    pub fn is_scrollable(&self) -> bool {
        self.scrollable
    }

    /// True after a move fell off the start.
    pub fn is_bof(&self) -> bool {
        self.bof
    }

    /// True after a move fell off the end.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Rows fetched but not yet returned.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn require_scrollable(&self) -> Result<(), ClientError> {
        if self.scrollable {
            Ok(())
        } else {
            Err(ClientError::usage("cursor is not scrollable"))
        }
    }

    fn fetch(&self, op: FetchOp, position: i32, count: u32) -> Result<FetchResponse, ClientError> {
        let statement = self.handle.get()?;
        let packet = if self.scrollable {
            Packet::FetchScroll(FetchScroll {
                statement,
                format: Bytes::new(),
                count,
                op,
                position,
            })
        } else {
            Packet::Fetch(Fetch {
                statement,
                format: Bytes::new(),
                count,
            })
        };
        self.port.transact(std::slice::from_ref(&packet), |replies| match replies.packet()? {
            Packet::FetchResponse(response) => Ok(response),
            other => {
                let opcode = other.opcode();
                expect_response(other)?;
                Err(ClientError::UnexpectedPacket(opcode))
            }
        })
    }

    fn decode(&self, row: &[u8]) -> Result<Vec<Value>, ClientError> {
        Ok(self.format.decode_row(row)?)
    }

    fn landed(&mut self, row: Option<Vec<Value>>, past_end: bool) -> Option<Vec<Value>> {
        match &row {
            Some(_) => {
                self.bof = false;
                self.eof = false;
            }
            None if past_end => {
                self.eof = true;
                self.bof = false;
            }
            None => {
                self.bof = true;
                self.eof = false;
            }
        }
        row
    }

    /// Clears prefetched rows after the server was repositioned.
    fn reset(&mut self, direction: Direction) {
        self.buffer.clear();
        self.lag = 0;
        self.batch = 1;
        self.exhausted = false;
        self.direction = direction;
    }

    /// One row in `direction`, using and refilling the prefetch buffer.
    fn step(&mut self, direction: Direction) -> Result<Option<Vec<Value>>, ClientError> {
        self.handle.get()?;
        if self.direction != direction {
            if !self.buffer.is_empty() || self.lag != 0 {
                // The server sits `lag` rows away from the caller.
                let position = i32::try_from(direction.step() - self.lag)
                    .map_err(|_| ClientError::usage("cursor moved too far to reposition"))?;
                let row = self.positioned(FetchOp::Relative, position)?;
                self.reset(direction);
                return Ok(self.landed(row, direction == Direction::Forward));
            }
            self.reset(direction);
        }

        let at_edge = match direction {
            Direction::Forward => self.eof,
            Direction::Backward => self.bof,
        };
        if at_edge && self.buffer.is_empty() {
            return Ok(None);
        }

        if self.buffer.is_empty() && !self.exhausted {
            let op = match direction {
                Direction::Forward => FetchOp::Next,
                Direction::Backward => FetchOp::Prior,
            };
            let response = self.fetch(op, 0, self.batch)?;
            let fetched = response.rows.len() as i64;
            for row in &response.rows {
                let row = self.decode(row)?;
                self.buffer.push_back(row);
            }
            self.lag += direction.step() * fetched;
            if response.status == fetch_status::NO_MORE_ROWS {
                // The server stepped onto the edge.
                self.lag += direction.step();
                self.exhausted = true;
            } else {
                self.batch = (self.batch * 2).min(self.max_batch);
            }
        }

        self.lag -= direction.step();
        let row = self.buffer.pop_front();
        Ok(self.landed(row, direction == Direction::Forward))
    }

    /// Single-row fetch at an explicit position; returns the row or None.
    fn positioned(&mut self, op: FetchOp, position: i32) -> Result<Option<Vec<Value>>, ClientError> {
        let response = self.fetch(op, position, 1)?;
        match response.rows.first() {
            Some(row) => Ok(Some(self.decode(row)?)),
            None => Ok(None),
        }
    }

    pub fn next(&mut self) -> Result<Option<Vec<Value>>, ClientError> {
        self.step(Direction::Forward)
    }

    pub fn prior(&mut self) -> Result<Option<Vec<Value>>, ClientError> {
        self.require_scrollable()?;
        self.step(Direction::Backward)
    }

    pub fn first(&mut self) -> Result<Option<Vec<Value>>, ClientError> {
        self.require_scrollable()?;
        let row = self.positioned(FetchOp::First, 0)?;
        self.reset(Direction::Forward);
        Ok(self.landed(row, true))
    }

    pub fn last(&mut self) -> Result<Option<Vec<Value>>, ClientError> {
        self.require_scrollable()?;
        let row = self.positioned(FetchOp::Last, 0)?;
        self.reset(Direction::Forward);
        Ok(self.landed(row, false))
    }

    /// Moves to a 1-based row; negative counts from the end.
    pub fn absolute(&mut self, position: i32) -> Result<Option<Vec<Value>>, ClientError> {
        self.require_scrollable()?;
        let row = self.positioned(FetchOp::Absolute, position)?;
        self.reset(Direction::Forward);
        Ok(self.landed(row, position > 0))
    }

    /// Moves `offset` rows from the row last returned.
    pub fn relative(&mut self, offset: i32) -> Result<Option<Vec<Value>>, ClientError> {
        self.require_scrollable()?;
        let lag = i32::try_from(self.lag)
            .map_err(|_| ClientError::usage("cursor moved too far to reposition"))?;
        let row = self.positioned(FetchOp::Relative, offset - lag)?;
        self.reset(Direction::Forward);
        if offset == 0 && row.is_none() {
            return Ok(None);
        }
        Ok(self.landed(row, offset > 0))
    }

    /// Reads every remaining row going forward.
    pub fn collect_rows(&mut self) -> Result<Vec<Vec<Value>>, ClientError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next()? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Closes the cursor; the statement stays prepared. Deferred in lazy
    /// mode.
    pub fn close(&mut self) -> Result<(), ClientError> {
        let statement = self.handle.get()?;
        self.handle.clear();
        self.buffer.clear();
        self.port.defer(Packet::FreeStatement(FreeStatement {
            statement,
            option: FreeOption::Close,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::tests::Script;
    use relwire_protocol::packet::{ptype, Response};
    use relwire_protocol::{Field, FieldType};

    fn format() -> MessageFormat {
        MessageFormat::new(vec![Field::new("ID", FieldType::Integer)])
    }

    fn rows(ids: &[i32], status: u32) -> Packet {
        let format = format();
        Packet::FetchResponse(FetchResponse {
            status,
            rows: ids
                .iter()
                .map(|id| format.encode_row(&[Value::Integer(*id)]).unwrap())
                .collect(),
        })
    }

    fn id(row: Option<Vec<Value>>) -> Option<i64> {
        row.map(|r| r[0].as_i64().unwrap())
    }

    fn scroll_ops(script: &Script) -> Vec<(FetchOp, i32, u32)> {
        script
            .sent()
            .into_iter()
            .filter_map(|p| match p {
                Packet::FetchScroll(f) => Some((f.op, f.position, f.count)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_prefetch_grows() {
        let script = Script::new();
        let port = script.port(ptype::SYNC);
        let mut cursor = Cursor::new(&port, 1, format(), true);
        script.reply(rows(&[1], fetch_status::OK));
        script.reply(rows(&[2, 3], fetch_status::OK));
        script.reply(rows(&[4], fetch_status::NO_MORE_ROWS));
        let all: Vec<i64> = cursor
            .collect_rows()
            .unwrap()
            .iter()
            .map(|r| r[0].as_i64().unwrap())
            .collect();
        assert_eq!(all, vec![1, 2, 3, 4]);
        assert!(cursor.is_eof());
        assert_eq!(
            scroll_ops(&script),
            vec![(FetchOp::Next, 0, 1), (FetchOp::Next, 0, 2), (FetchOp::Next, 0, 4)]
        );
        // sticky at the end
        assert_eq!(cursor.next().unwrap(), None);
        assert_eq!(scroll_ops(&script).len(), 3);
    }

    #[test]
    fn test_direction_change_corrects_lag() {
        let script = Script::new();
        let port = script.port(ptype::SYNC);
        let mut cursor = Cursor::new(&port, 1, format(), true);
        script.reply(rows(&[1], fetch_status::OK));
        script.reply(rows(&[2, 3], fetch_status::OK));
        assert_eq!(id(cursor.next().unwrap()), Some(1));
        assert_eq!(id(cursor.next().unwrap()), Some(2));
        assert_eq!(cursor.buffered(), 1);

        // server sits on row 3, caller on row 2: one back is two back
        script.reply(rows(&[1], fetch_status::OK));
        assert_eq!(id(cursor.prior().unwrap()), Some(1));
        assert_eq!(scroll_ops(&script).last(), Some(&(FetchOp::Relative, -2, 1)));
        assert_eq!(cursor.buffered(), 0);

        script.reply(rows(&[], fetch_status::NO_MORE_ROWS));
        assert_eq!(cursor.prior().unwrap(), None);
        assert!(cursor.is_bof());
    }

    #[test]
    fn test_relative_accounts_for_prefetch() {
        let script = Script::new();
        let port = script.port(ptype::SYNC);
        let mut cursor = Cursor::new(&port, 1, format(), true);
        script.reply(rows(&[1], fetch_status::OK));
        script.reply(rows(&[2, 3], fetch_status::OK));
        cursor.next().unwrap();
        cursor.next().unwrap();
        script.reply(rows(&[5], fetch_status::OK));
        assert_eq!(id(cursor.relative(3).unwrap()), Some(5));
        assert_eq!(scroll_ops(&script).last(), Some(&(FetchOp::Relative, 2, 1)));
    }

    #[test]
    fn test_forward_only_rejects_scrolling() {
        let script = Script::new();
        let port = script.port(ptype::SYNC);
        let mut cursor = Cursor::new(&port, 1, format(), false);
        assert!(matches!(cursor.prior(), Err(ClientError::Usage(_))));
        assert!(matches!(cursor.absolute(1), Err(ClientError::Usage(_))));
        script.reply(rows(&[1], fetch_status::NO_MORE_ROWS));
        assert_eq!(id(cursor.next().unwrap()), Some(1));
        assert!(matches!(script.sent()[0], Packet::Fetch(_)));
    }

    #[test]
    fn test_close_defers_and_releases() {
        let script = Script::new();
        let port = script.port(ptype::LAZY);
        let mut cursor = Cursor::new(&port, 1, format(), true);
        cursor.close().unwrap();
        assert_eq!(port.deferred_len(), 1);
        assert!(matches!(cursor.next(), Err(ClientError::Released("cursor"))));
        script.reply(Packet::Response(Response::with_object(1)));
        port.flush().unwrap();
    }
}
