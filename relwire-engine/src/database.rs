//! In-memory database state shared by every attachment to it.

use crate::api::EventCallback;
use crate::error::EngineError;
use crate::sql::ColumnDef;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use relwire_protocol::format::Field;
use relwire_protocol::packet::EventCount;
use relwire_protocol::{MessageFormat, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A table: column definitions plus committed rows in insertion order.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(name: String, columns: Vec<ColumnDef>) -> Self {
        Self {
            name,
            columns,
            rows: Vec::new(),
        }
    }

    pub fn column_index(&self, name: &str) -> Result<usize, EngineError> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| EngineError::ColumnNotFound {
                column: name.to_string(),
            })
    }

    pub fn primary_key(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.primary_key)
    }

    /// Row format for every column of the table.
    pub fn format(&self) -> MessageFormat {
        MessageFormat::new(
            self.columns
                .iter()
                .map(|c| Field {
                    name: c.name.clone(),
                    field_type: c.field_type,
                    nullable: c.nullable,
                })
                .collect(),
        )
    }
}

/// A stored blob.
#[derive(Debug, Clone, Default)]
pub struct StoredBlob {
    pub segments: Vec<Bytes>,
    pub stream: bool,
}

impl StoredBlob {
    pub fn total_length(&self) -> u64 {
        self.segments.iter().map(|s| s.len() as u64).sum()
    }

    pub fn max_segment(&self) -> usize {
        self.segments.iter().map(Bytes::len).max().unwrap_or(0)
    }
}

struct Subscription {
    attachment: u64,
    events: Vec<EventCount>,
    callback: EventCallback,
}

/// Posted event counters and one-shot subscriptions.
#[derive(Default)]
pub struct EventHub {
    counts: Mutex<HashMap<String, u32>>,
    subscriptions: Mutex<HashMap<u64, Subscription>>,
    next_id: AtomicU64,
}

impl EventHub {
    fn current(&self, events: &[EventCount]) -> Vec<EventCount> {
        let counts = self.counts.lock();
        events
            .iter()
            .map(|e| EventCount {
                name: e.name.clone(),
                count: counts.get(&e.name).copied().unwrap_or(0),
            })
            .collect()
    }

    fn is_due(known: &[EventCount], current: &[EventCount]) -> bool {
        known
            .iter()
            .zip(current)
            .any(|(k, c)| c.count > k.count)
    }

    /// Registers interest. Fires immediately when a counter is already ahead
    /// of what the subscriber has seen.
    pub fn subscribe(
        &self,
        attachment: u64,
        events: &[EventCount],
        callback: EventCallback,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let current = self.current(events);
        if Self::is_due(events, &current) {
            callback(current);
            return id;
        }
        self.subscriptions.lock().insert(
            id,
            Subscription {
                attachment,
                events: events.to_vec(),
                callback,
            },
        );
        id
    }

    pub fn cancel(&self, id: u64) -> bool {
        self.subscriptions.lock().remove(&id).is_some()
    }

    /// Drops every subscription owned by an attachment.
    pub fn cancel_attachment(&self, attachment: u64) {
        self.subscriptions
            .lock()
            .retain(|_, s| s.attachment != attachment);
    }

    pub fn pending(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Bumps counters for the committed events and fires due subscriptions.
    pub fn post(&self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        {
            let mut counts = self.counts.lock();
            for name in names {
                *counts.entry(name.clone()).or_insert(0) += 1;
            }
        }

        let mut due = Vec::new();
        {
            let mut subs = self.subscriptions.lock();
            let ids: Vec<u64> = subs
                .iter()
                .filter(|(_, s)| s.events.iter().any(|e| names.contains(&e.name)))
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                if let Some(sub) = subs.remove(&id) {
                    due.push(sub);
                }
            }
        }

        // Callbacks run without holding the registry lock.
        for sub in due {
            let current = self.current(&sub.events);
            tracing::debug!("firing event subscription for attachment {}", sub.attachment);
            (sub.callback)(current);
        }
    }
}

/// Everything stored for one named database.
pub struct Database {
    pub name: String,
    pub created: DateTime<Utc>,
    pub tables: RwLock<HashMap<String, Table>>,
    pub blobs: Mutex<HashMap<u64, StoredBlob>>,
    pub events: EventHub,
    /// Attachment id to user name.
    pub attachments: Mutex<HashMap<u64, String>>,
    /// Key a client must present before attaching.
    pub key: Option<Bytes>,
    next_blob: AtomicU64,
    next_transaction: AtomicU64,
}

impl Database {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created: Utc::now(),
            tables: RwLock::new(HashMap::new()),
            blobs: Mutex::new(HashMap::new()),
            events: EventHub::default(),
            attachments: Mutex::new(HashMap::new()),
            key: None,
            next_blob: AtomicU64::new(0),
            next_transaction: AtomicU64::new(0),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn allocate_blob_id(&self) -> u64 {
        self.next_blob.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn allocate_transaction_id(&self) -> u64 {
        self.next_transaction.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn blob(&self, id: u64) -> Result<StoredBlob, EngineError> {
        self.blobs
            .lock()
            .get(&id)
            .cloned()
            .ok_or(EngineError::BlobNotFound { id })
    }

    pub fn store_blob(&self, id: u64, blob: StoredBlob) {
        self.blobs.lock().insert(id, blob);
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn counts(name: &str, count: u32) -> Vec<EventCount> {
        vec![EventCount {
            name: name.to_string(),
            count,
        }]
    }

    #[test]
    fn test_subscription_fires_once_on_post() {
        let hub = EventHub::default();
        let (tx, rx) = mpsc::channel();
        hub.subscribe(
            1,
            &counts("shipped", 0),
            Box::new(move |c| tx.send(c).unwrap()),
        );
        assert_eq!(hub.pending(), 1);

        hub.post(&["other".to_string()]);
        assert!(rx.try_recv().is_err());

        hub.post(&["shipped".to_string()]);
        let fired = rx.try_recv().unwrap();
        assert_eq!(fired[0].count, 1);
        assert_eq!(hub.pending(), 0);
    }

    #[test]
    fn test_subscription_fires_immediately_when_behind() {
        let hub = EventHub::default();
        hub.post(&["placed".to_string()]);

        let (tx, rx) = mpsc::channel();
        hub.subscribe(1, &counts("placed", 0), Box::new(move |c| tx.send(c).unwrap()));
        assert_eq!(rx.try_recv().unwrap()[0].count, 1);
        assert_eq!(hub.pending(), 0);
    }

    #[test]
    fn test_cancel_subscription() {
        let hub = EventHub::default();
        let id = hub.subscribe(7, &counts("x", 0), Box::new(|_| panic!("must not fire")));
        assert!(hub.cancel(id));
        assert!(!hub.cancel(id));
        hub.post(&["x".to_string()]);
    }

    #[test]
    fn test_cancel_attachment() {
        let hub = EventHub::default();
        hub.subscribe(3, &counts("a", 0), Box::new(|_| panic!("must not fire")));
        hub.subscribe(4, &counts("a", 0), Box::new(|_| {}));
        hub.cancel_attachment(3);
        assert_eq!(hub.pending(), 1);
        hub.post(&["a".to_string()]);
        assert_eq!(hub.pending(), 0);
    }
}
