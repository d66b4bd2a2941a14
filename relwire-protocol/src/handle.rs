//! Per-connection handle tables.
//!
//! Objects living on a connection are addressed on the wire by small
//! integer ids. Id 0 is reserved as "no object"; allocation picks the lowest
//! free slot starting at 1 and grows the table up to a fixed cap.

use crate::status::codes;
use crate::MAX_HANDLES;
use thiserror::Error;

/// Kind of object a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Attachment,
    Transaction,
    Blob,
    Statement,
    Request,
    Event,
    Service,
    Batch,
}

impl ObjectKind {
    /// Error code reported when a handle of this kind is not live.
    pub fn bad_handle_code(self) -> u32 {
        match self {
            ObjectKind::Attachment => codes::BAD_DB_HANDLE,
            ObjectKind::Transaction => codes::BAD_TRANS_HANDLE,
            ObjectKind::Blob => codes::BAD_SEGSTR_HANDLE,
            ObjectKind::Statement => codes::BAD_STMT_HANDLE,
            ObjectKind::Request => codes::BAD_REQ_HANDLE,
            ObjectKind::Event => codes::BAD_EVENT_HANDLE,
            ObjectKind::Service => codes::BAD_SVC_HANDLE,
            ObjectKind::Batch => codes::BAD_BATCH_HANDLE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::Attachment => "attachment",
            ObjectKind::Transaction => "transaction",
            ObjectKind::Blob => "blob",
            ObjectKind::Statement => "statement",
            ObjectKind::Request => "request",
            ObjectKind::Event => "event",
            ObjectKind::Service => "service",
            ObjectKind::Batch => "batch",
        }
    }
}

/// Handle lookup and allocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("invalid {} handle {id}", .kind.name())]
    Invalid { kind: ObjectKind, id: u32 },

    #[error("too many open {} handles", .kind.name())]
    TooMany { kind: ObjectKind },
}

impl HandleError {
    pub fn gds_code(&self) -> u32 {
        match self {
            HandleError::Invalid { kind, .. } => kind.bad_handle_code(),
            HandleError::TooMany { .. } => codes::TOO_MANY_HANDLES,
        }
    }
}

/// Growable slot array mapping ids to live objects of one kind.
#[derive(Debug)]
pub struct HandleTable<T> {
    kind: ObjectKind,
    slots: Vec<Option<T>>,
    live: usize,
    cap: usize,
}

impl<T> HandleTable<T> {
    pub fn new(kind: ObjectKind) -> Self {
        Self::with_cap(kind, MAX_HANDLES as usize)
    }

    pub fn with_cap(kind: ObjectKind, cap: usize) -> Self {
        // Slot 0 exists but is never filled.
        Self {
            kind,
            slots: vec![None],
            live: 0,
            cap,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Highest id ever handed out.
    pub fn high_water(&self) -> u32 {
        (self.slots.len() - 1) as u32
    }

    fn invalid(&self, id: u32) -> HandleError {
        HandleError::Invalid {
            kind: self.kind,
            id,
        }
    }

    /// Stores an object and returns its new id.
    pub fn allocate(&mut self, value: T) -> Result<u32, HandleError> {
        if let Some(id) = self.slots.iter().skip(1).position(Option::is_none) {
            let id = id + 1;
            self.slots[id] = Some(value);
            self.live += 1;
            return Ok(id as u32);
        }
        if self.slots.len() > self.cap {
            return Err(HandleError::TooMany { kind: self.kind });
        }
        self.slots.push(Some(value));
        self.live += 1;
        Ok((self.slots.len() - 1) as u32)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.get(id).is_ok()
    }

    pub fn get(&self, id: u32) -> Result<&T, HandleError> {
        if id == 0 {
            return Err(self.invalid(id));
        }
        self.slots
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| self.invalid(id))
    }

    pub fn get_mut(&mut self, id: u32) -> Result<&mut T, HandleError> {
        if id == 0 {
            return Err(self.invalid(id));
        }
        let err = self.invalid(id);
        self.slots
            .get_mut(id as usize)
            .and_then(Option::as_mut)
            .ok_or(err)
    }

    /// Empties a slot and returns the object it held.
    pub fn release(&mut self, id: u32) -> Result<T, HandleError> {
        if id == 0 {
            return Err(self.invalid(id));
        }
        let err = self.invalid(id);
        let value = self
            .slots
            .get_mut(id as usize)
            .and_then(Option::take)
            .ok_or(err)?;
        self.live -= 1;
        Ok(value)
    }

    /// Live ids in ascending order.
    pub fn ids(&self) -> Vec<u32> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|v| (id as u32, v)))
    }

    /// Removes every live object, highest id first.
    pub fn drain(&mut self) -> Vec<(u32, T)> {
        let mut out = Vec::with_capacity(self.live);
        for id in (1..self.slots.len()).rev() {
            if let Some(value) = self.slots[id].take() {
                out.push((id as u32, value));
            }
        }
        self.live = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_zero_is_invalid() {
        let table: HandleTable<&str> = HandleTable::new(ObjectKind::Transaction);
        let err = table.get(0).unwrap_err();
        assert_eq!(err.gds_code(), codes::BAD_TRANS_HANDLE);
    }

    #[test]
    fn test_allocate_lowest_free() {
        let mut table = HandleTable::new(ObjectKind::Statement);
        assert_eq!(table.allocate("a").unwrap(), 1);
        assert_eq!(table.allocate("b").unwrap(), 2);
        assert_eq!(table.allocate("c").unwrap(), 3);

        assert_eq!(table.release(2).unwrap(), "b");
        assert!(table.get(2).is_err());
        assert_eq!(table.allocate("d").unwrap(), 2);
        assert_eq!(table.len(), 3);
        assert_eq!(table.high_water(), 3);
    }

    #[test]
    fn test_beyond_high_water() {
        let mut table = HandleTable::new(ObjectKind::Blob);
        table.allocate(1u8).unwrap();
        assert!(matches!(
            table.get(99),
            Err(HandleError::Invalid {
                kind: ObjectKind::Blob,
                id: 99
            })
        ));
        assert!(table.release(99).is_err());
    }

    #[test]
    fn test_cap_exceeded() {
        let mut table = HandleTable::with_cap(ObjectKind::Request, 2);
        table.allocate(()).unwrap();
        table.allocate(()).unwrap();
        let err = table.allocate(()).unwrap_err();
        assert_eq!(err.gds_code(), codes::TOO_MANY_HANDLES);

        table.release(1).unwrap();
        assert_eq!(table.allocate(()).unwrap(), 1);
    }

    #[test]
    fn test_double_release() {
        let mut table = HandleTable::new(ObjectKind::Attachment);
        let id = table.allocate(5).unwrap();
        table.release(id).unwrap();
        assert!(table.release(id).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_drain_highest_first() {
        let mut table = HandleTable::new(ObjectKind::Event);
        table.allocate('a').unwrap();
        table.allocate('b').unwrap();
        table.allocate('c').unwrap();
        table.release(2).unwrap();
        let drained: Vec<u32> = table.drain().into_iter().map(|(id, _)| id).collect();
        assert_eq!(drained, vec![3, 1]);
        assert!(table.is_empty());
    }

    proptest! {
        #[test]
        fn test_allocate_release_sequences(ops in proptest::collection::vec((any::<bool>(), 0usize..16), 1..200)) {
            let mut table = HandleTable::with_cap(ObjectKind::Statement, 64);
            let mut live: HashSet<u32> = HashSet::new();
            let mut released: HashSet<u32> = HashSet::new();

            for (alloc, pick) in ops {
                if alloc || live.is_empty() {
                    if let Ok(id) = table.allocate(0u64) {
                        prop_assert!(id > 0);
                        prop_assert!(live.insert(id), "id {} handed out twice", id);
                        released.remove(&id);
                    }
                } else {
                    let mut ids: Vec<u32> = live.iter().copied().collect();
                    ids.sort_unstable();
                    let id = ids[pick % ids.len()];
                    prop_assert!(table.release(id).is_ok());
                    live.remove(&id);
                    released.insert(id);
                }
                for id in &released {
                    prop_assert!(table.get(*id).is_err());
                }
                for id in &live {
                    prop_assert!(table.get(*id).is_ok());
                }
                prop_assert_eq!(table.len(), live.len());
            }
        }
    }
}
