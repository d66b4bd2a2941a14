//! Blob handles of the in-memory engine.

use crate::api::{BlobSegment, EngineBlob};
use crate::database::{Database, StoredBlob};
use crate::error::EngineError;
use bytes::Bytes;
use parking_lot::Mutex;
use relwire_protocol::info::{items, InfoWriter};
use relwire_protocol::packet::SeekMode;
use std::sync::Arc;

enum Mode {
    Reading {
        blob: StoredBlob,
        segment: usize,
        offset: usize,
        /// Absolute position, stream blobs only.
        position: u64,
    },
    Writing {
        blob: StoredBlob,
        db: Arc<Database>,
    },
    Closed,
}

/// An open blob, either being read or being written.
pub struct MemoryBlob {
    id: u64,
    mode: Mutex<Mode>,
}

impl MemoryBlob {
    pub fn open(id: u64, blob: StoredBlob) -> Self {
        Self {
            id,
            mode: Mutex::new(Mode::Reading {
                blob,
                segment: 0,
                offset: 0,
                position: 0,
            }),
        }
    }

    pub fn create(id: u64, stream: bool, db: Arc<Database>) -> Self {
        Self {
            id,
            mode: Mutex::new(Mode::Writing {
                blob: StoredBlob {
                    segments: Vec::new(),
                    stream,
                },
                db,
            }),
        }
    }

    fn closed(&self) -> EngineError {
        EngineError::BlobNotFound { id: self.id }
    }
}

/// Reads up to `max_len` contiguous bytes starting at `position`.
fn read_stream(blob: &StoredBlob, position: u64, max_len: usize) -> Bytes {
    let mut out = Vec::with_capacity(max_len);
    let mut skip = position;
    for segment in &blob.segments {
        if out.len() >= max_len {
            break;
        }
        let len = segment.len() as u64;
        if skip >= len {
            skip -= len;
            continue;
        }
        let start = skip as usize;
        skip = 0;
        let take = (segment.len() - start).min(max_len - out.len());
        out.extend_from_slice(&segment[start..start + take]);
    }
    Bytes::from(out)
}

impl EngineBlob for MemoryBlob {
    fn id(&self) -> u64 {
        self.id
    }

    fn get_segment(&self, max_len: usize) -> Result<BlobSegment, EngineError> {
        let mut mode = self.mode.lock();
        match &mut *mode {
            Mode::Reading {
                blob,
                segment,
                offset,
                position,
            } => {
                if blob.stream {
                    if *position >= blob.total_length() {
                        return Err(EngineError::BlobEof);
                    }
                    let data = read_stream(blob, *position, max_len);
                    *position += data.len() as u64;
                    return Ok(BlobSegment {
                        data,
                        complete: true,
                    });
                }
                let Some(current) = blob.segments.get(*segment) else {
                    return Err(EngineError::BlobEof);
                };
                let remaining = current.len() - *offset;
                let take = remaining.min(max_len);
                let data = current.slice(*offset..*offset + take);
                if take == remaining {
                    *segment += 1;
                    *offset = 0;
                    Ok(BlobSegment {
                        data,
                        complete: true,
                    })
                } else {
                    *offset += take;
                    Ok(BlobSegment {
                        data,
                        complete: false,
                    })
                }
            }
            Mode::Writing { .. } => Err(EngineError::BadBpb {
                reason: "blob was created for writing".to_string(),
            }),
            Mode::Closed => Err(self.closed()),
        }
    }

    fn put_segment(&self, data: &[u8]) -> Result<(), EngineError> {
        let mut mode = self.mode.lock();
        match &mut *mode {
            Mode::Writing { blob, .. } => {
                blob.segments.push(Bytes::copy_from_slice(data));
                Ok(())
            }
            Mode::Reading { .. } => Err(EngineError::BadBpb {
                reason: "blob was opened for reading".to_string(),
            }),
            Mode::Closed => Err(self.closed()),
        }
    }

    fn seek(&self, seek_mode: SeekMode, offset: i64) -> Result<u64, EngineError> {
        let mut mode = self.mode.lock();
        match &mut *mode {
            Mode::Reading { blob, position, .. } if blob.stream => {
                let total = blob.total_length() as i64;
                let base = match seek_mode {
                    SeekMode::Start => 0,
                    SeekMode::Current => *position as i64,
                    SeekMode::End => total,
                };
                let target = (base + offset).clamp(0, total);
                *position = target as u64;
                Ok(*position)
            }
            Mode::Closed => Err(self.closed()),
            _ => Err(EngineError::BadBpb {
                reason: "seek requires a stream blob opened for reading".to_string(),
            }),
        }
    }

    fn info(&self, item: u8, writer: &mut InfoWriter) -> Result<bool, EngineError> {
        let mode = self.mode.lock();
        let blob = match &*mode {
            Mode::Reading { blob, .. } | Mode::Writing { blob, .. } => blob,
            Mode::Closed => return Err(self.closed()),
        };
        match item {
            items::BLOB_NUM_SEGMENTS => writer.push_u32(item, blob.segments.len() as u32),
            items::BLOB_MAX_SEGMENT => writer.push_u32(item, blob.max_segment() as u32),
            items::BLOB_TOTAL_LENGTH => writer.push_i64(item, blob.total_length() as i64),
            items::BLOB_TYPE => writer.push(item, &[u8::from(blob.stream)]),
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn close(&self) -> Result<(), EngineError> {
        let mut mode = self.mode.lock();
        match std::mem::replace(&mut *mode, Mode::Closed) {
            Mode::Writing { blob, db } => {
                tracing::trace!("storing blob {} ({} bytes)", self.id, blob.total_length());
                db.store_blob(self.id, blob);
                Ok(())
            }
            Mode::Reading { .. } => Ok(()),
            Mode::Closed => Err(self.closed()),
        }
    }

    fn cancel(&self) -> Result<(), EngineError> {
        let mut mode = self.mode.lock();
        match std::mem::replace(&mut *mode, Mode::Closed) {
            Mode::Closed => Err(self.closed()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(stream: bool, segments: &[&[u8]]) -> (Arc<Database>, u64) {
        let db = Arc::new(Database::new("db"));
        let id = db.allocate_blob_id();
        let blob = MemoryBlob::create(id, stream, db.clone());
        for s in segments {
            blob.put_segment(s).unwrap();
        }
        blob.close().unwrap();
        (db, id)
    }

    #[test]
    fn test_segmented_read() {
        let (db, id) = written(false, &[b"hello", b"world!"]);
        let blob = MemoryBlob::open(id, db.blob(id).unwrap());

        let first = blob.get_segment(100).unwrap();
        assert_eq!(&first.data[..], b"hello");
        assert!(first.complete);

        let partial = blob.get_segment(4).unwrap();
        assert_eq!(&partial.data[..], b"worl");
        assert!(!partial.complete);

        let rest = blob.get_segment(4).unwrap();
        assert_eq!(&rest.data[..], b"d!");
        assert!(rest.complete);

        assert!(matches!(blob.get_segment(4), Err(EngineError::BlobEof)));
    }

    #[test]
    fn test_stream_seek() {
        let (db, id) = written(true, &[b"0123", b"456789"]);
        let blob = MemoryBlob::open(id, db.blob(id).unwrap());

        assert_eq!(blob.seek(SeekMode::Start, 3).unwrap(), 3);
        assert_eq!(&blob.get_segment(4).unwrap().data[..], b"3456");
        assert_eq!(blob.seek(SeekMode::Current, -2).unwrap(), 5);
        assert_eq!(blob.seek(SeekMode::End, -1).unwrap(), 9);
        assert_eq!(&blob.get_segment(10).unwrap().data[..], b"9");
        assert!(matches!(blob.get_segment(1), Err(EngineError::BlobEof)));
    }

    #[test]
    fn test_seek_segmented_rejected() {
        let (db, id) = written(false, &[b"abc"]);
        let blob = MemoryBlob::open(id, db.blob(id).unwrap());
        assert!(matches!(
            blob.seek(SeekMode::Start, 0),
            Err(EngineError::BadBpb { .. })
        ));
    }

    #[test]
    fn test_cancel_discards() {
        let db = Arc::new(Database::new("db"));
        let id = db.allocate_blob_id();
        let blob = MemoryBlob::create(id, false, db.clone());
        blob.put_segment(b"draft").unwrap();
        blob.cancel().unwrap();
        assert!(matches!(db.blob(id), Err(EngineError::BlobNotFound { .. })));
        assert!(blob.close().is_err());
    }

    #[test]
    fn test_blob_info() {
        use relwire_protocol::info::InfoResponse;

        let (db, id) = written(false, &[b"ab", b"cdef"]);
        let blob = MemoryBlob::open(id, db.blob(id).unwrap());
        let mut writer = InfoWriter::new(64);
        for item in [items::BLOB_NUM_SEGMENTS, items::BLOB_MAX_SEGMENT, items::BLOB_TOTAL_LENGTH] {
            assert!(blob.info(item, &mut writer).unwrap());
        }
        let info = InfoResponse::parse(&writer.finish()).unwrap();
        assert_eq!(info.get(items::BLOB_NUM_SEGMENTS).unwrap().as_u32(), Some(2));
        assert_eq!(info.get(items::BLOB_MAX_SEGMENT).unwrap().as_u32(), Some(4));
        assert_eq!(info.get(items::BLOB_TOTAL_LENGTH).unwrap().as_i64(), Some(6));
    }
}
