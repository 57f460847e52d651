//! Backing record store: per-file locked read-modify-write
//!
//! The store is the only holder of persisted record state. Every mutation
//! runs as "lock this file's record, decode, apply, re-encode, unlock";
//! records are kept in their wire form so the codec round-trip is exercised
//! on every access. A record whose last entry, token and lock are gone is
//! dropped on commit.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::CoreResult;
use crate::record::{FileIdentity, ShareModeRecord};
use crate::wire::{decode_from_bytes, encode_to_bytes};

/// Outcome of a read-modify-write operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    /// The record was not changed; nothing is persisted
    Unchanged,
    /// The record was changed and must be persisted (or dropped if empty)
    Modified,
}

/// Transactional store of share-mode records keyed by file identity
pub trait RecordStore: Send + Sync {
    /// Run `op` with the file's record under its exclusive critical section.
    ///
    /// A missing record is presented as a fresh empty one; it only comes
    /// into existence if `op` reports [`Mutation::Modified`]. No implementation
    /// may let `op` acquire a second file's critical section.
    fn locked_read_modify_write(
        &self,
        id: FileIdentity,
        op: &mut dyn FnMut(&mut ShareModeRecord) -> CoreResult<Mutation>,
    ) -> CoreResult<()>;

    /// Fetch a consistent snapshot of a record, if one exists
    fn read_only(&self, id: FileIdentity) -> CoreResult<Option<ShareModeRecord>>;
}

/// In-memory [`RecordStore`] holding wire-encoded records under per-file
/// mutexes
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: DashMap<FileIdentity, Arc<Mutex<Option<Bytes>>>>,
}

impl InMemoryRecordStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted records
    pub fn len(&self) -> usize {
        self.records
            .iter()
            .filter(|cell| cell.value().lock().is_some())
            .count()
    }

    /// Check whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell(&self, id: FileIdentity) -> Arc<Mutex<Option<Bytes>>> {
        self.records
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    fn load(id: FileIdentity, slot: &Option<Bytes>) -> CoreResult<ShareModeRecord> {
        match slot {
            Some(bytes) => {
                let record: ShareModeRecord = decode_from_bytes(bytes)?;
                record.validate()?;
                Ok(record)
            }
            None => Ok(ShareModeRecord::new(id)),
        }
    }
}

impl RecordStore for InMemoryRecordStore {
    fn locked_read_modify_write(
        &self,
        id: FileIdentity,
        op: &mut dyn FnMut(&mut ShareModeRecord) -> CoreResult<Mutation>,
    ) -> CoreResult<()> {
        let cell = self.cell(id);
        let mut slot = cell.lock();
        let mut record = Self::load(id, &slot)?;
        if op(&mut record)? == Mutation::Modified {
            if record.is_empty() {
                debug!(inode = record.id.inode, "dropping empty record");
                *slot = None;
                drop(slot);
                // A concurrent locker may hold the cell; it will observe the
                // empty slot and treat the record as fresh.
                self.records
                    .remove_if(&id, |_, cell| cell.lock().is_none());
            } else {
                record.sequence = record.sequence.wrapping_add(1);
                *slot = Some(encode_to_bytes(&record)?);
            }
        }
        Ok(())
    }

    fn read_only(&self, id: FileIdentity) -> CoreResult<Option<ShareModeRecord>> {
        let Some(cell) = self.records.get(&id).map(|c| Arc::clone(c.value())) else {
            return Ok(None);
        };
        let slot = cell.lock();
        match slot.as_ref() {
            Some(bytes) => {
                let record: ShareModeRecord = decode_from_bytes(bytes)?;
                record.validate()?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}
