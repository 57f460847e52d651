//! Per-file share-mode record: the unit of coordination state
//!
//! A [`ShareModeRecord`] aggregates every open of one file: the share-mode
//! entries, delete-on-close tokens, path metadata, and the embedded byte-range
//! lock table. The record is created on first open and dropped by the store
//! once the last entry, token and lock are gone. All access happens under the
//! record-scoped exclusive critical section provided by the store.

use bytes::Bytes;

use crate::error::{CoreError, CoreResult};
use crate::lock::{HandleId, LockTable, ProcessId};

/// Stable identity of a file's underlying storage object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    /// Device the file lives on
    pub device: u64,
    /// Inode within the device
    pub inode: u64,
    /// Extension id disambiguating recycled inodes
    pub extid: u64,
}

impl FileIdentity {
    /// Create a file identity
    pub const fn new(device: u64, inode: u64, extid: u64) -> Self {
        Self {
            device,
            inode,
            extid,
        }
    }
}

/// Client GUID identifying a lease-holding client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientGuid(pub [u8; 16]);

/// Client-chosen lease key, unique per client GUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseKey {
    /// High half of the key
    pub high: u64,
    /// Low half of the key
    pub low: u64,
}

/// Reference to one lease: the (client GUID, lease key) pair that identifies
/// it in the external lease index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseRef {
    /// Owning client
    pub client_guid: ClientGuid,
    /// Lease key within the client
    pub key: LeaseKey,
}

/// Oplock state flags for one share-mode entry
///
/// EXCLUSIVE and BATCH form one exclusive-grant category; LEVEL_TWO and
/// LEASE are each their own category. A live entry may carry at most one
/// category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OplockFlags(u8);

impl OplockFlags {
    /// No oplock held
    pub const NONE: u8 = 0x00;
    /// Exclusive oplock
    pub const EXCLUSIVE: u8 = 0x01;
    /// Batch oplock (exclusive plus handle caching)
    pub const BATCH: u8 = 0x02;
    /// Level II (shared read-caching) oplock
    pub const LEVEL_TWO: u8 = 0x04;
    /// Lease-based oplock
    pub const LEASE: u8 = 0x08;

    /// Create flags from a raw value
    pub const fn new(flags: u8) -> Self {
        Self(flags)
    }

    /// Get the raw value
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Check if a flag is set
    pub const fn has(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    /// Check for an exclusive-category grant
    pub const fn is_exclusive(&self) -> bool {
        self.has(Self::EXCLUSIVE | Self::BATCH)
    }

    /// Number of distinct oplock categories set
    pub const fn categories(&self) -> u32 {
        let mut n = 0;
        if self.is_exclusive() {
            n += 1;
        }
        if self.has(Self::LEVEL_TWO) {
            n += 1;
        }
        if self.has(Self::LEASE) {
            n += 1;
        }
        n
    }
}

/// Per-entry flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShareEntryFlags(u16);

impl ShareEntryFlags {
    /// Entry was opened through POSIX open semantics
    pub const POSIX_OPEN: u16 = 0x0001;
    /// Entry is a base-file open backing an open named stream
    pub const STREAM_BASEOPEN: u16 = 0x0002;

    /// Create flags from a raw value
    pub const fn new(flags: u16) -> Self {
        Self(flags)
    }

    /// Get the raw value
    pub const fn bits(&self) -> u16 {
        self.0
    }

    /// Check if a flag is set
    pub const fn has(&self, flag: u16) -> bool {
        self.0 & flag != 0
    }
}

/// One open of the file by one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareModeEntry {
    /// Process owning the open
    pub owner_process: ProcessId,
    /// Share-access mask granted to other opens
    pub share_access: u32,
    /// Access mask this open holds
    pub access_mask: u32,
    /// Handle id of the open within the owning process
    pub file_handle_id: HandleId,
    /// Numeric user id the open was made as
    pub uid: u32,
    /// Hash of the name the file was opened under
    pub name_hash: u32,
    /// Oplock state
    pub oplock: OplockFlags,
    /// Lease backing the oplock, when lease-based
    pub lease: Option<LeaseRef>,
    /// Entry flags
    pub flags: ShareEntryFlags,
    /// Soft-delete marker: set once the owning process is found dead.
    /// Once stale, always stale.
    pub stale: bool,
}

/// Delete-on-close credential token for one name hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteToken {
    /// Name hash the token applies to
    pub name_hash: u32,
    /// Parent directory lease to break before the delete, if any
    pub parent_lease_key: Option<LeaseKey>,
    /// Opaque security token of the marking user
    pub security_token: Bytes,
    /// Opaque unix credential block of the marking user
    pub unix_token: Bytes,
}

/// Per-file aggregate of entries, delete tokens, paths and the lock table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareModeRecord {
    /// Identity of the file
    pub id: FileIdentity,
    /// Monotonic change sequence, bumped by the store on every persist
    pub sequence: u64,
    /// Share/service path the file lives under
    pub service_path: String,
    /// File base name relative to the service path
    pub base_name: String,
    /// Named stream, empty for the base file
    pub stream_name: String,
    /// Open entries, in open order
    pub entries: Vec<ShareModeEntry>,
    /// Delete-on-close tokens, at most one per name hash
    pub delete_tokens: Vec<DeleteToken>,
    /// Embedded byte-range lock table
    pub locks: LockTable,
}

impl ShareModeRecord {
    /// Create an empty record for a file
    pub fn new(id: FileIdentity) -> Self {
        Self {
            id,
            sequence: 0,
            service_path: String::new(),
            base_name: String::new(),
            stream_name: String::new(),
            entries: Vec::new(),
            delete_tokens: Vec::new(),
            locks: LockTable::new(),
        }
    }

    /// Check whether nothing references the record anymore
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.delete_tokens.is_empty() && self.locks.is_empty()
    }

    /// Find the entry for one open
    pub fn find_entry(
        &mut self,
        process: ProcessId,
        handle: HandleId,
    ) -> Option<&mut ShareModeEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.owner_process == process && e.file_handle_id == handle)
    }

    /// Remove the entry for one open, returning it
    pub fn remove_entry(
        &mut self,
        process: ProcessId,
        handle: HandleId,
    ) -> Option<ShareModeEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.owner_process == process && e.file_handle_id == handle)?;
        Some(self.entries.remove(pos))
    }

    /// Find the delete token for a name hash
    pub fn find_delete_token(&self, name_hash: u32) -> Option<&DeleteToken> {
        self.delete_tokens.iter().find(|t| t.name_hash == name_hash)
    }

    /// Validate oplock exclusivity across live entries.
    ///
    /// An exclusive-category grant must be the only live entry; reading a
    /// record that violates this means a writer persisted corrupt state.
    pub fn validate(&self) -> CoreResult<()> {
        let live = self.entries.iter().filter(|e| !e.stale).count();
        let exclusive = self
            .entries
            .iter()
            .filter(|e| !e.stale && e.oplock.is_exclusive())
            .count();
        if exclusive > 1 || (exclusive == 1 && live > 1) {
            return Err(CoreError::Corrupt(format!(
                "{exclusive} exclusive grant(s) among {live} live entries"
            )));
        }
        Ok(())
    }
}
