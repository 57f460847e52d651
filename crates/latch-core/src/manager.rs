//! Share-mode manager: operations over per-file records
//!
//! Every operation follows the same shape: enter the file's record critical
//! section through the [`RecordStore`], apply the change, and fire wake
//! signals or cross-process notifications only after the critical section is
//! released. No operation touches two files' records at once, so there is no
//! lock ordering to get wrong; cross-file effects (rename notifications,
//! lease re-keying) are best-effort once the record mutation has committed.

use std::ops::ControlFlow;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::CoreResult;
use crate::lock::{BlockerInfo, HandleId, LockFlavor, LockRange, OwnerContext, ProcessId};
use crate::notify::{
    LeaseIndex, MessageType, NotificationChannel, ProcessLiveness, RenameMessage, WakeNotifier,
};
use crate::record::{DeleteToken, FileIdentity, LeaseKey, LeaseRef, ShareModeEntry};
use crate::store::{Mutation, RecordStore};
use crate::wire::encode_to_bytes;

/// Outcome of a byte-range lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The range was granted and recorded
    Granted,
    /// The range conflicts with an existing lock; retry on wake
    Blocked(BlockerInfo),
}

/// Coordinates share-mode entries, delete-on-close tokens and byte-range
/// locks for every open file
pub struct ShareModeManager<S> {
    store: S,
    liveness: Arc<dyn ProcessLiveness>,
    waker: Arc<dyn WakeNotifier>,
    channel: Arc<dyn NotificationChannel>,
    leases: Arc<dyn LeaseIndex>,
    self_process: ProcessId,
}

impl<S: RecordStore> ShareModeManager<S> {
    /// Create a manager for the calling process
    pub fn new(
        store: S,
        liveness: Arc<dyn ProcessLiveness>,
        waker: Arc<dyn WakeNotifier>,
        channel: Arc<dyn NotificationChannel>,
        leases: Arc<dyn LeaseIndex>,
        self_process: ProcessId,
    ) -> Self {
        Self {
            store,
            liveness,
            waker,
            channel,
            leases,
            self_process,
        }
    }

    /// The backing store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Record a new open of a file.
    ///
    /// The first open of a file creates its record and sets the path
    /// metadata; later opens append an entry. The oplock exclusivity
    /// invariant is checked before commit.
    pub fn open_entry(
        &self,
        id: FileIdentity,
        service_path: &str,
        base_name: &str,
        stream_name: &str,
        entry: ShareModeEntry,
    ) -> CoreResult<()> {
        self.store.locked_read_modify_write(id, &mut |record| {
            if record.is_empty() {
                record.service_path = service_path.to_string();
                record.base_name = base_name.to_string();
                record.stream_name = stream_name.to_string();
            }
            record.entries.push(entry.clone());
            record.validate()?;
            Ok(Mutation::Modified)
        })
    }

    /// Remove the entry for one open; returns whether an entry was removed
    pub fn close_entry(
        &self,
        id: FileIdentity,
        process: ProcessId,
        handle: HandleId,
    ) -> CoreResult<bool> {
        let mut removed = false;
        self.store.locked_read_modify_write(id, &mut |record| {
            removed = record.remove_entry(process, handle).is_some();
            Ok(if removed {
                Mutation::Modified
            } else {
                Mutation::Unchanged
            })
        })?;
        Ok(removed)
    }

    /// Request a byte-range lock
    pub fn lock(&self, id: FileIdentity, request: LockRange) -> CoreResult<LockOutcome> {
        let mut outcome = LockOutcome::Granted;
        self.store.locked_read_modify_write(id, &mut |record| {
            match record.locks.lock(request) {
                Ok(()) => {
                    outcome = LockOutcome::Granted;
                    Ok(Mutation::Modified)
                }
                Err(blocker) => {
                    outcome = LockOutcome::Blocked(blocker);
                    Ok(Mutation::Unchanged)
                }
            }
        })?;
        Ok(outcome)
    }

    /// Release an exact-matching byte-range lock.
    ///
    /// Returns false when no matching range is held. A successful unlock
    /// wakes external waiters registered against this file.
    pub fn unlock(
        &self,
        id: FileIdentity,
        owner: &OwnerContext,
        start: u64,
        length: u64,
        flavor: LockFlavor,
    ) -> CoreResult<bool> {
        let mut removed = false;
        self.store.locked_read_modify_write(id, &mut |record| {
            removed = record.locks.unlock(owner, start, length, flavor);
            Ok(if removed {
                Mutation::Modified
            } else {
                Mutation::Unchanged
            })
        })?;
        if removed {
            self.waker.wake(id);
        }
        Ok(removed)
    }

    /// Release every byte-range lock held through one handle.
    ///
    /// When the handle's fast counter proves it never held a lock, the table
    /// is not touched and no wake is sent. Otherwise waiters are woken
    /// exactly once however many ranges were removed.
    pub fn close_locks(
        &self,
        id: FileIdentity,
        owner: &OwnerContext,
        handle: HandleId,
    ) -> CoreResult<()> {
        let mut touched = false;
        self.store.locked_read_modify_write(id, &mut |record| {
            if record.locks.handle_has_no_locks(owner.process, handle) {
                return Ok(Mutation::Unchanged);
            }
            let removed = record.locks.close_handle(owner, handle);
            debug!(
                inode = id.inode,
                removed, "released byte-range locks on close"
            );
            touched = true;
            Ok(Mutation::Modified)
        })?;
        if touched {
            self.waker.wake(id);
        }
        Ok(())
    }

    /// Report which lock would block `candidate`, without taking anything
    pub fn query_lock(
        &self,
        id: FileIdentity,
        candidate: &LockRange,
    ) -> CoreResult<Option<BlockerInfo>> {
        match self.store.read_only(id)? {
            Some(record) => Ok(record.locks.query_lock(candidate)),
            None => Ok(None),
        }
    }

    /// Strict read/write consistency probe for the I/O path.
    ///
    /// Zero-length probes always pass, and a caller-attested covering lease
    /// skips the table entirely. Otherwise the probe runs against a
    /// read-only snapshot first; only a conflict pays for the record
    /// critical section, where it is retried once with self-conflict
    /// checking enabled.
    pub fn strict_lock_check(
        &self,
        id: FileIdentity,
        probe: &LockRange,
        lease_covers: bool,
    ) -> CoreResult<bool> {
        if probe.length == 0 {
            return Ok(true);
        }
        if lease_covers {
            return Ok(true);
        }
        let Some(record) = self.store.read_only(id)? else {
            return Ok(true);
        };
        if record.locks.test_lock(probe, false) {
            return Ok(true);
        }
        let mut allowed = false;
        self.store.locked_read_modify_write(id, &mut |record| {
            allowed = record.locks.test_lock(probe, true);
            Ok(Mutation::Unchanged)
        })?;
        Ok(allowed)
    }

    /// Check (and memoize) whether an entry's owner is gone.
    ///
    /// Once an entry has been marked stale it stays stale for this record's
    /// lifetime.
    pub fn entry_is_stale(&self, entry: &mut ShareModeEntry) -> bool {
        if entry.stale {
            return true;
        }
        if self.liveness.exists(entry.owner_process) {
            return false;
        }
        warn!(
            process = entry.owner_process.value(),
            "marking share-mode entry stale, owner is gone"
        );
        entry.stale = true;
        true
    }

    /// Validate one entry against a confirmed-live owner.
    ///
    /// A stale or dead-owner entry is simply invalid. A live entry carrying
    /// more than one oplock category means two incompatible grants coexist
    /// for one open; that is unrecoverable data corruption.
    pub fn validate_entry(&self, entry: &mut ShareModeEntry) -> bool {
        if self.entry_is_stale(entry) {
            return false;
        }
        let categories = entry.oplock.categories();
        assert!(
            categories <= 1,
            "share-mode entry for live process {} carries {} oplock categories",
            entry.owner_process.value(),
            categories
        );
        true
    }

    /// Apply `visitor` to every entry, stale or not.
    ///
    /// The visitor may mutate the entry, set the modified flag to request
    /// persistence, and break to stop early. Visitor errors abort the
    /// traversal and nothing is persisted.
    pub fn for_each_entry<F>(&self, id: FileIdentity, mut visitor: F) -> CoreResult<()>
    where
        F: FnMut(&mut ShareModeEntry, &mut bool) -> CoreResult<ControlFlow<()>>,
    {
        self.store.locked_read_modify_write(id, &mut |record| {
            let mut modified = false;
            for index in 0..record.entries.len() {
                if let ControlFlow::Break(()) =
                    visitor(&mut record.entries[index], &mut modified)?
                {
                    break;
                }
            }
            Ok(if modified {
                Mutation::Modified
            } else {
                Mutation::Unchanged
            })
        })
    }

    /// Apply `visitor` once per distinct lease referenced by the record.
    ///
    /// A lease shared by several entries is visited exactly once, deduplicated
    /// by (client GUID, lease key).
    pub fn for_each_lease<F>(&self, id: FileIdentity, mut visitor: F) -> CoreResult<()>
    where
        F: FnMut(&LeaseRef, &mut bool) -> CoreResult<ControlFlow<()>>,
    {
        self.store.locked_read_modify_write(id, &mut |record| {
            let mut modified = false;
            let mut seen: Vec<LeaseRef> = Vec::new();
            for index in 0..record.entries.len() {
                let Some(lease) = record.entries[index].lease else {
                    continue;
                };
                if seen.contains(&lease) {
                    continue;
                }
                seen.push(lease);
                if let ControlFlow::Break(()) = visitor(&lease, &mut modified)? {
                    break;
                }
            }
            Ok(if modified {
                Mutation::Modified
            } else {
                Mutation::Unchanged
            })
        })
    }

    /// Mark the file delete-on-close for one name hash.
    ///
    /// Upserts the credential token: a repeat call replaces the stored
    /// credentials, including clearing a previously recorded parent lease
    /// key. Only a newly created mark notifies the other owning processes,
    /// so they can cancel pending change notifications for the doomed name.
    pub async fn set_delete_on_close(
        &self,
        id: FileIdentity,
        name_hash: u32,
        parent_lease_key: Option<LeaseKey>,
        security_token: Bytes,
        unix_token: Bytes,
    ) -> CoreResult<()> {
        let mut targets: Vec<ProcessId> = Vec::new();
        self.store.locked_read_modify_write(id, &mut |record| {
            let token = DeleteToken {
                name_hash,
                parent_lease_key,
                security_token: security_token.clone(),
                unix_token: unix_token.clone(),
            };
            match record
                .delete_tokens
                .iter_mut()
                .find(|t| t.name_hash == name_hash)
            {
                Some(existing) => {
                    *existing = token;
                }
                None => {
                    record.delete_tokens.push(token);
                    for entry in &record.entries {
                        if !entry.stale && !targets.contains(&entry.owner_process) {
                            targets.push(entry.owner_process);
                        }
                    }
                }
            }
            Ok(Mutation::Modified)
        })?;

        if targets.is_empty() {
            return Ok(());
        }
        let payload = encode_to_bytes(&id)?;
        for target in targets {
            if target == self.self_process {
                continue;
            }
            if let Err(err) = self
                .channel
                .send(target, MessageType::DeletePending, payload.clone())
                .await
            {
                warn!(
                    process = target.value(),
                    %err,
                    "delete-on-close notification not delivered"
                );
            }
        }
        Ok(())
    }

    /// Clear the delete-on-close mark for one name hash.
    ///
    /// A missing mark is a no-op, not an error.
    pub fn reset_delete_on_close(&self, id: FileIdentity, name_hash: u32) -> CoreResult<()> {
        self.store.locked_read_modify_write(id, &mut |record| {
            let before = record.delete_tokens.len();
            record.delete_tokens.retain(|t| t.name_hash != name_hash);
            Ok(if record.delete_tokens.len() != before {
                Mutation::Modified
            } else {
                Mutation::Unchanged
            })
        })
    }

    /// Check whether delete-on-close is set for a name hash
    pub fn is_delete_on_close_set(&self, id: FileIdentity, name_hash: u32) -> CoreResult<bool> {
        Ok(self
            .get_delete_on_close_token(id, name_hash)?
            .is_some())
    }

    /// Fetch the stored delete-on-close credentials for a name hash
    pub fn get_delete_on_close_token(
        &self,
        id: FileIdentity,
        name_hash: u32,
    ) -> CoreResult<Option<DeleteToken>> {
        match self.store.read_only(id)? {
            Some(record) => Ok(record.find_delete_token(name_hash).cloned()),
            None => Ok(None),
        }
    }

    /// Apply a rename to the record and propagate it.
    ///
    /// Path metadata is rewritten and every entry opened under the old name
    /// hash is re-keyed to the new one. Other owning processes of re-keyed
    /// entries receive a rename message so they can update their cached
    /// names, and each referenced lease is re-keyed in the external lease
    /// index. Both side effects are best-effort: once the record mutation
    /// has committed and some peers have been told, there is no safe
    /// rollback, so failures are logged and swallowed.
    pub async fn rename(
        &self,
        id: FileIdentity,
        new_service_path: &str,
        new_base_name: &str,
        new_stream_name: &str,
        old_name_hash: u32,
        new_name_hash: u32,
    ) -> CoreResult<()> {
        let mut messages: Vec<(ProcessId, Bytes)> = Vec::new();
        let mut lease_refs: Vec<LeaseRef> = Vec::new();
        self.store.locked_read_modify_write(id, &mut |record| {
            record.service_path = new_service_path.to_string();
            record.base_name = new_base_name.to_string();
            record.stream_name = new_stream_name.to_string();
            messages.clear();
            lease_refs.clear();
            for entry in &mut record.entries {
                if let Some(lease) = entry.lease {
                    if !lease_refs.contains(&lease) {
                        lease_refs.push(lease);
                    }
                }
                if entry.name_hash != old_name_hash {
                    continue;
                }
                entry.name_hash = new_name_hash;
                if entry.stale || entry.owner_process == self.self_process {
                    continue;
                }
                let message = RenameMessage {
                    id: record.id,
                    share_file_id: entry.file_handle_id.value(),
                    service_path: new_service_path.to_string(),
                    base_name: new_base_name.to_string(),
                    stream_name: new_stream_name.to_string(),
                };
                messages.push((entry.owner_process, encode_to_bytes(&message)?));
            }
            Ok(Mutation::Modified)
        })?;

        for (target, payload) in messages {
            if let Err(err) = self
                .channel
                .send(target, MessageType::FileRenamed, payload)
                .await
            {
                warn!(
                    process = target.value(),
                    %err,
                    "rename notification not delivered"
                );
            }
        }
        for lease in lease_refs {
            if let Err(err) = self
                .leases
                .rename_lease(lease.client_guid, lease.key, id, new_base_name)
                .await
            {
                warn!(%err, "lease index rename failed");
            }
        }
        Ok(())
    }

    /// Drop a lease from the external index unless a live entry still
    /// references it. Returns whether the lease was removed.
    pub async fn remove_lease_if_stale(
        &self,
        id: FileIdentity,
        lease: LeaseRef,
    ) -> CoreResult<bool> {
        if let Some(record) = self.store.read_only(id)? {
            let in_use = record.entries.iter().any(|e| {
                e.lease == Some(lease) && !e.stale && self.liveness.exists(e.owner_process)
            });
            if in_use {
                return Ok(false);
            }
        }
        self.leases
            .delete_lease(lease.client_guid, lease.key, id)
            .await?;
        Ok(true)
    }

    /// Check whether any live entry is a base-file open backing an open
    /// named stream
    pub fn file_has_open_streams(&self, id: FileIdentity) -> CoreResult<bool> {
        match self.store.read_only(id)? {
            Some(record) => Ok(record.entries.iter().any(|e| {
                !e.stale && e.flags.has(crate::record::ShareEntryFlags::STREAM_BASEOPEN)
            })),
            None => Ok(false),
        }
    }
}

impl<S> std::fmt::Debug for ShareModeManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareModeManager")
            .field("self_process", &self.self_process)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{HandleId, LockType};
    use crate::notify::{InMemoryChannel, InMemoryLeaseIndex, InMemoryLiveness, InMemoryWaker};
    use crate::record::{ClientGuid, OplockFlags, ShareEntryFlags};
    use crate::store::InMemoryRecordStore;
    use crate::wire::decode_from_bytes;

    struct Fixture {
        manager: ShareModeManager<InMemoryRecordStore>,
        liveness: Arc<InMemoryLiveness>,
        waker: Arc<InMemoryWaker>,
        channel: Arc<InMemoryChannel>,
        leases: Arc<InMemoryLeaseIndex>,
    }

    fn fixture() -> Fixture {
        let liveness = Arc::new(InMemoryLiveness::new());
        for p in 1..6 {
            liveness.register(ProcessId::new(p));
        }
        let waker = Arc::new(InMemoryWaker::new());
        let channel = Arc::new(InMemoryChannel::new());
        let leases = Arc::new(InMemoryLeaseIndex::new());
        let manager = ShareModeManager::new(
            InMemoryRecordStore::new(),
            liveness.clone(),
            waker.clone(),
            channel.clone(),
            leases.clone(),
            ProcessId::new(1),
        );
        Fixture {
            manager,
            liveness,
            waker,
            channel,
            leases,
        }
    }

    fn file() -> FileIdentity {
        FileIdentity::new(1, 100, 0)
    }

    fn entry(process: u64, handle: u64) -> ShareModeEntry {
        ShareModeEntry {
            owner_process: ProcessId::new(process),
            share_access: 0x7,
            access_mask: 0x1,
            file_handle_id: HandleId::new(handle),
            uid: 1000,
            name_hash: 0xAAAA,
            oplock: OplockFlags::default(),
            lease: None,
            flags: ShareEntryFlags::default(),
            stale: false,
        }
    }

    fn lease_ref(byte: u8) -> LeaseRef {
        LeaseRef {
            client_guid: ClientGuid([byte; 16]),
            key: LeaseKey {
                high: u64::from(byte),
                low: 1,
            },
        }
    }

    fn owner(process: u64) -> OwnerContext {
        OwnerContext::new(ProcessId::new(process), process, process * 100)
    }

    fn write_range(process: u64, start: u64, length: u64) -> LockRange {
        LockRange {
            owner: owner(process),
            handle: HandleId::new(process),
            start,
            length,
            kind: LockType::Write,
            flavor: LockFlavor::Windows,
        }
    }

    fn open(f: &Fixture, e: ShareModeEntry) {
        f.manager
            .open_entry(file(), "/srv/share", "file.txt", "", e)
            .unwrap();
    }

    #[test]
    fn test_open_close_lifecycle() {
        let f = fixture();
        open(&f, entry(1, 1));
        open(&f, entry(2, 1));

        let record = f.manager.store().read_only(file()).unwrap().unwrap();
        assert_eq!(record.entries.len(), 2);
        assert_eq!(record.base_name, "file.txt");

        assert!(f
            .manager
            .close_entry(file(), ProcessId::new(1), HandleId::new(1))
            .unwrap());
        assert!(!f
            .manager
            .close_entry(file(), ProcessId::new(1), HandleId::new(1))
            .unwrap());
        assert!(f
            .manager
            .close_entry(file(), ProcessId::new(2), HandleId::new(1))
            .unwrap());
        // Last entry gone, nothing else references the record
        assert!(f.manager.store().read_only(file()).unwrap().is_none());
    }

    #[test]
    fn test_lock_blocked_then_granted_after_unlock() {
        let f = fixture();
        assert_eq!(
            f.manager.lock(file(), write_range(1, 0, 100)).unwrap(),
            LockOutcome::Granted
        );
        match f.manager.lock(file(), write_range(2, 50, 10)).unwrap() {
            LockOutcome::Blocked(blocker) => {
                assert_eq!(blocker.owner, owner(1));
                assert_eq!(blocker.start, 0);
                assert_eq!(blocker.length, 100);
            }
            LockOutcome::Granted => panic!("conflicting lock was granted"),
        }

        assert!(f
            .manager
            .unlock(file(), &owner(1), 0, 100, LockFlavor::Windows)
            .unwrap());
        assert_eq!(f.waker.wakes(), vec![file()]);
        assert_eq!(
            f.manager.lock(file(), write_range(2, 50, 10)).unwrap(),
            LockOutcome::Granted
        );
    }

    #[test]
    fn test_failed_unlock_does_not_wake() {
        let f = fixture();
        assert!(!f
            .manager
            .unlock(file(), &owner(1), 0, 100, LockFlavor::Windows)
            .unwrap());
        assert!(f.waker.wakes().is_empty());
    }

    #[test]
    fn test_close_locks_wakes_once() {
        let f = fixture();
        f.manager.lock(file(), write_range(1, 0, 10)).unwrap();
        f.manager.lock(file(), write_range(1, 20, 10)).unwrap();

        f.manager
            .close_locks(file(), &owner(1), HandleId::new(1))
            .unwrap();
        assert_eq!(f.waker.wakes(), vec![file()]);
        assert!(f.manager.store().read_only(file()).unwrap().is_none());
    }

    #[test]
    fn test_close_locks_fast_path_skips_wake() {
        let f = fixture();
        open(&f, entry(1, 1));
        f.manager
            .close_locks(file(), &owner(1), HandleId::new(1))
            .unwrap();
        assert!(f.waker.wakes().is_empty());
    }

    #[test]
    fn test_query_lock() {
        let f = fixture();
        assert!(f
            .manager
            .query_lock(file(), &write_range(2, 0, 10))
            .unwrap()
            .is_none());
        f.manager.lock(file(), write_range(1, 0, 100)).unwrap();
        let blocker = f
            .manager
            .query_lock(file(), &write_range(2, 0, 10))
            .unwrap()
            .unwrap();
        assert_eq!(blocker.owner, owner(1));
    }

    #[test]
    fn test_strict_lock_check() {
        let f = fixture();
        f.manager.lock(file(), write_range(1, 0, 100)).unwrap();

        // Zero-length probes always pass
        assert!(f
            .manager
            .strict_lock_check(file(), &write_range(2, 50, 0), false)
            .unwrap());
        // A covering lease skips the table
        assert!(f
            .manager
            .strict_lock_check(file(), &write_range(2, 50, 10), true)
            .unwrap());
        // A conflicting probe from another owner fails
        assert!(!f
            .manager
            .strict_lock_check(file(), &write_range(2, 50, 10), false)
            .unwrap());
        // The owner's own probe passes the read-only fast path
        assert!(f
            .manager
            .strict_lock_check(file(), &write_range(1, 50, 10), false)
            .unwrap());
        // No record at all passes
        assert!(f
            .manager
            .strict_lock_check(FileIdentity::new(9, 9, 9), &write_range(2, 0, 10), false)
            .unwrap());
    }

    #[tokio::test]
    async fn test_set_delete_on_close_notifies_other_owners() {
        let f = fixture();
        open(&f, entry(1, 1));
        open(&f, entry(2, 1));
        open(&f, entry(3, 1));

        f.manager
            .set_delete_on_close(
                file(),
                0xAAAA,
                None,
                Bytes::from_static(b"nt"),
                Bytes::from_static(b"ux"),
            )
            .await
            .unwrap();

        let sent = f.channel.sent();
        let mut targets: Vec<u64> = sent.iter().map(|m| m.target.value()).collect();
        targets.sort_unstable();
        // Process 1 is ourselves and is skipped
        assert_eq!(targets, vec![2, 3]);
        for message in &sent {
            assert_eq!(message.message, MessageType::DeletePending);
            let id: FileIdentity = decode_from_bytes(&message.payload).unwrap();
            assert_eq!(id, file());
        }
        assert!(f.manager.is_delete_on_close_set(file(), 0xAAAA).unwrap());
    }

    #[tokio::test]
    async fn test_set_delete_on_close_replaces_credentials_quietly() {
        let f = fixture();
        open(&f, entry(1, 1));
        open(&f, entry(2, 1));

        f.manager
            .set_delete_on_close(
                file(),
                0xAAAA,
                Some(LeaseKey { high: 1, low: 2 }),
                Bytes::from_static(b"nt1"),
                Bytes::from_static(b"ux1"),
            )
            .await
            .unwrap();
        assert_eq!(f.channel.sent().len(), 1);

        // Replacement updates credentials and clears the parent lease key
        // without another round of notifications
        f.manager
            .set_delete_on_close(
                file(),
                0xAAAA,
                None,
                Bytes::from_static(b"nt2"),
                Bytes::from_static(b"ux2"),
            )
            .await
            .unwrap();
        assert_eq!(f.channel.sent().len(), 1);

        let token = f
            .manager
            .get_delete_on_close_token(file(), 0xAAAA)
            .unwrap()
            .unwrap();
        assert_eq!(token.security_token, Bytes::from_static(b"nt2"));
        assert_eq!(token.parent_lease_key, None);
    }

    #[tokio::test]
    async fn test_reset_delete_on_close_idempotent() {
        let f = fixture();
        open(&f, entry(1, 1));
        f.manager
            .set_delete_on_close(
                file(),
                7,
                None,
                Bytes::from_static(b"nt"),
                Bytes::from_static(b"ux"),
            )
            .await
            .unwrap();
        assert!(f.manager.is_delete_on_close_set(file(), 7).unwrap());

        f.manager.reset_delete_on_close(file(), 7).unwrap();
        assert!(!f.manager.is_delete_on_close_set(file(), 7).unwrap());

        // Resetting again is a no-op, not an error
        f.manager.reset_delete_on_close(file(), 7).unwrap();
        assert!(!f.manager.is_delete_on_close_set(file(), 7).unwrap());
    }

    #[tokio::test]
    async fn test_rename_updates_and_notifies() {
        let f = fixture();
        let mut mine = entry(1, 1);
        mine.lease = Some(lease_ref(0x11));
        open(&f, mine);
        let mut theirs = entry(2, 7);
        theirs.lease = Some(lease_ref(0x22));
        open(&f, theirs);
        // An open under a different name (a hard link) keeps its hash
        let mut other_name = entry(3, 1);
        other_name.name_hash = 0xBBBB;
        open(&f, other_name);

        f.manager
            .rename(file(), "/srv/share", "renamed.txt", "", 0xAAAA, 0xCCCC)
            .await
            .unwrap();

        let record = f.manager.store().read_only(file()).unwrap().unwrap();
        assert_eq!(record.base_name, "renamed.txt");
        assert_eq!(record.entries[0].name_hash, 0xCCCC);
        assert_eq!(record.entries[1].name_hash, 0xCCCC);
        assert_eq!(record.entries[2].name_hash, 0xBBBB);

        // Only process 2 gets a message: we are process 1, and process 3's
        // entry was not renamed
        let sent = f.channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, ProcessId::new(2));
        assert_eq!(sent[0].message, MessageType::FileRenamed);
        let message: RenameMessage = decode_from_bytes(&sent[0].payload).unwrap();
        assert_eq!(message.base_name, "renamed.txt");
        assert_eq!(message.share_file_id, 7);

        // Both leases were re-keyed
        assert_eq!(f.leases.renamed().len(), 2);
    }

    #[tokio::test]
    async fn test_rename_survives_lease_index_failure() {
        let f = fixture();
        let mut e = entry(2, 1);
        e.lease = Some(lease_ref(0x33));
        open(&f, e);
        f.leases.fail_calls(true);
        f.channel.fail_sends(true);

        f.manager
            .rename(file(), "/srv/share", "renamed.txt", "", 0xAAAA, 0xCCCC)
            .await
            .unwrap();
        let record = f.manager.store().read_only(file()).unwrap().unwrap();
        assert_eq!(record.base_name, "renamed.txt");
    }

    #[test]
    fn test_for_each_entry_mutation_persists() {
        let f = fixture();
        open(&f, entry(1, 1));
        open(&f, entry(2, 1));

        f.manager
            .for_each_entry(file(), |entry, modified| {
                entry.access_mask = 0xFF;
                *modified = true;
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();

        let record = f.manager.store().read_only(file()).unwrap().unwrap();
        assert!(record.entries.iter().all(|e| e.access_mask == 0xFF));
    }

    #[test]
    fn test_for_each_entry_early_stop() {
        let f = fixture();
        open(&f, entry(1, 1));
        open(&f, entry(2, 1));

        let mut visited = 0;
        f.manager
            .for_each_entry(file(), |_, _| {
                visited += 1;
                Ok(ControlFlow::Break(()))
            })
            .unwrap();
        assert_eq!(visited, 1);
    }

    #[test]
    fn test_for_each_lease_dedupes() {
        let f = fixture();
        let shared = lease_ref(0x44);
        for (process, handle) in [(1, 1), (1, 2), (2, 1)] {
            let mut e = entry(process, handle);
            e.lease = Some(shared);
            open(&f, e);
        }
        let mut plain = entry(3, 1);
        plain.lease = Some(lease_ref(0x55));
        open(&f, plain);
        open(&f, entry(4, 1));

        let mut visited = Vec::new();
        f.manager
            .for_each_lease(file(), |lease, _| {
                visited.push(*lease);
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();
        assert_eq!(visited, vec![shared, lease_ref(0x55)]);
    }

    #[tokio::test]
    async fn test_remove_lease_if_stale() {
        let f = fixture();
        let lease = lease_ref(0x66);
        let mut e = entry(2, 1);
        e.lease = Some(lease);
        open(&f, e);

        // Owner alive: lease is in use
        assert!(!f.manager.remove_lease_if_stale(file(), lease).await.unwrap());
        assert!(f.leases.deleted().is_empty());

        // Owner gone: lease is dropped from the index
        f.liveness.kill(ProcessId::new(2));
        assert!(f.manager.remove_lease_if_stale(file(), lease).await.unwrap());
        assert_eq!(f.leases.deleted().len(), 1);
    }

    #[test]
    fn test_entry_staleness_memoized() {
        let f = fixture();
        let mut e = entry(2, 1);
        assert!(!f.manager.entry_is_stale(&mut e));

        f.liveness.kill(ProcessId::new(2));
        assert!(f.manager.entry_is_stale(&mut e));
        assert!(e.stale);

        // Once stale, always stale, even if the pid is reused
        f.liveness.register(ProcessId::new(2));
        assert!(f.manager.entry_is_stale(&mut e));
    }

    #[test]
    fn test_validate_entry() {
        let f = fixture();
        let mut good = entry(2, 1);
        good.oplock = OplockFlags::new(OplockFlags::LEASE);
        assert!(f.manager.validate_entry(&mut good));

        let mut dead = entry(2, 2);
        f.liveness.kill(ProcessId::new(2));
        assert!(!f.manager.validate_entry(&mut dead));
    }

    #[test]
    #[should_panic(expected = "oplock categories")]
    fn test_validate_entry_panics_on_double_grant() {
        let f = fixture();
        let mut bad = entry(3, 1);
        bad.oplock = OplockFlags::new(OplockFlags::EXCLUSIVE | OplockFlags::LEASE);
        f.manager.validate_entry(&mut bad);
    }

    #[test]
    fn test_file_has_open_streams() {
        let f = fixture();
        assert!(!f.manager.file_has_open_streams(file()).unwrap());

        open(&f, entry(1, 1));
        assert!(!f.manager.file_has_open_streams(file()).unwrap());

        let mut base = entry(2, 1);
        base.flags = ShareEntryFlags::new(ShareEntryFlags::STREAM_BASEOPEN);
        open(&f, base);
        assert!(f.manager.file_has_open_streams(file()).unwrap());
    }
}
