//! Collaborator seams: process liveness, wake signals, cross-process
//! messages, and the external lease index
//!
//! The engine never blocks a caller and never owns a wait queue; it reports
//! blockers and fires wake signals through these traits. In-memory
//! implementations are provided for embedding and tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::lock::ProcessId;
use crate::record::{ClientGuid, FileIdentity, LeaseKey};

/// Cross-process message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    /// The file was marked delete-on-close; cancel pending change
    /// notifications for it. Payload: encoded [`FileIdentity`].
    DeletePending = 1,
    /// The file was renamed; update cached names. Payload: encoded
    /// rename message.
    FileRenamed = 2,
}

impl TryFrom<u32> for MessageType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::DeletePending),
            2 => Ok(Self::FileRenamed),
            other => Err(other),
        }
    }
}

/// Payload of a [`MessageType::FileRenamed`] message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameMessage {
    /// File that was renamed
    pub id: FileIdentity,
    /// Handle id of the receiving open, so the receiver can find its state
    pub share_file_id: u64,
    /// New service path
    pub service_path: String,
    /// New base name
    pub base_name: String,
    /// New stream name
    pub stream_name: String,
}

/// Liveness oracle for lock and entry owners
pub trait ProcessLiveness: Send + Sync {
    /// Check whether a process still exists
    fn exists(&self, process: ProcessId) -> bool;
}

/// Wake signal observable by external waiters blocked on a file's locks
pub trait WakeNotifier: Send + Sync {
    /// Signal waiters registered against `id` to retry
    fn wake(&self, id: FileIdentity);
}

/// Asynchronous inter-process notification channel
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Send a message to one process
    async fn send(
        &self,
        target: ProcessId,
        message: MessageType,
        payload: Bytes,
    ) -> CoreResult<()>;
}

/// External lease index keyed by (client GUID, lease key)
#[async_trait]
pub trait LeaseIndex: Send + Sync {
    /// Re-key a lease's file/path mapping after a rename
    async fn rename_lease(
        &self,
        client_guid: ClientGuid,
        key: LeaseKey,
        id: FileIdentity,
        new_path: &str,
    ) -> CoreResult<()>;

    /// Drop a lease from the index
    async fn delete_lease(
        &self,
        client_guid: ClientGuid,
        key: LeaseKey,
        id: FileIdentity,
    ) -> CoreResult<()>;
}

/// In-memory liveness oracle over an explicit set of live processes
#[derive(Debug, Default)]
pub struct InMemoryLiveness {
    live: Mutex<HashSet<ProcessId>>,
}

impl InMemoryLiveness {
    /// Create an oracle with no live processes
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a process live
    pub fn register(&self, process: ProcessId) {
        self.live.lock().insert(process);
    }

    /// Mark a process dead
    pub fn kill(&self, process: ProcessId) {
        self.live.lock().remove(&process);
    }
}

impl ProcessLiveness for InMemoryLiveness {
    fn exists(&self, process: ProcessId) -> bool {
        self.live.lock().contains(&process)
    }
}

/// In-memory wake notifier recording every signal
#[derive(Debug, Default)]
pub struct InMemoryWaker {
    wakes: Mutex<Vec<FileIdentity>>,
}

impl InMemoryWaker {
    /// Create a notifier with no recorded wakes
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals recorded so far
    pub fn wakes(&self) -> Vec<FileIdentity> {
        self.wakes.lock().clone()
    }
}

impl WakeNotifier for InMemoryWaker {
    fn wake(&self, id: FileIdentity) {
        self.wakes.lock().push(id);
    }
}

/// One message captured by [`InMemoryChannel`]
#[derive(Debug, Clone)]
pub struct SentMessage {
    /// Receiving process
    pub target: ProcessId,
    /// Message type
    pub message: MessageType,
    /// Encoded payload
    pub payload: Bytes,
}

/// In-memory notification channel recording every message
#[derive(Debug, Default)]
pub struct InMemoryChannel {
    sent: Mutex<Vec<SentMessage>>,
    fail: AtomicBool,
}

impl InMemoryChannel {
    /// Create a channel with no recorded messages
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail
    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    /// Messages recorded so far
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl NotificationChannel for InMemoryChannel {
    async fn send(
        &self,
        target: ProcessId,
        message: MessageType,
        payload: Bytes,
    ) -> CoreResult<()> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(CoreError::Notification(format!(
                "delivery to process {} refused",
                target.value()
            )));
        }
        self.sent.lock().push(SentMessage {
            target,
            message,
            payload,
        });
        Ok(())
    }
}

/// In-memory lease index recording rename and delete calls
#[derive(Debug, Default)]
pub struct InMemoryLeaseIndex {
    renamed: Mutex<Vec<(ClientGuid, LeaseKey, FileIdentity, String)>>,
    deleted: Mutex<Vec<(ClientGuid, LeaseKey, FileIdentity)>>,
    fail: AtomicBool,
}

impl InMemoryLeaseIndex {
    /// Create an index with no recorded calls
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail
    pub fn fail_calls(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    /// Rename calls recorded so far
    pub fn renamed(&self) -> Vec<(ClientGuid, LeaseKey, FileIdentity, String)> {
        self.renamed.lock().clone()
    }

    /// Delete calls recorded so far
    pub fn deleted(&self) -> Vec<(ClientGuid, LeaseKey, FileIdentity)> {
        self.deleted.lock().clone()
    }
}

#[async_trait]
impl LeaseIndex for InMemoryLeaseIndex {
    async fn rename_lease(
        &self,
        client_guid: ClientGuid,
        key: LeaseKey,
        id: FileIdentity,
        new_path: &str,
    ) -> CoreResult<()> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(CoreError::LeaseIndex("rename refused".to_string()));
        }
        self.renamed
            .lock()
            .push((client_guid, key, id, new_path.to_string()));
        Ok(())
    }

    async fn delete_lease(
        &self,
        client_guid: ClientGuid,
        key: LeaseKey,
        id: FileIdentity,
    ) -> CoreResult<()> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(CoreError::LeaseIndex("delete refused".to_string()));
        }
        self.deleted.lock().push((client_guid, key, id));
        Ok(())
    }
}
