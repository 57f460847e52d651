//! latch-core: byte-range lock and share-mode coordination engine
//!
//! Arbitrates overlapping byte-range lock requests and share-mode state for
//! files opened by many concurrent clients:
//!
//! - Per-file [`lock::LockTable`] with Windows- and POSIX-flavored conflict
//!   semantics and per-handle fast lock counting
//! - [`record::ShareModeRecord`]: the per-file aggregate of open entries,
//!   delete-on-close tokens, path metadata and the embedded lock table
//! - [`manager::ShareModeManager`]: record operations with stale-owner
//!   reclamation, rename propagation and delete-on-close notifications
//! - [`store::RecordStore`]: the transactional per-file critical section;
//!   records persist in their latch-wire form and round-trip byte-exact
//!
//! Lock conflicts never block inside this crate. A denied request returns the
//! blocker's identity; waiting, timeouts and retry scheduling belong to the
//! caller, driven by wake signals delivered through [`notify::WakeNotifier`].

#![warn(missing_docs)]

pub mod error;
pub mod lock;
pub mod manager;
pub mod notify;
pub mod record;
pub mod store;
pub mod wire;

pub use error::{CoreError, CoreResult};
pub use lock::{
    BlockerInfo, HandleId, LockFlavor, LockRange, LockTable, LockType, OwnerContext, ProcessId,
};
pub use manager::{LockOutcome, ShareModeManager};
pub use notify::{
    LeaseIndex, MessageType, NotificationChannel, ProcessLiveness, RenameMessage, WakeNotifier,
};
pub use record::{
    ClientGuid, DeleteToken, FileIdentity, LeaseKey, LeaseRef, OplockFlags, ShareEntryFlags,
    ShareModeEntry, ShareModeRecord,
};
pub use store::{InMemoryRecordStore, Mutation, RecordStore};
