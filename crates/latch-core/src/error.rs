//! Error types for the coordination engine

use latch_wire::WireError;
use thiserror::Error;

/// Coordination engine result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Coordination engine error types
///
/// Expected contention (lock conflicts, unlocking an unheld range) is not an
/// error here; those outcomes are typed return values on the operations that
/// produce them.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Record or message serialization failed
    #[error("wire codec error: {0}")]
    Wire(#[from] WireError),

    /// A persisted record violates a structural invariant
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// The backing store failed outside of normal contention
    #[error("store error: {0}")]
    Store(String),

    /// A cross-process notification could not be delivered
    #[error("notification error: {0}")]
    Notification(String),

    /// The lease index collaborator rejected an operation
    #[error("lease index error: {0}")]
    LeaseIndex(String),
}
