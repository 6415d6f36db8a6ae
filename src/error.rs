//! Error types for allocator and backend operations.
//!
//! Provides explicit error types with actionable context. Backend errors are
//! cheap to clone and compare so that retry policies can match on them.

use thiserror::Error;

/// Errors produced by [`Backend`](crate::backend::Backend) implementations.
///
/// The allocator classifies these to drive its retry policy: `AlreadyExists`
/// is contention on a master record and drives the selection-loop retry,
/// `NotFound` on release is absorbed, and `Unavailable` is retried with
/// backoff up to the attempt budget.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// A master record for this ID already exists.
    #[error("id {id} is already allocated")]
    AlreadyExists {
        /// The contended ID.
        id: u64,
    },

    /// No record exists for the given key.
    #[error("key '{key}' not found")]
    NotFound {
        /// Canonical form of the missing key.
        key: String,
    },

    /// The backend could not be reached or failed transiently.
    #[error("backend unavailable: {reason}")]
    Unavailable {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,
}

/// Errors surfaced by [`Allocator`](crate::allocator::Allocator) operations.
#[derive(Debug, Error)]
pub enum AllocatorError {
    /// The ID pool has no available IDs left in the configured range.
    #[error("no more available IDs in the configured space")]
    NoIdsAvailable,

    /// A backend operation failed permanently.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The allocation retry budget was exhausted without success.
    #[error("allocation of key '{key}' failed after {attempts} attempts")]
    AllocationAttemptsExceeded {
        /// Canonical form of the key being allocated.
        key: String,
        /// Number of attempts made.
        attempts: usize,
    },

    /// A local key is already bound to a different ID.
    #[error("local key '{key}' already bound to id {expected}, cannot rebind to {actual}")]
    KeyMismatch {
        /// Canonical form of the conflicting key.
        key: String,
        /// ID the key is bound to on record.
        expected: u64,
        /// Conflicting ID the caller attempted to bind.
        actual: u64,
    },

    /// The key is not present in the local key table.
    #[error("unable to find local key '{key}'")]
    UnknownKey {
        /// Canonical form of the unknown key.
        key: String,
    },

    /// The configured ID range is invalid.
    #[error("invalid id range [{min}, {max}]")]
    InvalidRange {
        /// Lower bound of the range.
        min: u64,
        /// Upper bound of the range.
        max: u64,
    },

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,
}

impl AllocatorError {
    /// Whether another allocation attempt may succeed.
    ///
    /// Contention on a master record and transient backend failures are
    /// retried: the competing writer may lose the race or the backend may
    /// recover before the attempt budget runs out. Pool exhaustion is not
    /// retried; it needs a release to clear.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(
            self,
            AllocatorError::Backend(BackendError::AlreadyExists { .. })
                | AllocatorError::Backend(BackendError::Unavailable { .. })
        )
    }
}
