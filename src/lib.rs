//! Distributed identity allocator.
//!
//! Maps opaque application-defined keys to stable small integer IDs in a
//! cluster-wide shared namespace backed by a linearizable key-value store:
//!
//! - [`Allocator`] - allocate/release with local reference counting and a
//!   compare-and-swap claim protocol under a distributed lock
//! - [`Backend`] - the persistence, locking and watch contract; an
//!   [`InMemoryBackend`] is provided for tests and embedders
//! - [`IdPool`] - O(1) pool of available IDs over a closed range
//! - [`RemoteCache`] - fan-in of secondary remote namespaces into one
//!   observable view
//!
//! Durable state lives entirely in the backend; the allocator keeps a
//! write-through cache reconciled by a list+watch stream and repairs drift
//! with periodic garbage collection and local key synchronization.
//!
//! ## Example
//!
//! ```ignore
//! use aspen_allocator::{Allocator, InMemoryBackend, StringKey};
//!
//! let backend = InMemoryBackend::new();
//! let allocator = Allocator::builder(backend)
//!     .with_min(1)
//!     .with_max(0xFFFF)
//!     .build()?;
//!
//! let (id, newly_allocated, first_use) = allocator.allocate(&StringKey::new("foo")).await?;
//! allocator.release(&StringKey::new("foo")).await?;
//! ```

#![warn(missing_docs)]

mod allocator;
mod backend;
mod cache;
mod error;
mod events;
mod idpool;
mod inmemory;
mod key;
mod localkeys;
mod rate;
mod remote;

pub use allocator::{Allocator, AllocatorBuilder, DEFAULT_MAX_ID, DEFAULT_MIN_ID};
pub use backend::{Backend, CacheMutations, GcCandidates, GcStats, KvLock, StaleLocks};
pub use cache::CacheValidator;
pub use error::{AllocatorError, BackendError};
pub use events::{
    event_channel, AllocatorChange, AllocatorChangeKind, AllocatorEvent, AllocatorEventReceiver,
    AllocatorEventSender,
};
pub use idpool::{Id, IdPool, NO_ID};
pub use inmemory::{InMemoryBackend, UpdateHook};
pub use key::{AllocatorKey, StringKey};
pub use localkeys::{LocalKey, LocalKeys};
pub use rate::RateLimiter;
pub use remote::RemoteCache;
