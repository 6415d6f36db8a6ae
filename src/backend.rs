//! Backend contract the allocator depends on for persistence, locking and
//! watch.
//!
//! A backend stores two kinds of facts. The *master* record is the global
//! assertion "ID X is assigned to key K", created by the first allocator to
//! win the race. The *slave* record is the per-process assertion "this
//! process holds a reference to ID X with key K", created by every process
//! that uses the ID.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::BackendError;
use crate::idpool::Id;
use crate::key::AllocatorKey;
use crate::rate::RateLimiter;

/// Opaque handle on a distributed lock over a key's namespace.
#[async_trait]
pub trait KvLock: Send + Sync {
    /// Release the lock. Idempotent on a best-effort basis; the lock also
    /// expires on its own if the holder dies.
    async fn unlock(&self) -> Result<(), BackendError>;
}

/// Handler driven by [`Backend::list_and_watch`].
///
/// Implementations must tolerate being called from the backend's watch task;
/// the methods are synchronous and must not block.
pub trait CacheMutations<K: AllocatorKey>: Send + Sync {
    /// A master record was created or updated.
    fn on_upsert(&self, id: Id, key: K);

    /// A master record was deleted.
    fn on_delete(&self, id: Id, key: K);

    /// Every preexisting master record has been reported via `on_upsert`.
    fn on_list_done(&self);
}

/// Statistics reported by a garbage collection pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcStats {
    /// Number of IDs still referenced by at least one slave record.
    pub alive: u64,
    /// Number of master records reclaimed in this pass.
    pub deleted: u64,
}

/// Map of reclamation candidates carried between GC passes, keyed by the
/// canonical key string. A candidate seen unreferenced in two consecutive
/// passes is reclaimed.
pub type GcCandidates = HashMap<String, u64>;

/// Map of distributed locks suspected stale, carried between lock GC passes.
pub type StaleLocks = HashMap<String, u64>;

/// Persistence, locking and watch operations the allocator core requires.
///
/// Implementations must be linearizable: within one ID, mutations observed
/// through [`list_and_watch`](Self::list_and_watch) occur in the order they
/// were applied.
#[async_trait]
pub trait Backend<K: AllocatorKey>: Send + Sync + 'static {
    /// Create the master record binding `id` to `key`.
    ///
    /// Fails with [`BackendError::AlreadyExists`] if `id` is taken.
    async fn allocate_id(&self, id: Id, key: &K) -> Result<(), BackendError>;

    /// Like [`allocate_id`](Self::allocate_id), guarded by a distributed
    /// lock token obtained from [`lock`](Self::lock).
    async fn allocate_id_if_locked(
        &self,
        id: Id,
        key: &K,
        lock: &dyn KvLock,
    ) -> Result<(), BackendError>;

    /// Create or refresh this process's slave record for `id`.
    async fn acquire_reference(
        &self,
        id: Id,
        key: &K,
        lock: Option<&dyn KvLock>,
    ) -> Result<(), BackendError>;

    /// Remove this process's slave record for `(id, key)`.
    ///
    /// Fails with [`BackendError::NotFound`] if the record is absent.
    async fn release(&self, id: Id, key: &K) -> Result<(), BackendError>;

    /// (Re)write both the master and slave records for `(id, key)`.
    ///
    /// `reliably_missing` hints that the caller knows the records are gone,
    /// letting the backend skip a read before writing.
    async fn update_key(&self, id: Id, key: &K, reliably_missing: bool) -> Result<(), BackendError>;

    /// Look up the ID bound to `key` by scanning slave records.
    ///
    /// Returns [`NO_ID`](crate::idpool::NO_ID) when no slave record exists —
    /// including when a master record exists but no process references it;
    /// callers must treat that case the same as "not present".
    async fn get(&self, key: &K) -> Result<Id, BackendError>;

    /// Like [`get`](Self::get), under a distributed lock.
    async fn get_if_locked(&self, key: &K, lock: &dyn KvLock) -> Result<Id, BackendError>;

    /// Look up the key bound to `id` from master records.
    async fn get_by_id(&self, id: Id) -> Result<Option<K>, BackendError>;

    /// Acquire the distributed lock for `key`'s namespace.
    async fn lock(&self, key: &K) -> Result<Box<dyn KvLock>, BackendError>;

    /// Snapshot of all master record IDs.
    async fn list_ids(&self) -> Result<Vec<Id>, BackendError>;

    /// Emit `on_upsert` for every preexisting master record, then
    /// `on_list_done`, then stream live changes to `handler`.
    ///
    /// Returns only when `cancel` fires.
    async fn list_and_watch(&self, handler: Arc<dyn CacheMutations<K>>, cancel: CancellationToken);

    /// Reclaim master records in `[min, max]` with no slave reference.
    ///
    /// Reclamation is two-phase: an unreferenced ID seen for the first time
    /// is recorded in the returned candidate map; an ID already present in
    /// `candidates` is deleted. `rate` bounds backend pressure during the
    /// scan.
    async fn run_gc(
        &self,
        rate: &RateLimiter,
        candidates: GcCandidates,
        min: Id,
        max: Id,
    ) -> Result<(GcCandidates, GcStats), BackendError>;

    /// Inspect distributed locks suspected stale in a prior pass and release
    /// the ones still stale; returns the new suspect set.
    async fn run_locks_gc(&self, stale: StaleLocks) -> Result<StaleLocks, BackendError>;

    /// Remove every master and slave record. Test and reset helper.
    async fn delete_all_keys(&self);
}

// Blanket implementation for Arc<B>
#[async_trait]
impl<K: AllocatorKey, B: Backend<K> + ?Sized> Backend<K> for Arc<B> {
    async fn allocate_id(&self, id: Id, key: &K) -> Result<(), BackendError> {
        (**self).allocate_id(id, key).await
    }

    async fn allocate_id_if_locked(
        &self,
        id: Id,
        key: &K,
        lock: &dyn KvLock,
    ) -> Result<(), BackendError> {
        (**self).allocate_id_if_locked(id, key, lock).await
    }

    async fn acquire_reference(
        &self,
        id: Id,
        key: &K,
        lock: Option<&dyn KvLock>,
    ) -> Result<(), BackendError> {
        (**self).acquire_reference(id, key, lock).await
    }

    async fn release(&self, id: Id, key: &K) -> Result<(), BackendError> {
        (**self).release(id, key).await
    }

    async fn update_key(&self, id: Id, key: &K, reliably_missing: bool) -> Result<(), BackendError> {
        (**self).update_key(id, key, reliably_missing).await
    }

    async fn get(&self, key: &K) -> Result<Id, BackendError> {
        (**self).get(key).await
    }

    async fn get_if_locked(&self, key: &K, lock: &dyn KvLock) -> Result<Id, BackendError> {
        (**self).get_if_locked(key, lock).await
    }

    async fn get_by_id(&self, id: Id) -> Result<Option<K>, BackendError> {
        (**self).get_by_id(id).await
    }

    async fn lock(&self, key: &K) -> Result<Box<dyn KvLock>, BackendError> {
        (**self).lock(key).await
    }

    async fn list_ids(&self) -> Result<Vec<Id>, BackendError> {
        (**self).list_ids().await
    }

    async fn list_and_watch(&self, handler: Arc<dyn CacheMutations<K>>, cancel: CancellationToken) {
        (**self).list_and_watch(handler, cancel).await
    }

    async fn run_gc(
        &self,
        rate: &RateLimiter,
        candidates: GcCandidates,
        min: Id,
        max: Id,
    ) -> Result<(GcCandidates, GcStats), BackendError> {
        (**self).run_gc(rate, candidates, min, max).await
    }

    async fn run_locks_gc(&self, stale: StaleLocks) -> Result<StaleLocks, BackendError> {
        (**self).run_locks_gc(stale).await
    }

    async fn delete_all_keys(&self) {
        (**self).delete_all_keys().await
    }
}
