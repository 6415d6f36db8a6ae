//! In-memory implementation of the [`Backend`] contract for testing.
//!
//! Provides a deterministic, non-persistent backend for unit tests and
//! embedders that want allocator semantics without a cluster. The
//! implementation mirrors the behavior of a replicated KV-store backend
//! without network I/O, including synchronous watch-event delivery to the
//! registered handler.
//!
//! Failure-injection hooks let tests fail the master or slave half of
//! [`update_key`](Backend::update_key) and suppress the list-done marker.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, CacheMutations, GcCandidates, GcStats, KvLock, StaleLocks};
use crate::error::BackendError;
use crate::idpool::{Id, NO_ID};
use crate::key::AllocatorKey;
use crate::rate::RateLimiter;

/// Hook invoked by [`InMemoryBackend`] on one half of an `update_key`.
pub type UpdateHook<K> = Arc<dyn Fn(Id, &K) -> Result<(), BackendError> + Send + Sync>;

struct State<K> {
    /// Master records: the authoritative `id -> key` bindings.
    master_keys: BTreeMap<Id, K>,
    /// Slave records: this store's per-process reference markers.
    slave_keys: HashMap<Id, K>,
    /// Handler registered by `list_and_watch`.
    handler: Option<Arc<dyn CacheMutations<K>>>,
    update_master_hook: Option<UpdateHook<K>>,
    update_slave_hook: Option<UpdateHook<K>>,
    suppress_list_done: bool,
}

/// Deterministic in-memory [`Backend`].
pub struct InMemoryBackend<K: AllocatorKey> {
    state: Mutex<State<K>>,
}

impl<K: AllocatorKey> Default for InMemoryBackend<K> {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                master_keys: BTreeMap::new(),
                slave_keys: HashMap::new(),
                handler: None,
                update_master_hook: None,
                update_slave_hook: None,
                suppress_list_done: false,
            }),
        }
    }
}

impl<K: AllocatorKey> InMemoryBackend<K> {
    /// Create an empty backend.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail or observe the master half of `update_key`.
    pub fn set_update_master_hook(&self, hook: UpdateHook<K>) {
        self.state.lock().update_master_hook = Some(hook);
    }

    /// Fail or observe the slave half of `update_key`.
    pub fn set_update_slave_hook(&self, hook: UpdateHook<K>) {
        self.state.lock().update_slave_hook = Some(hook);
    }

    /// Suppress the list-done marker so watchers never reach the synced
    /// state. Takes effect for subsequent `list_and_watch` calls.
    pub fn suppress_list_done(&self) {
        self.state.lock().suppress_list_done = true;
    }

    /// Delete a master record directly, emitting no watch event. Simulates
    /// out-of-band loss of backend state.
    pub fn delete_master_key(&self, id: Id) {
        self.state.lock().master_keys.remove(&id);
    }

    /// Number of slave records currently stored. Test hook.
    pub fn slave_key_count(&self) -> usize {
        self.state.lock().slave_keys.len()
    }

    /// Drive an upsert through the registered watch handler, as a remote
    /// mutation observed by the watch would. Test hook.
    pub fn inject_upsert(&self, id: Id, key: K) {
        let handler = self.state.lock().handler.clone();
        if let Some(handler) = handler {
            handler.on_upsert(id, key);
        }
    }

    /// Drive a delete through the registered watch handler. Test hook.
    pub fn inject_delete(&self, id: Id, key: K) {
        let handler = self.state.lock().handler.clone();
        if let Some(handler) = handler {
            handler.on_delete(id, key);
        }
    }

    fn handler(&self) -> Option<Arc<dyn CacheMutations<K>>> {
        self.state.lock().handler.clone()
    }
}

struct NoopLock;

#[async_trait]
impl KvLock for NoopLock {
    async fn unlock(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

#[async_trait]
impl<K: AllocatorKey> Backend<K> for InMemoryBackend<K> {
    async fn allocate_id(&self, id: Id, key: &K) -> Result<(), BackendError> {
        {
            let mut state = self.state.lock();
            if state.master_keys.contains_key(&id) {
                return Err(BackendError::AlreadyExists { id });
            }
            state.master_keys.insert(id, key.clone());
        }
        if let Some(handler) = self.handler() {
            handler.on_upsert(id, key.clone());
        }
        Ok(())
    }

    async fn allocate_id_if_locked(
        &self,
        id: Id,
        key: &K,
        _lock: &dyn KvLock,
    ) -> Result<(), BackendError> {
        self.allocate_id(id, key).await
    }

    async fn acquire_reference(
        &self,
        id: Id,
        key: &K,
        _lock: Option<&dyn KvLock>,
    ) -> Result<(), BackendError> {
        {
            let mut state = self.state.lock();
            if !state.master_keys.contains_key(&id) {
                return Err(BackendError::Unavailable {
                    reason: format!("no master record for id {id}"),
                });
            }
            state.slave_keys.insert(id, key.clone());
        }
        if let Some(handler) = self.handler() {
            handler.on_upsert(id, key.clone());
        }
        Ok(())
    }

    async fn release(&self, id: Id, key: &K) -> Result<(), BackendError> {
        let removed = {
            let mut state = self.state.lock();
            match state.slave_keys.get(&id) {
                Some(stored) if stored.get_key() == key.get_key() => {
                    state.slave_keys.remove(&id)
                }
                _ => None,
            }
        };
        match removed {
            Some(stored) => {
                if let Some(handler) = self.handler() {
                    handler.on_delete(id, stored);
                }
                Ok(())
            }
            None => Err(BackendError::NotFound { key: key.get_key() }),
        }
    }

    async fn update_key(&self, id: Id, key: &K, _reliably_missing: bool) -> Result<(), BackendError> {
        let (master_hook, slave_hook) = {
            let mut state = self.state.lock();
            state.master_keys.insert(id, key.clone());
            (state.update_master_hook.clone(), state.update_slave_hook.clone())
        };
        if let Some(hook) = master_hook {
            hook(id, key)?;
        }
        if let Some(hook) = slave_hook {
            hook(id, key)?;
        }
        self.state.lock().slave_keys.insert(id, key.clone());
        Ok(())
    }

    async fn get(&self, key: &K) -> Result<Id, BackendError> {
        let state = self.state.lock();
        // Scans slave records, mirroring the KV-store layout where references
        // are stored per process under the key's value.
        for (id, stored) in &state.slave_keys {
            if stored.get_key() == key.get_key() {
                return Ok(*id);
            }
        }
        Ok(NO_ID)
    }

    async fn get_if_locked(&self, key: &K, _lock: &dyn KvLock) -> Result<Id, BackendError> {
        self.get(key).await
    }

    async fn get_by_id(&self, id: Id) -> Result<Option<K>, BackendError> {
        Ok(self.state.lock().master_keys.get(&id).cloned())
    }

    async fn lock(&self, _key: &K) -> Result<Box<dyn KvLock>, BackendError> {
        Ok(Box::new(NoopLock))
    }

    async fn list_ids(&self) -> Result<Vec<Id>, BackendError> {
        Ok(self.state.lock().master_keys.keys().copied().collect())
    }

    async fn list_and_watch(&self, handler: Arc<dyn CacheMutations<K>>, cancel: CancellationToken) {
        let (snapshot, suppress) = {
            let mut state = self.state.lock();
            state.handler = Some(handler.clone());
            let snapshot: Vec<(Id, K)> = state
                .master_keys
                .iter()
                .map(|(id, key)| (*id, key.clone()))
                .collect();
            (snapshot, state.suppress_list_done)
        };
        for (id, key) in snapshot {
            handler.on_upsert(id, key);
        }
        if !suppress {
            handler.on_list_done();
        }
        cancel.cancelled().await;
    }

    async fn run_gc(
        &self,
        rate: &RateLimiter,
        candidates: GcCandidates,
        min: Id,
        max: Id,
    ) -> Result<(GcCandidates, GcStats), BackendError> {
        let scan: Vec<(Id, K)> = {
            let state = self.state.lock();
            state
                .master_keys
                .range(min..=max)
                .map(|(id, key)| (*id, key.clone()))
                .collect()
        };

        let mut next_round = GcCandidates::new();
        let mut stats = GcStats::default();
        for (id, key) in scan {
            rate.wait().await;
            let referenced = self.state.lock().slave_keys.contains_key(&id);
            if referenced {
                stats.alive += 1;
                continue;
            }
            let key_str = key.get_key();
            if candidates.contains_key(&key_str) {
                // Unreferenced for two consecutive passes: reclaim.
                self.state.lock().master_keys.remove(&id);
                if let Some(handler) = self.handler() {
                    handler.on_delete(id, key);
                }
                stats.deleted += 1;
            } else {
                next_round.insert(key_str, id);
            }
        }
        Ok((next_round, stats))
    }

    async fn run_locks_gc(&self, _stale: StaleLocks) -> Result<StaleLocks, BackendError> {
        // In-memory locks are process-local and cannot leak.
        Ok(StaleLocks::new())
    }

    async fn delete_all_keys(&self) {
        let mut state = self.state.lock();
        state.master_keys.clear();
        state.slave_keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::key::StringKey;

    fn key(s: &str) -> StringKey {
        StringKey::new(s)
    }

    #[tokio::test]
    async fn allocate_id_is_exclusive() {
        let backend = InMemoryBackend::new();
        backend.allocate_id(1, &key("foo")).await.unwrap();
        assert_eq!(
            backend.allocate_id(1, &key("bar")).await,
            Err(BackendError::AlreadyExists { id: 1 })
        );
        assert_eq!(backend.get_by_id(1).await.unwrap().unwrap().get_key(), "foo");
    }

    #[tokio::test]
    async fn get_scans_slave_records_only() {
        let backend = InMemoryBackend::new();
        backend.allocate_id(1, &key("foo")).await.unwrap();

        // A master without slaves is reported as not present.
        assert_eq!(backend.get(&key("foo")).await.unwrap(), NO_ID);

        backend.acquire_reference(1, &key("foo"), None).await.unwrap();
        assert_eq!(backend.get(&key("foo")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn release_requires_matching_record() {
        let backend = InMemoryBackend::new();
        backend.allocate_id(1, &key("foo")).await.unwrap();
        backend.acquire_reference(1, &key("foo"), None).await.unwrap();

        assert!(matches!(
            backend.release(1, &key("bar")).await,
            Err(BackendError::NotFound { .. })
        ));
        backend.release(1, &key("foo")).await.unwrap();
        assert!(matches!(
            backend.release(1, &key("foo")).await,
            Err(BackendError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn gc_reclaims_unreferenced_masters_in_two_passes() {
        let backend = InMemoryBackend::new();
        backend.allocate_id(1, &key("live")).await.unwrap();
        backend.acquire_reference(1, &key("live"), None).await.unwrap();
        backend.allocate_id(2, &key("stale")).await.unwrap();

        let rate = RateLimiter::new(Duration::from_millis(1), 100);

        let (candidates, stats) = backend
            .run_gc(&rate, GcCandidates::new(), 1, 10)
            .await
            .unwrap();
        assert_eq!(stats, GcStats { alive: 1, deleted: 0 });
        assert!(candidates.contains_key("stale"));

        let (candidates, stats) = backend.run_gc(&rate, candidates, 1, 10).await.unwrap();
        assert_eq!(stats, GcStats { alive: 1, deleted: 1 });
        assert!(candidates.is_empty());
        assert!(backend.get_by_id(2).await.unwrap().is_none());
        assert!(backend.get_by_id(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_key_hooks_fire_in_order() {
        let backend = InMemoryBackend::new();
        backend.set_update_master_hook(Arc::new(|_, _| {
            Err(BackendError::Unavailable {
                reason: "injected".to_string(),
            })
        }));

        let err = backend.update_key(7, &key("foo"), true).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable { .. }));
        // The slave half must not have been written after the master failure.
        assert_eq!(backend.slave_key_count(), 0);
    }
}
