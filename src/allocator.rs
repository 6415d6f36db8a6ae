//! Allocator core: orchestrates the allocation protocol, the cache watcher,
//! reference counting, garbage collection and event fan-out.
//!
//! Allocation takes the fast paths first (local reference, then cached
//! binding), falling back to a slow path that claims an ID under the
//! backend's distributed lock with bounded retries and exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, GcCandidates, GcStats, KvLock, StaleLocks};
use crate::cache::{CacheParams, CacheValidator, MainCache};
use crate::error::{AllocatorError, BackendError};
use crate::events::{
    send_event, AllocatorChange, AllocatorChangeKind, AllocatorEvent, AllocatorEventSender,
};
use crate::idpool::{Id, IdPool, NO_ID};
use crate::key::AllocatorKey;
use crate::localkeys::LocalKeys;
use crate::rate::RateLimiter;
use crate::remote::RemoteCache;

/// Default lower bound of the ID range.
pub const DEFAULT_MIN_ID: Id = 1;

/// Default upper bound of the ID range.
pub const DEFAULT_MAX_ID: Id = 65_535;

/// Attempt budget of the selection-and-claim loop.
const MAX_ALLOC_ATTEMPTS: usize = 16;

const DEFAULT_BACKOFF_MIN: Duration = Duration::from_millis(20);
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_RECREATE_MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Rate limit applied to the periodic GC scan.
const GC_RATE_REFILL_INTERVAL: Duration = Duration::from_secs(1);
const GC_RATE_BURST: u32 = 100;

/// How long shutdown waits for background tasks to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct BackoffConfig {
    min: Duration,
    factor: f64,
    max: Duration,
}

impl BackoffConfig {
    /// Delay before retry `attempt` (zero-based), with jitter.
    fn delay(&self, attempt: usize) -> Duration {
        let base = self.min.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = base.min(self.max.as_secs_f64());
        // Jitter up to half the delay to avoid thundering herds; the rng is
        // created here so no non-Send value lives across an await.
        let jitter = rand::rng().random_range(0.0..=capped / 2.0);
        Duration::from_secs_f64(capped + jitter)
    }
}

/// Builder for [`Allocator`].
///
/// ```ignore
/// let allocator = Allocator::builder(backend)
///     .with_min(1)
///     .with_max(0xFFFF)
///     .with_prefix_mask(1 << 16)
///     .build()?;
/// ```
pub struct AllocatorBuilder<K: AllocatorKey> {
    backend: Arc<dyn Backend<K>>,
    min: Id,
    max: Id,
    prefix_mask: Id,
    events: Option<AllocatorEventSender<K>>,
    backoff: BackoffConfig,
    validators: Vec<CacheValidator<K>>,
    master_key_protection: bool,
    recreate_max_interval: Duration,
    gc_interval: Duration,
    sync_interval: Duration,
    autostart: bool,
    gc_enabled: bool,
}

impl<K: AllocatorKey> AllocatorBuilder<K> {
    /// Lower bound of the ID range (inclusive). Must be nonzero.
    pub fn with_min(mut self, min: Id) -> Self {
        self.min = min;
        self
    }

    /// Upper bound of the ID range (inclusive).
    pub fn with_max(mut self, max: Id) -> Self {
        self.max = max;
        self
    }

    /// Constant OR-ed onto every emitted ID, carrying a namespace tag in the
    /// high bits. The pool tracks unmasked IDs.
    pub fn with_prefix_mask(mut self, mask: Id) -> Self {
        self.prefix_mask = mask;
        self
    }

    /// Bounded channel receiving every cache mutation.
    pub fn with_events(mut self, events: AllocatorEventSender<K>) -> Self {
        self.events = Some(events);
        self
    }

    /// Disable the periodic garbage collection task.
    pub fn without_gc(mut self) -> Self {
        self.gc_enabled = false;
        self
    }

    /// Do not start the watcher and maintenance tasks; the embedder drives
    /// the watch explicitly (used for secondary allocators).
    pub fn without_autostart(mut self) -> Self {
        self.autostart = false;
        self
    }

    /// Add a predicate consulted before every cache mutation.
    pub fn with_cache_validator(
        mut self,
        validator: impl Fn(AllocatorChangeKind, Id, &K) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Tune the retry backoff of the allocation slow path.
    pub fn with_backoff(mut self, factor: f64, max: Duration) -> Self {
        self.backoff.factor = factor;
        self.backoff.max = max;
        self
    }

    /// Re-create backend records for locally-owned IDs deleted out from
    /// under this process.
    pub fn with_master_key_protection(mut self) -> Self {
        self.master_key_protection = true;
        self
    }

    /// Cap on the re-creation retry interval under master-key protection.
    pub fn with_master_key_recreate_max_interval(mut self, interval: Duration) -> Self {
        self.recreate_max_interval = interval;
        self
    }

    /// Period of the garbage collection task.
    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Period of the local key reconciliation task.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Construct the allocator and start its background tasks.
    pub fn build(self) -> Result<Arc<Allocator<K>>, AllocatorError> {
        if self.min == NO_ID || self.min > self.max {
            return Err(AllocatorError::InvalidRange {
                min: self.min,
                max: self.max,
            });
        }

        let shutdown = CancellationToken::new();
        let id_pool = Arc::new(IdPool::new(self.min, self.max));
        let local_keys = Arc::new(LocalKeys::new());
        let main_cache = MainCache::new(CacheParams {
            backend: self.backend.clone(),
            local_keys: local_keys.clone(),
            id_pool: id_pool.clone(),
            prefix_mask: self.prefix_mask,
            events: self.events.clone(),
            validators: self.validators,
            master_key_protection: self.master_key_protection,
            recreate_max_interval: self.recreate_max_interval,
            shutdown: shutdown.clone(),
        });

        let allocator = Arc::new(Allocator {
            backend: self.backend,
            main_cache,
            local_keys,
            id_pool,
            min: self.min,
            max: self.max,
            prefix_mask: self.prefix_mask,
            events: self.events,
            backoff: self.backoff,
            gc_interval: self.gc_interval,
            sync_interval: self.sync_interval,
            remote_caches: RwLock::new(HashMap::new()),
            gc_stale_locks: Mutex::new(StaleLocks::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        if self.autostart {
            allocator.start_watch();
            allocator.spawn_sync_loop();
            if self.gc_enabled {
                allocator.spawn_gc_loop();
            }
        }

        Ok(allocator)
    }
}

/// Distributed identity allocator.
///
/// Maps opaque keys to stable small integer IDs in a cluster-wide shared
/// namespace, with local reference counting and a write-through cache kept
/// consistent by a backend watch. All methods are safe under concurrent
/// invocation.
pub struct Allocator<K: AllocatorKey> {
    backend: Arc<dyn Backend<K>>,
    main_cache: Arc<MainCache<K>>,
    local_keys: Arc<LocalKeys<K>>,
    id_pool: Arc<IdPool>,
    min: Id,
    max: Id,
    prefix_mask: Id,
    events: Option<AllocatorEventSender<K>>,
    backoff: BackoffConfig,
    gc_interval: Duration,
    sync_interval: Duration,
    pub(crate) remote_caches: RwLock<HashMap<String, Arc<RemoteCache<K>>>>,
    gc_stale_locks: Mutex<StaleLocks>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<K: AllocatorKey> Allocator<K> {
    /// Start building an allocator over `backend`.
    pub fn builder<B: Backend<K>>(backend: B) -> AllocatorBuilder<K> {
        AllocatorBuilder {
            backend: Arc::new(backend),
            min: DEFAULT_MIN_ID,
            max: DEFAULT_MAX_ID,
            prefix_mask: 0,
            events: None,
            backoff: BackoffConfig {
                min: DEFAULT_BACKOFF_MIN,
                factor: DEFAULT_BACKOFF_FACTOR,
                max: DEFAULT_BACKOFF_MAX,
            },
            validators: Vec::new(),
            master_key_protection: false,
            recreate_max_interval: DEFAULT_RECREATE_MAX_INTERVAL,
            gc_interval: DEFAULT_GC_INTERVAL,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            autostart: true,
            gc_enabled: true,
        }
    }

    pub(crate) fn cache(&self) -> &Arc<MainCache<K>> {
        &self.main_cache
    }

    /// The local key table. Exposed for inspection in tests and metrics.
    pub fn local_keys(&self) -> &LocalKeys<K> {
        &self.local_keys
    }

    /// Start the backend watcher feeding the main cache.
    ///
    /// Called automatically unless the allocator was built
    /// `without_autostart`.
    pub fn start_watch(self: &Arc<Self>) {
        self.start_watch_with(self.shutdown.child_token());
    }

    pub(crate) fn start_watch_with(self: &Arc<Self>, cancel: CancellationToken) {
        let backend = self.backend.clone();
        let cache = self.main_cache.clone();
        let handle = tokio::spawn(async move {
            backend.list_and_watch(cache, cancel).await;
        });
        self.tasks.lock().push(handle);
    }

    /// Wait until the main cache has observed a complete initial listing.
    pub async fn wait_for_initial_sync(&self) {
        self.main_cache.wait_for_list_done().await;
    }

    /// Whether the main cache has observed a complete initial listing.
    pub fn is_synced(&self) -> bool {
        self.main_cache.is_synced()
    }

    /// Return the ID bound to `key`, creating a binding if none exists.
    ///
    /// Returns `(id, newly_allocated, first_use)`: `newly_allocated` is true
    /// iff this call created the backend master record; `first_use` is true
    /// iff this call brought the local reference count from 0 to 1.
    pub async fn allocate(&self, key: &K) -> Result<(Id, bool, bool), AllocatorError> {
        let key_str = key.get_key();

        // Fast path: we already hold a verified reference.
        let id = self.local_keys.use_key(&key_str);
        if id != NO_ID {
            debug!(key = %key, id, "reusing local reference");
            return Ok((id, false, false));
        }

        // Fast path: the cluster already has a binding; take a reference
        // without the allocation lock. The local entry is recorded first so
        // the watch upsert triggered by the acquisition can verify it.
        if let Some(id) = self.main_cache.get_by_key(&key_str) {
            let first_use = self.local_keys.allocate(&key_str, key, id)?;
            match self.backend.acquire_reference(id, key, None).await {
                Ok(()) => {
                    self.verify_local_key(&key_str);
                    debug!(key = %key, id, first_use, "reused cached binding");
                    return Ok((id, false, first_use));
                }
                Err(err) => {
                    let _ = self.local_keys.release(&key_str);
                    debug!(
                        key = %key,
                        id,
                        error = %err,
                        "unlocked reference acquisition failed, taking slow path"
                    );
                }
            }
        }

        // Slow path: claim a binding under the distributed lock, with
        // bounded retries for contention and transient failures.
        for attempt in 0..MAX_ALLOC_ATTEMPTS {
            if self.shutdown.is_cancelled() {
                return Err(AllocatorError::Cancelled);
            }
            match self.locked_allocate(key, &key_str).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_retryable() => {
                    debug!(key = %key, attempt, error = %err, "allocation attempt failed");
                }
                Err(err) => return Err(err),
            }
            tokio::time::sleep(self.backoff.delay(attempt)).await;
        }

        warn!(key = %key, attempts = MAX_ALLOC_ATTEMPTS, "allocation attempts exhausted");
        Err(AllocatorError::AllocationAttemptsExceeded {
            key: key_str,
            attempts: MAX_ALLOC_ATTEMPTS,
        })
    }

    async fn locked_allocate(&self, key: &K, key_str: &str) -> Result<(Id, bool, bool), AllocatorError> {
        let lock = self.backend.lock(key).await?;
        let result = self.locked_allocate_inner(key, key_str, &*lock).await;
        if let Err(err) = lock.unlock().await {
            warn!(key = %key, error = %err, "failed to release allocation lock");
        }
        result
    }

    async fn locked_allocate_inner(
        &self,
        key: &K,
        key_str: &str,
        lock: &dyn KvLock,
    ) -> Result<(Id, bool, bool), AllocatorError> {
        // Re-check under the lock: a competing allocator may have won the
        // race since the fast path.
        let mut id = self.main_cache.get_by_key(key_str).unwrap_or(NO_ID);
        if id == NO_ID {
            id = self.backend.get_if_locked(key, lock).await?;
        }
        if id != NO_ID {
            let first_use = self.local_keys.allocate(key_str, key, id)?;
            if let Err(err) = self.backend.acquire_reference(id, key, Some(lock)).await {
                let _ = self.local_keys.release(key_str);
                return Err(err.into());
            }
            self.verify_local_key(key_str);
            return Ok((id, false, first_use));
        }

        // Selection and claim.
        let (masked_id, unmasked_id) = self.select_available_id();
        if masked_id == NO_ID {
            return Err(AllocatorError::NoIdsAvailable);
        }
        let first_use = match self.local_keys.allocate(key_str, key, masked_id) {
            Ok(first_use) => first_use,
            Err(err) => {
                self.id_pool.release(unmasked_id);
                return Err(err);
            }
        };
        if let Err(err) = self.backend.allocate_id_if_locked(masked_id, key, lock).await {
            // Contention on the master record: put the ID back and let the
            // caller retry with a fresh selection.
            let _ = self.local_keys.release(key_str);
            self.id_pool.release(unmasked_id);
            return Err(err.into());
        }
        self.id_pool.use_id(unmasked_id);

        if let Err(err) = self.backend.acquire_reference(masked_id, key, Some(lock)).await {
            let _ = self.local_keys.release(key_str);
            return Err(err.into());
        }
        self.verify_local_key(key_str);

        info!(key = %key, id = masked_id, "allocated new identity");
        Ok((masked_id, true, true))
    }

    /// Lease an ID and apply the prefix mask; `(NO_ID, NO_ID)` on
    /// exhaustion. Returns `(masked, unmasked)`; the pool tracks the
    /// unmasked value.
    fn select_available_id(&self) -> (Id, Id) {
        let unmasked = self.id_pool.lease_available_id();
        if unmasked == NO_ID {
            return (NO_ID, NO_ID);
        }
        (unmasked | self.prefix_mask, unmasked)
    }

    /// Under master-key protection, verification waits for the cache to
    /// observe the upsert; otherwise the backend acknowledgement suffices.
    fn verify_local_key(&self, key_str: &str) {
        if !self.main_cache.master_key_protection() {
            let _ = self.local_keys.verify(key_str);
        }
    }

    /// Drop one local reference to `key`.
    ///
    /// Returns true iff this was the last local reference, in which case the
    /// slave record is removed from the backend. A missing backend record is
    /// treated as already reconciled.
    pub async fn release(&self, key: &K) -> Result<bool, AllocatorError> {
        let key_str = key.get_key();
        let (last_use, id) = self.local_keys.release(&key_str)?;
        if !last_use {
            return Ok(false);
        }

        match self.backend.release(id, key).await {
            Ok(()) => {}
            Err(BackendError::NotFound { .. }) => {
                debug!(key = %key, id, "backend reference already gone");
            }
            Err(err) => {
                // The slave record lingers until GC; local state stays
                // authoritative for the refcount.
                warn!(key = %key, id, error = %err, "backend release failed, leaving to GC");
            }
        }

        if self.main_cache.get_by_key(&key_str).is_none() {
            // The cluster no longer references the ID: make it available
            // again and tell the embedder.
            self.id_pool.insert(id & !self.prefix_mask);
            if let Some(tx) = &self.events {
                send_event(
                    tx,
                    AllocatorEvent {
                        kind: AllocatorChangeKind::Delete,
                        id,
                        key: key.clone(),
                    },
                );
            }
        }

        debug!(key = %key, id, "released last local reference");
        Ok(true)
    }

    /// ID bound to `key`, from the cache or the backend's slave records.
    ///
    /// [`NO_ID`] means "not present", including the case where a master
    /// record exists but no process currently references it.
    pub async fn get(&self, key: &K) -> Result<Id, AllocatorError> {
        if let Some(id) = self.main_cache.get_by_key(&key.get_key()) {
            return Ok(id);
        }
        Ok(self.backend.get(key).await?)
    }

    /// Key bound to `id`, from the cache or the backend's master records.
    pub async fn get_by_id(&self, id: Id) -> Result<Option<K>, AllocatorError> {
        if let Some(key) = self.main_cache.get_by_id(id) {
            return Ok(Some(key));
        }
        Ok(self.backend.get_by_id(id).await?)
    }

    /// Like [`get`](Self::get), also consulting the registered remote
    /// caches.
    pub async fn get_include_remote_caches(&self, key: &K) -> Result<Id, AllocatorError> {
        let key_str = key.get_key();
        if let Some(id) = self.main_cache.get_by_key(&key_str) {
            return Ok(id);
        }
        {
            let remotes = self.remote_caches.read();
            for remote in remotes.values() {
                if let Some(id) = remote.cache().get_by_key(&key_str) {
                    return Ok(id);
                }
            }
        }
        Ok(self.backend.get(key).await?)
    }

    /// Like [`get_by_id`](Self::get_by_id), also consulting the registered
    /// remote caches.
    pub async fn get_by_id_include_remote_caches(&self, id: Id) -> Result<Option<K>, AllocatorError> {
        if let Some(key) = self.main_cache.get_by_id(id) {
            return Ok(Some(key));
        }
        {
            let remotes = self.remote_caches.read();
            for remote in remotes.values() {
                if let Some(key) = remote.cache().get_by_id(id) {
                    return Ok(Some(key));
                }
            }
        }
        Ok(self.backend.get_by_id(id).await?)
    }

    /// Subscribe to allocator changes.
    ///
    /// Replays every currently-stable binding as Upsert in unspecified
    /// order, then a single Sync marker, then live changes until `cancel`
    /// fires, at which point the channel closes.
    pub fn observe(&self, cancel: CancellationToken) -> mpsc::Receiver<AllocatorChange<K>> {
        self.main_cache.observe(cancel)
    }

    /// Invoke `f` for every binding in the main cache and all remote caches.
    pub fn foreach_cache(&self, mut f: impl FnMut(Id, &K)) {
        self.main_cache.foreach(&mut f);
        for remote in self.remote_caches.read().values() {
            remote.cache().foreach(&mut f);
        }
    }

    /// Run one garbage collection pass.
    ///
    /// `candidates` is the map returned by the previous pass; an ID must be
    /// seen unreferenced in two consecutive passes before it is reclaimed.
    /// IDs this process still holds verified references to are never
    /// candidates. Also sweeps distributed locks suspected stale in prior
    /// passes.
    pub async fn run_gc(
        &self,
        rate: &RateLimiter,
        candidates: GcCandidates,
    ) -> Result<(GcCandidates, GcStats), AllocatorError> {
        let mut candidates = candidates;
        for key in self.local_keys.get_verified_ids().values() {
            candidates.remove(&key.get_key());
        }

        let (next_round, stats) = self
            .backend
            .run_gc(
                rate,
                candidates,
                self.min | self.prefix_mask,
                self.max | self.prefix_mask,
            )
            .await?;

        let stale = { self.gc_stale_locks.lock().clone() };
        let still_stale = self.backend.run_locks_gc(stale).await?;
        *self.gc_stale_locks.lock() = still_stale;

        debug!(alive = stats.alive, deleted = stats.deleted, "garbage collection pass complete");
        Ok((next_round, stats))
    }

    /// Repair backend records for every verified local key.
    ///
    /// Safe to run concurrently with [`release`](Self::release): if a key is
    /// released between the snapshot and the write, the freshly-written
    /// slave record is removed again.
    pub async fn sync_local_keys(&self) -> Result<(), AllocatorError> {
        for (id, key) in self.local_keys.get_verified_ids() {
            if let Err(err) = self.backend.update_key(id, &key, false).await {
                warn!(id, key = %key, error = %err, "unable to sync local key");
                continue;
            }
            let key_str = key.get_key();
            if self.local_keys.lookup_key(&key_str) == NO_ID {
                // Released while we were writing; take the slave record back
                // out so nothing leaks.
                match self.backend.release(id, &key).await {
                    Ok(()) | Err(BackendError::NotFound { .. }) => {}
                    Err(err) => {
                        warn!(id, key = %key, error = %err, "unable to undo stale sync");
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove every master and slave record from the backend. Test and
    /// reset helper.
    pub async fn delete_all_keys(&self) {
        self.backend.delete_all_keys().await;
    }

    /// Stop all background tasks and close subscription streams.
    ///
    /// Pending releases demanded by local reference counts have already
    /// reached the backend by the time their callers returned; shutdown only
    /// waits for the maintenance tasks to drain, bounded by a grace timeout.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("background task did not stop within grace period");
            }
        }
        info!("allocator shut down");
    }

    fn spawn_gc_loop(self: &Arc<Self>) {
        let allocator = self.clone();
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(async move {
            let rate = RateLimiter::new(GC_RATE_REFILL_INTERVAL, GC_RATE_BURST);
            let mut ticker = tokio::time::interval(allocator.gc_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh allocator
            // does not scan an empty range.
            ticker.tick().await;
            let mut candidates = GcCandidates::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match allocator.run_gc(&rate, std::mem::take(&mut candidates)).await {
                            Ok((next_round, _stats)) => candidates = next_round,
                            Err(err) => warn!(error = %err, "garbage collection pass failed"),
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_sync_loop(self: &Arc<Self>) {
        let allocator = self.clone();
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(allocator.sync_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = allocator.sync_local_keys().await {
                            warn!(error = %err, "local key sync failed");
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inmemory::InMemoryBackend;
    use crate::key::StringKey;

    fn key(s: &str) -> StringKey {
        StringKey::new(s)
    }

    #[tokio::test]
    async fn select_available_id_exhausts_range() {
        let backend = InMemoryBackend::<StringKey>::new();
        let allocator = Allocator::builder(backend)
            .with_min(1)
            .with_max(5)
            .without_gc()
            .build()
            .unwrap();

        for _ in 1..=5 {
            let (masked, unmasked) = allocator.select_available_id();
            assert_ne!(masked, NO_ID);
            assert_eq!(masked, unmasked);
        }
        assert_eq!(allocator.select_available_id(), (NO_ID, NO_ID));
        allocator.shutdown().await;
    }

    #[tokio::test]
    async fn select_available_id_applies_prefix_mask() {
        let backend = InMemoryBackend::<StringKey>::new();
        let allocator = Allocator::builder(backend)
            .with_min(1)
            .with_max(5)
            .with_prefix_mask(1 << 16)
            .without_gc()
            .build()
            .unwrap();

        for _ in 1..=5 {
            let (masked, unmasked) = allocator.select_available_id();
            assert_ne!(masked, NO_ID);
            assert_eq!(masked >> 16, 1);
            assert_ne!(masked, unmasked);
            assert_eq!(masked & !(1 << 16), unmasked);
        }
        allocator.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_range_is_rejected() {
        let backend = InMemoryBackend::<StringKey>::new();
        assert!(matches!(
            Allocator::builder(backend.clone()).with_min(0).build(),
            Err(AllocatorError::InvalidRange { .. })
        ));
        assert!(matches!(
            Allocator::builder(backend).with_min(10).with_max(9).build(),
            Err(AllocatorError::InvalidRange { .. })
        ));
    }

    #[tokio::test]
    async fn allocate_is_idempotent_per_reference() {
        let backend = InMemoryBackend::new();
        let allocator = Allocator::builder(backend)
            .with_max(10)
            .without_gc()
            .build()
            .unwrap();
        allocator.wait_for_initial_sync().await;

        let (id, newly_allocated, first_use) = allocator.allocate(&key("foo")).await.unwrap();
        assert_ne!(id, NO_ID);
        assert!(newly_allocated);
        assert!(first_use);

        let (id2, newly_allocated, first_use) = allocator.allocate(&key("foo")).await.unwrap();
        assert_eq!(id2, id);
        assert!(!newly_allocated);
        assert!(!first_use);
        assert_eq!(allocator.local_keys().refcnt("foo"), Some(2));

        assert!(!allocator.release(&key("foo")).await.unwrap());
        assert!(allocator.release(&key("foo")).await.unwrap());
        assert_eq!(allocator.local_keys().refcnt("foo"), None);
        allocator.shutdown().await;
    }

    #[tokio::test]
    async fn release_of_unknown_key_fails() {
        let backend = InMemoryBackend::new();
        let allocator = Allocator::builder(backend).without_gc().build().unwrap();
        assert!(matches!(
            allocator.release(&key("nope")).await,
            Err(AllocatorError::UnknownKey { .. })
        ));
        allocator.shutdown().await;
    }
}
