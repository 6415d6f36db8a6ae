//! Fan-in of secondary remote allocators into one observable view.
//!
//! Each remote KV store gets its own secondary allocator (built without
//! autostart, sharing the parent's event channel) wrapped in a
//! [`RemoteCache`]. Watching a remote cache streams its mutations into the
//! shared channel; once the remote's initial listing completes the handle is
//! published into the parent's registry, atomically replacing any prior
//! entry under the same name and revoking the replaced entry's stale
//! bindings. A watch cancelled before its first sync never touches the
//! registry, and the partial state it observed is revoked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::allocator::Allocator;
use crate::cache::MainCache;
use crate::key::AllocatorKey;

/// Handle on a secondary allocator mirroring a remote ID namespace.
pub struct RemoteCache<K: AllocatorKey> {
    name: String,
    allocator: Arc<Allocator<K>>,
    parent: Weak<Allocator<K>>,
    synced: AtomicBool,
}

impl<K: AllocatorKey> Allocator<K> {
    /// Construct a handle for the remote namespace `name`, backed by
    /// `remote` — a secondary allocator built `without_autostart` and
    /// `without_gc`, sharing this allocator's event channel.
    pub fn new_remote_cache(self: &Arc<Self>, name: &str, remote: Arc<Allocator<K>>) -> Arc<RemoteCache<K>> {
        Arc::new(RemoteCache {
            name: name.to_string(),
            allocator: remote,
            parent: Arc::downgrade(self),
            synced: AtomicBool::new(false),
        })
    }

    /// Tear down the remote cache registered under `name`, revoking every
    /// binding it contributed.
    pub fn remove_remote_kv_store(&self, name: &str) {
        let removed = self.remote_caches.write().remove(name);
        if let Some(remote) = removed {
            info!(name, "removing remote kvstore");
            remote.cache().drain_if(&|_| true);
        }
    }

    /// Remote cache registered under `name`, if any.
    pub fn remote_cache(&self, name: &str) -> Option<Arc<RemoteCache<K>>> {
        self.remote_caches.read().get(name).cloned()
    }

    /// Number of registered remote caches.
    pub fn num_remote_caches(&self) -> usize {
        self.remote_caches.read().len()
    }
}

impl<K: AllocatorKey> RemoteCache<K> {
    /// Name of the remote namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the remote's initial listing has completed and the handle is
    /// published in the parent registry. Cleared when the watch stops.
    pub fn synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub(crate) fn cache(&self) -> &Arc<MainCache<K>> {
        self.allocator.cache()
    }

    /// Watch the remote namespace until `cancel` fires.
    ///
    /// Mutations stream into the shared event channel from the start. On the
    /// remote's first sync the handle replaces any prior registry entry
    /// under the same name — emitting a Delete for each binding of the prior
    /// entry absent from the new view — and `on_sync` is invoked. If
    /// `cancel` fires before the first sync, the registry keeps the prior
    /// entry and every binding observed during the incomplete listing that
    /// the prior entry does not also hold is revoked.
    pub async fn watch(self: Arc<Self>, cancel: CancellationToken, on_sync: impl FnOnce() + Send) {
        let watch_cancel = cancel.child_token();
        self.allocator.start_watch_with(watch_cancel.clone());

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(name = %self.name, "remote cache watch cancelled before initial sync");
                self.drain_unsynced();
                watch_cancel.cancel();
                return;
            }
            _ = self.cache().wait_for_list_done() => {}
        }

        let Some(parent) = self.parent.upgrade() else {
            warn!(name = %self.name, "parent allocator gone, stopping remote cache watch");
            watch_cancel.cancel();
            return;
        };

        let prior = parent
            .remote_caches
            .write()
            .insert(self.name.clone(), self.clone());
        if let Some(prior) = prior.filter(|prior| !Arc::ptr_eq(prior, &self)) {
            // Revoke bindings of the replaced entry the new view no longer
            // holds.
            let new_cache = self.cache().clone();
            prior.cache().drain_if(&move |id| new_cache.get_by_id(id).is_none());
        }

        self.synced.store(true, Ordering::Release);
        info!(name = %self.name, entries = self.cache().len(), "remote cache synchronized");
        on_sync();

        cancel.cancelled().await;
        self.synced.store(false, Ordering::Release);
        watch_cancel.cancel();
        debug!(name = %self.name, "remote cache watch stopped");
    }

    /// Revoke partial state observed before the initial listing completed,
    /// sparing bindings the registered prior entry also holds.
    fn drain_unsynced(&self) {
        let prior = self
            .parent
            .upgrade()
            .and_then(|parent| parent.remote_cache(&self.name));
        match prior {
            Some(prior) if !std::ptr::eq(Arc::as_ptr(&prior), self as *const _) => {
                let prior_cache = prior.cache().clone();
                self.cache().drain_if(&move |id| prior_cache.get_by_id(id).is_none());
            }
            Some(_) => {}
            None => self.cache().drain_if(&|_| true),
        }
    }
}
