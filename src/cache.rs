//! Two-view cache of the cluster's ID-to-key bindings.
//!
//! The *stable* view serves reads. The *pending* view is rebuilt while a
//! list+watch is in flight and promoted atomically once the initial listing
//! completes; afterwards both views track every mutation so a watch restart
//! rebuilds from a consistent base.
//!
//! The cache is also where backend events meet local ownership: upserts
//! reserve the ID in the local pool and acknowledge pending local keys,
//! deletes hand the ID back, and deletes of locally-owned IDs can trigger
//! master-key re-creation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{Backend, CacheMutations};
use crate::events::{
    send_event, AllocatorChange, AllocatorChangeKind, AllocatorEvent, AllocatorEventSender,
    Subscription, OBSERVE_CHANNEL_CAPACITY, SUBSCRIPTION_QUEUE_CAPACITY,
};
use crate::idpool::{Id, IdPool, NO_ID};
use crate::key::AllocatorKey;
use crate::localkeys::LocalKeys;

/// Initial retry interval for master-key re-creation.
const RECREATE_BASE_INTERVAL: Duration = Duration::from_millis(10);

/// Predicate consulted before every cache mutation. A rejected mutation is
/// dropped and emits no event.
pub type CacheValidator<K> = Arc<
    dyn Fn(AllocatorChangeKind, Id, &K) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

pub(crate) struct CacheParams<K: AllocatorKey> {
    pub backend: Arc<dyn Backend<K>>,
    pub local_keys: Arc<LocalKeys<K>>,
    pub id_pool: Arc<IdPool>,
    pub prefix_mask: Id,
    pub events: Option<AllocatorEventSender<K>>,
    pub validators: Vec<CacheValidator<K>>,
    pub master_key_protection: bool,
    pub recreate_max_interval: Duration,
    pub shutdown: CancellationToken,
}

struct Views<K> {
    /// Stable view serving reads.
    cache: HashMap<Id, K>,
    key_cache: HashMap<String, Id>,
    /// Pending view rebuilt during list+watch.
    next_cache: HashMap<Id, K>,
    next_key_cache: HashMap<String, Id>,
    list_done: bool,
}

pub(crate) struct MainCache<K: AllocatorKey> {
    backend: Arc<dyn Backend<K>>,
    local_keys: Arc<LocalKeys<K>>,
    id_pool: Arc<IdPool>,
    prefix_mask: Id,
    events: Option<AllocatorEventSender<K>>,
    validators: Vec<CacheValidator<K>>,
    master_key_protection: AtomicBool,
    recreate_max_interval: Duration,
    shutdown: CancellationToken,
    views: RwLock<Views<K>>,
    subscribers: Mutex<Vec<Arc<Subscription<K>>>>,
    list_done_tx: watch::Sender<bool>,
}

impl<K: AllocatorKey> MainCache<K> {
    pub(crate) fn new(params: CacheParams<K>) -> Arc<Self> {
        let (list_done_tx, _) = watch::channel(false);
        Arc::new(Self {
            backend: params.backend,
            local_keys: params.local_keys,
            id_pool: params.id_pool,
            prefix_mask: params.prefix_mask,
            events: params.events,
            validators: params.validators,
            master_key_protection: AtomicBool::new(params.master_key_protection),
            recreate_max_interval: params.recreate_max_interval,
            shutdown: params.shutdown,
            views: RwLock::new(Views {
                cache: HashMap::new(),
                key_cache: HashMap::new(),
                next_cache: HashMap::new(),
                next_key_cache: HashMap::new(),
                list_done: false,
            }),
            subscribers: Mutex::new(Vec::new()),
            list_done_tx,
        })
    }

    /// Key bound to `id` in the stable view.
    pub(crate) fn get_by_id(&self, id: Id) -> Option<K> {
        self.views.read().cache.get(&id).cloned()
    }

    /// ID bound to the canonical key string in the stable view.
    pub(crate) fn get_by_key(&self, key_str: &str) -> Option<Id> {
        self.views.read().key_cache.get(key_str).copied()
    }

    /// Number of bindings in the stable view.
    pub(crate) fn len(&self) -> usize {
        self.views.read().cache.len()
    }

    /// Invoke `f` for every binding in the stable view.
    pub(crate) fn foreach(&self, f: &mut dyn FnMut(Id, &K)) {
        for (id, key) in &self.views.read().cache {
            f(*id, key);
        }
    }

    /// Whether the initial listing has completed at least once.
    pub(crate) fn is_synced(&self) -> bool {
        *self.list_done_tx.borrow()
    }

    /// Wait until the initial listing completes.
    pub(crate) async fn wait_for_list_done(&self) {
        let mut rx = self.list_done_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub(crate) fn master_key_protection(&self) -> bool {
        self.master_key_protection.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn set_master_key_protection(&self, enabled: bool) {
        self.master_key_protection.store(enabled, Ordering::Release);
    }

    /// Remove every binding matching `pred` from both views, emitting a
    /// Delete event for each.
    ///
    /// Operates on the pending view so that bindings observed during an
    /// incomplete initial listing are drained as well.
    pub(crate) fn drain_if(&self, pred: &dyn Fn(Id) -> bool) {
        let drained: Vec<(Id, K)>;
        {
            let mut views = self.views.write();
            drained = views
                .next_cache
                .iter()
                .filter(|(id, _)| pred(**id))
                .map(|(id, key)| (*id, key.clone()))
                .collect();
            for (id, key) in &drained {
                let key_str = key.get_key();
                views.next_cache.remove(id);
                views.next_key_cache.remove(&key_str);
                views.cache.remove(id);
                views.key_cache.remove(&key_str);
                self.publish(AllocatorChangeKind::Delete, *id, Some(key.clone()));
            }
        }
        for (id, _) in &drained {
            self.id_pool.insert(self.unmask(*id));
        }
    }

    /// Register an observer: replay of the stable view, one Sync marker,
    /// then live changes in cache order. The stream closes when `cancel`
    /// fires, the allocator shuts down, or the receiver is dropped.
    pub(crate) fn observe(&self, cancel: CancellationToken) -> mpsc::Receiver<AllocatorChange<K>> {
        let (tx, rx) = mpsc::channel(OBSERVE_CHANNEL_CAPACITY);
        let subscription = Arc::new(Subscription::new(SUBSCRIPTION_QUEUE_CAPACITY));

        {
            // Hold the view lock across snapshot and registration so no
            // mutation can slip between the replay and the live stream.
            let views = self.views.read();
            for (id, key) in &views.cache {
                subscription.push(AllocatorChange {
                    kind: AllocatorChangeKind::Upsert,
                    id: *id,
                    key: Some(key.clone()),
                });
            }
            subscription.push(AllocatorChange {
                kind: AllocatorChangeKind::Sync,
                id: NO_ID,
                key: None,
            });
            self.subscribers.lock().push(subscription.clone());
        }

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() || shutdown.is_cancelled() {
                    break;
                }
                match subscription.pop() {
                    Some(change) => {
                        if tx.send(change).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = shutdown.cancelled() => break,
                            _ = subscription.notified() => {}
                        }
                    }
                }
            }
            subscription.close();
        });

        rx
    }

    fn unmask(&self, id: Id) -> Id {
        id & !self.prefix_mask
    }

    fn validate(&self, kind: AllocatorChangeKind, id: Id, key: &K) -> bool {
        for validator in &self.validators {
            if let Err(err) = validator(kind, id, key) {
                warn!(
                    kind = %kind,
                    id,
                    key = %key,
                    error = %err,
                    "validation failed, dropping cache mutation"
                );
                return false;
            }
        }
        true
    }

    /// Deliver a change to the global channel and every subscriber.
    ///
    /// Sync markers go to subscribers only; the global channel carries
    /// mutations. Called with the view lock held so subscribers see changes
    /// in the order the cache processed them.
    fn publish(&self, kind: AllocatorChangeKind, id: Id, key: Option<K>) {
        if kind != AllocatorChangeKind::Sync {
            if let (Some(tx), Some(key)) = (&self.events, key.clone()) {
                send_event(tx, AllocatorEvent { kind, id, key });
            }
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscription| !subscription.is_closed());
        for subscription in subscribers.iter() {
            subscription.push(AllocatorChange {
                kind,
                id,
                key: key.clone(),
            });
        }
    }

    /// Re-create the master and slave records for a locally-owned ID whose
    /// master record was deleted out from under us.
    fn spawn_master_key_recreate(&self, id: Id, key: K) {
        let backend = self.backend.clone();
        let cancel = self.shutdown.clone();
        let max_interval = self.recreate_max_interval;
        tokio::spawn(async move {
            let mut interval = RECREATE_BASE_INTERVAL.min(max_interval);
            loop {
                match backend.update_key(id, &key, true).await {
                    Ok(()) => {
                        debug!(id, key = %key, "re-created master key");
                        return;
                    }
                    Err(err) => {
                        warn!(
                            id,
                            key = %key,
                            error = %err,
                            retry_in_ms = interval.as_millis() as u64,
                            "unable to re-create master key"
                        );
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                interval = (interval * 2).min(max_interval);
            }
        });
    }
}

impl<K: AllocatorKey> CacheMutations<K> for MainCache<K> {
    fn on_upsert(&self, id: Id, key: K) {
        if !self.validate(AllocatorChangeKind::Upsert, id, &key) {
            return;
        }
        let key_str = key.get_key();
        {
            let mut views = self.views.write();
            views.next_cache.insert(id, key.clone());
            views.next_key_cache.insert(key_str.clone(), id);
            if views.list_done {
                views.cache.insert(id, key.clone());
                views.key_cache.insert(key_str.clone(), id);
            }
            self.publish(AllocatorChangeKind::Upsert, id, Some(key.clone()));
        }
        // The binding is taken cluster-wide; it must not be leased out here.
        self.id_pool.remove(self.unmask(id));
        // The backend acknowledged the binding; a pending local key for it
        // is now verified.
        if self.local_keys.lookup_key(&key_str) == id {
            let _ = self.local_keys.verify(&key_str);
        }
    }

    fn on_delete(&self, id: Id, key: K) {
        if !self.validate(AllocatorChangeKind::Delete, id, &key) {
            return;
        }
        if self.master_key_protection.load(Ordering::Acquire) {
            if let Some(owned) = self.local_keys.lookup_id(id) {
                // This process still references the ID: keep the binding and
                // restore the backend state instead of dropping it.
                debug!(id, key = %owned, "re-creating master key of locally-owned identity");
                self.spawn_master_key_recreate(id, owned);
                return;
            }
        }
        let key_str = key.get_key();
        {
            let mut views = self.views.write();
            views.next_cache.remove(&id);
            views.next_key_cache.remove(&key_str);
            if views.list_done {
                views.cache.remove(&id);
                views.key_cache.remove(&key_str);
            }
            self.publish(AllocatorChangeKind::Delete, id, Some(key.clone()));
        }
        self.id_pool.insert(self.unmask(id));
    }

    fn on_list_done(&self) {
        let stale: Vec<(Id, K)>;
        {
            let mut views = self.views.write();
            stale = views
                .cache
                .iter()
                .filter(|(id, _)| !views.next_cache.contains_key(*id))
                .map(|(id, key)| (*id, key.clone()))
                .collect();
            for (id, key) in &stale {
                self.publish(AllocatorChangeKind::Delete, *id, Some(key.clone()));
            }
            views.cache = views.next_cache.clone();
            views.key_cache = views.next_key_cache.clone();
            views.list_done = true;
            self.publish(AllocatorChangeKind::Sync, NO_ID, None);
        }
        for (id, _) in &stale {
            self.id_pool.insert(self.unmask(*id));
        }
        debug!(entries = self.len(), "initial listing complete");
        let _ = self.list_done_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::error::BackendError;
    use crate::events::event_channel;
    use crate::inmemory::InMemoryBackend;
    use crate::key::StringKey;

    fn new_cache(
        backend: Arc<InMemoryBackend<StringKey>>,
        events: Option<AllocatorEventSender<StringKey>>,
        validators: Vec<CacheValidator<StringKey>>,
        master_key_protection: bool,
    ) -> (Arc<MainCache<StringKey>>, Arc<LocalKeys<StringKey>>) {
        let local_keys = Arc::new(LocalKeys::new());
        let cache = MainCache::new(CacheParams {
            backend: backend.clone(),
            local_keys: local_keys.clone(),
            id_pool: Arc::new(IdPool::new(1, 1 << 20)),
            prefix_mask: 0,
            events,
            validators,
            master_key_protection,
            recreate_max_interval: Duration::from_millis(1),
            shutdown: CancellationToken::new(),
        });
        (cache, local_keys)
    }

    #[tokio::test]
    async fn pending_view_promotes_on_list_done() {
        let backend = InMemoryBackend::new();
        let (cache, _) = new_cache(backend, None, Vec::new(), false);

        cache.on_upsert(1, StringKey::new("foo"));
        // Reads serve the stable view while the listing is in flight.
        assert!(cache.get_by_id(1).is_none());

        cache.on_list_done();
        assert_eq!(cache.get_by_id(1).unwrap().get_key(), "foo");
        assert_eq!(cache.get_by_key("foo"), Some(1));
        assert!(cache.is_synced());
    }

    #[tokio::test]
    async fn list_done_diff_emits_deletes_for_vanished_entries() {
        let backend = InMemoryBackend::new();
        let (events_tx, mut events_rx) = event_channel(16);
        let (cache, _) = new_cache(backend, Some(events_tx), Vec::new(), false);

        cache.on_upsert(1, StringKey::new("foo"));
        cache.on_list_done();
        assert_eq!(events_rx.recv().await.unwrap().kind, AllocatorChangeKind::Upsert);

        // Restarted listing no longer contains id 1.
        cache.on_upsert(2, StringKey::new("bar"));
        cache.on_list_done();

        let upsert = events_rx.recv().await.unwrap();
        assert_eq!((upsert.kind, upsert.id), (AllocatorChangeKind::Upsert, 2));
        let delete = events_rx.recv().await.unwrap();
        assert_eq!((delete.kind, delete.id), (AllocatorChangeKind::Delete, 1));
        assert!(cache.get_by_id(1).is_none());
        assert_eq!(cache.get_by_id(2).unwrap().get_key(), "bar");
    }

    #[tokio::test]
    async fn validator_rejection_drops_mutation_and_event() {
        let backend = InMemoryBackend::new();
        let (events_tx, mut events_rx) = event_channel(16);
        let validator: CacheValidator<StringKey> = Arc::new(|_, id, _| {
            if id == 11 {
                Err("invalid".into())
            } else {
                Ok(())
            }
        });
        let (cache, _) = new_cache(backend, Some(events_tx), vec![validator], false);
        cache.on_list_done();

        cache.on_upsert(10, StringKey::new("key"));
        let event = events_rx.recv().await.unwrap();
        assert_eq!((event.kind, event.id), (AllocatorChangeKind::Upsert, 10));
        assert_eq!(cache.get_by_id(10).unwrap().get_key(), "key");

        cache.on_upsert(11, StringKey::new("key"));
        assert!(events_rx.try_recv().is_err(), "rejected upsert must not emit");
        assert!(cache.get_by_id(11).is_none());

        cache.on_delete(10, StringKey::new("key"));
        let event = events_rx.recv().await.unwrap();
        assert_eq!((event.kind, event.id), (AllocatorChangeKind::Delete, 10));
        assert!(cache.get_by_id(10).is_none());

        cache.on_delete(11, StringKey::new("key"));
        assert!(events_rx.try_recv().is_err(), "rejected delete must not emit");
    }

    #[tokio::test]
    async fn master_key_protection_retains_owned_binding_and_retries() {
        let backend = InMemoryBackend::new();
        let (cache, local_keys) = new_cache(backend.clone(), None, Vec::new(), true);
        cache.on_list_done();

        local_keys.allocate("foo", &StringKey::new("foo"), 1234).unwrap();
        cache.on_upsert(1234, StringKey::new("foo"));
        assert_eq!(cache.get_by_id(1234).unwrap().get_key(), "foo");

        let counter = Arc::new(AtomicU32::new(0));
        let hook_counter = counter.clone();
        backend.set_update_master_hook(Arc::new(move |_, _| {
            let attempt = hook_counter.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= 2 {
                Err(BackendError::Unavailable {
                    reason: format!("injected failure {attempt}"),
                })
            } else {
                Ok(())
            }
        }));

        cache.on_delete(1234, StringKey::new("foo"));

        // The binding survives and re-creation retries until it succeeds.
        assert_eq!(cache.get_by_id(1234).unwrap().get_key(), "foo");
        tokio::time::timeout(Duration::from_secs(1), async {
            while counter.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("update never succeeded");
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        // With protection off the same delete removes the binding.
        cache.set_master_key_protection(false);
        cache.on_delete(1234, StringKey::new("foo"));
        assert!(cache.get_by_id(1234).is_none());

        // Non-owned bindings are unaffected by protection.
        cache.set_master_key_protection(true);
        cache.on_upsert(4321, StringKey::new("bar"));
        assert_eq!(cache.get_by_id(4321).unwrap().get_key(), "bar");
        cache.on_delete(4321, StringKey::new("bar"));
        assert!(cache.get_by_id(4321).is_none());
    }

    #[tokio::test]
    async fn upsert_verifies_pending_local_key() {
        let backend = InMemoryBackend::new();
        let (cache, local_keys) = new_cache(backend, None, Vec::new(), false);
        cache.on_list_done();

        local_keys.allocate("foo", &StringKey::new("foo"), 5).unwrap();
        assert_eq!(local_keys.use_key("foo"), NO_ID, "not yet verified");

        cache.on_upsert(5, StringKey::new("foo"));
        assert_eq!(local_keys.use_key("foo"), 5);
    }

    #[tokio::test]
    async fn drain_emits_deletes_for_matching_entries() {
        let backend = InMemoryBackend::new();
        let (events_tx, mut events_rx) = event_channel(16);
        let (cache, _) = new_cache(backend, Some(events_tx), Vec::new(), false);

        // Entries observed during an incomplete listing are drainable too.
        cache.on_upsert(1, StringKey::new("keep"));
        cache.on_upsert(2, StringKey::new("drop"));
        assert_eq!(events_rx.recv().await.unwrap().id, 1);
        assert_eq!(events_rx.recv().await.unwrap().id, 2);

        cache.drain_if(&|id| id == 2);
        let event = events_rx.recv().await.unwrap();
        assert_eq!((event.kind, event.id), (AllocatorChangeKind::Delete, 2));
        assert!(events_rx.try_recv().is_err());
    }
}
