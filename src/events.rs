//! Event types and delivery plumbing.
//!
//! Two event paths exist. The *global channel* is a caller-supplied bounded
//! queue receiving every cache mutation; the core must not assume
//! unboundedness and degrades by dropping events with a warning when the
//! channel is full. *Subscription streams* are per-observer queues that
//! replay the stable cache, emit a sync marker, then follow live changes.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::idpool::Id;
use crate::key::AllocatorKey;

/// High-water mark of a subscription queue before non-sync changes are
/// dropped for that subscriber.
pub(crate) const SUBSCRIPTION_QUEUE_CAPACITY: usize = 1024;

/// Capacity of the channel handed to an observer.
pub(crate) const OBSERVE_CHANNEL_CAPACITY: usize = 128;

/// Kind of a cache mutation or stream marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocatorChangeKind {
    /// An ID-to-key binding was created or updated.
    Upsert,
    /// An ID-to-key binding was removed.
    Delete,
    /// The initial listing completed; the stream now reflects the full state.
    Sync,
}

impl AllocatorChangeKind {
    /// Stable string form for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
            Self::Sync => "sync",
        }
    }
}

impl fmt::Display for AllocatorChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event delivered on the global channel.
///
/// Sync markers are never delivered here; the channel carries mutations only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorEvent<K> {
    /// What happened.
    pub kind: AllocatorChangeKind,
    /// The affected ID.
    pub id: Id,
    /// The affected key.
    pub key: K,
}

/// Change delivered on a subscription stream.
///
/// `key` is `None` only for [`AllocatorChangeKind::Sync`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorChange<K> {
    /// What happened.
    pub kind: AllocatorChangeKind,
    /// The affected ID; zero for sync markers.
    pub id: Id,
    /// The affected key; absent for sync markers.
    pub key: Option<K>,
}

/// Sending half of the caller-supplied global event channel.
pub type AllocatorEventSender<K> = mpsc::Sender<AllocatorEvent<K>>;

/// Receiving half of the global event channel.
pub type AllocatorEventReceiver<K> = mpsc::Receiver<AllocatorEvent<K>>;

/// Create a bounded global event channel.
pub fn event_channel<K: AllocatorKey>(capacity: usize) -> (AllocatorEventSender<K>, AllocatorEventReceiver<K>) {
    mpsc::channel(capacity)
}

/// Best-effort send on the global channel.
///
/// A full channel drops the event with a warning; a closed channel drops it
/// silently. Mutation delivery here is advisory, the cache views stay
/// authoritative.
pub(crate) fn send_event<K: AllocatorKey>(tx: &AllocatorEventSender<K>, event: AllocatorEvent<K>) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            warn!(
                kind = %event.kind,
                id = event.id,
                key = %event.key,
                "event channel full, dropping event"
            );
        }
        Err(mpsc::error::TrySendError::Closed(event)) => {
            debug!(kind = %event.kind, id = event.id, "event channel closed, dropping event");
        }
    }
}

/// Per-subscriber buffer between the cache and the observer's channel.
///
/// The cache pushes changes here while holding its own lock; a forwarder
/// task drains the queue into the observer's bounded channel so that user
/// code is never reached from under a lock.
pub(crate) struct Subscription<K> {
    queue: Mutex<VecDeque<AllocatorChange<K>>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl<K: AllocatorKey> Subscription<K> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a change for this subscriber.
    ///
    /// Non-sync changes are dropped with a warning once the queue is at
    /// capacity; sync markers are always enqueued so a lagging subscriber
    /// still learns where a consistent snapshot ends.
    pub(crate) fn push(&self, change: AllocatorChange<K>) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity && change.kind != AllocatorChangeKind::Sync {
                warn!(
                    kind = %change.kind,
                    id = change.id,
                    "subscription queue full, dropping change for slow observer"
                );
                return;
            }
            queue.push_back(change);
        }
        self.notify.notify_one();
    }

    pub(crate) fn pop(&self) -> Option<AllocatorChange<K>> {
        self.queue.lock().pop_front()
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::StringKey;

    fn upsert(id: Id) -> AllocatorChange<StringKey> {
        AllocatorChange {
            kind: AllocatorChangeKind::Upsert,
            id,
            key: Some(StringKey::new(format!("key-{id}"))),
        }
    }

    #[test]
    fn kind_display() {
        assert_eq!(AllocatorChangeKind::Upsert.to_string(), "upsert");
        assert_eq!(AllocatorChangeKind::Delete.to_string(), "delete");
        assert_eq!(AllocatorChangeKind::Sync.to_string(), "sync");
    }

    #[test]
    fn subscription_drops_non_sync_at_capacity() {
        let sub: Subscription<StringKey> = Subscription::new(2);
        sub.push(upsert(1));
        sub.push(upsert(2));
        sub.push(upsert(3)); // dropped
        sub.push(AllocatorChange {
            kind: AllocatorChangeKind::Sync,
            id: 0,
            key: None,
        }); // kept despite being over capacity

        assert_eq!(sub.pop().unwrap().id, 1);
        assert_eq!(sub.pop().unwrap().id, 2);
        assert_eq!(sub.pop().unwrap().kind, AllocatorChangeKind::Sync);
        assert!(sub.pop().is_none());
    }

    #[tokio::test]
    async fn global_channel_overflow_drops_event() {
        let (tx, mut rx) = event_channel::<StringKey>(1);
        send_event(
            &tx,
            AllocatorEvent {
                kind: AllocatorChangeKind::Upsert,
                id: 1,
                key: StringKey::new("a"),
            },
        );
        send_event(
            &tx,
            AllocatorEvent {
                kind: AllocatorChangeKind::Upsert,
                id: 2,
                key: StringKey::new("b"),
            },
        );

        assert_eq!(rx.recv().await.unwrap().id, 1);
        assert!(rx.try_recv().is_err(), "second event should have been dropped");
    }
}
