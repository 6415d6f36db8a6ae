//! Pool of currently-available integer IDs over a closed range.
//!
//! Leasing draws an ID without replacement; a lease is settled either by
//! `release` (return it to the pool) or `use_id` (consume it permanently).
//! All operations are O(1) amortized and thread-safe.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

/// Identifier handed out by the allocator. Unsigned; `NO_ID` is reserved.
pub type Id = u64;

/// Sentinel meaning "no ID". Never handed out by the pool.
pub const NO_ID: Id = 0;

struct PoolState {
    /// Available IDs, in no particular order.
    available: Vec<Id>,
    /// Position of each available ID inside `available`.
    positions: HashMap<Id, usize>,
    /// IDs leased out but not yet settled.
    leased: HashSet<Id>,
}

impl PoolState {
    fn insert(&mut self, id: Id) -> bool {
        if self.positions.contains_key(&id) || self.leased.contains(&id) {
            return false;
        }
        self.positions.insert(id, self.available.len());
        self.available.push(id);
        true
    }

    fn remove(&mut self, id: Id) -> bool {
        let Some(pos) = self.positions.remove(&id) else {
            return false;
        };
        self.available.swap_remove(pos);
        if let Some(&moved) = self.available.get(pos) {
            self.positions.insert(moved, pos);
        }
        true
    }
}

/// Bounded set of currently-available IDs over `[min, max]`.
pub struct IdPool {
    min: Id,
    max: Id,
    state: Mutex<PoolState>,
}

impl IdPool {
    /// Create a pool with every ID in `[min, max]` available.
    pub fn new(min: Id, max: Id) -> Self {
        let count = max.saturating_sub(min).saturating_add(1) as usize;
        let mut state = PoolState {
            available: Vec::with_capacity(count),
            positions: HashMap::with_capacity(count),
            leased: HashSet::new(),
        };
        for id in min..=max {
            state.insert(id);
        }
        Self {
            min,
            max,
            state: Mutex::new(state),
        }
    }

    /// Lease an available ID, or return [`NO_ID`] if the pool is exhausted.
    ///
    /// The lease must be settled with [`release`](Self::release) or
    /// [`use_id`](Self::use_id).
    pub fn lease_available_id(&self) -> Id {
        let mut state = self.state.lock();
        let Some(id) = state.available.pop() else {
            return NO_ID;
        };
        state.positions.remove(&id);
        state.leased.insert(id);
        id
    }

    /// Return a leased ID to the available set.
    pub fn release(&self, id: Id) -> bool {
        let mut state = self.state.lock();
        if !state.leased.remove(&id) {
            return false;
        }
        state.insert(id)
    }

    /// Consume a leased ID permanently.
    pub fn use_id(&self, id: Id) -> bool {
        self.state.lock().leased.remove(&id)
    }

    /// Add an ID to the available set.
    ///
    /// No-op for IDs outside `[min, max]`, already available, or leased.
    pub fn insert(&self, id: Id) -> bool {
        if id < self.min || id > self.max {
            return false;
        }
        self.state.lock().insert(id)
    }

    /// Remove an ID from the available set, e.g. because another node
    /// allocated it.
    pub fn remove(&self, id: Id) -> bool {
        self.state.lock().remove(id)
    }

    /// Number of currently-available IDs.
    pub fn available(&self) -> usize {
        self.state.lock().available.len()
    }

    /// Snapshot of the available IDs.
    pub fn snapshot(&self) -> Vec<Id> {
        self.state.lock().available.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn lease_until_exhausted() {
        let pool = IdPool::new(1, 5);
        let mut seen = HashSet::new();
        for _ in 1..=5 {
            let id = pool.lease_available_id();
            assert_ne!(id, NO_ID);
            assert!((1..=5).contains(&id));
            assert!(seen.insert(id), "id {id} leased twice");
        }
        assert_eq!(pool.lease_available_id(), NO_ID);
    }

    #[test]
    fn release_returns_lease_to_pool() {
        let pool = IdPool::new(1, 1);
        let id = pool.lease_available_id();
        assert_eq!(id, 1);
        assert_eq!(pool.lease_available_id(), NO_ID);

        assert!(pool.release(id));
        assert_eq!(pool.lease_available_id(), 1);
    }

    #[test]
    fn use_id_consumes_lease() {
        let pool = IdPool::new(1, 1);
        let id = pool.lease_available_id();
        assert!(pool.use_id(id));
        // Settled leases cannot be released back.
        assert!(!pool.release(id));
        assert_eq!(pool.lease_available_id(), NO_ID);

        // But the ID can be re-inserted, e.g. after a backend deletion.
        assert!(pool.insert(id));
        assert_eq!(pool.lease_available_id(), id);
    }

    #[test]
    fn insert_rejects_out_of_range() {
        let pool = IdPool::new(10, 20);
        assert!(!pool.insert(9));
        assert!(!pool.insert(21));
        assert!(!pool.insert(10), "already available");
    }

    #[test]
    fn remove_takes_id_out_of_rotation() {
        let pool = IdPool::new(1, 3);
        assert!(pool.remove(2));
        assert!(!pool.remove(2));
        let mut rest = vec![
            pool.lease_available_id(),
            pool.lease_available_id(),
        ];
        rest.sort_unstable();
        assert_eq!(rest, vec![1, 3]);
        assert_eq!(pool.lease_available_id(), NO_ID);
    }

    proptest! {
        #[test]
        fn never_double_leases(ops in prop::collection::vec(0u8..3, 1..200)) {
            let pool = IdPool::new(1, 16);
            let mut leased = HashSet::new();
            for op in ops {
                match op {
                    0 => {
                        let id = pool.lease_available_id();
                        if id != NO_ID {
                            prop_assert!(leased.insert(id), "id {} leased while outstanding", id);
                        }
                    }
                    1 => {
                        if let Some(&id) = leased.iter().next() {
                            leased.remove(&id);
                            prop_assert!(pool.release(id));
                        }
                    }
                    _ => {
                        if let Some(&id) = leased.iter().next() {
                            leased.remove(&id);
                            prop_assert!(pool.use_id(id));
                        }
                    }
                }
            }
        }
    }
}
