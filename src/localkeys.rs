//! Reference-counted table of keys owned by the local process.
//!
//! The table is indexed both by canonical key string and by ID. An entry is
//! created on first allocation and destroyed when its reference count drops
//! to zero. The `verified` flag is set once the backend has acknowledged the
//! slave record for the ID; unverified entries behave as if they do not
//! exist for the read paths that hand out references.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::AllocatorError;
use crate::idpool::{Id, NO_ID};
use crate::key::AllocatorKey;

/// A key the local process holds references to.
#[derive(Debug, Clone)]
pub struct LocalKey<K> {
    /// The key value.
    pub key: K,
    /// The ID the key is bound to.
    pub id: Id,
    /// Outstanding references: allocations not yet balanced by releases.
    pub refcnt: u64,
    /// Whether the backend has acknowledged the slave record.
    pub verified: bool,
}

struct Indexes<K> {
    by_key: HashMap<String, LocalKey<K>>,
    by_id: HashMap<Id, String>,
}

/// Reference-counted key table with key-string and ID indexes.
pub struct LocalKeys<K> {
    indexes: RwLock<Indexes<K>>,
}

impl<K: AllocatorKey> LocalKeys<K> {
    pub(crate) fn new() -> Self {
        Self {
            indexes: RwLock::new(Indexes {
                by_key: HashMap::new(),
                by_id: HashMap::new(),
            }),
        }
    }

    /// Take a reference on an existing verified entry.
    ///
    /// Returns the bound ID with the refcount bumped, or [`NO_ID`] if the
    /// key is unknown or not yet verified.
    pub(crate) fn use_key(&self, key_str: &str) -> Id {
        let mut indexes = self.indexes.write();
        match indexes.by_key.get_mut(key_str) {
            Some(entry) if entry.verified => {
                entry.refcnt += 1;
                entry.id
            }
            _ => NO_ID,
        }
    }

    /// Record an allocation of `key` under `id`.
    ///
    /// An existing entry must already be bound to `id`; its refcount is
    /// bumped and `false` (not first use) is returned. Otherwise a new
    /// unverified entry with refcount 1 is inserted and `true` is returned.
    pub(crate) fn allocate(&self, key_str: &str, key: &K, id: Id) -> Result<bool, AllocatorError> {
        let mut indexes = self.indexes.write();
        if let Some(entry) = indexes.by_key.get_mut(key_str) {
            if entry.id != id {
                return Err(AllocatorError::KeyMismatch {
                    key: key_str.to_string(),
                    expected: entry.id,
                    actual: id,
                });
            }
            entry.refcnt += 1;
            return Ok(false);
        }
        indexes.by_key.insert(
            key_str.to_string(),
            LocalKey {
                key: key.clone(),
                id,
                refcnt: 1,
                verified: false,
            },
        );
        indexes.by_id.insert(id, key_str.to_string());
        Ok(true)
    }

    /// Mark the entry as acknowledged by the backend.
    pub(crate) fn verify(&self, key_str: &str) -> Result<(), AllocatorError> {
        let mut indexes = self.indexes.write();
        match indexes.by_key.get_mut(key_str) {
            Some(entry) => {
                entry.verified = true;
                Ok(())
            }
            None => Err(AllocatorError::UnknownKey {
                key: key_str.to_string(),
            }),
        }
    }

    /// Drop one reference.
    ///
    /// Returns `(last_user, id)`; on the last reference the entry is removed
    /// from both indexes.
    pub(crate) fn release(&self, key_str: &str) -> Result<(bool, Id), AllocatorError> {
        let mut indexes = self.indexes.write();
        let Some(entry) = indexes.by_key.get_mut(key_str) else {
            return Err(AllocatorError::UnknownKey {
                key: key_str.to_string(),
            });
        };
        entry.refcnt -= 1;
        let id = entry.id;
        if entry.refcnt > 0 {
            return Ok((false, id));
        }
        indexes.by_key.remove(key_str);
        indexes.by_id.remove(&id);
        Ok((true, id))
    }

    /// ID bound to `key_str`, or [`NO_ID`].
    pub(crate) fn lookup_key(&self, key_str: &str) -> Id {
        self.indexes
            .read()
            .by_key
            .get(key_str)
            .map_or(NO_ID, |entry| entry.id)
    }

    /// Key bound to `id`, if owned locally.
    pub(crate) fn lookup_id(&self, id: Id) -> Option<K> {
        let indexes = self.indexes.read();
        let key_str = indexes.by_id.get(&id)?;
        indexes.by_key.get(key_str).map(|entry| entry.key.clone())
    }

    /// Snapshot of all verified `(id, key)` pairs, for reconciliation.
    pub(crate) fn get_verified_ids(&self) -> HashMap<Id, K> {
        self.indexes
            .read()
            .by_key
            .values()
            .filter(|entry| entry.verified)
            .map(|entry| (entry.id, entry.key.clone()))
            .collect()
    }

    /// Current reference count for `key_str`, if present. Test hook.
    pub fn refcnt(&self, key_str: &str) -> Option<u64> {
        self.indexes.read().by_key.get(key_str).map(|entry| entry.refcnt)
    }

    /// Number of locally owned keys.
    pub fn count(&self) -> usize {
        self.indexes.read().by_key.len()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::key::StringKey;

    fn key(s: &str) -> StringKey {
        StringKey::new(s)
    }

    #[test]
    fn allocate_release_round_trip() {
        let keys = LocalKeys::new();
        let k = key("foo");

        assert!(keys.allocate("foo", &k, 3).unwrap());
        assert!(!keys.allocate("foo", &k, 3).unwrap());
        assert_eq!(keys.refcnt("foo"), Some(2));

        assert_eq!(keys.release("foo").unwrap(), (false, 3));
        assert_eq!(keys.release("foo").unwrap(), (true, 3));
        assert_eq!(keys.refcnt("foo"), None);
        assert_eq!(keys.count(), 0);
        assert!(matches!(
            keys.release("foo"),
            Err(AllocatorError::UnknownKey { .. })
        ));
    }

    #[test]
    fn allocate_rejects_id_mismatch() {
        let keys = LocalKeys::new();
        let k = key("foo");
        keys.allocate("foo", &k, 3).unwrap();
        assert!(matches!(
            keys.allocate("foo", &k, 4),
            Err(AllocatorError::KeyMismatch {
                expected: 3,
                actual: 4,
                ..
            })
        ));
    }

    #[test]
    fn use_key_requires_verification() {
        let keys = LocalKeys::new();
        let k = key("foo");
        keys.allocate("foo", &k, 3).unwrap();

        // Unverified entries behave as absent.
        assert_eq!(keys.use_key("foo"), NO_ID);
        assert_eq!(keys.refcnt("foo"), Some(1));

        keys.verify("foo").unwrap();
        assert_eq!(keys.use_key("foo"), 3);
        assert_eq!(keys.refcnt("foo"), Some(2));
    }

    #[test]
    fn verify_unknown_key_fails() {
        let keys: LocalKeys<StringKey> = LocalKeys::new();
        assert!(matches!(
            keys.verify("nope"),
            Err(AllocatorError::UnknownKey { .. })
        ));
    }

    #[test]
    fn verified_snapshot_skips_unverified() {
        let keys = LocalKeys::new();
        keys.allocate("a", &key("a"), 1).unwrap();
        keys.allocate("b", &key("b"), 2).unwrap();
        keys.verify("b").unwrap();

        let verified = keys.get_verified_ids();
        assert_eq!(verified.len(), 1);
        assert_eq!(verified.get(&2).unwrap().get_key(), "b");
    }

    #[test]
    fn lookup_by_both_indexes() {
        let keys = LocalKeys::new();
        keys.allocate("foo", &key("foo"), 9).unwrap();
        assert_eq!(keys.lookup_key("foo"), 9);
        assert_eq!(keys.lookup_key("bar"), NO_ID);
        assert_eq!(keys.lookup_id(9).unwrap().get_key(), "foo");
        assert!(keys.lookup_id(8).is_none());
    }

    proptest! {
        // The refcount always equals allocations minus releases.
        #[test]
        fn refcount_matches_operation_balance(ops in prop::collection::vec(prop::bool::ANY, 1..100)) {
            let keys = LocalKeys::new();
            let k = key("k");
            let mut outstanding = 0u64;
            for allocate in ops {
                if allocate {
                    keys.allocate("k", &k, 1).unwrap();
                    outstanding += 1;
                } else if outstanding > 0 {
                    keys.release("k").unwrap();
                    outstanding -= 1;
                }
                prop_assert_eq!(keys.refcnt("k").unwrap_or(0), outstanding);
            }
        }
    }
}
