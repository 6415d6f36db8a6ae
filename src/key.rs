//! Key abstraction for the allocator.
//!
//! The allocator is agnostic to what a key means semantically; it only
//! requires a canonical string form and a symmetric encoding to a labeled
//! attribute map. Two keys are identical iff their canonical strings match.

use std::collections::HashMap;
use std::fmt;

/// Capability set a user key type must provide.
///
/// Implementations must guarantee that `put_key(k.get_key())` reproduces a
/// key equal to `k` under canonical-string comparison, and likewise for the
/// map encoding.
pub trait AllocatorKey: Clone + Send + Sync + fmt::Debug + fmt::Display + 'static {
    /// Canonical string form of the key. The allocator treats two keys as
    /// identical iff their canonical strings match.
    fn get_key(&self) -> String;

    /// Construct a key from its canonical string form.
    fn put_key(value: &str) -> Self;

    /// Encode the key as a labeled attribute map.
    fn get_as_map(&self) -> HashMap<String, String>;

    /// Construct a key from a labeled attribute map.
    fn put_key_from_map(map: &HashMap<String, String>) -> Self;
}

/// Minimal key type wrapping a plain string.
///
/// Useful for embedders whose keys have no internal structure, and as the
/// key type in tests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StringKey(String);

impl StringKey {
    /// Create a key from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for StringKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AllocatorKey for StringKey {
    fn get_key(&self) -> String {
        self.0.clone()
    }

    fn put_key(value: &str) -> Self {
        Self(value.to_string())
    }

    fn get_as_map(&self) -> HashMap<String, String> {
        HashMap::from([(self.0.clone(), self.0.clone())])
    }

    fn put_key_from_map(map: &HashMap<String, String>) -> Self {
        let value = map.values().next().cloned().unwrap_or_default();
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_string_round_trip() {
        let key = StringKey::new("k8s:io.kubernetes.pod.namespace=default");
        assert_eq!(StringKey::put_key(&key.get_key()), key);
    }

    #[test]
    fn map_round_trip() {
        let key = StringKey::new("foo");
        let decoded = StringKey::put_key_from_map(&key.get_as_map());
        assert_eq!(decoded.get_key(), key.get_key());
    }

    #[test]
    fn empty_map_decodes_to_empty_key() {
        let decoded = StringKey::put_key_from_map(&HashMap::new());
        assert_eq!(decoded.get_key(), "");
    }
}
