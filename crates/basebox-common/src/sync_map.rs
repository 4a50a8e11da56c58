//! Map wrapper without implicit entry creation.
//!
//! Reference-counted dataplane objects (an L2 interface group shared by
//! several bridging flows, for example) must only ever be counted when the
//! object is actually known. `SyncMap` makes every entry-creating call
//! explicit:
//! - `get()` returns `Option<&V>`
//! - `increment_ref()` fails with [`SyncMapError::KeyNotFound`]
//! - `decrement_ref()` fails instead of wrapping below zero

use std::collections::HashMap;
use std::hash::Hash;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncMapError {
    #[error("Key not found")]
    KeyNotFound,

    #[error("Reference count underflow")]
    RefCountUnderflow,
}

/// Values carrying a reference count.
pub trait HasRefCount {
    /// Increments the count and returns the new value.
    fn increment_ref(&mut self) -> u32;

    /// Decrements the count; `None` when it is already zero.
    fn decrement_ref(&mut self) -> Option<u32>;

    fn ref_count(&self) -> u32;
}

/// A map that never creates entries implicitly.
///
/// # Example
///
/// ```
/// use basebox_common::SyncMap;
///
/// let mut groups: SyncMap<u32, &str> = SyncMap::new();
/// assert!(groups.get(&0x000a_0003).is_none());
///
/// groups.insert(0x000a_0003, "l2-interface");
/// assert_eq!(groups.get(&0x000a_0003), Some(&"l2-interface"));
/// ```
#[derive(Debug, Clone)]
pub struct SyncMap<K, V> {
    inner: HashMap<K, V>,
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Returns the value for `key`. **This never creates entries.**
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// Returns the value for `key` mutably. **This never creates entries.**
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    /// Inserts, returning the previous value if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.remove(key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.values()
    }
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
    V: HasRefCount,
{
    /// Increments the count of an existing entry.
    pub fn increment_ref(&mut self, key: &K) -> Result<u32, SyncMapError> {
        match self.inner.get_mut(key) {
            Some(entry) => Ok(entry.increment_ref()),
            None => Err(SyncMapError::KeyNotFound),
        }
    }

    /// Decrements the count of an existing entry.
    pub fn decrement_ref(&mut self, key: &K) -> Result<u32, SyncMapError> {
        match self.inner.get_mut(key) {
            Some(entry) => entry
                .decrement_ref()
                .ok_or(SyncMapError::RefCountUnderflow),
            None => Err(SyncMapError::KeyNotFound),
        }
    }

    pub fn ref_count(&self, key: &K) -> Option<u32> {
        self.inner.get(key).map(|e| e.ref_count())
    }
}

impl<K, V> Default for SyncMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone)]
    struct GroupUse {
        refs: u32,
    }

    impl HasRefCount for GroupUse {
        fn increment_ref(&mut self) -> u32 {
            self.refs += 1;
            self.refs
        }

        fn decrement_ref(&mut self) -> Option<u32> {
            self.refs = self.refs.checked_sub(1)?;
            Some(self.refs)
        }

        fn ref_count(&self) -> u32 {
            self.refs
        }
    }

    #[test]
    fn test_get_never_creates() {
        let mut map: SyncMap<u32, i32> = SyncMap::new();

        assert!(map.get(&1).is_none());
        assert!(map.get_mut(&1).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_increment_ref_requires_existing_key() {
        let mut map: SyncMap<u32, GroupUse> = SyncMap::new();
        assert_eq!(map.increment_ref(&7), Err(SyncMapError::KeyNotFound));

        map.insert(7, GroupUse { refs: 0 });
        assert_eq!(map.increment_ref(&7), Ok(1));
        assert_eq!(map.increment_ref(&7), Ok(2));
        assert_eq!(map.ref_count(&7), Some(2));
    }

    #[test]
    fn test_decrement_ref_underflow_protection() {
        let mut map: SyncMap<u32, GroupUse> = SyncMap::new();
        map.insert(7, GroupUse { refs: 0 });

        assert_eq!(map.decrement_ref(&7), Err(SyncMapError::RefCountUnderflow));
        map.increment_ref(&7).unwrap();
        assert_eq!(map.decrement_ref(&7), Ok(0));
        assert_eq!(map.ref_count(&7), Some(0));
    }

    #[test]
    fn test_remove_returns_entry() {
        let mut map: SyncMap<u32, GroupUse> = SyncMap::new();
        map.insert(7, GroupUse { refs: 1 });
        map.insert(8, GroupUse { refs: 0 });
        assert_eq!(map.values().map(|g| g.refs).sum::<u32>(), 1);

        assert_eq!(map.remove(&7).map(|g| g.refs), Some(1));
        assert!(!map.contains_key(&7));
        assert_eq!(map.ref_count(&7), None);
        assert_eq!(map.len(), 1);
    }
}
