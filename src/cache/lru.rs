//! Fixed-capacity, insertion-ordered cache with O(1) lookup, insert, and
//! eviction of the least-recently-*inserted* key.
//!
//! A non-promoting read is intentional here (see spec.md §4.1): a hit never
//! touches recency, only an insert does. Miss cost is dominated by the store
//! round-trip the caller performs on a miss, so promoting on read would buy
//! nothing but complexity.

use std::borrow::Borrow;
use std::hash::Hash;

/// Default capacity used by every dimension cache except [`Group`](super::dimension::GroupCache),
/// which is unbounded.
pub const DEFAULT_CAPACITY: usize = 10;

pub struct LruCache<K, V> {
    inner: lru::LruCache<K, V>,
}

impl<K: Hash + Eq, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let cap = std::num::NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: lru::LruCache::new(cap),
        }
    }

    /// Non-promoting lookup: a hit does not change eviction order.
    pub fn fetch<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.peek(key)
    }

    /// Insert `key -> value`, evicting the oldest-inserted entry if the cache
    /// is already at capacity and `key` is new.
    pub fn insert(&mut self, key: K, value: V) {
        self.inner.put(key, value);
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_does_not_promote() {
        let mut c = LruCache::new(2);
        c.insert("a", 1);
        c.insert("b", 2);
        // reading "a" must not save it from eviction
        assert_eq!(c.fetch(&"a"), Some(&1));
        c.insert("c", 3);
        assert_eq!(c.fetch(&"a"), None);
        assert_eq!(c.fetch(&"b"), Some(&2));
        assert_eq!(c.fetch(&"c"), Some(&3));
    }

    #[test]
    fn evicts_oldest_insert_when_full() {
        let mut c = LruCache::new(1);
        c.insert(1, "x");
        c.insert(2, "y");
        assert_eq!(c.fetch(&1), None);
        assert_eq!(c.fetch(&2), Some(&"y"));
    }

    #[test]
    fn clear_empties_cache() {
        let mut c: LruCache<i32, i32> = LruCache::new(4);
        c.insert(1, 1);
        c.insert(2, 2);
        c.clear();
        assert!(c.is_empty());
        assert_eq!(c.fetch(&1), None);
    }
}
