//! Insertion-ordered map with a size bound and an optional TTL.
//!
//! Backs the acknowledged multicast event store and the flood gossip
//! handled-set. When full, the oldest entry is evicted first.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry<V> {
    value: V,
    added_at: Instant,
}

/// Map bounded by capacity and, optionally, by entry age.
#[derive(Debug)]
pub struct BoundedMap<K, V> {
    entries: HashMap<K, Entry<V>>,
    order: VecDeque<K>,
    capacity: usize,
    ttl: Option<Duration>,
}

impl<K, V> BoundedMap<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates a map holding at most `capacity` entries (minimum one).
    #[must_use]
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    fn is_live(&self, entry: &Entry<V>) -> bool {
        self.ttl.is_none_or(|ttl| entry.added_at.elapsed() < ttl)
    }

    /// Returns the live value for `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|entry| self.is_live(entry))
            .map(|entry| &entry.value)
    }

    /// Returns true if `key` has a live entry.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Inserts `value` unless a live entry exists.
    ///
    /// Returns true if the value was inserted. An existing live entry is
    /// never overwritten.
    pub fn insert_if_absent(&mut self, key: K, value: V) -> bool {
        if self.contains(&key) {
            return false;
        }
        if self.entries.remove(&key).is_some() {
            self.order.retain(|k| k != &key);
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.entries.insert(
            key.clone(),
            Entry {
                value,
                added_at: Instant::now(),
            },
        );
        self.order.push_back(key);
        true
    }

    /// Drops entries older than the TTL. Returns how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.added_at.elapsed() < ttl);
        let entries = &self.entries;
        self.order.retain(|k| entries.contains_key(k));
        before - self.entries.len()
    }

    /// Number of stored entries, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_first_writer_wins() {
        let mut map = BoundedMap::new(4, None);
        assert!(map.insert_if_absent("m1", 1));
        assert!(!map.insert_if_absent("m1", 2));
        assert_eq!(map.get(&"m1"), Some(&1));
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut map = BoundedMap::new(3, None);
        for (i, key) in ["a", "b", "c", "d"].into_iter().enumerate() {
            map.insert_if_absent(key, i);
        }

        assert_eq!(map.len(), 3);
        assert!(!map.contains(&"a"));
        assert!(map.contains(&"b"));
        assert!(map.contains(&"d"));
    }

    #[test]
    fn expired_entries_are_invisible_and_purged() {
        let mut map = BoundedMap::new(10, Some(Duration::from_millis(10)));
        map.insert_if_absent("m1", ());

        std::thread::sleep(Duration::from_millis(20));

        assert!(!map.contains(&"m1"));
        assert_eq!(map.purge_expired(), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn expired_entry_can_be_reinserted() {
        let mut map = BoundedMap::new(10, Some(Duration::from_millis(10)));
        map.insert_if_absent("m1", 1);
        std::thread::sleep(Duration::from_millis(20));

        assert!(map.insert_if_absent("m1", 2));
        assert_eq!(map.get(&"m1"), Some(&2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn zero_capacity_holds_one() {
        let mut map = BoundedMap::new(0, None);
        map.insert_if_absent(1, ());
        assert_eq!(map.capacity(), 1);
        assert!(map.contains(&1));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn never_exceeds_capacity(
                capacity in 1usize..16,
                keys in proptest::collection::vec(0u32..64, 0..128),
            ) {
                let mut map = BoundedMap::new(capacity, None);
                for key in keys {
                    map.insert_if_absent(key, ());
                    prop_assert!(map.len() <= capacity);
                }
            }
        }
    }
}
