//! Collection type aliases used throughout the crate.
//!
//! The hasher backing `HashMap`/`HashSet` is chosen by feature flag, the
//! same way the teacher crate picks its collection backends: `twox-hash`
//! by default (fast, non-cryptographic, fine for in-process maps keyed by
//! digests and node ids that are never attacker-chosen inputs to a
//! hashmap DoS), or the standard library's `RandomState` otherwise.

use std::collections::HashMap as StdHashMap;
use std::collections::HashSet as StdHashSet;

use linked_hash_map::LinkedHashMap;

#[cfg(feature = "collections_randomstate_twox_hash")]
type DefaultHasher = std::hash::BuildHasherDefault<twox_hash::XxHash64>;

#[cfg(not(feature = "collections_randomstate_twox_hash"))]
type DefaultHasher = std::collections::hash_map::RandomState;

/// A `HashMap`, using this crate's default hasher.
pub type HashMap<K, V> = StdHashMap<K, V, DefaultHasher>;

/// A `HashSet`, using this crate's default hasher.
pub type HashSet<K> = StdHashSet<K, DefaultHasher>;

/// An insertion-ordered map, used where iteration order must match
/// arrival order (e.g. the dedup FIFO, the audit ring buffers).
pub type OrderedMap<K, V> = LinkedHashMap<K, V>;

/// Returns a new, empty `HashMap`.
pub fn hash_map<K, V>() -> HashMap<K, V> {
    HashMap::default()
}

/// Returns a new, empty `HashMap`, with the given initial capacity.
pub fn hash_map_capacity<K, V>(capacity: usize) -> HashMap<K, V> {
    HashMap::with_capacity_and_hasher(capacity, Default::default())
}

/// Returns a new, empty `HashSet`.
pub fn hash_set<K>() -> HashSet<K> {
    HashSet::default()
}

/// Returns a new, empty `OrderedMap`.
pub fn ordered_map<K, V>() -> OrderedMap<K, V> {
    LinkedHashMap::new()
}

/// A bounded FIFO: pushes evict the oldest entry once `capacity` is
/// exceeded. Used by the audit ring buffers (spec: `audit_mem_size`) and
/// the failure detector's seen-request memory.
pub struct BoundedFifo<T> {
    capacity: usize,
    inner: std::collections::VecDeque<T>,
}

impl<T> BoundedFifo<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: std::collections::VecDeque::with_capacity(capacity),
        }
    }

    /// Pushes a new entry, evicting the oldest one if this would exceed
    /// capacity. Returns the evicted entry, if one was evicted.
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.inner.len() >= self.capacity {
            self.inner.pop_front()
        } else {
            None
        };
        self.inner.push_back(value);
        evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.inner.iter()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
