//! This module provides the collection types used throughout the
//! crate, as well as constructor functions for them, so the concrete
//! hashing strategy can be swapped with a feature flag.

#[cfg(feature = "collections_randomstate_twox_hash")]
use std::hash::BuildHasherDefault;

use std::collections;
use std::hash::Hash;

#[cfg(feature = "collections_randomstate_twox_hash")]
pub type RandomState = BuildHasherDefault<twox_hash::XxHash64>;

#[cfg(feature = "collections_randomstate_std")]
pub type RandomState = collections::hash_map::RandomState;

/// A map which does not preserve the ordering of its keys.
pub type HashMap<K, V> = collections::HashMap<K, V, RandomState>;

/// A set which does not preserve the ordering of its elements.
pub type HashSet<T> = collections::HashSet<T, RandomState>;

/// A map which preserves the insertion order of its keys.
pub type OrderedMap<K, V> = linked_hash_map::LinkedHashMap<K, V>;

/// Creates a new `HashMap`.
pub fn hash_map<K: Eq + Hash, V>() -> HashMap<K, V> {
    HashMap::with_hasher(Default::default())
}

/// Creates a new `HashMap` with the given capacity.
pub fn hash_map_capacity<K: Eq + Hash, V>(cap: usize) -> HashMap<K, V> {
    HashMap::with_capacity_and_hasher(cap, Default::default())
}

/// Creates a new `HashSet`.
pub fn hash_set<T: Eq + Hash>() -> HashSet<T> {
    HashSet::with_hasher(Default::default())
}

/// Creates a new `OrderedMap`.
pub fn ordered_map<K: Eq + Hash, V>() -> OrderedMap<K, V> {
    OrderedMap::new()
}
