use std::collections::hash_map::RandomState;

/// Re-export of [`hashbrown::HashMap`] using [`RandomState`] ("DefaultHasher").
pub type HashMap<K, V> = hashbrown::HashMap<K, V, RandomState>;

/// Re-export of [`hashbrown::HashSet`] using [`RandomState`] ("DefaultHasher").
pub type HashSet<T> = hashbrown::HashSet<T, RandomState>;
