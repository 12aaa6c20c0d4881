//! Process-wide mutable state shared across every stream of every backend
//! instance in the process (§5 Shared process-wide state, §9).
//!
//! Both sets are single-writer/many-reader concurrent sets guarded by a
//! `std::sync::RwLock`, the same pattern the in-memory event store backend
//! in the teacher crate uses for its shared state.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::RwLock;

/// A concurrent set supporting an atomic `try_insert`, used both for the
/// verified-container cache (§4.1) and the closed-stream cache (§4.2.1 step
/// 1, step 7).
#[derive(Debug, Default)]
pub struct ConcurrentSet<T> {
    inner: RwLock<HashSet<T>>,
}

impl<T> ConcurrentSet<T>
where
    T: Eq + Hash + Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashSet::new()),
        }
    }

    /// Returns `true` if `value` is already known to be a member.
    #[must_use]
    pub fn contains(&self, value: &T) -> bool {
        self.inner
            .read()
            .expect("acquire read lock on process-wide set")
            .contains(value)
    }

    /// Inserts `value`, returning `true` if it was newly added.
    pub fn try_insert(&self, value: T) -> bool {
        self.inner
            .write()
            .expect("acquire write lock on process-wide set")
            .insert(value)
    }

    /// Test-only: clears the set. Process-wide state must be reset between
    /// independent test cases that otherwise share the same process (§4.1
    /// Container/bucket verification, §5 Shared process-wide state).
    pub fn clear(&self) {
        self.inner
            .write()
            .expect("acquire write lock on process-wide set")
            .clear();
    }
}

/// A concurrent map used to cache small pieces of derived information keyed
/// by stream identifier (e.g. the continuation info learned at the moment a
/// stream was found closed), so the fast-close check in §4.2.1 step 1 never
/// has to re-derive it.
#[derive(Debug, Default)]
pub struct ConcurrentMap<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner
            .read()
            .expect("acquire read lock on process-wide map")
            .get(key)
            .cloned()
    }

    pub fn insert(&self, key: K, value: V) {
        self.inner
            .write()
            .expect("acquire write lock on process-wide map")
            .insert(key, value);
    }

    pub fn clear(&self) {
        self.inner
            .write()
            .expect("acquire write lock on process-wide map")
            .clear();
    }
}
