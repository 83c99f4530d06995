//! Per-host registry of lazily created values.
//!
//! Entries are never evicted: the map grows with the number of distinct hosts
//! seen, which is acceptable only while host cardinality stays bounded by
//! legitimate traffic.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Concurrent map where each key is created at most once and then shared.
#[derive(Debug)]
pub struct HostCache<V> {
    entries: RwLock<HashMap<String, Arc<V>>>,
}

impl<V> Default for HostCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> HostCache<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Returns the entry for `key`, creating it with `create` if absent.
    ///
    /// The candidate is built outside any lock. When two callers race on the
    /// same key, the first insert wins and every caller gets that entry; the
    /// losing candidate is dropped without ever being handed out.
    pub fn get_or_create_once(&self, key: &str, create: impl FnOnce() -> V) -> Arc<V> {
        if let Some(existing) = self.get(key) {
            return existing;
        }

        let candidate = Arc::new(create());

        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(key.to_owned())
            .or_insert(candidate)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
