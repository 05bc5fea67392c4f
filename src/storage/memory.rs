// In-Memory Durable Store
//
// Process-local store used by tests and single-node embeddings. Maps are
// BTreeMaps behind parking_lot locks, counters are atomics, and handles
// resolved under the same name share the same underlying data, matching
// the contract of the persistent collaborator.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::Result;
use crate::storage::{DurableCounter, KvStore, TreeMap};

/// In-memory implementation of the durable store contract.
#[derive(Default)]
pub struct InMemoryStore {
    maps: DashMap<String, Arc<MemoryTreeMap>>,
    counters: DashMap<String, Arc<MemoryCounter>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for InMemoryStore {
    fn tree_map(&self, name: &str) -> Arc<dyn TreeMap> {
        let map = self
            .maps
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryTreeMap::default()))
            .clone();
        map
    }

    fn counter(&self, name: &str) -> Arc<dyn DurableCounter> {
        let counter = self
            .counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryCounter::default()))
            .clone();
        counter
    }
}

#[derive(Default)]
struct MemoryTreeMap {
    inner: RwLock<BTreeMap<i64, Vec<u8>>>,
}

impl TreeMap for MemoryTreeMap {
    fn get(&self, key: i64) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().get(&key).cloned())
    }

    fn put(&self, key: i64, value: Vec<u8>) -> Result<()> {
        self.inner.write().insert(key, value);
        Ok(())
    }

    fn remove(&self, key: i64) -> Result<()> {
        self.inner.write().remove(&key);
        Ok(())
    }

    fn len(&self) -> usize {
        self.inner.read().len()
    }

    fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    fn last_key(&self) -> Option<i64> {
        self.inner.read().keys().next_back().copied()
    }

    fn last_entry(&self) -> Result<Option<(i64, Vec<u8>)>> {
        Ok(self
            .inner
            .read()
            .iter()
            .next_back()
            .map(|(key, value)| (*key, value.clone())))
    }

    fn keys(&self) -> Vec<i64> {
        self.inner.read().keys().copied().collect()
    }
}

#[derive(Default)]
struct MemoryCounter {
    value: AtomicI64,
}

impl DurableCounter for MemoryCounter {
    fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    fn set(&self, value: i64) -> Result<()> {
        self.value.store(value, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_handles_share_data() {
        let store = InMemoryStore::new();
        let first = store.tree_map("entries");
        let second = store.tree_map("entries");

        first.put(1, vec![1, 2, 3]).unwrap();
        assert_eq!(second.get(1).unwrap(), Some(vec![1, 2, 3]));
        assert!(store.tree_map("snapshots").is_empty());
    }

    #[test]
    fn test_map_ordering() {
        let store = InMemoryStore::new();
        let map = store.tree_map("entries");

        map.put(3, vec![3]).unwrap();
        map.put(1, vec![1]).unwrap();
        map.put(2, vec![2]).unwrap();

        assert_eq!(map.len(), 3);
        assert_eq!(map.last_key(), Some(3));
        assert_eq!(map.keys(), vec![1, 2, 3]);
        assert_eq!(map.last_entry().unwrap(), Some((3, vec![3])));

        map.remove(3).unwrap();
        assert_eq!(map.last_key(), Some(2));
    }

    #[test]
    fn test_counter_persists_across_handles() {
        let store = InMemoryStore::new();
        store.counter("commitIndex").set(42).unwrap();
        assert_eq!(store.counter("commitIndex").get(), 42);
    }
}
