//! The in-memory ordered stores backing the lock table and the rollback
//! table. Reads are lock-free and safe from any thread; all writes flow
//! through the single lock-pipeline worker, with conflicting writers
//! serialized by region latches before they submit.

use crossbeam_skiplist::SkipMap;
use std::ops::Bound;

/// An ordered in-memory key/value store over a lock-free concurrent skiplist.
/// Point reads and range scans observe a consistent per-entry snapshot
/// without blocking writers.
pub struct MemStore {
    map: SkipMap<Vec<u8>, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self { map: SkipMap::new() }
    }

    /// Fetches the value of a key, if it exists.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    /// Sets the value of a key, replacing any existing value.
    pub fn insert(&self, key: Vec<u8>, value: Vec<u8>) {
        self.map.insert(key, value);
    }

    /// Removes a key, or does nothing if it does not exist.
    pub fn remove(&self, key: &[u8]) {
        self.map.remove(key);
    }

    /// Iterates over all key/value pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (Vec<u8>, Vec<u8>)> + '_ {
        self.map.iter().map(|entry| (entry.key().clone(), entry.value().clone()))
    }

    /// Iterates over key/value pairs in sorted order, starting at the given
    /// key (inclusive).
    pub fn range_from<'a>(
        &'a self,
        start: &'a [u8],
    ) -> impl Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a {
        self.map
            .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }

    /// The number of entries in the store.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ops() {
        let s = MemStore::new();
        assert_eq!(s.get(b"a"), None);

        s.insert(b"a".to_vec(), vec![1]);
        assert_eq!(s.get(b"a"), Some(vec![1]));

        s.insert(b"a".to_vec(), vec![2]);
        assert_eq!(s.get(b"a"), Some(vec![2]));

        s.remove(b"a");
        assert_eq!(s.get(b"a"), None);
        s.remove(b"a"); // idempotent
        assert!(s.is_empty());
    }

    #[test]
    fn range_from() {
        let s = MemStore::new();
        for key in [&b"a"[..], b"b", b"ba", b"c"] {
            s.insert(key.to_vec(), key.to_vec());
        }
        assert_eq!(s.len(), 4);

        let keys: Vec<Vec<u8>> = s.range_from(b"b").map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"ba".to_vec(), b"c".to_vec()]);

        let keys: Vec<Vec<u8>> = s.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"ba".to_vec(), b"c".to_vec()]);
    }

    /// Readers must not block writers on other keys.
    #[test]
    fn concurrent_access() {
        let s = std::sync::Arc::new(MemStore::new());
        let writer = {
            let s = s.clone();
            std::thread::spawn(move || {
                for i in 0..100u8 {
                    s.insert(vec![i], vec![i]);
                }
            })
        };
        while s.get(&[99]).is_none() {
            std::hint::spin_loop();
        }
        writer.join().expect("writer panicked");
        assert_eq!(s.len(), 100);
    }
}
