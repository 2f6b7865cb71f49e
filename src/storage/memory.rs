//! In-memory backend over a `BTreeMap`.
//!
//! Authority for tests and for servers started without a data directory.

use std::collections::BTreeMap;
use std::ops::Bound;

use bytes::Bytes;
use parking_lot::RwLock;

use super::{StorageBackend, StorageError, WriteBatch, WriteOp};

#[derive(Default)]
pub struct MemoryBackend {
    map: RwLock<BTreeMap<Vec<u8>, Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StorageError> {
        Ok(self.map.read().get(key).cloned())
    }

    fn apply(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut map = self.map.write();
        for op in batch.ops {
            match op {
                WriteOp::Put { key, value } => {
                    map.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Bytes)>, StorageError> {
        let map = self.map.read();
        let lower = match after {
            Some(k) if k >= prefix => Bound::Excluded(k.to_vec()),
            _ => Bound::Included(prefix.to_vec()),
        };
        let mut out = Vec::new();
        for (k, v) in map.range((lower, Bound::Unbounded)) {
            if !k.starts_with(prefix) {
                break;
            }
            out.push((k.clone(), v.clone()));
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    fn delete_prefix(&self, prefix: &[u8]) -> Result<(), StorageError> {
        let mut map = self.map.write();
        let doomed: Vec<Vec<u8>> = map
            .range((Bound::Included(prefix.to_vec()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for k in doomed {
            map.remove(&k);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(backend: &MemoryBackend, key: &str, value: &str) {
        let mut batch = WriteBatch::new();
        batch.put(key.as_bytes().to_vec(), value.as_bytes().to_vec());
        backend.apply(batch).unwrap();
    }

    #[test]
    fn scan_is_ordered_and_prefix_bounded() {
        let backend = MemoryBackend::new();
        put(&backend, "a/1", "one");
        put(&backend, "a/2", "two");
        put(&backend, "a/3", "three");
        put(&backend, "b/1", "other");

        let rows = backend.scan(b"a/", None, 100).unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"a/1".to_vec(), b"a/2".to_vec(), b"a/3".to_vec()]);
    }

    #[test]
    fn scan_after_is_exclusive() {
        let backend = MemoryBackend::new();
        put(&backend, "a/1", "one");
        put(&backend, "a/2", "two");

        let rows = backend.scan(b"a/", Some(b"a/1".as_slice()), 100).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, b"a/2".to_vec());
    }

    #[test]
    fn scan_respects_limit() {
        let backend = MemoryBackend::new();
        for i in 0..10 {
            put(&backend, &format!("a/{i}"), "x");
        }
        let rows = backend.scan(b"a/", None, 3).unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn delete_prefix_is_total() {
        let backend = MemoryBackend::new();
        put(&backend, "a/1", "one");
        put(&backend, "a/2", "two");
        put(&backend, "b/1", "keep");

        backend.delete_prefix(b"a/").unwrap();
        assert!(backend.scan(b"a/", None, 10).unwrap().is_empty());
        assert_eq!(backend.get(b"b/1").unwrap().unwrap(), Bytes::from("keep"));
    }

    #[test]
    fn batch_applies_puts_and_deletes_together() {
        let backend = MemoryBackend::new();
        put(&backend, "k1", "v1");

        let mut batch = WriteBatch::new();
        batch.put(b"k2".to_vec(), b"v2".to_vec());
        batch.delete(b"k1".to_vec());
        backend.apply(batch).unwrap();

        assert!(backend.get(b"k1").unwrap().is_none());
        assert_eq!(backend.get(b"k2").unwrap().unwrap(), Bytes::from("v2"));
    }
}
