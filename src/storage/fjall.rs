//! Fjall-backed persistence.
//!
//! One partition holds the whole key layout; the LSM tree gives us the
//! ordered scans the offset codec relies on, and `Batch` gives atomic
//! multi-key commits.

use std::ops::Bound;
use std::path::Path;

use bytes::Bytes;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use super::{StorageBackend, StorageError, WriteBatch, WriteOp};

pub struct FjallBackend {
    keyspace: Keyspace,
    partition: PartitionHandle,
}

impl FjallBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let keyspace = Config::new(path).open().map_err(backend_err)?;
        let partition = keyspace
            .open_partition("streams", PartitionCreateOptions::default())
            .map_err(backend_err)?;
        Ok(Self {
            keyspace,
            partition,
        })
    }
}

fn backend_err(e: fjall::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

impl StorageBackend for FjallBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StorageError> {
        let found = self.partition.get(key).map_err(backend_err)?;
        Ok(found.map(|slice| Bytes::copy_from_slice(&slice)))
    }

    fn apply(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut b = self.keyspace.batch();
        for op in batch.ops {
            match op {
                WriteOp::Put { key, value } => b.insert(&self.partition, key, value.as_ref()),
                WriteOp::Delete { key } => b.remove(&self.partition, key),
            }
        }
        b.commit().map_err(backend_err)?;
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(backend_err)?;
        Ok(())
    }

    fn scan(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Bytes)>, StorageError> {
        let lower: Bound<Vec<u8>> = match after {
            Some(k) if k >= prefix => Bound::Excluded(k.to_vec()),
            _ => Bound::Included(prefix.to_vec()),
        };
        let mut out = Vec::new();
        for item in self.partition.range((lower, Bound::Unbounded)) {
            let (key, value) = item.map_err(backend_err)?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), Bytes::copy_from_slice(&value)));
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    fn delete_prefix(&self, prefix: &[u8]) -> Result<(), StorageError> {
        let mut doomed = Vec::new();
        for item in self.partition.prefix(prefix) {
            let (key, _) = item.map_err(backend_err)?;
            doomed.push(key.to_vec());
        }
        let mut b = self.keyspace.batch();
        for key in doomed {
            b.remove(&self.partition, key);
        }
        b.commit().map_err(backend_err)?;
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(backend_err)?;
        Ok(())
    }
}
