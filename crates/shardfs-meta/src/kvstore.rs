//! Ordered key-value store backing a partition's dentry and inode tables.
//!
//! Every partition owns one store. Keys are compared bytewise, so the table
//! modules encode integers big-endian to get numeric ordering for free.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::MetaError;

/// Raw key bytes.
pub type Key = Vec<u8>;
/// Raw value bytes.
pub type Value = Vec<u8>;
/// One row returned by a scan.
pub type KvPair = (Key, Value);

/// Storage engine contract required by a partition.
///
/// Point reads and writes, ordered prefix scans, and an atomic batch used to
/// apply a whole prepare, finalize or abandon step at once. Rows are only
/// removed through a batch.
pub trait KvStore: Send + Sync {
    /// Point read; `None` when the key is absent.
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError>;

    /// Inserts or replaces one row.
    fn put(&self, key: Key, value: Value) -> Result<(), MetaError>;

    /// Rows whose key starts with `prefix`, ascending by key.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError>;

    /// Applies every op or none of them, in order.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError>;
}

/// A single operation in a write batch.
#[derive(Clone, Debug)]
pub enum BatchOp {
    /// Insert or replace a row.
    Put {
        /// Row key
        key: Key,
        /// Row value
        value: Value,
    },
    /// Remove a row.
    Delete {
        /// Row key
        key: Key,
    },
}

/// Volatile store over an ordered map.
///
/// Nothing survives a restart; this is the store used by the in-process
/// cluster and by tests.
#[derive(Default)]
pub struct MemoryKvStore {
    rows: RwLock<BTreeMap<Key, Value>>,
}

impl MemoryKvStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.len()).unwrap_or(0)
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<Key, Value>>, MetaError> {
        self.rows
            .read()
            .map_err(|e| MetaError::KvError(format!("store lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<Key, Value>>, MetaError> {
        self.rows
            .write()
            .map_err(|e| MetaError::KvError(format!("store lock poisoned: {}", e)))
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError> {
        Ok(self.read()?.get(key).cloned())
    }

    fn put(&self, key: Key, value: Value) -> Result<(), MetaError> {
        self.write()?.insert(key, value);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let rows = self.read()?;
        Ok(rows
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError> {
        let mut rows = self.write()?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    rows.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    rows.remove(&key);
                }
            }
        }
        Ok(())
    }
}
