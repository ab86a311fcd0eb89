//! Inode table for one partition.
//!
//! Inodes are stored in the partition's KV store with key format
//! `inode/{fs_be}/{inode_id_be}`. Serialization uses bincode.

use std::sync::Arc;

use crate::kvstore::KvStore;
use crate::types::{FsId, Inode, InodeId, MetaError};

/// Key prefix for inode entries in the KV store.
const INODE_PREFIX: &[u8] = b"inode/";

/// Builds the KV store key for an inode.
fn inode_key(fs_id: FsId, ino: InodeId) -> Vec<u8> {
    let mut key = INODE_PREFIX.to_vec();
    key.extend_from_slice(&fs_id.as_u32().to_be_bytes());
    key.extend_from_slice(&ino.as_u64().to_be_bytes());
    key
}

/// Inode CRUD on top of the KV store.
pub struct InodeStorage {
    kv: Arc<dyn KvStore>,
}

impl InodeStorage {
    /// Creates a new InodeStorage with the given KV store backend.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Inserts a new inode. Fails if the inode already exists.
    pub fn insert(&self, inode: &Inode) -> Result<(), MetaError> {
        let key = inode_key(inode.fs_id, inode.inode_id);
        if self.kv.get(&key)?.is_some() {
            return Err(MetaError::InvalidArgument(format!(
                "inode {} already exists",
                inode.inode_id
            )));
        }
        let value = bincode::serialize(inode).map_err(|e| MetaError::KvError(e.to_string()))?;
        self.kv.put(key, value)
    }

    /// Retrieves an inode.
    pub fn get(&self, fs_id: FsId, ino: InodeId) -> Result<Inode, MetaError> {
        match self.kv.get(&inode_key(fs_id, ino))? {
            Some(value) => {
                bincode::deserialize(&value).map_err(|e| MetaError::KvError(e.to_string()))
            }
            None => Err(MetaError::InodeNotFound(ino)),
        }
    }

    /// Replaces an existing inode.
    pub fn update(&self, inode: &Inode) -> Result<(), MetaError> {
        let key = inode_key(inode.fs_id, inode.inode_id);
        if self.kv.get(&key)?.is_none() {
            return Err(MetaError::InodeNotFound(inode.inode_id));
        }
        let value = bincode::serialize(inode).map_err(|e| MetaError::KvError(e.to_string()))?;
        self.kv.put(key, value)
    }
}
