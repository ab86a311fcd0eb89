//! Versioned directory-entry table for one partition.
//!
//! Every written dentry version is kept under the key
//! `dentry/{fs_be}/{parent_be}{name}\0{epoch_be}`. Names cannot contain NUL,
//! so all versions of one name are contiguous and ascend by epoch, and all
//! names of one parent are contiguous in name order.
//!
//! A read at epoch `T` sees the version with the greatest epoch `<= T`; a
//! visible version carrying `DELETE_MARK` means the name does not resolve.
//! Versions written by a prepare sit at `committed + 1` and stay invisible
//! until readers move to that epoch.

use std::sync::Arc;

use crate::kvstore::{BatchOp, Key, KvStore};
use crate::types::{Dentry, DentryFlags, Epoch, FsId, InodeId, MetaError};

/// Key prefix for directory entries in the KV store.
const DENTRY_PREFIX: &[u8] = b"dentry/";

/// Separates the name from the epoch suffix.
const NAME_TERMINATOR: u8 = 0;

fn parent_prefix(fs_id: FsId, parent: InodeId) -> Key {
    let mut key = DENTRY_PREFIX.to_vec();
    key.extend_from_slice(&fs_id.as_u32().to_be_bytes());
    key.extend_from_slice(&parent.as_u64().to_be_bytes());
    key
}

fn name_prefix(fs_id: FsId, parent: InodeId, name: &str) -> Key {
    let mut key = parent_prefix(fs_id, parent);
    key.extend_from_slice(name.as_bytes());
    key.push(NAME_TERMINATOR);
    key
}

/// Builds the KV key of one dentry version.
pub fn version_key(dentry: &Dentry) -> Key {
    let mut key = name_prefix(dentry.fs_id, dentry.parent_id, &dentry.name);
    key.extend_from_slice(&dentry.epoch.as_u64().to_be_bytes());
    key
}

/// Rejects names that cannot be stored.
pub fn validate_name(name: &str) -> Result<(), MetaError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(MetaError::InvalidArgument(format!(
            "invalid entry name {:?}",
            name
        )));
    }
    if name.bytes().any(|b| b == NAME_TERMINATOR || b == b'/') {
        return Err(MetaError::InvalidArgument(format!(
            "entry name {:?} contains a reserved byte",
            name
        )));
    }
    Ok(())
}

fn decode(value: &[u8]) -> Result<Dentry, MetaError> {
    bincode::deserialize(value).map_err(|e| MetaError::KvError(e.to_string()))
}

fn encode(dentry: &Dentry) -> Result<Vec<u8>, MetaError> {
    bincode::serialize(dentry).map_err(|e| MetaError::KvError(e.to_string()))
}

/// Picks the version visible at `epoch` out of an ascending run of versions.
fn visible_at(versions: impl Iterator<Item = Dentry>, epoch: Epoch) -> Option<Dentry> {
    versions.take_while(|d| d.epoch <= epoch).last()
}

/// Manages dentry versions on top of the KV store.
pub struct DentryStorage {
    kv: Arc<dyn KvStore>,
}

impl DentryStorage {
    /// Creates a new DentryStorage.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Writes one version, replacing a version at the same key and epoch.
    pub fn put(&self, dentry: &Dentry) -> Result<(), MetaError> {
        validate_name(&dentry.name)?;
        self.kv.put(version_key(dentry), encode(dentry)?)
    }

    /// All stored versions of a name, ascending by epoch.
    pub fn versions(
        &self,
        fs_id: FsId,
        parent: InodeId,
        name: &str,
    ) -> Result<Vec<Dentry>, MetaError> {
        self.kv
            .scan_prefix(&name_prefix(fs_id, parent, name))?
            .into_iter()
            .map(|(_, v)| decode(&v))
            .collect()
    }

    /// True if a version already exists at the dentry's key and epoch.
    pub fn has_version(&self, dentry: &Dentry) -> Result<bool, MetaError> {
        Ok(self.kv.get(&version_key(dentry))?.is_some())
    }

    /// Resolves `(parent, name)` as seen at `epoch`.
    pub fn get(
        &self,
        fs_id: FsId,
        parent: InodeId,
        name: &str,
        epoch: Epoch,
    ) -> Result<Option<Dentry>, MetaError> {
        let versions = self.versions(fs_id, parent, name)?;
        Ok(visible_at(versions.into_iter(), epoch).filter(|d| !d.is_deleted()))
    }

    /// Lists up to `limit` live children of `parent` visible at `epoch`, in name order.
    pub fn list(
        &self,
        fs_id: FsId,
        parent: InodeId,
        epoch: Epoch,
        limit: usize,
    ) -> Result<Vec<Dentry>, MetaError> {
        let mut children = Vec::new();
        if limit == 0 {
            return Ok(children);
        }

        let mut current: Option<String> = None;
        let mut run: Vec<Dentry> = Vec::new();
        let rows = self.kv.scan_prefix(&parent_prefix(fs_id, parent))?;
        for (_, value) in rows {
            let dentry = decode(&value)?;
            if current.as_deref() != Some(dentry.name.as_str()) {
                if let Some(live) = visible_at(run.drain(..), epoch).filter(|d| !d.is_deleted()) {
                    children.push(live);
                    if children.len() >= limit {
                        return Ok(children);
                    }
                }
                current = Some(dentry.name.clone());
            }
            run.push(dentry);
        }
        if let Some(live) = visible_at(run.into_iter(), epoch).filter(|d| !d.is_deleted()) {
            children.push(live);
        }
        Ok(children)
    }

    /// Batch ops that write the given versions.
    pub fn put_ops(&self, dentries: &[Dentry]) -> Result<Vec<BatchOp>, MetaError> {
        dentries
            .iter()
            .map(|d| {
                validate_name(&d.name)?;
                Ok(BatchOp::Put {
                    key: version_key(d),
                    value: encode(d)?,
                })
            })
            .collect()
    }

    /// Batch ops that rewrite the given versions with the prepare state cleared.
    pub fn finalize_ops(&self, dentries: &[Dentry]) -> Result<Vec<BatchOp>, MetaError> {
        let finalized: Vec<Dentry> = dentries
            .iter()
            .cloned()
            .map(|mut d| {
                d.flags.remove(DentryFlags::TRANSACTION_PREPARE);
                d.replaces = InodeId::NONE;
                d
            })
            .collect();
        self.put_ops(&finalized)
    }

    /// Batch ops that drop the given versions.
    pub fn remove_ops(&self, dentries: &[Dentry]) -> Vec<BatchOp> {
        dentries
            .iter()
            .map(|d| BatchOp::Delete {
                key: version_key(d),
            })
            .collect()
    }

    /// Applies a batch atomically.
    pub fn apply(&self, ops: Vec<BatchOp>) -> Result<(), MetaError> {
        self.kv.write_batch(ops)
    }
}
