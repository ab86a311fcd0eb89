//! One metadata partition: versioned dentries, inodes and the prepare marker.
//!
//! A partition accepts a rename prepare only at the epoch following the one
//! the authority has committed for it, and holds at most one pending
//! transaction at a time. A pending transaction is finalized once the
//! authority reports its epoch committed, or dropped by [`Partition::abandon`]
//! while it is still uncommitted.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::dentry::{validate_name, DentryStorage};
use crate::inode::InodeStorage;
use crate::kvstore::KvStore;
use crate::topology::{EpochAuthority, PartitionInfo};
use crate::types::*;

/// Versions written by a prepare that has not been finalized yet.
#[derive(Clone, Debug)]
pub struct PendingTx {
    /// Epoch the versions were written at.
    pub epoch: Epoch,
    /// The prepared versions.
    pub dentries: Vec<Dentry>,
}

/// A single partition's tables and transaction state.
pub struct Partition {
    info: PartitionInfo,
    dentries: DentryStorage,
    inodes: InodeStorage,
    pending: Mutex<Option<PendingTx>>,
    authority: Arc<dyn EpochAuthority>,
}

impl Partition {
    /// Creates a partition over the given store.
    pub fn new(
        info: PartitionInfo,
        kv: Arc<dyn KvStore>,
        authority: Arc<dyn EpochAuthority>,
    ) -> Self {
        Self {
            info,
            dentries: DentryStorage::new(kv.clone()),
            inodes: InodeStorage::new(kv),
            pending: Mutex::new(None),
            authority,
        }
    }

    /// The partition's identifier.
    pub fn id(&self) -> PartitionId {
        self.info.partition_id
    }

    /// Placement of this partition.
    pub fn info(&self) -> &PartitionInfo {
        &self.info
    }

    /// Last epoch the authority committed for this partition.
    pub fn committed_epoch(&self) -> Result<Epoch, MetaError> {
        self.authority.committed_epoch(self.id())
    }

    /// Epoch of the pending transaction, if any.
    pub fn pending_epoch(&self) -> Option<Epoch> {
        self.pending
            .lock()
            .ok()
            .and_then(|p| p.as_ref().map(|tx| tx.epoch))
    }

    fn lock_pending(&self) -> Result<MutexGuard<'_, Option<PendingTx>>, MetaError> {
        self.pending
            .lock()
            .map_err(|e| MetaError::Internal(format!("partition {} lock poisoned: {}", self.id(), e)))
    }

    fn check_owner(&self, fs_id: FsId, ino: InodeId) -> Result<(), MetaError> {
        if self.info.owns(fs_id, ino) {
            Ok(())
        } else {
            Err(MetaError::InvalidArgument(format!(
                "inode {} of fs {} is not owned by partition {}",
                ino,
                fs_id,
                self.id()
            )))
        }
    }

    /// Writes a committed dentry version directly (bootstrap and create path).
    pub fn insert_dentry(&self, dentry: &Dentry) -> Result<(), MetaError> {
        self.check_owner(dentry.fs_id, dentry.parent_id)?;
        if dentry.is_prepared() {
            return Err(MetaError::InvalidArgument(
                "direct writes cannot carry the prepare marker".to_string(),
            ));
        }
        let committed = self.committed_epoch()?;
        if dentry.epoch > committed {
            return Err(MetaError::Conflict {
                partition: self.id(),
                expected: committed,
                found: dentry.epoch,
            });
        }
        self.dentries.put(dentry)
    }

    /// Resolves `(parent, name)` as seen at `epoch`.
    pub fn get_dentry(
        &self,
        fs_id: FsId,
        parent: InodeId,
        name: &str,
        epoch: Epoch,
    ) -> Result<Dentry, MetaError> {
        self.check_owner(fs_id, parent)?;
        self.dentries
            .get(fs_id, parent, name, epoch)?
            .ok_or_else(|| MetaError::NotExist {
                parent,
                name: name.to_string(),
            })
    }

    /// Lists up to `limit` live children of `parent` as seen at `epoch`.
    pub fn list_dentry(
        &self,
        fs_id: FsId,
        parent: InodeId,
        epoch: Epoch,
        limit: usize,
    ) -> Result<Vec<Dentry>, MetaError> {
        self.check_owner(fs_id, parent)?;
        self.dentries.list(fs_id, parent, epoch, limit)
    }

    /// Stores a new inode owned by this partition.
    pub fn insert_inode(&self, inode: &Inode) -> Result<(), MetaError> {
        self.check_owner(inode.fs_id, inode.inode_id)?;
        self.inodes.insert(inode)
    }

    /// Retrieves an inode owned by this partition.
    pub fn get_inode(&self, fs_id: FsId, ino: InodeId) -> Result<Inode, MetaError> {
        self.check_owner(fs_id, ino)?;
        self.inodes.get(fs_id, ino)
    }

    /// Replaces an inode owned by this partition.
    pub fn update_inode(&self, inode: &Inode) -> Result<(), MetaError> {
        self.check_owner(inode.fs_id, inode.inode_id)?;
        self.inodes.update(inode)
    }

    fn validate_batch(&self, dentries: &[Dentry]) -> Result<Epoch, MetaError> {
        let first = match dentries {
            [first] | [first, _] => first,
            _ => {
                return Err(MetaError::InvalidArgument(format!(
                    "prepare carries {} dentries, expected 1 or 2",
                    dentries.len()
                )))
            }
        };
        for d in dentries {
            if d.fs_id != first.fs_id || d.epoch != first.epoch {
                return Err(MetaError::InvalidArgument(
                    "prepared dentries disagree on fs or epoch".to_string(),
                ));
            }
            if !d.is_prepared() {
                return Err(MetaError::InvalidArgument(format!(
                    "dentry {:?} lacks the prepare marker",
                    d.name
                )));
            }
            validate_name(&d.name)?;
            self.check_owner(d.fs_id, d.parent_id)?;
        }
        if let [a, b] = dentries {
            if a.key() == b.key() {
                return Err(MetaError::InvalidArgument(
                    "prepared dentries share one key".to_string(),
                ));
            }
        }
        Ok(first.epoch)
    }

    fn finalize(&self, tx: &PendingTx) -> Result<(), MetaError> {
        self.dentries
            .apply(self.dentries.finalize_ops(&tx.dentries)?)?;
        tracing::debug!("Partition {}: finalized transaction at epoch {}", self.id(), tx.epoch);
        Ok(())
    }

    /// Checks a prepared version against the entry live at `committed`.
    ///
    /// A tombstone must hide a live entry naming the same inode. A
    /// materialization may only shadow the inode it declares in `replaces`,
    /// and needs a free name when that is `NONE`.
    fn check_live(&self, dentry: &Dentry, committed: Epoch) -> Result<(), MetaError> {
        let live = self
            .dentries
            .get(dentry.fs_id, dentry.parent_id, &dentry.name, committed)?
            .map(|d| d.inode_id);
        let expected = if dentry.is_deleted() {
            Some(dentry.inode_id)
        } else {
            (!dentry.replaces.is_none()).then_some(dentry.replaces)
        };
        if live == expected {
            return Ok(());
        }
        tracing::warn!(
            "Partition {}: prepared [{}] expects inode {:?} but {:?} is live at epoch {}",
            self.id(),
            dentry,
            expected,
            live,
            committed
        );
        Err(MetaError::EntryConflict {
            partition: self.id(),
            parent: dentry.parent_id,
            name: dentry.name.clone(),
        })
    }

    /// Writes the prepared versions of a rename as one unit.
    ///
    /// Every dentry must carry the prepare marker and the epoch following the
    /// committed one, and must agree with the entry live at the committed
    /// epoch. A still-uncommitted pending transaction blocks the prepare; a
    /// committed one is finalized first.
    pub fn prepare_rename_tx(&self, dentries: &[Dentry]) -> Result<(), MetaError> {
        let epoch = self.validate_batch(dentries)?;
        let mut pending = self.lock_pending()?;
        let committed = self.committed_epoch()?;

        if let Some(tx) = pending.as_ref() {
            if tx.epoch <= committed {
                self.finalize(tx)?;
                *pending = None;
            } else {
                tracing::warn!(
                    "Partition {}: prepare at epoch {} blocked by pending transaction at epoch {}",
                    self.id(),
                    epoch,
                    tx.epoch
                );
                return Err(MetaError::Conflict {
                    partition: self.id(),
                    expected: tx.epoch.next()?,
                    found: epoch,
                });
            }
        }

        let next = committed.next()?;
        if epoch != next {
            return Err(MetaError::Conflict {
                partition: self.id(),
                expected: next,
                found: epoch,
            });
        }
        for d in dentries {
            if self.dentries.has_version(d)? {
                return Err(MetaError::Conflict {
                    partition: self.id(),
                    expected: next,
                    found: epoch,
                });
            }
            self.check_live(d, committed)?;
        }

        self.dentries.apply(self.dentries.put_ops(dentries)?)?;
        *pending = Some(PendingTx {
            epoch,
            dentries: dentries.to_vec(),
        });
        tracing::debug!(
            "Partition {}: prepared {} dentries at epoch {}",
            self.id(),
            dentries.len(),
            epoch
        );
        Ok(())
    }

    /// Drops the pending transaction at `epoch` if the authority has not
    /// committed it.
    ///
    /// Returns true when versions were dropped. A transaction that turns out
    /// to be committed is finalized instead and false is returned.
    pub fn abandon(&self, epoch: Epoch) -> Result<bool, MetaError> {
        let mut pending = self.lock_pending()?;
        let tx = match pending.as_ref() {
            Some(tx) if tx.epoch == epoch => tx.clone(),
            _ => return Ok(false),
        };

        if tx.epoch <= self.committed_epoch()? {
            self.finalize(&tx)?;
            *pending = None;
            return Ok(false);
        }

        self.dentries.apply(self.dentries.remove_ops(&tx.dentries))?;
        *pending = None;
        tracing::info!(
            "Partition {}: abandoned prepared transaction at epoch {}",
            self.id(),
            epoch
        );
        Ok(true)
    }

    /// Finalizes the pending transaction if its epoch has been committed.
    ///
    /// Returns the finalized epoch; an uncommitted transaction stays pending.
    pub fn reconcile(&self) -> Result<Option<Epoch>, MetaError> {
        let mut pending = self.lock_pending()?;
        let committed = self.committed_epoch()?;
        match pending.take() {
            Some(tx) if tx.epoch <= committed => {
                self.finalize(&tx)?;
                Ok(Some(tx.epoch))
            }
            other => {
                *pending = other;
                Ok(None)
            }
        }
    }
}
