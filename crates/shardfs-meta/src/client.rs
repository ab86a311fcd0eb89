//! Collaborator contracts of the rename path and the in-process client.
//!
//! The rename coordinator only talks to these traits: [`EpochStore`] for the
//! client's view of partition epochs, [`MetadataStore`] for partition reads
//! and prepares, and [`TxCoordinator`] for the commit decision. [`MetaClient`]
//! implements the first two against a [`MetaCluster`]; the cluster's
//! topology implements the third.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::cluster::MetaCluster;
use crate::partition::Partition;
use crate::types::*;

/// Client-side view of partition epochs.
#[async_trait]
pub trait EpochStore: Send + Sync {
    /// Returns the partition owning the directory `inode_id` and the epoch
    /// this client currently reads that partition at.
    async fn epoch_of(&self, fs_id: FsId, inode_id: InodeId) -> Result<PartitionEpoch, MetaError>;

    /// Moves the cached epoch of a partition forward. Never moves it back.
    fn advance_epoch(&self, partition_id: PartitionId, epoch: Epoch);
}

/// Remote access to partition dentry and inode tables.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Resolves `(parent, name)`; `NotExist` if absent.
    async fn get_dentry(&self, fs_id: FsId, parent: InodeId, name: &str)
        -> Result<Dentry, MetaError>;

    /// Lists up to `limit` live children of `parent`.
    async fn list_dentry(
        &self,
        fs_id: FsId,
        parent: InodeId,
        limit: usize,
    ) -> Result<Vec<Dentry>, MetaError>;

    /// Submits prepared dentries to the partition owning their parents,
    /// which accepts or rejects them as one unit.
    async fn prepare_rename_tx(&self, dentries: &[Dentry]) -> Result<(), MetaError>;

    /// Drops an uncommitted prepare at `epoch` on the partition.
    async fn abandon_rename_tx(
        &self,
        partition_id: PartitionId,
        epoch: Epoch,
    ) -> Result<bool, MetaError>;

    /// Fetches an inode.
    async fn get_inode(&self, fs_id: FsId, inode_id: InodeId) -> Result<Inode, MetaError>;

    /// Writes back an updated inode.
    async fn update_inode(&self, inode: &Inode) -> Result<(), MetaError>;
}

/// The control-plane commit decision.
#[async_trait]
pub trait TxCoordinator: Send + Sync {
    /// Advances every listed partition's epoch as a single decision, or
    /// fails without any partial effect.
    async fn commit_tx(&self, epochs: &[PartitionEpoch]) -> Result<(), MetaError>;
}

/// In-process metadata client with its own cache of partition epochs.
///
/// Reads of a partition are served at the epoch cached here; the cache is
/// filled from the authority on first use and moved forward by
/// [`EpochStore::advance_epoch`] after a commit.
pub struct MetaClient {
    cluster: Arc<MetaCluster>,
    epochs: DashMap<PartitionId, Epoch>,
}

impl MetaClient {
    /// Creates a client of the given cluster.
    pub fn new(cluster: Arc<MetaCluster>) -> Self {
        Self {
            cluster,
            epochs: DashMap::new(),
        }
    }

    /// The cluster this client talks to.
    pub fn cluster(&self) -> &Arc<MetaCluster> {
        &self.cluster
    }

    /// Returns the cached epoch of a partition without filling the cache.
    pub fn cached_epoch(&self, partition_id: PartitionId) -> Option<Epoch> {
        self.epochs.get(&partition_id).map(|e| *e.value())
    }

    /// Forgets the cached epoch so the next access refetches it.
    pub fn invalidate_epoch(&self, partition_id: PartitionId) {
        self.epochs.remove(&partition_id);
    }

    fn read_epoch(&self, partition: &Partition) -> Result<Epoch, MetaError> {
        if let Some(epoch) = self.cached_epoch(partition.id()) {
            return Ok(epoch);
        }
        let epoch = partition.committed_epoch()?;
        let cached = *self.epochs.entry(partition.id()).or_insert(epoch);
        Ok(cached)
    }
}

#[async_trait]
impl EpochStore for MetaClient {
    async fn epoch_of(&self, fs_id: FsId, inode_id: InodeId) -> Result<PartitionEpoch, MetaError> {
        let partition = self.cluster.partition_for(fs_id, inode_id)?;
        let epoch = self.read_epoch(&partition)?;
        Ok(PartitionEpoch::new(partition.id(), epoch))
    }

    fn advance_epoch(&self, partition_id: PartitionId, epoch: Epoch) {
        let mut entry = self.epochs.entry(partition_id).or_insert(epoch);
        if *entry < epoch {
            *entry = epoch;
        }
    }
}

#[async_trait]
impl MetadataStore for MetaClient {
    async fn get_dentry(
        &self,
        fs_id: FsId,
        parent: InodeId,
        name: &str,
    ) -> Result<Dentry, MetaError> {
        let partition = self.cluster.partition_for(fs_id, parent)?;
        let epoch = self.read_epoch(&partition)?;
        partition.get_dentry(fs_id, parent, name, epoch)
    }

    async fn list_dentry(
        &self,
        fs_id: FsId,
        parent: InodeId,
        limit: usize,
    ) -> Result<Vec<Dentry>, MetaError> {
        let partition = self.cluster.partition_for(fs_id, parent)?;
        let epoch = self.read_epoch(&partition)?;
        partition.list_dentry(fs_id, parent, epoch, limit)
    }

    async fn prepare_rename_tx(&self, dentries: &[Dentry]) -> Result<(), MetaError> {
        let first = dentries
            .first()
            .ok_or_else(|| MetaError::InvalidArgument("empty prepare".to_string()))?;
        let partition = self.cluster.partition_for(first.fs_id, first.parent_id)?;
        let result = partition.prepare_rename_tx(dentries);
        if let Err(e) = &result {
            if e.kind() == ErrorKind::Conflict {
                self.invalidate_epoch(partition.id());
            }
        }
        result
    }

    async fn abandon_rename_tx(
        &self,
        partition_id: PartitionId,
        epoch: Epoch,
    ) -> Result<bool, MetaError> {
        self.cluster.partition(partition_id)?.abandon(epoch)
    }

    async fn get_inode(&self, fs_id: FsId, inode_id: InodeId) -> Result<Inode, MetaError> {
        self.cluster
            .partition_for(fs_id, inode_id)?
            .get_inode(fs_id, inode_id)
    }

    async fn update_inode(&self, inode: &Inode) -> Result<(), MetaError> {
        self.cluster
            .partition_for(inode.fs_id, inode.inode_id)?
            .update_inode(inode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: u32 = 1;

    fn setup() -> (Arc<MetaCluster>, MetaClient) {
        let cluster = Arc::new(MetaCluster::new());
        let fs = FsId::new(FS);
        cluster
            .add_partition(fs, PartitionId::new(1), InodeId::new(1), InodeId::new(99))
            .unwrap();
        cluster
            .add_partition(fs, PartitionId::new(2), InodeId::new(100), InodeId::new(199))
            .unwrap();
        cluster.advance_to(PartitionId::new(1), Epoch::new(5)).unwrap();
        let client = MetaClient::new(cluster.clone());
        (cluster, client)
    }

    #[tokio::test]
    async fn test_epoch_of_fills_cache_from_authority() {
        let (_cluster, client) = setup();
        assert!(client.cached_epoch(PartitionId::new(1)).is_none());

        let pe = client.epoch_of(FsId::new(FS), InodeId::new(10)).await.unwrap();
        assert_eq!(pe, PartitionEpoch::new(PartitionId::new(1), Epoch::new(5)));
        assert_eq!(client.cached_epoch(PartitionId::new(1)), Some(Epoch::new(5)));

        let pe = client.epoch_of(FsId::new(FS), InodeId::new(150)).await.unwrap();
        assert_eq!(pe.partition_id, PartitionId::new(2));
        assert!(client.epoch_of(FsId::new(FS), InodeId::new(999)).await.is_err());
    }

    #[tokio::test]
    async fn test_advance_epoch_is_monotonic() {
        let (_cluster, client) = setup();
        client.advance_epoch(PartitionId::new(1), Epoch::new(6));
        client.advance_epoch(PartitionId::new(1), Epoch::new(4));
        assert_eq!(client.cached_epoch(PartitionId::new(1)), Some(Epoch::new(6)));
    }

    #[tokio::test]
    async fn test_reads_use_cached_epoch() {
        let (cluster, client) = setup();
        let fs = FsId::new(FS);
        let part = cluster.partition(PartitionId::new(1)).unwrap();
        part.insert_dentry(&Dentry::new_file(fs, InodeId::new(10), "a", InodeId::new(50), Epoch::new(5)))
            .unwrap();

        assert!(client.get_dentry(fs, InodeId::new(10), "a").await.is_ok());

        let mut tomb = Dentry::new_file(fs, InodeId::new(10), "a", InodeId::new(50), Epoch::new(6));
        tomb.flags |= DentryFlags::DELETE_MARK | DentryFlags::TRANSACTION_PREPARE;
        client.prepare_rename_tx(&[tomb]).await.unwrap();
        cluster.advance_to(PartitionId::new(1), Epoch::new(6)).unwrap();

        // still reading at the cached epoch 5
        assert!(client.get_dentry(fs, InodeId::new(10), "a").await.is_ok());
        client.advance_epoch(PartitionId::new(1), Epoch::new(6));
        assert!(client
            .get_dentry(fs, InodeId::new(10), "a")
            .await
            .unwrap_err()
            .is_not_exist());
    }

    #[tokio::test]
    async fn test_conflict_invalidates_cached_epoch() {
        let (cluster, client) = setup();
        let fs = FsId::new(FS);
        client.epoch_of(fs, InodeId::new(10)).await.unwrap();
        cluster.advance_to(PartitionId::new(1), Epoch::new(8)).unwrap();

        let mut stale = Dentry::new_file(fs, InodeId::new(10), "a", InodeId::new(50), Epoch::new(6));
        stale.flags |= DentryFlags::TRANSACTION_PREPARE;
        let err = client.prepare_rename_tx(&[stale]).await.unwrap_err();
        assert!(matches!(err, MetaError::Conflict { .. }));
        assert!(client.cached_epoch(PartitionId::new(1)).is_none());

        let pe = client.epoch_of(fs, InodeId::new(10)).await.unwrap();
        assert_eq!(pe.epoch, Epoch::new(8));
    }

    #[tokio::test]
    async fn test_stale_entry_invalidates_cached_epoch() {
        let (_cluster, client) = setup();
        let fs = FsId::new(FS);
        client.epoch_of(fs, InodeId::new(10)).await.unwrap();

        // tombstone of an entry that is not live
        let mut tomb = Dentry::new_file(fs, InodeId::new(10), "a", InodeId::new(50), Epoch::new(6));
        tomb.flags |= DentryFlags::DELETE_MARK | DentryFlags::TRANSACTION_PREPARE;
        let err = client.prepare_rename_tx(&[tomb]).await.unwrap_err();
        assert!(matches!(err, MetaError::EntryConflict { .. }));
        assert!(client.cached_epoch(PartitionId::new(1)).is_none());
    }

    #[tokio::test]
    async fn test_inode_routing() {
        let (cluster, client) = setup();
        let fs = FsId::new(FS);
        cluster
            .partition(PartitionId::new(2))
            .unwrap()
            .insert_inode(&Inode::new_file(fs, InodeId::new(150)))
            .unwrap();

        let mut inode = client.get_inode(fs, InodeId::new(150)).await.unwrap();
        inode.nlink = 4;
        client.update_inode(&inode).await.unwrap();
        assert_eq!(client.get_inode(fs, InodeId::new(150)).await.unwrap().nlink, 4);
        assert!(matches!(
            client.get_inode(fs, InodeId::new(151)).await,
            Err(MetaError::InodeNotFound(_))
        ));
    }
}
