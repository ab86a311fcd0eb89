//! In-process metadata cluster: the topology plus the partitions it places.
//!
//! Stands in for the set of metadata servers and the coordination service
//! when everything runs in one process (tests, the demo binary).

use std::sync::Arc;

use dashmap::DashMap;

use crate::kvstore::{KvStore, MemoryKvStore};
use crate::partition::Partition;
use crate::topology::Topology;
use crate::types::*;

/// Owns the topology and one [`Partition`] per registered range.
pub struct MetaCluster {
    topology: Arc<Topology>,
    partitions: DashMap<PartitionId, Arc<Partition>>,
}

impl MetaCluster {
    /// Creates a cluster without partitions.
    pub fn new() -> Self {
        Self {
            topology: Arc::new(Topology::new()),
            partitions: DashMap::new(),
        }
    }

    /// The coordination authority.
    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Registers a partition owning `[start, end]` of `fs_id`, backed by an in-memory store.
    pub fn add_partition(
        &self,
        fs_id: FsId,
        partition_id: PartitionId,
        start: InodeId,
        end: InodeId,
    ) -> Result<Arc<Partition>, MetaError> {
        self.add_partition_with_store(fs_id, partition_id, start, end, Arc::new(MemoryKvStore::new()))
    }

    /// Registers a partition over the given store.
    pub fn add_partition_with_store(
        &self,
        fs_id: FsId,
        partition_id: PartitionId,
        start: InodeId,
        end: InodeId,
        kv: Arc<dyn KvStore>,
    ) -> Result<Arc<Partition>, MetaError> {
        let info = self.topology.add_partition(fs_id, partition_id, start, end)?;
        let partition = Arc::new(Partition::new(info, kv, self.topology.clone()));
        self.partitions.insert(partition_id, partition.clone());
        Ok(partition)
    }

    /// Returns the partition with the given id.
    pub fn partition(&self, partition_id: PartitionId) -> Result<Arc<Partition>, MetaError> {
        self.partitions
            .get(&partition_id)
            .map(|p| p.value().clone())
            .ok_or(MetaError::UnknownPartition(partition_id))
    }

    /// Returns the partition owning `ino` of `fs_id`.
    pub fn partition_for(&self, fs_id: FsId, ino: InodeId) -> Result<Arc<Partition>, MetaError> {
        let info = self.topology.partition_for(fs_id, ino)?;
        self.partition(info.partition_id)
    }

    /// Advances a partition's committed epoch to `epoch` without a rename.
    ///
    /// Used to bring partitions to a known epoch when seeding state.
    pub fn advance_to(&self, partition_id: PartitionId, epoch: Epoch) -> Result<(), MetaError> {
        let mut current = self.topology.partition(partition_id)?.epoch;
        while current < epoch {
            current = current.next()?;
            self.topology
                .commit(&[PartitionEpoch::new(partition_id, current)])?;
        }
        Ok(())
    }

    /// Finalizes every pending transaction whose epoch has been committed.
    ///
    /// Returns the partitions that were reconciled.
    pub fn reconcile_all(&self) -> Result<Vec<PartitionEpoch>, MetaError> {
        let mut done = Vec::new();
        for entry in self.partitions.iter() {
            if let Some(epoch) = entry.value().reconcile()? {
                done.push(PartitionEpoch::new(*entry.key(), epoch));
            }
        }
        Ok(done)
    }
}

impl Default for MetaCluster {
    fn default() -> Self {
        Self::new()
    }
}
