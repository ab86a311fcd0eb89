//! Coordination authority: partition placement and authoritative epochs.
//!
//! The topology maps `(fs_id, inode)` to the partition owning that inode's
//! range and holds the committed epoch of every partition. A commit is a
//! single decision under one write lock: every listed partition advances to
//! its requested epoch, or none does.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::client::TxCoordinator;
use crate::types::*;

/// Placement and epoch of one partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionInfo {
    /// Filesystem the partition belongs to.
    pub fs_id: FsId,
    /// The partition's identifier.
    pub partition_id: PartitionId,
    /// First inode id owned (inclusive).
    pub start: InodeId,
    /// Last inode id owned (inclusive).
    pub end: InodeId,
    /// Last committed epoch.
    pub epoch: Epoch,
}

impl PartitionInfo {
    /// Returns true if this partition owns `ino` of `fs_id`.
    pub fn owns(&self, fs_id: FsId, ino: InodeId) -> bool {
        self.fs_id == fs_id && self.start <= ino && ino <= self.end
    }

    fn overlaps(&self, other: &PartitionInfo) -> bool {
        self.fs_id == other.fs_id && self.start <= other.end && other.start <= self.end
    }
}

/// Read access to committed epochs, used by partitions to resolve their
/// pending transactions.
pub trait EpochAuthority: Send + Sync {
    /// Returns the last committed epoch of the partition.
    fn committed_epoch(&self, partition_id: PartitionId) -> Result<Epoch, MetaError>;
}

/// In-memory coordination authority.
#[derive(Default)]
pub struct Topology {
    partitions: RwLock<HashMap<PartitionId, PartitionInfo>>,
}

impl Topology {
    /// Creates an empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a partition owning `[start, end]` of `fs_id`, starting at epoch 0.
    pub fn add_partition(
        &self,
        fs_id: FsId,
        partition_id: PartitionId,
        start: InodeId,
        end: InodeId,
    ) -> Result<PartitionInfo, MetaError> {
        if start > end {
            return Err(MetaError::InvalidArgument(format!(
                "partition {} has empty range [{}, {}]",
                partition_id, start, end
            )));
        }
        let info = PartitionInfo {
            fs_id,
            partition_id,
            start,
            end,
            epoch: Epoch::ZERO,
        };

        let mut partitions = self
            .partitions
            .write()
            .map_err(|e| MetaError::Internal(format!("failed to acquire write lock: {}", e)))?;
        if partitions.contains_key(&partition_id) {
            return Err(MetaError::InvalidArgument(format!(
                "partition {} already registered",
                partition_id
            )));
        }
        if let Some(existing) = partitions.values().find(|p| p.overlaps(&info)) {
            return Err(MetaError::InvalidArgument(format!(
                "partition {} overlaps partition {}",
                partition_id, existing.partition_id
            )));
        }
        partitions.insert(partition_id, info.clone());
        tracing::debug!(
            "Registered partition {} for fs {} owning [{}, {}]",
            partition_id,
            fs_id,
            start,
            end
        );
        Ok(info)
    }

    /// Returns the partition owning `ino` of `fs_id`.
    pub fn partition_for(&self, fs_id: FsId, ino: InodeId) -> Result<PartitionInfo, MetaError> {
        let partitions = self
            .partitions
            .read()
            .map_err(|e| MetaError::Internal(format!("failed to acquire read lock: {}", e)))?;
        partitions
            .values()
            .find(|p| p.owns(fs_id, ino))
            .cloned()
            .ok_or(MetaError::PartitionNotFound {
                fs_id,
                inode_id: ino,
            })
    }

    /// Returns the partition's info.
    pub fn partition(&self, partition_id: PartitionId) -> Result<PartitionInfo, MetaError> {
        let partitions = self
            .partitions
            .read()
            .map_err(|e| MetaError::Internal(format!("failed to acquire read lock: {}", e)))?;
        partitions
            .get(&partition_id)
            .cloned()
            .ok_or(MetaError::UnknownPartition(partition_id))
    }

    /// Returns every registered partition, ordered by id.
    pub fn partitions(&self) -> Vec<PartitionInfo> {
        let mut all: Vec<_> = self
            .partitions
            .read()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by_key(|p| p.partition_id);
        all
    }

    /// Advances every listed partition to its requested epoch as one decision.
    ///
    /// Each requested epoch must be exactly the partition's committed epoch
    /// plus one. A duplicate partition, an unknown partition or a stale epoch
    /// rejects the whole request and nothing changes.
    pub fn commit(&self, epochs: &[PartitionEpoch]) -> Result<(), MetaError> {
        if epochs.is_empty() {
            return Err(MetaError::InvalidArgument(
                "commit without partitions".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        if !epochs.iter().all(|pe| seen.insert(pe.partition_id)) {
            return Err(MetaError::InvalidArgument(
                "commit lists a partition twice".to_string(),
            ));
        }

        let mut partitions = self
            .partitions
            .write()
            .map_err(|e| MetaError::Internal(format!("failed to acquire write lock: {}", e)))?;

        for pe in epochs {
            let info = partitions
                .get(&pe.partition_id)
                .ok_or(MetaError::UnknownPartition(pe.partition_id))?;
            let next = info.epoch.next()?;
            if pe.epoch != next {
                return Err(MetaError::Conflict {
                    partition: pe.partition_id,
                    expected: next,
                    found: pe.epoch,
                });
            }
        }

        for pe in epochs {
            if let Some(info) = partitions.get_mut(&pe.partition_id) {
                info.epoch = pe.epoch;
            }
        }

        tracing::info!(
            "Committed epochs [{}]",
            epochs
                .iter()
                .map(|pe| pe.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }
}

impl EpochAuthority for Topology {
    fn committed_epoch(&self, partition_id: PartitionId) -> Result<Epoch, MetaError> {
        self.partition(partition_id).map(|p| p.epoch)
    }
}

#[async_trait]
impl TxCoordinator for Topology {
    async fn commit_tx(&self, epochs: &[PartitionEpoch]) -> Result<(), MetaError> {
        self.commit(epochs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_partitions() -> Topology {
        let topo = Topology::new();
        topo.add_partition(FsId::new(1), PartitionId::new(1), InodeId::new(1), InodeId::new(99))
            .unwrap();
        topo.add_partition(
            FsId::new(1),
            PartitionId::new(2),
            InodeId::new(100),
            InodeId::new(199),
        )
        .unwrap();
        topo
    }

    fn pe(pid: u32, epoch: u64) -> PartitionEpoch {
        PartitionEpoch::new(PartitionId::new(pid), Epoch::new(epoch))
    }

    #[test]
    fn test_partition_for_routes_by_range() {
        let topo = two_partitions();
        let fs = FsId::new(1);
        assert_eq!(
            topo.partition_for(fs, InodeId::new(10)).unwrap().partition_id,
            PartitionId::new(1)
        );
        assert_eq!(
            topo.partition_for(fs, InodeId::new(150)).unwrap().partition_id,
            PartitionId::new(2)
        );
        assert!(matches!(
            topo.partition_for(fs, InodeId::new(500)),
            Err(MetaError::PartitionNotFound { .. })
        ));
        assert!(topo.partition_for(FsId::new(2), InodeId::new(10)).is_err());
    }

    #[test]
    fn test_add_partition_rejects_overlap_and_duplicates() {
        let topo = two_partitions();
        let fs = FsId::new(1);
        assert!(topo
            .add_partition(fs, PartitionId::new(3), InodeId::new(50), InodeId::new(120))
            .is_err());
        assert!(topo
            .add_partition(fs, PartitionId::new(1), InodeId::new(500), InodeId::new(600))
            .is_err());
        assert!(topo
            .add_partition(fs, PartitionId::new(4), InodeId::new(9), InodeId::new(1))
            .is_err());
        assert!(topo
            .add_partition(FsId::new(2), PartitionId::new(5), InodeId::new(1), InodeId::new(99))
            .is_ok());
        assert_eq!(topo.partitions().len(), 3);
    }

    #[test]
    fn test_commit_advances_all_listed_partitions() {
        let topo = two_partitions();
        topo.commit(&[pe(1, 1), pe(2, 1)]).unwrap();
        assert_eq!(topo.committed_epoch(PartitionId::new(1)).unwrap(), Epoch::new(1));
        assert_eq!(topo.committed_epoch(PartitionId::new(2)).unwrap(), Epoch::new(1));

        topo.commit(&[pe(2, 2)]).unwrap();
        assert_eq!(topo.committed_epoch(PartitionId::new(1)).unwrap(), Epoch::new(1));
        assert_eq!(topo.committed_epoch(PartitionId::new(2)).unwrap(), Epoch::new(2));
    }

    #[test]
    fn test_commit_is_all_or_nothing() {
        let topo = two_partitions();
        let err = topo.commit(&[pe(1, 1), pe(2, 5)]).unwrap_err();
        assert!(matches!(err, MetaError::Conflict { .. }));
        assert_eq!(topo.committed_epoch(PartitionId::new(1)).unwrap(), Epoch::ZERO);

        assert!(matches!(
            topo.commit(&[pe(1, 1), pe(9, 1)]),
            Err(MetaError::UnknownPartition(_))
        ));
        assert_eq!(topo.committed_epoch(PartitionId::new(1)).unwrap(), Epoch::ZERO);
    }

    #[test]
    fn test_commit_rejects_duplicates_and_empty() {
        let topo = two_partitions();
        assert!(matches!(
            topo.commit(&[pe(1, 1), pe(1, 1)]),
            Err(MetaError::InvalidArgument(_))
        ));
        assert!(matches!(topo.commit(&[]), Err(MetaError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_commit_tx_through_coordinator_trait() {
        let topo = two_partitions();
        let coordinator: &dyn TxCoordinator = &topo;
        coordinator.commit_tx(&[pe(1, 1)]).await.unwrap();
        assert_eq!(topo.partition(PartitionId::new(1)).unwrap().epoch, Epoch::new(1));
    }
}
