//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use shardfs_meta::cache::{DentryCacheManager, InodeCacheManager};
use shardfs_meta::client::{EpochStore, MetaClient, MetadataStore, TxCoordinator};
use shardfs_meta::cluster::MetaCluster;
use shardfs_meta::config::{CacheConfig, RenameConfig};
use shardfs_meta::metrics::RenameMetrics;
use shardfs_meta::partition::Partition;
use shardfs_meta::rename::{RenameContext, RenameOperator};
use shardfs_meta::topology::Topology;
use shardfs_meta::types::*;

pub const FS: u32 = 1;
pub const P1: u32 = 1;
pub const P2: u32 = 2;

/// Source parent, on partition 1
pub const SRC_PARENT: u64 = 10;
/// Second parent on partition 1
pub const LOCAL_PARENT: u64 = 11;
/// Destination parent, on partition 2
pub const DST_PARENT: u64 = 20;
/// Inode referenced by `(10, "a")`
pub const SRC_INODE: u64 = 100;
/// Inode referenced by the optional `(20, "b")`
pub const DST_INODE: u64 = 200;
/// Directory referenced by the optional `(20, "d")`
pub const DIR_INODE: u64 = 300;

pub fn fs() -> FsId {
    FsId::new(FS)
}

pub fn ino(n: u64) -> InodeId {
    InodeId::new(n)
}

pub fn pid(n: u32) -> PartitionId {
    PartitionId::new(n)
}

pub fn pe(p: u32, e: u64) -> PartitionEpoch {
    PartitionEpoch::new(pid(p), Epoch::new(e))
}

/// One recorded prepare call
#[derive(Clone, Debug)]
pub struct PrepareCall {
    pub partition: PartitionId,
    pub dentries: Vec<Dentry>,
}

/// [`MetadataStore`] wrapper recording prepare/abandon calls, with failure switches
pub struct RecordingStore {
    inner: Arc<MetaClient>,
    prepares: Mutex<Vec<PrepareCall>>,
    abandons: Mutex<Vec<PartitionEpoch>>,
    fail_prepare_on: Mutex<Option<PartitionId>>,
    fail_update_inode: AtomicBool,
}

impl RecordingStore {
    pub fn new(inner: Arc<MetaClient>) -> Self {
        Self {
            inner,
            prepares: Mutex::new(Vec::new()),
            abandons: Mutex::new(Vec::new()),
            fail_prepare_on: Mutex::new(None),
            fail_update_inode: AtomicBool::new(false),
        }
    }

    pub fn prepares(&self) -> Vec<PrepareCall> {
        self.prepares.lock().unwrap().clone()
    }

    pub fn abandons(&self) -> Vec<PartitionEpoch> {
        self.abandons.lock().unwrap().clone()
    }

    pub fn fail_prepare_on(&self, partition: PartitionId) {
        *self.fail_prepare_on.lock().unwrap() = Some(partition);
    }

    pub fn fail_update_inode(&self) {
        self.fail_update_inode.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetadataStore for RecordingStore {
    async fn get_dentry(
        &self,
        fs_id: FsId,
        parent: InodeId,
        name: &str,
    ) -> Result<Dentry, MetaError> {
        self.inner.get_dentry(fs_id, parent, name).await
    }

    async fn list_dentry(
        &self,
        fs_id: FsId,
        parent: InodeId,
        limit: usize,
    ) -> Result<Vec<Dentry>, MetaError> {
        self.inner.list_dentry(fs_id, parent, limit).await
    }

    async fn prepare_rename_tx(&self, dentries: &[Dentry]) -> Result<(), MetaError> {
        let first = &dentries[0];
        let partition = self
            .inner
            .cluster()
            .partition_for(first.fs_id, first.parent_id)?
            .id();
        self.prepares.lock().unwrap().push(PrepareCall {
            partition,
            dentries: dentries.to_vec(),
        });
        if *self.fail_prepare_on.lock().unwrap() == Some(partition) {
            return Err(MetaError::Internal(format!(
                "injected prepare failure on partition {}",
                partition
            )));
        }
        self.inner.prepare_rename_tx(dentries).await
    }

    async fn abandon_rename_tx(
        &self,
        partition_id: PartitionId,
        epoch: Epoch,
    ) -> Result<bool, MetaError> {
        self.abandons
            .lock()
            .unwrap()
            .push(PartitionEpoch::new(partition_id, epoch));
        self.inner.abandon_rename_tx(partition_id, epoch).await
    }

    async fn get_inode(&self, fs_id: FsId, inode_id: InodeId) -> Result<Inode, MetaError> {
        self.inner.get_inode(fs_id, inode_id).await
    }

    async fn update_inode(&self, inode: &Inode) -> Result<(), MetaError> {
        if self.fail_update_inode.load(Ordering::SeqCst) {
            return Err(MetaError::Internal("injected inode update failure".to_string()));
        }
        self.inner.update_inode(inode).await
    }
}

/// [`TxCoordinator`] wrapper recording commit requests
pub struct RecordingCoordinator {
    inner: Arc<Topology>,
    commits: Mutex<Vec<Vec<PartitionEpoch>>>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl RecordingCoordinator {
    pub fn new(inner: Arc<Topology>) -> Self {
        Self {
            inner,
            commits: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn commits(&self) -> Vec<Vec<PartitionEpoch>> {
        self.commits.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TxCoordinator for RecordingCoordinator {
    async fn commit_tx(&self, epochs: &[PartitionEpoch]) -> Result<(), MetaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.commits.lock().unwrap().push(epochs.to_vec());
        if self.fail.load(Ordering::SeqCst) {
            return Err(MetaError::Internal("coordinator unavailable".to_string()));
        }
        self.inner.commit_tx(epochs).await
    }
}

/// Two-partition cluster: partition 1 owns inodes 1..=19 at epoch 5,
/// partition 2 owns 20..=999 at epoch 7. `(10, "a")` points at file inode 100.
pub struct RenameFixture {
    pub cluster: Arc<MetaCluster>,
    pub client: Arc<MetaClient>,
    pub store: Arc<RecordingStore>,
    pub coordinator: Arc<RecordingCoordinator>,
    pub dentry_cache: Arc<DentryCacheManager>,
    pub inode_cache: Arc<InodeCacheManager>,
    pub metrics: Arc<RenameMetrics>,
    pub config: RenameConfig,
}

impl RenameFixture {
    pub fn new() -> Self {
        let cluster = Arc::new(MetaCluster::new());
        cluster.add_partition(fs(), pid(P1), ino(1), ino(19)).unwrap();
        cluster.add_partition(fs(), pid(P2), ino(20), ino(999)).unwrap();
        cluster.advance_to(pid(P1), Epoch::new(5)).unwrap();
        cluster.advance_to(pid(P2), Epoch::new(7)).unwrap();

        let fixture = Self::over(cluster);
        fixture
            .p1()
            .insert_dentry(&Dentry::new_file(
                fs(),
                ino(SRC_PARENT),
                "a",
                ino(SRC_INODE),
                Epoch::new(5),
            ))
            .unwrap();
        fixture
            .p2()
            .insert_inode(&Inode::new_file(fs(), ino(SRC_INODE)))
            .unwrap();
        fixture
    }

    fn over(cluster: Arc<MetaCluster>) -> Self {
        let client = Arc::new(MetaClient::new(cluster.clone()));
        let store = Arc::new(RecordingStore::new(client.clone()));
        let coordinator = Arc::new(RecordingCoordinator::new(cluster.topology().clone()));
        let dentry_cache = Arc::new(DentryCacheManager::new(
            fs(),
            store.clone(),
            CacheConfig::default(),
        ));
        let inode_cache = Arc::new(InodeCacheManager::new(
            fs(),
            store.clone(),
            CacheConfig::default(),
        ));
        Self {
            cluster,
            client,
            store,
            coordinator,
            dentry_cache,
            inode_cache,
            metrics: Arc::new(RenameMetrics::new()),
            config: RenameConfig::default(),
        }
    }

    /// A second client of the same cluster, with its own caches and epochs.
    pub fn peer(&self) -> Self {
        Self::over(self.cluster.clone())
    }

    /// Adds `(20, "b")` pointing at file inode 200 at epoch 7.
    pub fn with_dst_file(self) -> Self {
        self.p2()
            .insert_dentry(&Dentry::new_file(
                fs(),
                ino(DST_PARENT),
                "b",
                ino(DST_INODE),
                Epoch::new(7),
            ))
            .unwrap();
        self.p2()
            .insert_inode(&Inode::new_file(fs(), ino(DST_INODE)))
            .unwrap();
        self
    }

    /// Adds directory `(20, "d")` -> 300, optionally with one child.
    pub fn with_dst_dir(self, with_child: bool) -> Self {
        self.p2()
            .insert_dentry(&Dentry::new_dir(
                fs(),
                ino(DST_PARENT),
                "d",
                ino(DIR_INODE),
                Epoch::new(7),
            ))
            .unwrap();
        self.p2()
            .insert_inode(&Inode::new_directory(fs(), ino(DIR_INODE)))
            .unwrap();
        if with_child {
            self.p2()
                .insert_dentry(&Dentry::new_file(
                    fs(),
                    ino(DIR_INODE),
                    "x",
                    ino(301),
                    Epoch::new(7),
                ))
                .unwrap();
        }
        self
    }

    pub fn p1(&self) -> Arc<Partition> {
        self.cluster.partition(pid(P1)).unwrap()
    }

    pub fn p2(&self) -> Arc<Partition> {
        self.cluster.partition(pid(P2)).unwrap()
    }

    pub fn epoch(&self, partition: u32) -> Epoch {
        self.cluster
            .partition(pid(partition))
            .unwrap()
            .committed_epoch()
            .unwrap()
    }

    pub fn context(&self) -> RenameContext {
        let epochs: Arc<dyn EpochStore> = self.client.clone();
        RenameContext {
            dentry_cache: self.dentry_cache.clone(),
            inode_cache: self.inode_cache.clone(),
            epochs,
            store: self.store.clone(),
            coordinator: self.coordinator.clone(),
            config: self.config.clone(),
            metrics: Some(self.metrics.clone()),
        }
    }

    pub fn rename(&self, from: (u64, &str), to: (u64, &str)) -> RenameOperator {
        RenameOperator::new(fs(), ino(from.0), from.1, ino(to.0), to.1, self.context())
    }
}
