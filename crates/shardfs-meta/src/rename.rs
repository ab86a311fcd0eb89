//! Rename coordination across metadata partitions.
//!
//! A [`RenameOperator`] moves one directory entry from `(parent, name)` to
//! `(new_parent, newname)`. The two parents may live on different
//! partitions. The run goes through these phases and stops at the first
//! failure:
//!
//! 1. Precheck: resolve the source, then check the destination for an overwrite.
//! 2. Epoch fetch: look up the source and destination partitions with their epochs.
//! 3. Prepare: write a tombstone of the source and the re-parented entry,
//!    both under the prepare marker at the partitions' next epoch.
//! 4. Commit: advance every involved partition's epoch as one decision.
//! 5. Post-commit: unlink the overwritten inode, then refresh the local caches.
//!
//! Post-commit failures are reported as [`PostCommitWarning`]s. They never
//! turn a committed rename into an error.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::cache::{DentryCache, DentryCacheManager, InodeCache, InodeCacheManager};
use crate::client::{EpochStore, MetaClient, MetadataStore, TxCoordinator};
use crate::config::{MetaClientConfig, RenameConfig};
use crate::dentry::validate_name;
use crate::metrics::RenameMetrics;
use crate::types::*;

/// Phase a [`RenameOperator`] has reached.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum RenameState {
    /// Nothing done yet.
    Init,
    /// Source resolved and the overwrite rule checked.
    Prechecked,
    /// Both partitions and their epochs are known.
    EpochsFetched,
    /// Every involved partition accepted its prepared dentries.
    Prepared,
    /// The commit decision succeeded.
    Committed,
    /// Post-commit work ran; the operator is done.
    Finalized,
    /// The run stopped on an error.
    Aborted,
}

/// A post-commit side effect that failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum PostCommitWarning {
    /// The overwritten inode could not be loaded.
    InodeLookup {
        /// The overwritten inode
        inode: InodeId,
        /// Error text of the lookup
        error: String,
    },
    /// The overwritten inode could not be unlinked.
    InodeUnlink {
        /// The overwritten inode
        inode: InodeId,
        /// Error text of the update
        error: String,
    },
}

impl fmt::Display for PostCommitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostCommitWarning::InodeLookup { inode, error } => {
                write!(f, "lookup of overwritten inode {} failed: {}", inode, error)
            }
            PostCommitWarning::InodeUnlink { inode, error } => {
                write!(f, "unlink of overwritten inode {} failed: {}", inode, error)
            }
        }
    }
}

/// Result of a rename that did not fail.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RenameOutcome {
    /// False when the rename had nothing to do.
    pub committed: bool,
    /// Partition epochs the commit advanced to.
    pub partitions: Vec<PartitionEpoch>,
    /// Inode whose entry was replaced, if any.
    pub overwritten: Option<InodeId>,
    /// Post-commit failures that did not affect the rename.
    pub warnings: Vec<PostCommitWarning>,
}

impl RenameOutcome {
    /// Outcome of a rename that changed nothing.
    pub fn noop() -> Self {
        Self::default()
    }
}

/// Collaborators and settings shared by rename operators of one client.
#[derive(Clone)]
pub struct RenameContext {
    /// Client dentry cache
    pub dentry_cache: Arc<dyn DentryCache>,
    /// Client inode cache
    pub inode_cache: Arc<dyn InodeCache>,
    /// Client view of partition epochs
    pub epochs: Arc<dyn EpochStore>,
    /// Partition access
    pub store: Arc<dyn MetadataStore>,
    /// Commit decision
    pub coordinator: Arc<dyn TxCoordinator>,
    /// Behavior switches
    pub config: RenameConfig,
    /// Optional counters
    pub metrics: Option<Arc<RenameMetrics>>,
}

impl RenameContext {
    /// Wires a context around an in-process client, with fresh caches sized
    /// by `config`.
    pub fn for_client(fs_id: FsId, client: Arc<MetaClient>, config: &MetaClientConfig) -> Self {
        let store: Arc<dyn MetadataStore> = client.clone();
        Self {
            dentry_cache: Arc::new(DentryCacheManager::new(
                fs_id,
                store.clone(),
                config.dentry_cache.clone(),
            )),
            inode_cache: Arc::new(InodeCacheManager::new(
                fs_id,
                store.clone(),
                config.inode_cache.clone(),
            )),
            epochs: client.clone(),
            store,
            coordinator: client.cluster().topology().clone(),
            config: config.rename.clone(),
            metrics: None,
        }
    }

    /// Attaches counters.
    pub fn with_metrics(mut self, metrics: Arc<RenameMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

enum Precheck {
    Proceed,
    Noop,
}

/// Single-use coordinator of one rename.
pub struct RenameOperator {
    op_id: Uuid,
    fs_id: FsId,
    parent_id: InodeId,
    name: String,
    new_parent_id: InodeId,
    newname: String,
    ctx: RenameContext,

    state: RenameState,
    src_dentry: Option<Dentry>,
    dst_dentry: Option<Dentry>,
    src: Option<PartitionEpoch>,
    dst: Option<PartitionEpoch>,
    tombstone: Option<Dentry>,
    new_dentry: Option<Dentry>,
    overwritten: InodeId,
}

impl RenameOperator {
    /// Creates an operator moving `(parent_id, name)` to `(new_parent_id, newname)`.
    pub fn new(
        fs_id: FsId,
        parent_id: InodeId,
        name: impl Into<String>,
        new_parent_id: InodeId,
        newname: impl Into<String>,
        ctx: RenameContext,
    ) -> Self {
        Self {
            op_id: Uuid::new_v4(),
            fs_id,
            parent_id,
            name: name.into(),
            new_parent_id,
            newname: newname.into(),
            ctx,
            state: RenameState::Init,
            src_dentry: None,
            dst_dentry: None,
            src: None,
            dst: None,
            tombstone: None,
            new_dentry: None,
            overwritten: InodeId::NONE,
        }
    }

    /// Identifier recorded in the run's tracing span.
    pub fn op_id(&self) -> Uuid {
        self.op_id
    }

    /// Phase reached so far.
    pub fn state(&self) -> RenameState {
        self.state
    }

    /// Runs the rename to completion.
    pub async fn run(mut self) -> Result<RenameOutcome, MetaError> {
        let span = tracing::info_span!("rename", op_id = %self.op_id, fs = %self.fs_id);
        async move {
            let started = Instant::now();
            if let Some(m) = &self.ctx.metrics {
                m.record_attempt();
            }

            let result = self.execute().await;

            if let Some(m) = &self.ctx.metrics {
                m.record_duration_us(started.elapsed().as_micros() as u64);
                match &result {
                    Ok(outcome) if outcome.committed => m.record_committed(outcome.warnings.len()),
                    Ok(_) => m.record_noop(),
                    Err(e) => m.record_abort(e.kind()),
                }
            }

            if let Err(e) = &result {
                self.state = RenameState::Aborted;
                tracing::error!("Rename aborted: {}; {}", e, self);
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn execute(&mut self) -> Result<RenameOutcome, MetaError> {
        if let Precheck::Noop = self.precheck().await? {
            tracing::debug!("Rename {}: source and destination are the same entry", self.op_id);
            self.state = RenameState::Finalized;
            return Ok(RenameOutcome::noop());
        }
        self.get_epochs().await?;
        if let Err(e) = self.prepare_tx().await {
            if e.kind() == ErrorKind::Conflict {
                self.forget_entries();
            }
            return Err(e);
        }
        let partitions = self.commit_tx().await?;
        let warnings = self.unlink_old_inode().await;
        self.update_cache(&partitions);
        self.state = RenameState::Finalized;

        Ok(RenameOutcome {
            committed: true,
            partitions,
            overwritten: (!self.overwritten.is_none()).then_some(self.overwritten),
            warnings,
        })
    }

    async fn precheck(&mut self) -> Result<Precheck, MetaError> {
        validate_name(&self.newname)?;
        let cache = &self.ctx.dentry_cache;

        let src = cache.get_dentry(self.parent_id, &self.name).await?;
        if self.parent_id == self.new_parent_id && self.name == self.newname {
            self.src_dentry = Some(src);
            return Ok(Precheck::Noop);
        }

        let dst = match cache.get_dentry(self.new_parent_id, &self.newname).await {
            Ok(d) => Some(d),
            Err(e) if e.is_not_exist() => None,
            Err(e) => return Err(e),
        };

        let mut outcome = Precheck::Proceed;
        if let Some(dst) = &dst {
            if dst.inode_id == src.inode_id {
                outcome = Precheck::Noop;
            } else {
                if !dst.is_file() && !cache.list_dentry(dst.inode_id, 1).await?.is_empty() {
                    return Err(MetaError::NotEmpty(dst.inode_id));
                }
                self.overwritten = dst.inode_id;
            }
        }

        self.src_dentry = Some(src);
        self.dst_dentry = dst;
        self.state = RenameState::Prechecked;
        Ok(outcome)
    }

    async fn get_epochs(&mut self) -> Result<(), MetaError> {
        let epochs = &self.ctx.epochs;
        let (src, dst) = if self.ctx.config.parallel_epoch_fetch {
            tokio::try_join!(
                epochs.epoch_of(self.fs_id, self.parent_id),
                epochs.epoch_of(self.fs_id, self.new_parent_id)
            )?
        } else {
            let src = epochs.epoch_of(self.fs_id, self.parent_id).await?;
            let dst = epochs.epoch_of(self.fs_id, self.new_parent_id).await?;
            (src, dst)
        };

        tracing::debug!("Rename {}: source {} destination {}", self.op_id, src, dst);
        self.src = Some(src);
        self.dst = Some(dst);
        self.state = RenameState::EpochsFetched;
        Ok(())
    }

    fn fetched(&self) -> Result<(&Dentry, PartitionEpoch, PartitionEpoch), MetaError> {
        match (&self.src_dentry, self.src, self.dst) {
            (Some(d), Some(src), Some(dst)) => Ok((d, src, dst)),
            _ => Err(MetaError::Internal(format!(
                "rename {} used before its epochs were fetched",
                self.op_id
            ))),
        }
    }

    async fn prepare_tx(&mut self) -> Result<(), MetaError> {
        let (src_dentry, src, dst) = self.fetched()?;

        let mut tombstone = src_dentry.clone();
        tombstone.epoch = src.epoch.next()?;
        tombstone.flags |= DentryFlags::DELETE_MARK | DentryFlags::TRANSACTION_PREPARE;
        tombstone.replaces = InodeId::NONE;

        let mut new_dentry = src_dentry.clone();
        new_dentry.parent_id = self.new_parent_id;
        new_dentry.name = self.newname.clone();
        new_dentry.epoch = dst.epoch.next()?;
        new_dentry.flags |= DentryFlags::TRANSACTION_PREPARE;
        new_dentry.replaces = self.overwritten;

        let store = &self.ctx.store;
        if src.partition_id == dst.partition_id {
            if src.epoch != dst.epoch {
                return Err(MetaError::Conflict {
                    partition: src.partition_id,
                    expected: tombstone.epoch,
                    found: new_dentry.epoch,
                });
            }
            store
                .prepare_rename_tx(&[tombstone.clone(), new_dentry.clone()])
                .await?;
        } else {
            store
                .prepare_rename_tx(std::slice::from_ref(&tombstone))
                .await?;
            if let Err(e) = store
                .prepare_rename_tx(std::slice::from_ref(&new_dentry))
                .await
            {
                if self.ctx.config.compensate_failed_prepare {
                    self.compensate(PartitionEpoch::new(src.partition_id, tombstone.epoch))
                        .await;
                }
                return Err(e);
            }
        }

        tracing::debug!(
            "Rename {}: prepared tombstone [{}] and entry [{}]",
            self.op_id,
            tombstone,
            new_dentry
        );
        self.tombstone = Some(tombstone);
        self.new_dentry = Some(new_dentry);
        self.state = RenameState::Prepared;
        Ok(())
    }

    /// Drops both names from the dentry cache so a retry resolves them again.
    fn forget_entries(&self) {
        let cache = &self.ctx.dentry_cache;
        cache.delete_cache(self.parent_id, &self.name);
        cache.delete_cache(self.new_parent_id, &self.newname);
    }

    async fn compensate(&self, prepared: PartitionEpoch) {
        match self
            .ctx
            .store
            .abandon_rename_tx(prepared.partition_id, prepared.epoch)
            .await
        {
            Ok(true) => {
                tracing::warn!(
                    "Rename {}: abandoned source prepare {} after destination prepare failed",
                    self.op_id,
                    prepared
                );
                if let Some(m) = &self.ctx.metrics {
                    m.record_compensation();
                }
            }
            Ok(false) => {
                tracing::warn!(
                    "Rename {}: source prepare {} was no longer pending",
                    self.op_id,
                    prepared
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Rename {}: failed to abandon source prepare {}: {}",
                    self.op_id,
                    prepared,
                    e
                );
            }
        }
    }

    async fn commit_tx(&mut self) -> Result<Vec<PartitionEpoch>, MetaError> {
        let (_, src, dst) = self.fetched()?;
        let mut epochs = vec![PartitionEpoch::new(src.partition_id, src.epoch.next()?)];
        if dst.partition_id != src.partition_id {
            epochs.push(PartitionEpoch::new(dst.partition_id, dst.epoch.next()?));
        }

        self.ctx
            .coordinator
            .commit_tx(&epochs)
            .await
            .map_err(|e| MetaError::Internal(format!("commit failed: {}", e)))?;

        tracing::info!(
            "Rename {}: committed ({}, {:?}) -> ({}, {:?}) at {:?}",
            self.op_id,
            self.parent_id,
            self.name,
            self.new_parent_id,
            self.newname,
            epochs
        );
        self.state = RenameState::Committed;
        Ok(epochs)
    }

    async fn unlink_old_inode(&self) -> Vec<PostCommitWarning> {
        if self.overwritten.is_none() {
            return Vec::new();
        }
        let inode = self.overwritten;

        let warning = match self.ctx.inode_cache.get_inode(inode).await {
            Err(e) => Some(PostCommitWarning::InodeLookup {
                inode,
                error: e.to_string(),
            }),
            Ok(handle) => match handle.unlink_locked().await {
                Ok(updated) => {
                    tracing::debug!(
                        "Rename {}: overwritten inode {} has nlink {}",
                        self.op_id,
                        inode,
                        updated.nlink
                    );
                    None
                }
                Err(e) => Some(PostCommitWarning::InodeUnlink {
                    inode,
                    error: e.to_string(),
                }),
            },
        };

        match warning {
            Some(w) => {
                tracing::warn!("Rename {}: {}", self.op_id, w);
                vec![w]
            }
            None => Vec::new(),
        }
    }

    fn update_cache(&self, committed: &[PartitionEpoch]) {
        let cache = &self.ctx.dentry_cache;
        cache.delete_cache(self.parent_id, &self.name);
        if let Some(d) = &self.new_dentry {
            let mut visible = d.clone();
            visible.flags.remove(DentryFlags::TRANSACTION_PREPARE);
            visible.replaces = InodeId::NONE;
            cache.insert_or_replace_cache(visible);
        }
        for pe in committed {
            self.ctx.epochs.advance_epoch(pe.partition_id, pe.epoch);
        }
    }
}

struct Opt<'a, T>(&'a Option<T>);

impl<T: fmt::Display> fmt::Display for Opt<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{}", v),
            None => write!(f, "-"),
        }
    }
}

impl fmt::Display for RenameOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rename op={} state={:?} fs={} src=({}, {:?}) dst=({}, {:?}) \
             src_dentry=[{}] dst_dentry=[{}] src_epoch={} dst_epoch={} \
             tombstone=[{}] new_dentry=[{}] overwritten={}",
            self.op_id,
            self.state,
            self.fs_id,
            self.parent_id,
            self.name,
            self.new_parent_id,
            self.newname,
            Opt(&self.src_dentry),
            Opt(&self.dst_dentry),
            Opt(&self.src),
            Opt(&self.dst),
            Opt(&self.tombstone),
            Opt(&self.new_dentry),
            self.overwritten
        )
    }
}
