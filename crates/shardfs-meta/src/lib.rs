#![warn(missing_docs)]

//! ShardFS metadata subsystem: partitioned dentry/inode tables and cross-partition rename

pub mod cache;
pub mod client;
pub mod cluster;
pub mod config;
pub mod dentry;
pub mod inode;
pub mod kvstore;
pub mod metrics;
pub mod partition;
pub mod rename;
pub mod topology;
pub mod types;

pub use client::{EpochStore, MetaClient, MetadataStore, TxCoordinator};
pub use cluster::MetaCluster;
pub use config::MetaClientConfig;
pub use rename::{RenameContext, RenameOperator, RenameOutcome};
pub use types::{Dentry, Epoch, FsId, Inode, InodeId, MetaError, PartitionEpoch, PartitionId};
