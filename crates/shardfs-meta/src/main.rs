#![warn(missing_docs)]

//! sfs-rename: runs one rename against a seeded in-memory cluster and prints the outcome.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use shardfs_meta::metrics::RenameMetrics;
use shardfs_meta::types::*;
use shardfs_meta::{MetaClient, MetaClientConfig, MetaCluster, RenameContext, RenameOperator};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SRC_PARENT: u64 = 10;
const DST_PARENT: u64 = 20;
const DST_PARENT_LOCAL: u64 = 11;

#[derive(Parser)]
#[command(name = "sfs-rename")]
#[command(about = "ShardFS cross-partition rename demo", long_about = None)]
struct Cli {
    /// Client configuration file (.toml or .json)
    #[arg(short, long, env = "SFS_CONFIG")]
    config: Option<PathBuf>,

    /// Seed an existing destination file that the rename replaces
    #[arg(long)]
    overwrite: bool,

    /// Keep both parents on the same partition
    #[arg(long)]
    same_partition: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<MetaClientConfig> {
    match path {
        Some(p) if p.exists() => MetaClientConfig::from_file(p),
        Some(p) => {
            tracing::warn!("Config file not found, using defaults: {}", p.display());
            Ok(MetaClientConfig::default())
        }
        None => Ok(MetaClientConfig::default()),
    }
}

/// Partition 1 owns inodes 1..=19 at epoch 5, partition 2 owns 20..=999 at
/// epoch 7. Source `(10, "a")` points at file inode 100.
fn seed(fs: FsId, dst_parent: InodeId, overwrite: bool) -> Result<Arc<MetaCluster>> {
    let cluster = Arc::new(MetaCluster::new());
    let p1 = PartitionId::new(1);
    let p2 = PartitionId::new(2);
    cluster.add_partition(fs, p1, InodeId::new(1), InodeId::new(19))?;
    cluster.add_partition(fs, p2, InodeId::new(20), InodeId::new(999))?;
    cluster.advance_to(p1, Epoch::new(5))?;
    cluster.advance_to(p2, Epoch::new(7))?;

    let src = cluster.partition_for(fs, InodeId::new(SRC_PARENT))?;
    src.insert_dentry(&Dentry::new_file(
        fs,
        InodeId::new(SRC_PARENT),
        "a",
        InodeId::new(100),
        Epoch::new(5),
    ))?;
    cluster
        .partition(p2)?
        .insert_inode(&Inode::new_file(fs, InodeId::new(100)))?;

    if overwrite {
        let dst = cluster.partition_for(fs, dst_parent)?;
        let epoch = dst.committed_epoch()?;
        dst.insert_dentry(&Dentry::new_file(fs, dst_parent, "b", InodeId::new(200), epoch))?;
        cluster
            .partition(p2)?
            .insert_inode(&Inode::new_file(fs, InodeId::new(200)))?;
    }
    Ok(cluster)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    let fs = FsId::new(1);
    let dst_parent = if cli.same_partition {
        InodeId::new(DST_PARENT_LOCAL)
    } else {
        InodeId::new(DST_PARENT)
    };
    let cluster = seed(fs, dst_parent, cli.overwrite)?;
    let client = Arc::new(MetaClient::new(cluster.clone()));
    let metrics = Arc::new(RenameMetrics::new());
    let ctx = RenameContext::for_client(fs, client, &config).with_metrics(metrics.clone());

    tracing::info!(
        "Renaming ({}, \"a\") -> ({}, \"b\")",
        SRC_PARENT,
        dst_parent
    );
    let outcome =
        RenameOperator::new(fs, InodeId::new(SRC_PARENT), "a", dst_parent, "b", ctx).run().await?;

    let partitions: Vec<_> = cluster
        .topology()
        .partitions()
        .into_iter()
        .map(|p| PartitionEpoch::new(p.partition_id, p.epoch))
        .collect();
    let report = serde_json::json!({
        "outcome": outcome,
        "partitions": partitions,
        "committed_runs": metrics.snapshot().committed,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
