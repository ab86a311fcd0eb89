//! Core types for the partitioned metadata tier.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a filesystem hosted by the metadata tier
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FsId(u32);

impl FsId {
    /// Creates a new FsId from a raw u32 value
    pub fn new(id: u32) -> Self {
        FsId(id)
    }

    /// Returns the raw u32 value of this filesystem ID
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for FsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents a unique identifier for an inode within a filesystem
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct InodeId(u64);

impl InodeId {
    /// Sentinel meaning "no inode"
    pub const NONE: InodeId = InodeId(0);

    /// Creates a new InodeId from a raw u64 value
    pub fn new(id: u64) -> Self {
        InodeId(id)
    }

    /// Returns the raw u64 value of this inode ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns true for the zero sentinel
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one metadata partition (a shard of the dentry/inode namespace)
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(u32);

impl PartitionId {
    /// Creates a new PartitionId from a raw u32 value
    pub fn new(id: u32) -> Self {
        PartitionId(id)
    }

    /// Returns the raw u32 value of this partition ID
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-partition transaction epoch. Advanced only by a successful commit.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Epoch(u64);

impl Epoch {
    /// The epoch a fresh partition starts at
    pub const ZERO: Epoch = Epoch(0);

    /// Creates a new Epoch from a raw u64 value
    pub fn new(e: u64) -> Self {
        Epoch(e)
    }

    /// Returns the raw u64 value of this epoch
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The epoch a transaction prepared against this one will commit at.
    ///
    /// Fails once the epoch space of a partition is exhausted.
    pub fn next(self) -> Result<Epoch, MetaError> {
        self.0
            .checked_add(1)
            .map(Epoch)
            .ok_or_else(|| MetaError::Internal(format!("epoch {} cannot advance", self.0)))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A partition together with one of its epochs.
///
/// Returned by epoch lookups and submitted, as a list, to a commit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionEpoch {
    /// The partition
    pub partition_id: PartitionId,
    /// Its epoch
    pub epoch: Epoch,
}

impl PartitionEpoch {
    /// Pairs a partition with an epoch
    pub fn new(partition_id: PartitionId, epoch: Epoch) -> Self {
        Self {
            partition_id,
            epoch,
        }
    }
}

impl fmt::Display for PartitionEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition_id, self.epoch)
    }
}

/// Represents a point in time with second and nanosecond precision
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: u64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    /// Returns the current timestamp
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

bitflags! {
    /// State bits carried by a dentry version
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DentryFlags: u32 {
        /// The entry names a regular file (absent for directories)
        const TYPE_FILE = 1;
        /// The entry is logically removed as of this version
        const DELETE_MARK = 1 << 1;
        /// The version belongs to a transaction that is not finalized yet
        const TRANSACTION_PREPARE = 1 << 2;
    }
}

/// A directory entry mapping `(parent_id, name)` to an inode.
///
/// `epoch` is the epoch of the owning partition under which this version was
/// written; it doubles as the optimistic-concurrency token for that partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dentry {
    /// Owning filesystem
    pub fs_id: FsId,
    /// Parent directory inode
    pub parent_id: InodeId,
    /// Entry name
    pub name: String,
    /// Inode the entry points at
    pub inode_id: InodeId,
    /// Partition epoch of this version
    pub epoch: Epoch,
    /// State flags
    pub flags: DentryFlags,
    /// Inode a prepared materialization expects to shadow; `NONE` when the
    /// name must be free. Cleared when the version is finalized.
    pub replaces: InodeId,
}

impl Dentry {
    /// Creates a live entry for a regular file at the given epoch
    pub fn new_file(
        fs_id: FsId,
        parent_id: InodeId,
        name: impl Into<String>,
        inode_id: InodeId,
        epoch: Epoch,
    ) -> Self {
        Self {
            fs_id,
            parent_id,
            name: name.into(),
            inode_id,
            epoch,
            flags: DentryFlags::TYPE_FILE,
            replaces: InodeId::NONE,
        }
    }

    /// Creates a live entry for a directory at the given epoch
    pub fn new_dir(
        fs_id: FsId,
        parent_id: InodeId,
        name: impl Into<String>,
        inode_id: InodeId,
        epoch: Epoch,
    ) -> Self {
        Self {
            fs_id,
            parent_id,
            name: name.into(),
            inode_id,
            epoch,
            flags: DentryFlags::empty(),
            replaces: InodeId::NONE,
        }
    }

    /// True if the entry names a regular file
    pub fn is_file(&self) -> bool {
        self.flags.contains(DentryFlags::TYPE_FILE)
    }

    /// True if this version removes the entry
    pub fn is_deleted(&self) -> bool {
        self.flags.contains(DentryFlags::DELETE_MARK)
    }

    /// True if this version carries the prepare marker
    pub fn is_prepared(&self) -> bool {
        self.flags.contains(DentryFlags::TRANSACTION_PREPARE)
    }

    /// Identity key of the entry within its filesystem
    pub fn key(&self) -> (InodeId, &str) {
        (self.parent_id, &self.name)
    }
}

impl fmt::Display for Dentry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fs={} parent={} name={:?} inode={} epoch={} flags={:#x}",
            self.fs_id,
            self.parent_id,
            self.name,
            self.inode_id,
            self.epoch,
            self.flags.bits()
        )
    }
}

/// File type of an inode
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file
    File,
    /// Directory
    Directory,
}

/// Inode record as seen by the rename path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    /// Owning filesystem
    pub fs_id: FsId,
    /// Inode number
    pub inode_id: InodeId,
    /// File type
    pub file_type: FileType,
    /// Hard link count
    pub nlink: u32,
    /// Last modification time
    pub mtime: Timestamp,
    /// Last status change time
    pub ctime: Timestamp,
}

impl Inode {
    /// Creates a file inode with a single link
    pub fn new_file(fs_id: FsId, inode_id: InodeId) -> Self {
        let now = Timestamp::now();
        Self {
            fs_id,
            inode_id,
            file_type: FileType::File,
            nlink: 1,
            mtime: now,
            ctime: now,
        }
    }

    /// Creates a directory inode (`.` and the parent's entry)
    pub fn new_directory(fs_id: FsId, inode_id: InodeId) -> Self {
        let now = Timestamp::now();
        Self {
            fs_id,
            inode_id,
            file_type: FileType::Directory,
            nlink: 2,
            mtime: now,
            ctime: now,
        }
    }
}

/// Coarse classification of a [`MetaError`], used for metrics labels
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// An entry that had to exist does not
    NotExist,
    /// Destination directory is not empty
    NotEmpty,
    /// Stale epoch, stale entry or concurrent prepare
    Conflict,
    /// Everything else: remote-call, control-plane or storage failures
    Internal,
}

impl ErrorKind {
    /// Returns a string representation of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotExist => "not_exist",
            ErrorKind::NotEmpty => "not_empty",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Error types for partitioned metadata operations
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// The requested directory entry does not exist.
    #[error("entry '{name}' does not exist in directory {parent}")]
    NotExist {
        /// Parent directory inode
        parent: InodeId,
        /// Entry name that was not found
        name: String,
    },

    /// Attempted to replace a non-empty directory.
    #[error("directory {0} is not empty")]
    NotEmpty(InodeId),

    /// A prepare targeted an epoch other than the partition's next one, or
    /// collided with another in-flight transaction.
    #[error("epoch conflict on partition {partition}: expected {expected}, found {found}")]
    Conflict {
        /// Partition that rejected the write
        partition: PartitionId,
        /// Epoch the partition would have accepted
        expected: Epoch,
        /// Epoch carried by the request
        found: Epoch,
    },

    /// A prepared version disagrees with the entry live at the committed epoch.
    #[error("entry '{name}' in directory {parent} changed on partition {partition}")]
    EntryConflict {
        /// Partition that rejected the write
        partition: PartitionId,
        /// Parent directory inode
        parent: InodeId,
        /// Entry name
        name: String,
    },

    /// Opaque remote-call or control-plane failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// The requested inode does not exist.
    #[error("inode {0} not found")]
    InodeNotFound(InodeId),

    /// No partition of the filesystem owns the inode.
    #[error("no partition of fs {fs_id} owns inode {inode_id}")]
    PartitionNotFound {
        /// Filesystem that was searched
        fs_id: FsId,
        /// Inode without an owner
        inode_id: InodeId,
    },

    /// The partition id is not known to the topology.
    #[error("unknown partition {0}")]
    UnknownPartition(PartitionId),

    /// Malformed request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An error occurred in the KV store layer.
    #[error("kv store error: {0}")]
    KvError(String),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl MetaError {
    /// Classifies the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            MetaError::NotExist { .. } => ErrorKind::NotExist,
            MetaError::NotEmpty(_) => ErrorKind::NotEmpty,
            MetaError::Conflict { .. } | MetaError::EntryConflict { .. } => ErrorKind::Conflict,
            _ => ErrorKind::Internal,
        }
    }

    /// True for [`MetaError::NotExist`]
    pub fn is_not_exist(&self) -> bool {
        matches!(self, MetaError::NotExist { .. })
    }
}
