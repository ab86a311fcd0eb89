//! Client-local dentry and inode caches.
//!
//! Both caches are read-through over a [`MetadataStore`] and never
//! authoritative. The rename path mutates the dentry cache only after a
//! successful commit.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;

use crate::client::MetadataStore;
use crate::config::CacheConfig;
use crate::types::*;

/// Dentry cache operations used by the rename coordinator.
#[async_trait]
pub trait DentryCache: Send + Sync {
    /// Resolves `(parent, name)`, from cache when possible.
    async fn get_dentry(&self, parent: InodeId, name: &str) -> Result<Dentry, MetaError>;

    /// Lists up to `limit` live children of `parent`.
    async fn list_dentry(&self, parent: InodeId, limit: usize) -> Result<Vec<Dentry>, MetaError>;

    /// Drops a cached entry.
    fn delete_cache(&self, parent: InodeId, name: &str);

    /// Installs an entry, replacing any cached one for the same key.
    fn insert_or_replace_cache(&self, dentry: Dentry);
}

/// Inode cache operations used by the rename coordinator.
#[async_trait]
pub trait InodeCache: Send + Sync {
    /// Returns the shared handle of an inode, loading it on a miss.
    async fn get_inode(&self, inode_id: InodeId) -> Result<Arc<InodeHandle>, MetaError>;
}

/// Cache statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that went to the store.
    pub misses: u64,
    /// Current number of entries.
    pub size: usize,
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

struct DentryLru {
    entries: LruCache<(InodeId, String), CacheEntry<Dentry>>,
    hits: u64,
    misses: u64,
}

fn capacity_of(config: &CacheConfig) -> NonZeroUsize {
    NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN)
}

/// LRU dentry cache for one filesystem.
pub struct DentryCacheManager {
    fs_id: FsId,
    store: Arc<dyn MetadataStore>,
    ttl: Duration,
    inner: Mutex<DentryLru>,
}

impl DentryCacheManager {
    /// Creates a dentry cache of `fs_id` over the given store.
    pub fn new(fs_id: FsId, store: Arc<dyn MetadataStore>, config: CacheConfig) -> Self {
        Self {
            fs_id,
            store,
            ttl: Duration::from_secs(config.ttl_secs),
            inner: Mutex::new(DentryLru {
                entries: LruCache::new(capacity_of(&config)),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Returns the cached entry without touching the store or the LRU order.
    pub fn peek(&self, parent: InodeId, name: &str) -> Option<Dentry> {
        let inner = self.inner.lock().ok()?;
        inner
            .entries
            .peek(&(parent, name.to_string()))
            .filter(|e| e.inserted_at.elapsed() <= self.ttl)
            .map(|e| e.value.clone())
    }

    /// Cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.inner
            .lock()
            .map(|inner| CacheStats {
                hits: inner.hits,
                misses: inner.misses,
                size: inner.entries.len(),
            })
            .unwrap_or_default()
    }

    fn lookup_cached(&self, parent: InodeId, name: &str) -> Option<Dentry> {
        let mut inner = self.inner.lock().ok()?;
        let key = (parent, name.to_string());
        let found = inner
            .entries
            .get(&key)
            .map(|e| (e.inserted_at.elapsed() <= self.ttl, e.value.clone()));
        let fresh = match found {
            Some((true, value)) => Some(value),
            Some((false, _)) => {
                inner.entries.pop(&key);
                None
            }
            None => None,
        };
        match fresh {
            Some(_) => inner.hits += 1,
            None => inner.misses += 1,
        }
        fresh
    }
}

#[async_trait]
impl DentryCache for DentryCacheManager {
    async fn get_dentry(&self, parent: InodeId, name: &str) -> Result<Dentry, MetaError> {
        if let Some(dentry) = self.lookup_cached(parent, name) {
            return Ok(dentry);
        }
        let dentry = self.store.get_dentry(self.fs_id, parent, name).await?;
        self.insert_or_replace_cache(dentry.clone());
        Ok(dentry)
    }

    async fn list_dentry(&self, parent: InodeId, limit: usize) -> Result<Vec<Dentry>, MetaError> {
        self.store.list_dentry(self.fs_id, parent, limit).await
    }

    fn delete_cache(&self, parent: InodeId, name: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.pop(&(parent, name.to_string()));
        }
    }

    fn insert_or_replace_cache(&self, dentry: Dentry) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.put(
                (dentry.parent_id, dentry.name.clone()),
                CacheEntry {
                    value: dentry,
                    inserted_at: Instant::now(),
                },
            );
        }
    }
}

/// Shared handle of one inode; all updates go through its lock.
pub struct InodeHandle {
    inode: tokio::sync::Mutex<Inode>,
    store: Arc<dyn MetadataStore>,
}

impl InodeHandle {
    /// Wraps a loaded inode.
    pub fn new(inode: Inode, store: Arc<dyn MetadataStore>) -> Self {
        Self {
            inode: tokio::sync::Mutex::new(inode),
            store,
        }
    }

    /// Current cached copy of the inode.
    pub async fn inode(&self) -> Inode {
        self.inode.lock().await.clone()
    }

    /// Drops one link and writes the inode back.
    ///
    /// A link count already at zero is left alone. The cached copy changes
    /// only once the store accepted the update.
    pub async fn unlink_locked(&self) -> Result<Inode, MetaError> {
        let mut guard = self.inode.lock().await;
        if guard.nlink == 0 {
            return Ok(guard.clone());
        }
        let mut updated = guard.clone();
        updated.nlink -= 1;
        updated.ctime = Timestamp::now();
        self.store.update_inode(&updated).await?;
        *guard = updated.clone();
        tracing::debug!("Inode {}: nlink now {}", updated.inode_id, updated.nlink);
        Ok(updated)
    }
}

/// LRU inode cache for one filesystem.
pub struct InodeCacheManager {
    fs_id: FsId,
    store: Arc<dyn MetadataStore>,
    inner: Mutex<LruCache<InodeId, Arc<InodeHandle>>>,
}

impl InodeCacheManager {
    /// Creates an inode cache of `fs_id` over the given store.
    pub fn new(fs_id: FsId, store: Arc<dyn MetadataStore>, config: CacheConfig) -> Self {
        Self {
            fs_id,
            store,
            inner: Mutex::new(LruCache::new(capacity_of(&config))),
        }
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// True if no handle is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl InodeCache for InodeCacheManager {
    async fn get_inode(&self, inode_id: InodeId) -> Result<Arc<InodeHandle>, MetaError> {
        if let Some(handle) = self
            .inner
            .lock()
            .ok()
            .and_then(|mut c| c.get(&inode_id).cloned())
        {
            return Ok(handle);
        }

        let inode = self.store.get_inode(self.fs_id, inode_id).await?;
        let handle = Arc::new(InodeHandle::new(inode, self.store.clone()));
        let mut cache = self
            .inner
            .lock()
            .map_err(|e| MetaError::Internal(format!("inode cache lock poisoned: {}", e)))?;
        // a concurrent loader may have won; keep its handle so updates serialize
        if let Some(existing) = cache.get(&inode_id) {
            return Ok(existing.clone());
        }
        cache.put(inode_id, handle.clone());
        Ok(handle)
    }
}
