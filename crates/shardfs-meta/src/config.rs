//! Client-side configuration for the rename path and its caches.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Sizing of one client-local cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries.
    pub capacity: usize,
    /// Seconds an entry stays valid.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 65_536,
            ttl_secs: 60,
        }
    }
}

/// Behavior switches of the rename coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenameConfig {
    /// Drop the source partition's prepare when the destination prepare fails.
    pub compensate_failed_prepare: bool,
    /// Look up the source and destination epochs concurrently.
    pub parallel_epoch_fetch: bool,
}

impl Default for RenameConfig {
    fn default() -> Self {
        Self {
            compensate_failed_prepare: true,
            parallel_epoch_fetch: true,
        }
    }
}

/// Top-level metadata client configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaClientConfig {
    /// Rename coordinator settings.
    pub rename: RenameConfig,
    /// Dentry cache settings.
    pub dentry_cache: CacheConfig,
    /// Inode cache settings.
    pub inode_cache: CacheConfig,
}

impl MetaClientConfig {
    /// Loads the configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = MetaClientConfig::default();
        assert!(config.rename.compensate_failed_prepare);
        assert!(config.rename.parallel_epoch_fetch);
        assert_eq!(config.dentry_cache.capacity, 65_536);
        assert_eq!(config.inode_cache.ttl_secs, 60);
    }

    #[test]
    fn test_from_file_toml_partial() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[rename]
compensate_failed_prepare = false

[dentry_cache]
capacity = 128
            "#
        )
        .unwrap();

        let config = MetaClientConfig::from_file(file.path()).unwrap();
        assert!(!config.rename.compensate_failed_prepare);
        assert!(config.rename.parallel_epoch_fetch);
        assert_eq!(config.dentry_cache.capacity, 128);
        assert_eq!(config.dentry_cache.ttl_secs, 60);
        assert_eq!(config.inode_cache, CacheConfig::default());
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "rename": {{ "parallel_epoch_fetch": false }},
                "inode_cache": {{ "capacity": 8, "ttl_secs": 1 }}
            }}"#
        )
        .unwrap();

        let config = MetaClientConfig::from_file(file.path()).unwrap();
        assert!(!config.rename.parallel_epoch_fetch);
        assert!(config.rename.compensate_failed_prepare);
        assert_eq!(config.inode_cache.capacity, 8);
        assert_eq!(config.inode_cache.ttl_secs, 1);
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(MetaClientConfig::from_file(file.path()).is_err());
    }
}
