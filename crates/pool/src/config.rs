//! Pool configuration and builder

use crate::layout::MIN_POOL_SIZE;
use crate::pool::Pool;
use pmkit_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default pool size (8 MiB)
pub const DEFAULT_POOL_SIZE: usize = 8 * 1024 * 1024;

/// Configuration for creating or opening a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Mapping size in bytes; ignored when opening an existing file
    pub size: usize,
    /// Backing file, `None` for an anonymous mapping
    pub path: Option<PathBuf>,
    /// Whether persistence barriers flush file-backed mappings
    pub flush_on_persist: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            size: DEFAULT_POOL_SIZE,
            path: None,
            flush_on_persist: true,
        }
    }
}

impl PoolConfig {
    /// Check that a pool can be created from this configuration
    pub fn validate(&self) -> Result<()> {
        if self.size < MIN_POOL_SIZE {
            return Err(Error::InvalidPool(format!(
                "pool size {} is below the minimum of {MIN_POOL_SIZE} bytes",
                self.size
            )));
        }
        Ok(())
    }
}

/// Builder for pools.
///
/// # Example
///
/// ```ignore
/// // File-backed, flushed on every persist
/// let pool = Pool::builder()
///     .path("./data.pool")
///     .size(64 * 1024 * 1024)
///     .create()?;
///
/// // Anonymous, for tests
/// let pool = Pool::builder().size(1 << 20).create()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct PoolBuilder {
    config: PoolConfig,
}

impl PoolBuilder {
    /// Builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Mapping size in bytes
    pub fn size(mut self, size: usize) -> Self {
        self.config.size = size;
        self
    }

    /// Back the pool with a file
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.config.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Skip `msync` on persistence barriers (faster, not crash safe)
    pub fn no_flush(mut self) -> Self {
        self.config.flush_on_persist = false;
        self
    }

    /// Create a fresh pool, truncating any existing file
    pub fn create(self) -> Result<Arc<Pool>> {
        Pool::with_config(self.config)
    }

    /// Open the existing pool file
    pub fn open(self) -> Result<Arc<Pool>> {
        let path = self
            .config
            .path
            .ok_or_else(|| Error::Config("opening a pool requires a path".to_string()))?;
        Pool::open_with(&path, self.config.flush_on_persist)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.size, DEFAULT_POOL_SIZE);
        assert!(config.path.is_none());
        assert!(config.flush_on_persist);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_too_small() {
        let config = PoolConfig {
            size: 1024,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidPool(_))));
    }

    #[test]
    fn test_partial_json() {
        let config: PoolConfig = serde_json::from_str(r#"{"size": 1048576}"#).unwrap();
        assert_eq!(config.size, 1 << 20);
        assert!(config.flush_on_persist);
    }

    #[test]
    fn test_open_without_path() {
        let err = PoolBuilder::new().open().err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
