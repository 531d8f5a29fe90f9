//! Store configuration
//!
//! One `StoreConfig` is passed to every store on open. It can be built in
//! code or deserialized from JSON by the admin CLI.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::file::CACHE_MEMORY;

/// Options shared by index and record stores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Memory budget for cached blocks, in bytes
    pub cache_memory: usize,

    /// Explicit number of cached blocks; overrides `cache_memory` when set
    pub cache_limit: Option<usize>,

    /// Record pre-mutation images so the store can be rolled back
    pub rollback: bool,

    /// Suffix appended to the data file name to form the rollback log name
    pub rollback_suffix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_memory: CACHE_MEMORY,
            cache_limit: None,
            rollback: false,
            rollback_suffix: ".rollback".to_string(),
        }
    }
}

impl StoreConfig {
    /// Create a new config builder
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    /// Number of blocks the cache may hold for the given block size (at least 1)
    pub fn cache_capacity(&self, block_size: usize) -> usize {
        self.cache_limit
            .unwrap_or(self.cache_memory / block_size.max(1))
            .max(1)
    }

    /// Path of the rollback log belonging to `data_path`
    pub fn rollback_path(&self, data_path: &Path) -> PathBuf {
        let mut name = data_path.as_os_str().to_os_string();
        name.push(&self.rollback_suffix);
        PathBuf::from(name)
    }
}

/// Builder for StoreConfig
#[derive(Default)]
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    /// Set the cache memory budget (in bytes)
    pub fn cache_memory(mut self, bytes: usize) -> Self {
        self.config.cache_memory = bytes;
        self
    }

    /// Pin the cache to an exact number of blocks
    pub fn cache_limit(mut self, blocks: usize) -> Self {
        self.config.cache_limit = Some(blocks);
        self
    }

    /// Enable or disable the rollback log
    pub fn rollback(mut self, enabled: bool) -> Self {
        self.config.rollback = enabled;
        self
    }

    /// Set the rollback log file suffix
    pub fn rollback_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.config.rollback_suffix = suffix.into();
        self
    }

    pub fn build(self) -> StoreConfig {
        self.config
    }
}
