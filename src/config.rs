//! Configuration for lstore
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{LstoreError, Result};

/// Main configuration for a table
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all tables
    /// Internal structure:
    ///   {data_dir}/
    ///     └── {table}/
    ///           ├── catalog.bin
    ///           └── stack{page_id}/   (one file per attribute)
    pub data_dir: PathBuf,

    /// fsync page files and the catalog when they are written
    pub sync_on_flush: bool,

    // -------------------------------------------------------------------------
    // Page Cache Configuration
    // -------------------------------------------------------------------------
    /// Max number of page sets kept resident before unpinned ones are evicted
    pub page_cache_limit: usize,

    // -------------------------------------------------------------------------
    // Merge Configuration
    // -------------------------------------------------------------------------
    /// Updates applied to one page stack before a merge is queued
    pub merge_threshold: u64,

    /// Number of background merge worker threads
    pub merge_workers: usize,

    /// Queue merges automatically when a stack reaches the threshold
    pub background_merge: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./lstore_data"),
            sync_on_flush: true,
            page_cache_limit: 2000,
            merge_threshold: 2048,
            merge_workers: 1,
            background_merge: true,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.merge_threshold == 0 {
            return Err(LstoreError::Config(
                "merge_threshold must be greater than zero".to_string(),
            ));
        }
        if self.merge_workers == 0 {
            return Err(LstoreError::Config(
                "merge_workers must be greater than zero".to_string(),
            ));
        }
        if self.page_cache_limit == 0 {
            return Err(LstoreError::Config(
                "page_cache_limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all tables)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Enable or disable fsync on flush
    pub fn sync_on_flush(mut self, sync: bool) -> Self {
        self.config.sync_on_flush = sync;
        self
    }

    /// Set the resident page set limit
    pub fn page_cache_limit(mut self, limit: usize) -> Self {
        self.config.page_cache_limit = limit;
        self
    }

    /// Set the number of updates per stack that triggers a merge
    pub fn merge_threshold(mut self, threshold: u64) -> Self {
        self.config.merge_threshold = threshold;
        self
    }

    /// Set the number of merge worker threads
    pub fn merge_workers(mut self, workers: usize) -> Self {
        self.config.merge_workers = workers;
        self
    }

    /// Enable or disable automatically queued merges
    pub fn background_merge(mut self, enabled: bool) -> Self {
        self.config.background_merge = enabled;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
