//! Container configuration
//!
//! # Config File Format
//!
//! ```toml
//! cluster_capacity = 4094
//! storage_version = 3
//! format_version = 1
//! buffer_mode = "read_write"
//! recovery = false
//! max_clusters = 1000000
//! reserve_clusters = 64
//! ```
//!
//! Every key is optional. JSON files with the same keys are accepted too.

use crate::error::{Result, StoreError};
use crate::header::{DEFAULT_CLUSTER_CAPACITY, MIN_CLUSTER_CAPACITY};
use crate::mode::BufferMode;
use crate::version::{STORAGE_V1, STORAGE_VERSION_CURRENT};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings for creating or opening a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Content bytes per cluster (new containers only)
    pub cluster_capacity: u16,

    /// Storage layout version (new containers only)
    pub storage_version: u16,

    /// Application document format version (new containers only)
    pub format_version: u32,

    /// Whether streams may be written
    pub buffer_mode: BufferMode,

    /// Open containers and streams in best-effort recovery mode
    pub recovery: bool,

    /// Ceiling on the master table; reaching it reports out-of-memory
    pub max_clusters: Option<u64>,

    /// Master table entries to pre-allocate at create/open
    pub reserve_clusters: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            cluster_capacity: DEFAULT_CLUSTER_CAPACITY,
            storage_version: STORAGE_VERSION_CURRENT,
            format_version: 0,
            buffer_mode: BufferMode::ReadWrite,
            recovery: false,
            max_clusters: None,
            reserve_clusters: 0,
        }
    }
}

impl StoreConfig {
    pub fn read_only() -> Self {
        StoreConfig {
            buffer_mode: BufferMode::ReadOnly,
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: StoreConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: StoreConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            Some("json") => Self::from_json_str(&text),
            other => Err(StoreError::InvalidConfig(format!(
                "unsupported config file extension: {:?}",
                other
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_capacity < MIN_CLUSTER_CAPACITY {
            return Err(StoreError::InvalidConfig(format!(
                "cluster_capacity {} below minimum {}",
                self.cluster_capacity, MIN_CLUSTER_CAPACITY
            )));
        }

        if !(STORAGE_V1..=STORAGE_VERSION_CURRENT).contains(&self.storage_version) {
            return Err(StoreError::InvalidConfig(format!(
                "storage_version {} outside supported range {}..={}",
                self.storage_version, STORAGE_V1, STORAGE_VERSION_CURRENT
            )));
        }

        if self.max_clusters == Some(0) {
            return Err(StoreError::InvalidConfig(
                "max_clusters must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
