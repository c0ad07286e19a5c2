use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Geometry of the physical block pool. How many blocks fit in device memory
/// is decided elsewhere; the allocator only receives the count.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Tokens per block.
    pub block_size: usize,
    /// Number of physical blocks in the pool.
    pub num_blocks: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 256,
            num_blocks: 1024,
        }
    }
}

impl CacheConfig {
    pub fn new(block_size: usize, num_blocks: usize) -> Result<Self, ConfigError> {
        let cfg = Self {
            block_size,
            num_blocks,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        if self.num_blocks == 0 {
            return Err(ConfigError::ZeroBlocks);
        }
        Ok(())
    }

    /// Load a JSON config. Missing fields fall back to the defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }
}
