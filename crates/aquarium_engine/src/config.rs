//! Benchmark configuration
//!
//! Settings are loaded from a TOML file (`aquarium.toml` by convention)
//! and individually overridable from the command line by the binary. All
//! fields have defaults so the benchmark runs with no file at all.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::streaming::{UploadMode, DEFAULT_POOL_CAPACITY};

/// Errors from loading a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for this schema
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level benchmark settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AquariumConfig {
    /// Number of simulated fish at startup
    pub num_fish: u32,
    /// Number of frames to run
    pub frames: u64,
    /// Prefer synchronous mapping: one-shot buffers destroyed per frame
    /// instead of the recycled async pool
    pub prefer_sync_upload: bool,
    /// Byte cap for the synchronous streaming pool
    pub pool_capacity: u64,
    /// Build one bind group per instance instead of one bind group plus
    /// dynamic offsets (for targets without dynamic-offset support)
    pub per_instance_bind_groups: bool,
    /// Grow the population by `ramp_step` every `ramp_interval` frames;
    /// 0 disables the ramp
    pub ramp_interval: u64,
    /// Fish added per ramp step
    pub ramp_step: u32,
    /// Seed for fish placement
    pub seed: u64,
}

impl Default for AquariumConfig {
    fn default() -> Self {
        Self {
            num_fish: 500,
            frames: 300,
            prefer_sync_upload: false,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            per_instance_bind_groups: false,
            ramp_interval: 0,
            ramp_step: 0,
            seed: 1,
        }
    }
}

impl AquariumConfig {
    /// Load settings from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// The upload policy selected by this configuration
    #[must_use]
    pub fn upload_mode(&self) -> UploadMode {
        if self.prefer_sync_upload {
            UploadMode::Sync
        } else {
            UploadMode::Async
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AquariumConfig::default();
        assert_eq!(config.num_fish, 500);
        assert_eq!(config.pool_capacity, DEFAULT_POOL_CAPACITY);
        assert_eq!(config.upload_mode(), UploadMode::Async);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AquariumConfig =
            toml::from_str("num_fish = 30000\nprefer_sync_upload = true\n").unwrap();
        assert_eq!(config.num_fish, 30000);
        assert_eq!(config.upload_mode(), UploadMode::Sync);
        assert_eq!(config.frames, 300);
    }
}
