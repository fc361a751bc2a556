//! Configuration
//!
//! Tunables for the residency manager and the feedback sampling pass. Both
//! structs can be loaded from JSON; missing fields take their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Backoff applied to tiles whose load failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Frames to wait after the first failure
    pub base_backoff_frames: u64,
    /// Upper bound on the wait between attempts
    pub max_backoff_frames: u64,
}

impl RetryPolicy {
    /// Frames to wait after `failures` consecutive failed loads
    pub fn backoff_frames(&self, failures: u32) -> u64 {
        if failures == 0 {
            return 0;
        }
        let shift = (failures - 1).min(63);
        1u64.checked_shl(shift)
            .and_then(|scale| self.base_backoff_frames.checked_mul(scale))
            .unwrap_or(u64::MAX)
            .min(self.max_backoff_frames)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff_frames: 4,
            max_backoff_frames: 240,
        }
    }
}

/// Residency manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidencyConfig {
    /// Physical tile pool size in tiles
    pub pool_capacity: u32,
    /// Tiles at the front of the pool set aside for packed mips
    pub reserved_tiles: u32,
    /// Upper bound on in-flight tile file reads
    pub max_simultaneous_file_load_tasks: usize,
    /// Upper bound on map/evict iterations per frame
    pub max_tiles_loaded_per_frame: usize,
    /// Retry behaviour for failed loads
    pub retry: RetryPolicy,
}

impl ResidencyConfig {
    /// Number of pool slots available to streamed tiles
    pub fn streaming_capacity(&self) -> u32 {
        self.pool_capacity.saturating_sub(self.reserved_tiles)
    }

    /// Check the configuration for values the tracker cannot work with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.reserved_tiles > self.pool_capacity {
            return Err(ConfigError::Invalid(format!(
                "reserved_tiles ({}) exceeds pool_capacity ({})",
                self.reserved_tiles, self.pool_capacity
            )));
        }
        if self.max_simultaneous_file_load_tasks == 0 {
            return Err(ConfigError::Invalid(
                "max_simultaneous_file_load_tasks must be at least 1".into(),
            ));
        }
        if self.max_tiles_loaded_per_frame == 0 {
            return Err(ConfigError::Invalid(
                "max_tiles_loaded_per_frame must be at least 1".into(),
            ));
        }
        if self.retry.max_backoff_frames < self.retry.base_backoff_frames {
            return Err(ConfigError::Invalid(
                "retry.max_backoff_frames is smaller than retry.base_backoff_frames".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ResidencyConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 1024,
            reserved_tiles: 64,
            max_simultaneous_file_load_tasks: 20,
            max_tiles_loaded_per_frame: 100,
            retry: RetryPolicy::default(),
        }
    }
}

/// Feedback sampling pass configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Screen is divided by this factor in both dimensions
    pub sampling_ratio: u32,
    /// Full-resolution screen width in pixels
    pub screen_width: u32,
    /// Full-resolution screen height in pixels
    pub screen_height: u32,
}

impl SamplingConfig {
    /// Size of the feedback target
    pub fn target_size(&self) -> (u32, u32) {
        let ratio = self.sampling_ratio.max(1);
        (
            (self.screen_width / ratio).max(1),
            (self.screen_height / ratio).max(1),
        )
    }

    /// Check the configuration for values the sampler cannot work with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.sampling_ratio == 0 {
            return Err(ConfigError::Invalid("sampling_ratio must be at least 1".into()));
        }
        if self.screen_width == 0 || self.screen_height == 0 {
            return Err(ConfigError::Invalid("screen size must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sampling_ratio: 8,
            screen_width: 1280,
            screen_height: 720,
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    /// Residency manager settings
    pub residency: ResidencyConfig,
    /// Feedback sampling settings
    pub sampling: SamplingConfig,
}

impl TesseraConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Serialize to pretty-printed JSON
    pub fn to_json_string(&self) -> ConfigResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate every section
    pub fn validate(&self) -> ConfigResult<()> {
        self.residency.validate()?;
        self.sampling.validate()
    }
}
