/// Transfer engine configuration
///
/// Construction-time settings shared by the handler and the device
/// backends. Loaded from TOML; every field has a default.

use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::error::{ConfigError, ConfigResult};
use crate::memory::AllocationStrategy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Invocations per workgroup along X for the copy kernel
    pub ideal_workgroup_size: u32,

    /// Staging allocation wait used by callers without their own budget
    pub default_max_wait_us: u64,

    /// Size of the shared upload streaming buffer (bytes)
    pub upload_ring_size: u32,

    /// Size of the shared download streaming buffer (bytes)
    pub download_ring_size: u32,

    /// Placement strategy inside the streaming buffers
    pub allocation_strategy: AllocationStrategy,

    /// Descriptor sets reserved per pipeline variant up front
    pub descriptor_set_reserve: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            ideal_workgroup_size: 256,
            default_max_wait_us: 50,
            upload_ring_size: 4 * 1024 * 1024,
            download_ring_size: 4 * 1024 * 1024,
            allocation_strategy: AllocationStrategy::FirstFit,
            descriptor_set_reserve: 4, // 4 frames worth
        }
    }
}

impl TransferConfig {
    /// Parse a TOML document and validate it
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: TransferConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        log::debug!("[TransferConfig] Loaded {}", path.as_ref().display());
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.ideal_workgroup_size == 0 {
            return Err(ConfigError::Invalid("ideal_workgroup_size must be non-zero".into()));
        }
        if self.upload_ring_size < 4 || self.upload_ring_size % 4 != 0 {
            return Err(ConfigError::Invalid(format!(
                "upload_ring_size must be a non-zero multiple of 4, got {}",
                self.upload_ring_size
            )));
        }
        if self.download_ring_size < 4 || self.download_ring_size % 4 != 0 {
            return Err(ConfigError::Invalid(format!(
                "download_ring_size must be a non-zero multiple of 4, got {}",
                self.download_ring_size
            )));
        }
        Ok(())
    }

    pub fn default_max_wait(&self) -> Duration {
        Duration::from_micros(self.default_max_wait_us)
    }
}
