use beacon_link::{ConfigError, LinkConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Simulated partition table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashLayout {
    pub partitions: u8,
    pub partition_capacity: u64,
}

impl Default for FlashLayout {
    fn default() -> Self {
        Self { partitions: 2, partition_capacity: 4 * 1024 * 1024 }
    }
}

/// Simulator settings.
///
/// ```toml
/// conn_handle = 1
///
/// [link]
/// device_name = "Bench"
/// max_fragment_payload = 244
///
/// [flash]
/// partitions = 3
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub conn_handle: u16,
    pub link: LinkConfig,
    pub flash: FlashLayout,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self { conn_handle: 1, link: LinkConfig::default(), flash: FlashLayout::default() }
    }
}

impl SimConfig {
    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.link.validate()?;
        let partitions = u64::from(self.flash.partitions);
        if !(2..=16).contains(&partitions) {
            return Err(ConfigError::OutOfRange {
                field: "flash.partitions",
                min: 2,
                max: 16,
                value: partitions,
            });
        }
        if self.flash.partition_capacity == 0 {
            return Err(ConfigError::OutOfRange {
                field: "flash.partition_capacity",
                min: 1,
                max: u64::MAX,
                value: 0,
            });
        }
        Ok(())
    }
}
