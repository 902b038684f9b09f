use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::settings::normalize_device_name;

pub const DEFAULT_DEVICE_NAME: &str = "Beacon";
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 4096;
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 4096;
pub const DEFAULT_MAX_FRAGMENT_PAYLOAD: usize = 500;
pub const DEFAULT_STORAGE_TIMEOUT_MS: u64 = 5_000;

/// Largest fragment payload that still fits a 512-byte attribute with its header.
pub const MAX_FRAGMENT_PAYLOAD_LIMIT: usize = 511;

/// Tunables for one [`crate::CommandChannel`].
///
/// ```toml
/// device_name = "Trail Unit"
/// max_request_bytes = 4096
/// max_fragment_payload = 180
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub device_name: String,
    pub max_request_bytes: usize,
    pub max_response_bytes: usize,
    pub max_fragment_payload: usize,
    pub storage_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            max_fragment_payload: DEFAULT_MAX_FRAGMENT_PAYLOAD,
            storage_timeout_ms: DEFAULT_STORAGE_TIMEOUT_MS,
        }
    }
}

impl LinkConfig {
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
        check_range("max_request_bytes", self.max_request_bytes as u64, 16, 65_536)?;
        check_range("max_response_bytes", self.max_response_bytes as u64, 64, 65_536)?;
        check_range(
            "max_fragment_payload",
            self.max_fragment_payload as u64,
            1,
            MAX_FRAGMENT_PAYLOAD_LIMIT as u64,
        )?;
        check_range("storage_timeout_ms", self.storage_timeout_ms, 1, 600_000)?;
        if normalize_device_name(&self.device_name).is_none() {
            return Err(ConfigError::InvalidDeviceName);
        }
        Ok(())
    }

    /// Trimmed, length-limited device name. Falls back to
    /// [`DEFAULT_DEVICE_NAME`] for a name [`LinkConfig::validate`] would reject.
    pub fn device_name(&self) -> String {
        normalize_device_name(&self.device_name).unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string())
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { field, min, max, value })
    }
}
