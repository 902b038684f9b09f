//! User-facing device settings exchanged by `get_settings` / `update_settings`.
//!
//! The wire shape mirrors the on-device settings file: each setting is a map
//! entry whose value is itself a map holding the value under `cfgVal`.
//!
//! ```text
//! { "Device Name": { "cfgVal": "Beacon" }, "UserID": { "cfgVal": 7 }, ... }
//! ```

use rmpv::Value;

use crate::codec::{Arguments, Reply};
use crate::error::HandlerError;

pub const DEVICE_NAME_KEY: &str = "Device Name";
pub const USER_ID_KEY: &str = "UserID";
pub const SILENT_MODE_KEY: &str = "Silent Mode";
pub const TIME_24_HOUR_KEY: &str = "24 Hour Time";
pub const CONFIG_VALUE_FIELD: &str = "cfgVal";

pub const MAX_DEVICE_NAME_CHARS: usize = 20;

/// Trim, reject empty or control-character names, cap the length.
pub fn normalize_device_name(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_control) {
        return None;
    }
    let normalized: String = trimmed.chars().take(MAX_DEVICE_NAME_CHARS).collect();
    let normalized = normalized.trim_end().to_string();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSettings {
    pub device_name: String,
    pub user_id: u64,
    pub silent_mode: bool,
    pub time_24_hour: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_DEVICE_NAME)
    }
}

impl DeviceSettings {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self { device_name: device_name.into(), user_id: 0, silent_mode: false, time_24_hour: false }
    }

    pub fn to_reply(&self) -> Reply {
        Reply::new()
            .with(DEVICE_NAME_KEY, wrap(Value::from(self.device_name.as_str())))
            .with(USER_ID_KEY, wrap(Value::from(self.user_id)))
            .with(SILENT_MODE_KEY, wrap(Value::from(self.silent_mode)))
            .with(TIME_24_HOUR_KEY, wrap(Value::from(self.time_24_hour)))
    }

    /// Apply every recognised entry of `args`, or none of them.
    pub fn apply(&mut self, args: &Arguments) -> Result<(), HandlerError> {
        let mut staged = self.clone();
        for (key, entry) in args.iter() {
            match key {
                DEVICE_NAME_KEY => {
                    staged.device_name = config_value(entry)
                        .and_then(Value::as_str)
                        .and_then(normalize_device_name)
                        .ok_or_else(|| HandlerError::invalid_field(key))?;
                }
                USER_ID_KEY => {
                    staged.user_id = config_value(entry)
                        .and_then(Value::as_u64)
                        .ok_or_else(|| HandlerError::invalid_field(key))?;
                }
                SILENT_MODE_KEY => {
                    staged.silent_mode = config_value(entry)
                        .and_then(Value::as_bool)
                        .ok_or_else(|| HandlerError::invalid_field(key))?;
                }
                TIME_24_HOUR_KEY => {
                    staged.time_24_hour = config_value(entry)
                        .and_then(Value::as_bool)
                        .ok_or_else(|| HandlerError::invalid_field(key))?;
                }
                other => log::debug!("rpc: ignoring unknown setting {:?}", other),
            }
        }
        *self = staged;
        Ok(())
    }

    pub fn rpc_get(&mut self, _args: &Arguments) -> Result<Reply, HandlerError> {
        Ok(self.to_reply())
    }

    pub fn rpc_update(&mut self, args: &Arguments) -> Result<Reply, HandlerError> {
        self.apply(args)?;
        log::info!("rpc: settings updated device_name={:?}", self.device_name);
        Ok(self.to_reply())
    }
}

fn wrap(value: Value) -> Value {
    Value::Map(vec![(Value::from(CONFIG_VALUE_FIELD), value)])
}

fn config_value(entry: &Value) -> Option<&Value> {
    entry
        .as_map()?
        .iter()
        .find(|(key, _)| key.as_str() == Some(CONFIG_VALUE_FIELD))
        .map(|(_, value)| value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setting(key: &str, value: Value) -> (String, Value) {
        (key.to_string(), wrap(value))
    }

    #[test]
    fn normalizes_device_names() {
        assert_eq!(normalize_device_name("  Trail Unit  "), Some("Trail Unit".into()));
        assert_eq!(normalize_device_name("   "), None);
        assert_eq!(normalize_device_name("bad\nname"), None);
        assert_eq!(
            normalize_device_name("abcdefghijklmnopqrstuvwxyz"),
            Some("abcdefghijklmnopqrst".into())
        );
        assert_eq!(normalize_device_name("abcdefghijklmnopqrs tail"), Some("abcdefghijklmnopqrs".into()));
    }

    #[test]
    fn reply_uses_settings_file_shape() {
        let reply = DeviceSettings::new("Beacon").to_reply();
        let name = reply.get(DEVICE_NAME_KEY).and_then(config_value).and_then(Value::as_str);
        assert_eq!(name, Some("Beacon"));
        let silent = reply.get(SILENT_MODE_KEY).and_then(config_value).and_then(Value::as_bool);
        assert_eq!(silent, Some(false));
    }

    #[test]
    fn applies_subset_of_settings() {
        let mut settings = DeviceSettings::new("Beacon");
        settings
            .apply(&Arguments::new(vec![
                setting(USER_ID_KEY, Value::from(42)),
                setting(TIME_24_HOUR_KEY, Value::from(true)),
                setting("Brightness", Value::from(3)),
            ]))
            .expect("apply");
        assert_eq!(settings.user_id, 42);
        assert!(settings.time_24_hour);
        assert_eq!(settings.device_name, "Beacon");
    }

    #[test]
    fn invalid_entry_applies_nothing() {
        let mut settings = DeviceSettings::new("Beacon");
        let err = settings
            .apply(&Arguments::new(vec![
                setting(DEVICE_NAME_KEY, Value::from("Renamed")),
                setting(SILENT_MODE_KEY, Value::from("yes")),
            ]))
            .expect_err("wrong type");
        assert_eq!(err.to_string(), "Missing or invalid 'Silent Mode'");
        assert_eq!(settings, DeviceSettings::new("Beacon"));
    }

    #[test]
    fn bare_value_without_cfgval_is_rejected() {
        let mut settings = DeviceSettings::default();
        let err = settings
            .apply(&Arguments::new(vec![(USER_ID_KEY.to_string(), Value::from(3))]))
            .expect_err("bare value");
        assert_eq!(err, HandlerError::invalid_field(USER_ID_KEY));
    }
}
