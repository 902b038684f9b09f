use beacon_link::{ConfigError, LinkConfig};
use std::fs;
use tempfile::NamedTempFile;

#[test]
fn loads_config_from_file() {
    let file = NamedTempFile::new().expect("temp file");
    fs::write(
        file.path(),
        r#"
device_name = "Ridge"
max_request_bytes = 8192
max_fragment_payload = 244
storage_timeout_ms = 250
"#,
    )
    .expect("write config");

    let config = LinkConfig::from_path(file.path()).expect("load");
    assert_eq!(config.device_name, "Ridge");
    assert_eq!(config.max_request_bytes, 8192);
    assert_eq!(config.max_response_bytes, 4096);
    assert_eq!(config.max_fragment_payload, 244);
    assert_eq!(config.storage_timeout().as_millis(), 250);
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let err = LinkConfig::from_path(dir.path().join("absent.toml")).expect_err("missing");
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn out_of_range_values_name_the_field() {
    let err = LinkConfig::from_toml("storage_timeout_ms = 0").expect_err("zero timeout");
    assert_eq!(err.to_string(), "storage_timeout_ms must be between 1 and 600000 (got 0)");
}
