//! Integration tests for configuration parsing
//!
//! Run with: `cargo test -p host --test config_tests`

use host::HostConfig;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const FULL_CONFIG: &str = r#"
[logging]
level = "debug"

[transfers]
default_timeout_ms = 250
control_buffer_size = 1024

[events]
poll_interval_ms = 20
auto_start_pump = true

[isochronous]
default_packets = 32
packet_size = 192
"#;

#[test]
fn test_load_full_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("host.toml");
    fs::write(&path, FULL_CONFIG).unwrap();

    let config = HostConfig::load(Some(path)).unwrap();
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.transfers.default_timeout_ms, 250);
    assert_eq!(config.transfers.control_buffer_size, 1024);
    assert_eq!(config.events.poll_interval(), Duration::from_millis(20));
    assert!(config.events.auto_start_pump);
    assert_eq!(config.isochronous.default_packets, 32);
    assert_eq!(config.isochronous.packet_size, Some(192));
}

#[test]
fn test_load_empty_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("host.toml");
    fs::write(&path, "").unwrap();

    let config = HostConfig::load(Some(path)).unwrap();
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.events.poll_interval_ms, 100);
    assert!(!config.events.auto_start_pump);
}

#[test]
fn test_load_rejects_invalid_values() {
    let dir = TempDir::new().unwrap();

    let path = dir.path().join("bad_level.toml");
    fs::write(&path, "[logging]\nlevel = \"loud\"\n").unwrap();
    let err = HostConfig::load(Some(path)).unwrap_err();
    assert!(format!("{:#}", err).contains("Invalid log level"));

    let path = dir.path().join("bad_poll.toml");
    fs::write(&path, "[events]\npoll_interval_ms = 0\n").unwrap();
    assert!(HostConfig::load(Some(path)).is_err());

    let path = dir.path().join("bad_syntax.toml");
    fs::write(&path, "[transfers\n").unwrap();
    let err = HostConfig::load(Some(path)).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse config file"));
}

#[test]
fn test_load_missing_file_fails() {
    let dir = TempDir::new().unwrap();
    let err = HostConfig::load(Some(dir.path().join("absent.toml"))).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to read config file"));

    let config = HostConfig::load_or_default(Some(dir.path().join("absent.toml")));
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_save_and_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("host.toml");

    let mut config = HostConfig::default();
    config.transfers.default_timeout_ms = 5000;
    config.isochronous.packet_size = Some(64);
    config.save(&path).unwrap();

    let loaded = HostConfig::load(Some(path)).unwrap();
    assert_eq!(loaded.transfers.default_timeout_ms, 5000);
    assert_eq!(loaded.isochronous.packet_size, Some(64));
}

#[test]
fn test_default_path_location() {
    let path = HostConfig::default_path();
    assert!(path.ends_with("usb-xfer/host.toml"));
}
