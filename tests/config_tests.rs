// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for configuration module

use camera_service::backends::camera::PreviewMemory;
use camera_service::{Config, ServiceError};
use std::path::PathBuf;

fn temp_config(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!("camera-service-{}-{}", name, std::process::id()))
        .join("config.json")
}

#[test]
fn test_config_default() {
    let config = Config::default();

    assert_eq!(config.backend, "v4l2");
    assert_eq!(config.device_path, "/dev/video0");
    assert_eq!(config.io_mode, PreviewMemory::Mapped);
    assert!(config.validate().is_ok(), "Default config must be valid");
}

#[test]
fn test_config_save_and_load() {
    let path = temp_config("roundtrip");
    let config = Config {
        backend: "virtual".to_string(),
        device_path: "virtual0".to_string(),
        io_mode: PreviewMemory::SharedSlots,
        buffer_count: 6,
        ..Config::default()
    };

    config.save(&path).unwrap();
    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded, config);

    std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
}

#[test]
fn test_config_load_rejects_invalid_values() {
    let path = temp_config("invalid");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, r#"{"ring_unit_num": 0}"#).unwrap();

    assert!(matches!(
        Config::load(&path),
        Err(ServiceError::InvalidParameter(_))
    ));

    std::fs::write(&path, "not json").unwrap();
    assert!(matches!(
        Config::load(&path),
        Err(ServiceError::InvalidParameter(_))
    ));

    std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
}

#[test]
fn test_config_preview_settings() {
    let config = Config {
        ring_meta_size: 128,
        dequeue_timeout_ms: 250,
        ..Config::default()
    };
    let preview = config.preview_config();
    assert_eq!(preview.meta_size, 128);
    assert_eq!(preview.timeout.as_millis(), 250);
    assert_eq!(preview.buffer_count, config.buffer_count);
}
