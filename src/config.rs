// SPDX-License-Identifier: GPL-3.0-only

//! Service configuration
//!
//! Stored as JSON under the user's config directory
//! (`~/.config/camera-service/config.json`). Missing fields take their
//! defaults, so an empty object is a valid file.

use crate::backends::camera::{BACKEND_NAMES, FormatSpec, PreviewMemory};
use crate::constants::{self, capture, ring, timing};
use crate::errors::{ServiceError, ServiceResult};
use crate::pipelines::PreviewConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Directory name under the platform config dir
pub const CONFIG_DIR_NAME: &str = "camera-service";

/// Config file name inside [`CONFIG_DIR_NAME`]
pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capture backend ("v4l2" or "virtual")
    pub backend: String,
    /// Device opened by default
    pub device_path: String,
    /// Format applied when the device is opened
    pub format: FormatSpec,
    /// Buffer memory used for preview
    pub io_mode: PreviewMemory,
    /// Device buffers per session
    pub buffer_count: u32,
    /// Ring slots on the copy path
    pub ring_unit_num: u32,
    /// Per-slot metadata capacity
    pub ring_meta_size: u32,
    /// Per-slot extra data; 0 disables the region
    pub ring_extra_size: u32,
    /// Create the channel semaphore
    pub with_semaphore: bool,
    pub dequeue_timeout_ms: u64,
    pub reader_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: capture::DEFAULT_BACKEND.to_string(),
            device_path: capture::DEFAULT_DEVICE_PATH.to_string(),
            format: FormatSpec::default(),
            io_mode: PreviewMemory::default(),
            buffer_count: capture::DEFAULT_BUFFER_COUNT,
            ring_unit_num: ring::DEFAULT_UNIT_NUM,
            ring_meta_size: ring::DEFAULT_META_SIZE,
            ring_extra_size: 0,
            with_semaphore: false,
            dequeue_timeout_ms: timing::DEQUEUE_TIMEOUT_MS,
            reader_timeout_ms: timing::READER_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Default config file location, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Read and validate a config file.
    pub fn load(path: &Path) -> ServiceResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ServiceError::IoFailure(format!("read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&text).map_err(|e| {
            ServiceError::InvalidParameter(format!("parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Load the default config file, falling back to defaults.
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            warn!("No config directory available, using defaults");
            return Self::default();
        };
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Write the config as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> ServiceResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| ServiceError::InvalidParameter(format!("serialize config: {}", e)))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Reject values no session could run with.
    pub fn validate(&self) -> ServiceResult<()> {
        if !BACKEND_NAMES.contains(&self.backend.as_str()) {
            return Err(ServiceError::InvalidParameter(format!(
                "unknown backend {:?} (available: {})",
                self.backend,
                BACKEND_NAMES.join(", ")
            )));
        }
        if self.device_path.is_empty() {
            return Err(ServiceError::InvalidParameter(
                "device_path is empty".to_string(),
            ));
        }
        if self.format.width == 0 || self.format.height == 0 {
            return Err(ServiceError::InvalidParameter(format!(
                "format {}x{} has no pixels",
                self.format.width, self.format.height
            )));
        }
        self.format.fourcc_code()?;
        if self.buffer_count == 0 || self.buffer_count > capture::MAX_BUFFER_COUNT {
            return Err(ServiceError::InvalidParameter(format!(
                "buffer_count {} outside 1..={}",
                self.buffer_count,
                capture::MAX_BUFFER_COUNT
            )));
        }
        if self.ring_unit_num == 0 {
            return Err(ServiceError::InvalidParameter(
                "ring_unit_num must be at least 1".to_string(),
            ));
        }
        if self.dequeue_timeout_ms == 0 || self.reader_timeout_ms == 0 {
            return Err(ServiceError::InvalidParameter(
                "timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Preview settings derived from this config.
    pub fn preview_config(&self) -> PreviewConfig {
        PreviewConfig {
            memory: self.io_mode,
            buffer_count: self.buffer_count,
            unit_num: self.ring_unit_num,
            meta_size: self.ring_meta_size,
            extra_size: self.ring_extra_size,
            with_semaphore: self.with_semaphore,
            timeout: self.dequeue_timeout(),
        }
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    pub fn reader_timeout(&self) -> Duration {
        if self.reader_timeout_ms == 0 {
            return constants::reader_timeout();
        }
        Duration::from_millis(self.reader_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: Config = serde_json::from_str(r#"{"backend": "virtual"}"#).unwrap();
        assert_eq!(config.backend, "virtual");
        assert_eq!(config.buffer_count, capture::DEFAULT_BUFFER_COUNT);
        assert_eq!(config.format, FormatSpec::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_io_mode_names() {
        let config: Config = serde_json::from_str(r#"{"io_mode": "SharedSlots"}"#).unwrap();
        assert_eq!(config.io_mode, PreviewMemory::SharedSlots);
    }

    #[test]
    fn test_validate_rejects_zero_counts() {
        let config = Config {
            buffer_count: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ServiceError::InvalidParameter(_))
        ));

        let config = Config {
            backend: "pipewire".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
