// SPDX-License-Identifier: GPL-3.0-only

//! Service-wide constants

use std::time::Duration;

/// Shared-memory ring channel constants
pub mod ring {
    /// First System V key tried when creating a channel ("CAM\0")
    pub const KEY_BASE: i32 = 0x4341_4D00;

    /// Number of consecutive keys tried before giving up
    pub const KEY_SEARCH_WINDOW: i32 = 4096;

    /// Permission bits for created segments and semaphores
    pub const SEGMENT_MODE: i32 = 0o666;

    /// Size in bytes of each length cell (payload, meta, extra-size scalar)
    pub const LENGTH_CELL: usize = 4;

    /// Default number of slots in a preview channel
    pub const DEFAULT_UNIT_NUM: u32 = 4;

    /// Default per-slot metadata capacity
    pub const DEFAULT_META_SIZE: u32 = 64;
}

/// Capture buffer defaults
pub mod capture {
    /// Default number of device buffers negotiated per session
    pub const DEFAULT_BUFFER_COUNT: u32 = 4;

    /// Upper bound on negotiated device buffers
    pub const MAX_BUFFER_COUNT: u32 = 32;

    /// Default capture device path
    pub const DEFAULT_DEVICE_PATH: &str = "/dev/video0";

    /// Default backend name
    pub const DEFAULT_BACKEND: &str = "v4l2";
}

/// Timing constants
pub mod timing {
    /// Device readiness wait before a dequeue reports `NoData`
    pub const DEQUEUE_TIMEOUT_MS: u64 = 2_000;

    /// Reader wait for a new-frame notification before declaring the producer dead
    pub const READER_TIMEOUT_MS: u64 = 3_000;

    /// Log a frame summary every N frames
    pub const FRAME_LOG_INTERVAL: u64 = 30;
}

/// Default device dequeue timeout
pub fn dequeue_timeout() -> Duration {
    Duration::from_millis(timing::DEQUEUE_TIMEOUT_MS)
}

/// Default reader notification timeout
pub fn reader_timeout() -> Duration {
    Duration::from_millis(timing::READER_TIMEOUT_MS)
}

/// Build information
pub mod app_info {
    /// Service version from build-time environment
    pub fn version() -> &'static str {
        env!("GIT_VERSION")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_window_stays_positive() {
        let last = ring::KEY_BASE.checked_add(ring::KEY_SEARCH_WINDOW);
        assert!(last.is_some_and(|k| k > 0));
    }

    #[test]
    fn test_timeouts_are_seconds_scale() {
        assert!(dequeue_timeout() >= Duration::from_secs(1));
        assert!(reader_timeout() >= dequeue_timeout());
    }
}
