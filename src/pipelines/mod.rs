// SPDX-License-Identifier: GPL-3.0-only

//! Frame pipelines behind a capture session
//!
//! # Pipeline Architecture
//!
//! ```text
//! ┌──────────────┐     ┌───────────────────┐     ┌──────────────────┐
//! │ DeviceHal    │ ──▶ │  CaptureSession   │ ──▶ │ SharedRingChannel│ ──▶ readers
//! │ (buffers)    │     │  - dequeue        │     │  (latest frame)  │
//! │              │     │  - publish/notify │     └──────────────────┘
//! │              │     │  - release        │     ┌──────────────────┐
//! │              │     │                   │ ──▶ │   RawRecorder    │ ──▶ file
//! └──────────────┘     └───────────────────┘     └──────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`preview`]: The capture loop feeding the ring channel
//! - [`recording`]: Raw frame capture to a file while preview runs

pub mod preview;
pub mod recording;

pub use preview::{CaptureSession, PreviewConfig, SessionStats, StatsSnapshot, publish_frame};
pub use recording::{CaptureSpec, RawRecorder, RecordingSummary, SharedRecorder, lock_recorder};

/// Per-frame metadata stored in the ring's meta region
///
/// Encoded as its native in-memory representation, little endian on every
/// supported target.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FrameMeta {
    /// Device sequence number
    pub sequence: u64,
    /// Capture timestamp in nanoseconds
    pub timestamp_ns: u64,
    pub width: u32,
    pub height: u32,
    /// FourCC as the little-endian integer V4L2 uses
    pub fourcc: u32,
    pub bytes_used: u32,
}

impl FrameMeta {
    pub const SIZE: usize = std::mem::size_of::<FrameMeta>();

    pub fn encode(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Decode from the front of `bytes`; `None` when too short.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        bytemuck::try_pod_read_unaligned(bytes.get(..Self::SIZE)?).ok()
    }

    /// Whether a channel with `meta_size` can store the metadata.
    ///
    /// Meta must be strictly shorter than the slot's meta capacity.
    pub fn fits(meta_size: u32) -> bool {
        (meta_size as usize) > Self::SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_meta_layout() {
        assert_eq!(FrameMeta::SIZE, 32);
        assert!(!FrameMeta::fits(32));
        assert!(FrameMeta::fits(33));
    }

    #[test]
    fn test_frame_meta_decode() {
        let meta = FrameMeta {
            sequence: 9,
            timestamp_ns: 1_000,
            width: 640,
            height: 480,
            fourcc: 0x5659_5559,
            bytes_used: 614_400,
        };
        // Offset by one byte so the read is unaligned
        let mut bytes = vec![0xff];
        bytes.extend_from_slice(meta.encode());
        assert_eq!(FrameMeta::decode(&bytes[1..]), Some(meta));
        assert_eq!(FrameMeta::decode(&bytes[1..32]), None);
    }
}
