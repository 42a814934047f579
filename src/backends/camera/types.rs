// SPDX-License-Identifier: GPL-3.0-only

//! Shared types for capture device backends

use crate::errors::ServiceError;
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;

/// Buffer-ownership strategy negotiated with the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoMode {
    /// Device-owned buffers mapped into the process
    Mapped,
    /// Process-owned blocks handed to the device by address
    UserPointer,
    /// Device-owned buffers exported as file descriptors
    ExportedHandle,
}

impl std::fmt::Display for IoMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoMode::Mapped => write!(f, "mmap"),
            IoMode::UserPointer => write!(f, "userptr"),
            IoMode::ExportedHandle => write!(f, "dmabuf"),
        }
    }
}

/// Memory kind requested by `start_preview`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PreviewMemory {
    #[default]
    Mapped,
    UserPointer,
    ExportedHandle,
    /// User pointers into the ring channel's own slots (zero-copy publish)
    SharedSlots,
}

impl PreviewMemory {
    /// Device I/O mode this memory kind runs on.
    pub fn io_mode(self) -> IoMode {
        match self {
            PreviewMemory::Mapped => IoMode::Mapped,
            PreviewMemory::UserPointer | PreviewMemory::SharedSlots => IoMode::UserPointer,
            PreviewMemory::ExportedHandle => IoMode::ExportedHandle,
        }
    }
}

/// Framerate as a fraction (numerator/denominator)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Framerate {
    pub num: u32,
    pub denom: u32,
}

impl Framerate {
    pub fn new(num: u32, denom: u32) -> Self {
        Self {
            num,
            denom: if denom == 0 { 1 } else { denom },
        }
    }

    pub fn from_int(fps: u32) -> Self {
        Self { num: fps, denom: 1 }
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.denom as f64
    }
}

impl std::fmt::Display for Framerate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.denom != 1 {
            write!(f, "{:.2}", self.as_f64())
        } else {
            write!(f, "{}", self.num)
        }
    }
}

/// Frame format requested from (and reported by) the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatSpec {
    pub width: u32,
    pub height: u32,
    /// FourCC code (e.g., "YUYV", "NV12", "MJPG")
    pub fourcc: String,
    pub framerate: Option<Framerate>,
    /// Row stride in bytes; filled in by the device
    pub bytes_per_line: u32,
    /// Bytes per frame; filled in by the device
    pub size_image: u32,
}

impl Default for FormatSpec {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fourcc: "YUYV".to_string(),
            framerate: Some(Framerate::from_int(30)),
            bytes_per_line: 0,
            size_image: 0,
        }
    }
}

impl FormatSpec {
    pub fn new(width: u32, height: u32, fourcc: &str) -> Self {
        Self {
            width,
            height,
            fourcc: fourcc.to_string(),
            ..Self::default()
        }
    }

    /// FourCC as the little-endian integer V4L2 uses.
    pub fn fourcc_code(&self) -> Result<u32, HalError> {
        fourcc_code(&self.fourcc)
    }
}

impl std::fmt::Display for FormatSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.fourcc)?;
        if let Some(fps) = &self.framerate {
            write!(f, " @ {}fps", fps)?;
        }
        Ok(())
    }
}

/// Encode a four-character code.
pub fn fourcc_code(fourcc: &str) -> Result<u32, HalError> {
    let bytes = fourcc.as_bytes();
    if bytes.len() != 4 || !bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        return Err(HalError::BadFormat(format!("invalid FourCC {:?}", fourcc)));
    }
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Decode a four-character code.
pub fn fourcc_string(code: u32) -> String {
    String::from_utf8_lossy(&code.to_le_bytes()).to_string()
}

/// Average bytes per pixel for uncompressed FourCCs the service knows.
pub fn bytes_per_pixel(fourcc: &str) -> Option<f32> {
    match fourcc {
        "YUYV" | "UYVY" | "YVYU" | "VYUY" | "RGBP" => Some(2.0),
        "GREY" => Some(1.0),
        "RGB3" | "BGR3" => Some(3.0),
        "NV12" | "NV21" | "YU12" | "YV12" => Some(1.5),
        "RGB4" | "BGR4" | "AR24" => Some(4.0),
        _ => None,
    }
}

/// Where a device buffer lives, as needed to map it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPlacement {
    /// Descriptor to pass to `mmap`
    pub fd: RawFd,
    pub offset: i64,
    pub length: usize,
}

/// Mode-specific argument to [`DeviceHal::enqueue`](super::DeviceHal::enqueue)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueuePayload {
    Mapped,
    UserPointer { addr: *mut u8, length: usize },
    Exported { fd: RawFd },
}

/// A completed buffer reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
    pub timestamp_ns: u64,
}

/// Device description returned by `get_device_info`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Name of the device (V4L2 card)
    pub card: String,
    /// Driver name (V4L2 driver)
    pub driver: String,
    pub bus_info: String,
    /// Device path (e.g., /dev/video0)
    pub path: String,
    /// Real device path (resolved symlinks)
    pub real_path: String,
    /// Capture FourCCs the device advertises
    pub formats: Vec<String>,
}

/// Result type for device backend operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors reported by device backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    /// No device answers to the path
    UnknownDevice(String),
    /// Format rejected by the device
    BadFormat(String),
    /// Buffer index or payload rejected by the device
    BadBuffer(String),
    /// ioctl, mmap or other system call failure
    Io(String),
    /// No completed buffer within the dequeue timeout
    Timeout,
}

impl HalError {
    /// Build an `Io` error from the calling thread's `errno`.
    pub fn last_os_error(context: &str) -> Self {
        HalError::Io(format!("{}: {}", context, std::io::Error::last_os_error()))
    }
}

impl std::fmt::Display for HalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HalError::UnknownDevice(msg) => write!(f, "Unknown device: {}", msg),
            HalError::BadFormat(msg) => write!(f, "Bad format: {}", msg),
            HalError::BadBuffer(msg) => write!(f, "Bad buffer: {}", msg),
            HalError::Io(msg) => write!(f, "I/O error: {}", msg),
            HalError::Timeout => write!(f, "Timed out waiting for a buffer"),
        }
    }
}

impl std::error::Error for HalError {}

impl From<HalError> for ServiceError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::UnknownDevice(msg) => ServiceError::DeviceNotFound(msg),
            HalError::BadFormat(msg) => ServiceError::InvalidParameter(msg),
            HalError::BadBuffer(msg) => ServiceError::InvalidParameter(msg),
            HalError::Io(msg) => ServiceError::IoFailure(msg),
            HalError::Timeout => ServiceError::NoData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_roundtrip() {
        let code = fourcc_code("YUYV").unwrap();
        assert_eq!(code, 0x5659_5559);
        assert_eq!(fourcc_string(code), "YUYV");
        assert!(fourcc_code("YUV").is_err());
    }

    #[test]
    fn test_preview_memory_modes() {
        assert_eq!(PreviewMemory::SharedSlots.io_mode(), IoMode::UserPointer);
        assert_eq!(PreviewMemory::default().io_mode(), IoMode::Mapped);
    }

    #[test]
    fn test_hal_error_conversion() {
        assert_eq!(ServiceError::from(HalError::Timeout), ServiceError::NoData);
        assert!(matches!(
            ServiceError::from(HalError::UnknownDevice("x".into())),
            ServiceError::DeviceNotFound(_)
        ));
        assert!(matches!(
            ServiceError::from(HalError::BadBuffer("x".into())),
            ServiceError::InvalidParameter(_)
        ));
    }

    #[test]
    fn test_format_display() {
        let spec = FormatSpec::new(1280, 720, "NV12");
        assert_eq!(spec.to_string(), "1280x720 NV12 @ 30fps");
    }
}
