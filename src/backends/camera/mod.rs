// SPDX-License-Identifier: GPL-3.0-only

//! Capture device abstraction
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │   CameraHandle      │  ← Session lifecycle surface
//! └──────────┬──────────┘
//!            │
//!            ▼
//! ┌─────────────────────┐
//! │ CaptureBufferManager│  ← Buffer pool, one IoStrategy per IoMode
//! └──────────┬──────────┘
//!            │
//!            ▼
//! ┌─────────────────────┐
//! │   DeviceHal Trait   │  ← Common device contract
//! └──────────┬──────────┘
//!            │
//!       ┌────┴─────┐
//!       ▼          ▼
//!    ┌─────┐  ┌─────────┐
//!    │V4L2 │  │ Virtual │
//!    └─────┘  └─────────┘
//! ```

pub mod buffers;
pub mod frame_loop;
pub(crate) mod io_modes;
pub mod mapping;
pub mod types;
pub mod v4l2;
pub mod v4l2_controls;
pub mod virtual_device;

pub use buffers::{BufferState, CaptureBufferManager, FrameBuffer, FramePayload};
pub use frame_loop::{CaptureLoopController, LoopAction};
pub use types::*;

use crate::errors::{ServiceError, ServiceResult};
use std::os::unix::io::{OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Device contract every capture backend implements
///
/// Mirrors the V4L2 streaming model: negotiate a format, request a buffer
/// pool in one [`IoMode`], queue buffers, stream, and dequeue completed ones.
pub trait DeviceHal: Send {
    /// Backend identifier ("v4l2", "virtual")
    fn name(&self) -> &'static str;

    // ===== Lifecycle =====

    /// Open the device node at `path`
    fn open(&mut self, path: &str) -> HalResult<()>;

    /// Close the device, releasing every buffer it still owns
    fn close(&mut self) -> HalResult<()>;

    fn is_open(&self) -> bool;

    // ===== Format =====

    /// Apply a format and return what the device actually negotiated
    fn set_format(&mut self, spec: &FormatSpec) -> HalResult<FormatSpec>;

    fn get_format(&self) -> HalResult<FormatSpec>;

    // ===== Buffers =====

    /// Request `count` buffers in `mode`; `count == 0` frees the pool.
    ///
    /// Returns the number of buffers the device granted.
    fn request_buffers(&mut self, count: u32, mode: IoMode) -> HalResult<u32>;

    /// Location of a device-owned buffer for mapping
    fn query_buffer(&self, index: u32) -> HalResult<BufferPlacement>;

    /// Hand buffer `index` to the device
    fn enqueue(&mut self, index: u32, payload: EnqueuePayload) -> HalResult<()>;

    /// Take the next completed buffer, waiting at most `timeout`
    fn dequeue(&mut self, timeout: Duration) -> HalResult<Dequeued>;

    /// Export buffer `index` as a file descriptor
    fn export_buffer(&mut self, index: u32) -> HalResult<OwnedFd>;

    // ===== Streaming =====

    fn start_streaming(&mut self) -> HalResult<()>;

    fn stop_streaming(&mut self) -> HalResult<()>;

    /// Descriptor that becomes readable when a buffer completes
    fn pollable_handle(&self) -> HalResult<RawFd>;

    // ===== Properties =====

    fn get_property(&self, id: u32) -> HalResult<i32>;

    fn set_property(&mut self, id: u32, value: i32) -> HalResult<()>;

    // ===== Metadata =====

    /// Describe the device at `path` without opening it for streaming
    fn device_info(&self, path: &str) -> HalResult<DeviceInfo>;
}

/// A device shared between the session owner and its capture thread
pub type SharedHal = Arc<Mutex<Box<dyn DeviceHal>>>;

/// Names accepted by [`create_backend`]
pub const BACKEND_NAMES: &[&str] = &["v4l2", "virtual"];

/// Instantiate a backend by name.
pub fn create_backend(name: &str) -> ServiceResult<Box<dyn DeviceHal>> {
    match name {
        "v4l2" => Ok(Box::new(v4l2::V4l2Device::new())),
        "virtual" => Ok(Box::new(virtual_device::VirtualDevice::new())),
        other => Err(ServiceError::DeviceNotFound(format!(
            "no backend named {:?} (available: {})",
            other,
            BACKEND_NAMES.join(", ")
        ))),
    }
}

/// Wrap a backend for sharing with a capture thread.
pub fn share(hal: Box<dyn DeviceHal>) -> SharedHal {
    Arc::new(Mutex::new(hal))
}

/// Lock a shared device, recovering from a poisoned lock.
pub fn lock_hal(hal: &SharedHal) -> MutexGuard<'_, Box<dyn DeviceHal>> {
    hal.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Wait until `fd` is readable or `timeout` elapses.
///
/// Returns `Ok(false)` on timeout.
pub fn wait_readable(fd: RawFd, timeout: Duration) -> HalResult<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    loop {
        // SAFETY: one valid pollfd.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc > 0 {
            if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                return Err(HalError::Io(format!(
                    "poll reported error events {:#x}",
                    pfd.revents
                )));
            }
            return Ok(true);
        }
        if rc == 0 {
            return Ok(false);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(HalError::Io(format!("poll: {err}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        assert_eq!(create_backend("virtual").unwrap().name(), "virtual");
        assert_eq!(create_backend("v4l2").unwrap().name(), "v4l2");
        assert!(matches!(
            create_backend("pipewire"),
            Err(ServiceError::DeviceNotFound(_))
        ));
    }
}
