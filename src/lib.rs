// SPDX-License-Identifier: GPL-3.0-only

//! Camera Service - capture frames from a device into a shared-memory ring
//!
//! A producer process owns the capture device and publishes every frame into
//! a System V shared-memory ring channel. Any number of consumer processes
//! attach to the channel by key and read the most recent frame when notified.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`backends`]: Device contract and the V4L2 / virtual backends
//! - [`ring`]: The shared-memory ring channel and its reader loop
//! - [`notify`]: Out-of-band new-frame notification
//! - [`pipelines`]: The preview capture session and raw recording
//! - [`service`]: Session lifecycle surface consumed by an RPC layer
//! - [`config`]: User configuration handling
//!
//! # Example
//!
//! ```no_run
//! use camera_service::backends::camera::PreviewMemory;
//! use camera_service::notify::NotifyTarget;
//! use camera_service::service::CameraHandle;
//!
//! let mut handle = CameraHandle::create("v4l2")?;
//! handle.open("/dev/video0", 0, NotifyTarget::None)?;
//! let key = handle.start_preview(PreviewMemory::Mapped)?;
//! println!("readers attach to {key:#x}");
//! handle.close()?;
//! # Ok::<(), camera_service::errors::ServiceError>(())
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod notify;
pub mod pipelines;
pub mod ring;
pub mod service;

// Re-export commonly used types
pub use config::Config;
pub use errors::{ResultCode, ServiceError, ServiceResult};
pub use ring::SharedRingChannel;
pub use service::CameraHandle;
