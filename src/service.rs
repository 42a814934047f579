// SPDX-License-Identifier: GPL-3.0-only

//! Session lifecycle surface
//!
//! [`CameraHandle`] is the object an RPC layer drives: one handle per device
//! session, no global state. Every operation returns a [`ServiceResult`];
//! [`ResultCode::of`](crate::errors::ResultCode::of) turns it into the numeric
//! code handed over the wire.
//!
//! ```text
//! create ─▶ open ─▶ [set_format] ─▶ start_preview ─▶ [start_capture ─▶ stop_capture]
//!                                        │
//!               close ◀──────────── stop_preview
//! ```

use crate::backends::camera::{
    CaptureLoopController, DeviceInfo, FormatSpec, HalError, PreviewMemory, SharedHal,
    create_backend, lock_hal, share,
};
use crate::config::Config;
use crate::errors::{ServiceError, ServiceResult};
use crate::notify::NotifyTarget;
use crate::pipelines::{
    CaptureSession, CaptureSpec, PreviewConfig, RawRecorder, RecordingSummary, SessionStats,
    SharedRecorder, StatsSnapshot, lock_recorder,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

struct ActivePreview {
    controller: CaptureLoopController<CaptureSession>,
    key: i32,
}

/// One device session
pub struct CameraHandle {
    hal: SharedHal,
    preview_config: PreviewConfig,
    /// Format applied at open, from the config
    initial_format: Option<FormatSpec>,
    device_id: Option<u32>,
    path: Option<String>,
    notify: NotifyTarget,
    preview: Option<ActivePreview>,
    recorder: SharedRecorder,
    stats: Arc<SessionStats>,
}

impl CameraHandle {
    /// Create a handle on the named backend with default settings.
    pub fn create(backend: &str) -> ServiceResult<Self> {
        Ok(Self {
            hal: share(create_backend(backend)?),
            preview_config: PreviewConfig::default(),
            initial_format: None,
            device_id: None,
            path: None,
            notify: NotifyTarget::None,
            preview: None,
            recorder: Arc::new(Mutex::new(None)),
            stats: Arc::new(SessionStats::default()),
        })
    }

    /// Create a handle from a validated config.
    pub fn with_config(config: &Config) -> ServiceResult<Self> {
        config.validate()?;
        let mut handle = Self::create(&config.backend)?;
        handle.preview_config = config.preview_config();
        handle.initial_format = Some(config.format.clone());
        Ok(handle)
    }

    pub fn backend_name(&self) -> &'static str {
        lock_hal(&self.hal).name()
    }

    pub fn is_open(&self) -> bool {
        self.path.is_some()
    }

    pub fn device_id(&self) -> Option<u32> {
        self.device_id
    }

    pub fn is_previewing(&self) -> bool {
        self.preview.is_some()
    }

    /// Whether the capture thread is still alive; `false` once it stopped on
    /// a fatal error.
    pub fn is_streaming(&self) -> bool {
        self.preview
            .as_ref()
            .is_some_and(|p| p.controller.is_running())
    }

    /// Channel key of the running preview.
    pub fn preview_key(&self) -> Option<i32> {
        self.preview.as_ref().map(|p| p.key)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn ensure_open(&self) -> ServiceResult<()> {
        if self.path.is_none() {
            return Err(ServiceError::InvalidState("device is not open".to_string()));
        }
        Ok(())
    }

    fn ensure_not_previewing(&self, op: &str) -> ServiceResult<()> {
        if self.preview.is_some() {
            return Err(ServiceError::InvalidState(format!(
                "{} not allowed while previewing",
                op
            )));
        }
        Ok(())
    }

    /// Open the device and register who to notify per frame.
    pub fn open(&mut self, path: &str, id: u32, notify: NotifyTarget) -> ServiceResult<()> {
        if self.path.is_some() {
            return Err(ServiceError::InvalidState(format!(
                "device {} already open",
                self.path.as_deref().unwrap_or_default()
            )));
        }
        // Reject a bad target before touching the device.
        notify.notifier()?;

        let mut hal = lock_hal(&self.hal);
        hal.open(path).map_err(|e| match e {
            HalError::UnknownDevice(msg) => ServiceError::DeviceNotFound(msg),
            other => ServiceError::DeviceOpen(other.to_string()),
        })?;

        if let Some(format) = &self.initial_format
            && let Err(e) = hal.set_format(format)
        {
            warn!(path, format = %format, error = %e, "Configured format rejected");
            if let Err(close_err) = hal.close() {
                warn!(path, error = %close_err, "Failed to close device");
            }
            return Err(e.into());
        }
        drop(hal);

        info!(path, id, backend = self.backend_name(), "Device opened");
        self.path = Some(path.to_string());
        self.device_id = Some(id);
        self.notify = notify;
        Ok(())
    }

    /// Stop any running preview and close the device.
    pub fn close(&mut self) -> ServiceResult<()> {
        self.ensure_open()?;
        let stopped = if self.preview.is_some() {
            self.stop_preview()
        } else {
            Ok(())
        };

        let closed = lock_hal(&self.hal)
            .close()
            .map_err(|e| ServiceError::DeviceClose(e.to_string()));
        info!(path = ?self.path, "Device closed");
        self.path = None;
        self.device_id = None;
        self.notify = NotifyTarget::None;
        stopped.and(closed)
    }

    pub fn set_format(&mut self, spec: &FormatSpec) -> ServiceResult<FormatSpec> {
        self.ensure_open()?;
        self.ensure_not_previewing("set_format")?;
        let negotiated = lock_hal(&self.hal).set_format(spec)?;
        info!(requested = %spec, negotiated = %negotiated, "Format set");
        Ok(negotiated)
    }

    pub fn get_format(&self) -> ServiceResult<FormatSpec> {
        self.ensure_open()?;
        Ok(lock_hal(&self.hal).get_format()?)
    }

    /// Start streaming into a new ring channel; returns its key.
    pub fn start_preview(&mut self, memory: PreviewMemory) -> ServiceResult<i32> {
        self.ensure_open()?;
        self.ensure_not_previewing("start_preview")?;

        let config = PreviewConfig {
            memory,
            ..self.preview_config
        };
        self.stats = Arc::new(SessionStats::default());
        let session = CaptureSession::new(
            Arc::clone(&self.hal),
            &config,
            self.notify.notifier()?,
            Arc::clone(&self.recorder),
            Arc::clone(&self.stats),
        )?;
        let key = session.channel_key();

        let controller =
            CaptureLoopController::start_with_state("preview", session, CaptureSession::step)?;
        self.preview = Some(ActivePreview { controller, key });
        info!(key = format_args!("{key:#x}"), ?memory, "Preview running");
        Ok(key)
    }

    /// Stop the capture thread and tear the session down.
    ///
    /// A raw capture still running is finished first.
    pub fn stop_preview(&mut self) -> ServiceResult<()> {
        let Some(mut preview) = self.preview.take() else {
            return Err(ServiceError::InvalidState("preview is not running".to_string()));
        };

        let session = preview.controller.stop();
        let recording = lock_recorder(&self.recorder).take();
        if let Some(recorder) = recording {
            match recorder.finish() {
                Ok(summary) => info!(frames = summary.frames, "Raw capture ended with preview"),
                Err(e) => warn!(error = %e, "Failed to finish raw capture"),
            }
        }

        match session {
            Some(mut session) => session.shutdown(),
            None => Err(ServiceError::IoFailure(
                "capture thread ended without its session".to_string(),
            )),
        }
    }

    /// Append raw frames to `output_path` while preview runs.
    pub fn start_capture(&mut self, spec: CaptureSpec, output_path: &Path) -> ServiceResult<()> {
        self.ensure_open()?;
        if self.preview.is_none() {
            return Err(ServiceError::InvalidState(
                "start_capture requires a running preview".to_string(),
            ));
        }
        let mut slot = lock_recorder(&self.recorder);
        if slot.is_some() {
            return Err(ServiceError::InvalidState(
                "capture already running".to_string(),
            ));
        }
        *slot = Some(RawRecorder::create(output_path, spec)?);
        Ok(())
    }

    /// Finish the running raw capture.
    pub fn stop_capture(&mut self) -> ServiceResult<RecordingSummary> {
        let recorder = lock_recorder(&self.recorder)
            .take()
            .ok_or_else(|| ServiceError::InvalidState("no capture running".to_string()))?;
        recorder.finish()
    }

    pub fn get_property(&self, id: u32) -> ServiceResult<i32> {
        self.ensure_open()?;
        Ok(lock_hal(&self.hal).get_property(id)?)
    }

    pub fn set_property(&mut self, id: u32, value: i32) -> ServiceResult<()> {
        self.ensure_open()?;
        lock_hal(&self.hal).set_property(id, value)?;
        Ok(())
    }

    /// Describe the device at `path`; works on closed handles.
    pub fn get_device_info(&self, path: &str) -> ServiceResult<DeviceInfo> {
        Ok(lock_hal(&self.hal).device_info(path)?)
    }
}

impl Drop for CameraHandle {
    fn drop(&mut self) {
        if self.path.is_some()
            && let Err(e) = self.close()
        {
            warn!(error = %e, "Failed to close camera handle on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ResultCode;

    #[test]
    fn test_unknown_backend() {
        assert!(matches!(
            CameraHandle::create("gstreamer"),
            Err(ServiceError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_operations_require_open() {
        let mut handle = CameraHandle::create("virtual").unwrap();
        let result = handle.start_preview(PreviewMemory::Mapped);
        assert_eq!(ResultCode::of(&result), ResultCode::InvalidState);
        assert!(handle.get_format().is_err());
        assert!(handle.close().is_err());
    }

    #[test]
    fn test_open_unknown_path() {
        let mut handle = CameraHandle::create("virtual").unwrap();
        let result = handle.open("/dev/video99", 0, NotifyTarget::None);
        assert_eq!(ResultCode::of(&result), ResultCode::DeviceNotFound);
        assert!(!handle.is_open());
    }

    #[test]
    fn test_bad_signal_target_rejected() {
        let mut handle = CameraHandle::create("virtual").unwrap();
        let result = handle.open(
            "virtual0",
            0,
            NotifyTarget::Signal {
                pid: 0,
                signal: libc::SIGUSR1,
            },
        );
        assert_eq!(ResultCode::of(&result), ResultCode::InvalidParameter);
    }

    #[test]
    fn test_device_info_without_open() {
        let handle = CameraHandle::create("virtual").unwrap();
        let info = handle.get_device_info("virtual0").unwrap();
        assert_eq!(info.driver, "virtual");
    }
}
