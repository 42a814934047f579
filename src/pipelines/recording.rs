// SPDX-License-Identifier: GPL-3.0-only

//! Raw frame recording
//!
//! While preview runs, every published frame can also be appended to a file
//! as-is. The capture thread writes through a [`SharedRecorder`] slot that
//! the service fills on `start_capture` and empties on `stop_capture`.

use crate::errors::{ServiceError, ServiceResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Options for a raw capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSpec {
    /// Stop appending after this many frames
    pub max_frames: Option<u64>,
}

/// What a finished recording wrote
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub frames: u64,
    pub bytes: u64,
}

/// Recorder slot shared between the service and the capture thread
pub type SharedRecorder = Arc<Mutex<Option<RawRecorder>>>;

/// Lock a recorder slot, recovering from a poisoned lock.
pub fn lock_recorder(recorder: &SharedRecorder) -> MutexGuard<'_, Option<RawRecorder>> {
    recorder
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Appends frame payloads back to back to one file
pub struct RawRecorder {
    writer: BufWriter<File>,
    path: PathBuf,
    spec: CaptureSpec,
    frames: u64,
    bytes: u64,
}

impl RawRecorder {
    /// Create (or truncate) `path`.
    pub fn create(path: &Path, spec: CaptureSpec) -> ServiceResult<Self> {
        if spec.max_frames == Some(0) {
            return Err(ServiceError::InvalidParameter(
                "max_frames must be at least 1".to_string(),
            ));
        }
        let file = File::create(path).map_err(|e| {
            ServiceError::IoFailure(format!("create {}: {}", path.display(), e))
        })?;
        info!(path = %path.display(), max_frames = ?spec.max_frames, "Started raw capture");
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            spec,
            frames: 0,
            bytes: 0,
        })
    }

    /// Whether the frame limit has been reached.
    pub fn is_full(&self) -> bool {
        self.spec.max_frames.is_some_and(|max| self.frames >= max)
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Append one frame; returns `false` once the limit is reached.
    pub fn write_frame(&mut self, data: &[u8]) -> ServiceResult<bool> {
        if self.is_full() {
            return Ok(false);
        }
        self.writer.write_all(data).map_err(|e| {
            ServiceError::IoFailure(format!("write {}: {}", self.path.display(), e))
        })?;
        self.frames += 1;
        self.bytes += data.len() as u64;
        if self.is_full() {
            debug!(path = %self.path.display(), frames = self.frames, "Raw capture limit reached");
        }
        Ok(true)
    }

    /// Flush and close the file.
    pub fn finish(mut self) -> ServiceResult<RecordingSummary> {
        self.writer.flush().map_err(|e| {
            ServiceError::IoFailure(format!("flush {}: {}", self.path.display(), e))
        })?;
        info!(
            path = %self.path.display(),
            frames = self.frames,
            bytes = self.bytes,
            "Raw capture saved"
        );
        Ok(RecordingSummary {
            path: self.path,
            frames: self.frames,
            bytes: self.bytes,
        })
    }
}
