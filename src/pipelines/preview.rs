// SPDX-License-Identifier: GPL-3.0-only

//! Preview capture session
//!
//! One [`CaptureSession`] per previewing device. Each iteration waits for the
//! device, dequeues a frame, publishes it into the ring channel, wakes the
//! consumer, and releases the buffer back to the device. The buffer is
//! released on every path, including failed publishes.
//!
//! Two publish paths exist:
//! - copy (`Mapped`, `UserPointer`, `ExportedHandle`): the frame bytes are
//!   copied into the slot at `write_index`
//! - zero-copy (`SharedSlots`): the device wrote straight into the ring slot,
//!   so only the slot header is published

use super::FrameMeta;
use super::recording::{SharedRecorder, lock_recorder};
use crate::backends::camera::{
    CaptureBufferManager, FrameBuffer, FormatSpec, LoopAction, PreviewMemory, SharedHal, lock_hal,
};
use crate::constants::{self, capture, ring, timing};
use crate::errors::{ServiceError, ServiceResult};
use crate::notify::FrameNotifier;
use crate::ring::{ChannelMark, ChannelOptions, SharedRingChannel};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How a preview session sizes its buffers and channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewConfig {
    pub memory: PreviewMemory,
    /// Device buffers; also the slot count for `SharedSlots`
    pub buffer_count: u32,
    /// Ring slots for the copy path
    pub unit_num: u32,
    pub meta_size: u32,
    pub extra_size: u32,
    pub with_semaphore: bool,
    /// Device readiness wait per iteration
    pub timeout: Duration,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            memory: PreviewMemory::default(),
            buffer_count: capture::DEFAULT_BUFFER_COUNT,
            unit_num: ring::DEFAULT_UNIT_NUM,
            meta_size: ring::DEFAULT_META_SIZE,
            extra_size: 0,
            with_semaphore: false,
            timeout: constants::dequeue_timeout(),
        }
    }
}

/// Counters updated by the capture thread
#[derive(Debug, Default)]
pub struct SessionStats {
    frames_published: AtomicU64,
    frames_recorded: AtomicU64,
    recoverable_errors: AtomicU64,
    overflows: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_published: u64,
    pub frames_recorded: u64,
    pub recoverable_errors: u64,
    pub overflows: u64,
}

impl SessionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_published: self.frames_published.load(Ordering::Relaxed),
            frames_recorded: self.frames_recorded.load(Ordering::Relaxed),
            recoverable_errors: self.recoverable_errors.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
        }
    }
}

/// Publish one dequeued frame into the channel.
pub fn publish_frame(
    channel: &mut SharedRingChannel,
    memory: PreviewMemory,
    frame: &FrameBuffer<'_>,
    meta: Option<&[u8]>,
) -> ServiceResult<()> {
    match memory {
        PreviewMemory::SharedSlots => {
            channel.publish_header(frame.index, frame.length)?;
            if let Some(meta) = meta {
                channel.publish_meta(meta)?;
            }
            channel.advance_write_index()
        }
        _ => channel.write_copy(frame.data(), meta, None),
    }
}

/// Recording state as last signalled to readers through the channel mark
#[derive(Debug, Default)]
struct MarkState {
    recording: bool,
    reset_marked: bool,
}

impl MarkState {
    /// Flag a recording start or stop to readers for one frame.
    fn update(&mut self, channel: &SharedRingChannel, recording: bool) -> ServiceResult<()> {
        if recording != self.recording {
            self.recording = recording;
            channel.set_mark(ChannelMark::Reset)?;
            self.reset_marked = true;
        } else if self.reset_marked {
            channel.set_mark(ChannelMark::Normal)?;
            self.reset_marked = false;
        }
        Ok(())
    }
}

/// Device buffers plus the ring channel they publish into
pub struct CaptureSession {
    // Declared before `channel`: slot-backed buffers must go before the slots.
    buffers: CaptureBufferManager,
    channel: SharedRingChannel,
    memory: PreviewMemory,
    format: FormatSpec,
    meta_size: u32,
    timeout: Duration,
    notifier: Option<Box<dyn FrameNotifier>>,
    recorder: SharedRecorder,
    stats: Arc<SessionStats>,
    mark: MarkState,
    closed: bool,
}

impl CaptureSession {
    /// Create the channel, negotiate buffers, and start streaming.
    ///
    /// Everything acquired is released again if any step fails.
    pub fn new(
        hal: SharedHal,
        config: &PreviewConfig,
        notifier: Option<Box<dyn FrameNotifier>>,
        recorder: SharedRecorder,
        stats: Arc<SessionStats>,
    ) -> ServiceResult<Self> {
        let format = lock_hal(&hal).get_format()?;
        if format.size_image == 0 {
            return Err(ServiceError::InvalidState(format!(
                "device reports a zero frame size for {}",
                format
            )));
        }

        let unit_num = match config.memory {
            PreviewMemory::SharedSlots => config.buffer_count,
            _ => config.unit_num,
        };
        let mut channel = SharedRingChannel::create_with(ChannelOptions {
            unit_size: format.size_image,
            meta_size: config.meta_size,
            unit_num,
            extra_size: config.extra_size,
            with_semaphore: config.with_semaphore,
        })?;

        let mut buffers = CaptureBufferManager::new(hal);
        match config.memory {
            PreviewMemory::SharedSlots => {
                let slots = channel
                    .export_slots(unit_num, false)?
                    .into_iter()
                    .map(|slot| slot.payload)
                    .collect();
                buffers.request_slot_buffers(slots)?;
            }
            memory => {
                buffers.request_buffers(config.buffer_count, memory.io_mode())?;
            }
        }
        buffers.start_capture()?;

        info!(
            key = format_args!("{:#x}", channel.key()),
            format = %format,
            memory = ?config.memory,
            buffers = buffers.buffer_count(),
            "Preview session started"
        );

        let recording = lock_recorder(&recorder).is_some();
        Ok(Self {
            buffers,
            channel,
            memory: config.memory,
            format,
            meta_size: config.meta_size,
            timeout: config.timeout,
            notifier,
            recorder,
            stats,
            mark: MarkState {
                recording,
                reset_marked: false,
            },
            closed: false,
        })
    }

    /// Key consumers attach to.
    pub fn channel_key(&self) -> i32 {
        self.channel.key()
    }

    pub fn channel(&self) -> &SharedRingChannel {
        &self.channel
    }

    pub fn buffers(&self) -> &CaptureBufferManager {
        &self.buffers
    }

    pub fn format(&self) -> &FormatSpec {
        &self.format
    }

    /// Dequeue, publish, notify, then release one frame.
    ///
    /// Returns the device sequence number of the published frame.
    pub fn run_once(&mut self) -> ServiceResult<u64> {
        let frame = self.buffers.dequeue(self.timeout)?;
        let index = frame.index;
        let sequence = frame.sequence as u64;

        let published = if frame.length == 0 {
            debug!(index, "Device returned an empty buffer");
            Err(ServiceError::NoData)
        } else {
            let meta = FrameMeta {
                sequence,
                timestamp_ns: frame.timestamp_ns,
                width: self.format.width,
                height: self.format.height,
                fourcc: self.format.fourcc_code().unwrap_or(0),
                bytes_used: frame.length,
            };
            let meta = FrameMeta::fits(self.meta_size).then_some(meta);
            publish_frame(
                &mut self.channel,
                self.memory,
                &frame,
                meta.as_ref().map(FrameMeta::encode),
            )
        };

        // Readers hear about the frame while its device buffer is still held,
        // so a slot-backed buffer cannot be refilled before the wake-up.
        let notified = published.and_then(|()| {
            let recording = record_frame(&self.recorder, &self.stats, frame.data());
            self.mark.update(&self.channel, recording)?;
            if let Some(notifier) = &self.notifier
                && let Err(e) = notifier.notify(sequence)
            {
                warn!(sequence, error = %e, "Failed to notify consumer");
            }
            Ok(())
        });

        drop(frame);
        let released = self.buffers.release(index);
        notified?;
        released?;

        self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
        Ok(sequence)
    }

    /// One loop iteration for [`CaptureLoopController`](crate::backends::camera::CaptureLoopController).
    pub fn step(&mut self) -> LoopAction {
        match self.run_once() {
            Ok(sequence) => {
                if sequence % timing::FRAME_LOG_INTERVAL == 0 {
                    debug!(
                        sequence,
                        published = self.stats.frames_published.load(Ordering::Relaxed),
                        "Preview frame published"
                    );
                }
                LoopAction::Continue
            }
            Err(ServiceError::Overflow) => {
                warn!("Ring write index overflowed and was reset");
                self.stats.overflows.fetch_add(1, Ordering::Relaxed);
                LoopAction::Continue
            }
            Err(e) if e.is_recoverable() => {
                debug!(error = %e, "Recoverable capture error");
                self.stats.recoverable_errors.fetch_add(1, Ordering::Relaxed);
                LoopAction::Continue
            }
            Err(e) => {
                error!(error = %e, "Preview session failed");
                LoopAction::Stop
            }
        }
    }

    /// Mark the channel terminated, stop streaming, free buffers, close the channel.
    ///
    /// Every step runs even if an earlier one fails; the first error is returned.
    pub fn shutdown(&mut self) -> ServiceResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_error = None;
        let mut keep = |result: ServiceResult<()>, step: &str| {
            if let Err(e) = result {
                warn!(step, error = %e, "Preview teardown step failed");
                first_error.get_or_insert(e);
            }
        };

        keep(self.channel.set_mark(ChannelMark::Terminate), "mark");
        // Wake readers so they observe the mark instead of timing out.
        if let Some(notifier) = &self.notifier {
            keep(notifier.notify(u64::MAX), "notify");
        }
        keep(self.buffers.stop_capture(), "stop_capture");
        keep(self.buffers.destroy_buffers(), "destroy_buffers");
        keep(self.channel.close(), "close");

        info!(
            key = format_args!("{:#x}", self.channel.key()),
            stats = ?self.stats.snapshot(),
            "Preview session stopped"
        );
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if !self.closed
            && let Err(e) = self.shutdown()
        {
            warn!(error = %e, "Failed to shut down preview session on drop");
        }
    }
}

/// Append a frame to the active recording, if any.
///
/// Returns whether a recording is active. A failing recorder is dropped so
/// the preview keeps running.
fn record_frame(recorder: &SharedRecorder, stats: &SessionStats, data: &[u8]) -> bool {
    let mut guard = lock_recorder(recorder);
    let Some(active) = guard.as_mut() else {
        return false;
    };
    match active.write_frame(data) {
        Ok(true) => {
            stats.frames_recorded.fetch_add(1, Ordering::Relaxed);
            true
        }
        Ok(false) => true,
        Err(e) => {
            error!(error = %e, "Raw capture failed, dropping recorder");
            *guard = None;
            false
        }
    }
}
