// SPDX-License-Identifier: GPL-3.0-only

//! Capture buffer pool
//!
//! [`CaptureBufferManager`] negotiates a fixed pool of device buffers in one
//! [`IoMode`] and cycles them:
//!
//! ```text
//! Idle ──request_buffers──▶ Negotiated ──start_capture──▶ Streaming
//!  ▲                            │                          │  ▲
//!  │                            │               dequeue/release
//!  └───────destroy_buffers──────┴──── Stopped ◀─stop_capture┘
//! ```
//!
//! `release(index)` is the backpressure point: a dequeued buffer is not
//! refilled until it is released, so at most `count` frames are in flight.

use super::io_modes::{IoStrategy, strategy_for};
use super::mapping::ExportedMapping;
use super::types::IoMode;
use super::{SharedHal, lock_hal, wait_readable};
use crate::constants::capture::MAX_BUFFER_COUNT;
use crate::errors::{ServiceError, ServiceResult};
use crate::ring::SlotRegion;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Position in the buffer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Idle,
    Negotiated,
    Streaming,
    Stopped,
}

/// Bytes of a dequeued buffer, shaped by the I/O mode
#[derive(Debug)]
pub enum FramePayload<'a> {
    /// View of the manager's mapping of device memory
    Mapped(&'a [u8]),
    /// View of the host block the device wrote into
    UserPointer(&'a [u8]),
    /// Transient mapping of the exported buffer; unmapped on drop
    Exported(ExportedMapping),
}

/// A completed buffer handed out by [`CaptureBufferManager::dequeue`]
#[derive(Debug)]
pub struct FrameBuffer<'a> {
    pub index: u32,
    /// Bytes the device wrote
    pub length: u32,
    pub sequence: u32,
    pub timestamp_ns: u64,
    pub payload: FramePayload<'a>,
}

impl FrameBuffer<'_> {
    pub fn data(&self) -> &[u8] {
        match &self.payload {
            FramePayload::Mapped(bytes) | FramePayload::UserPointer(bytes) => bytes,
            FramePayload::Exported(mapping) => mapping.as_slice(),
        }
    }
}

/// Owns the device buffer pool for one capture session.
pub struct CaptureBufferManager {
    hal: SharedHal,
    state: BufferState,
    strategy: Option<Box<dyn IoStrategy>>,
    /// Per-buffer: currently owned by the device
    queued: Vec<bool>,
    live_mappings: Arc<AtomicUsize>,
}

impl CaptureBufferManager {
    pub fn new(hal: SharedHal) -> Self {
        Self {
            hal,
            state: BufferState::Idle,
            strategy: None,
            queued: Vec::new(),
            live_mappings: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn io_mode(&self) -> Option<IoMode> {
        self.strategy.as_ref().map(|s| s.mode())
    }

    /// Number of negotiated buffers.
    pub fn buffer_count(&self) -> u32 {
        self.queued.len() as u32
    }

    /// Buffers currently held by the caller (dequeued, not yet released).
    pub fn in_flight(&self) -> usize {
        match self.state {
            BufferState::Streaming => self.queued.iter().filter(|q| !**q).count(),
            _ => 0,
        }
    }

    /// Process mappings currently alive (pool mappings plus exported frames).
    pub fn live_mappings(&self) -> usize {
        self.live_mappings.load(Ordering::SeqCst)
    }

    fn expect_state(&self, allowed: &[BufferState], op: &str) -> ServiceResult<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(ServiceError::InvalidState(format!(
            "{} not allowed in {:?} state",
            op, self.state
        )))
    }

    /// Negotiate `count` buffers in `mode`.
    pub fn request_buffers(&mut self, count: u32, mode: IoMode) -> ServiceResult<u32> {
        self.negotiate(count, mode, None)
    }

    /// Negotiate `UserPointer` buffers backed by ring channel slots.
    pub fn request_slot_buffers(&mut self, slots: Vec<SlotRegion>) -> ServiceResult<u32> {
        let count = slots.len() as u32;
        self.negotiate(count, IoMode::UserPointer, Some(slots))
    }

    fn negotiate(
        &mut self,
        count: u32,
        mode: IoMode,
        slots: Option<Vec<SlotRegion>>,
    ) -> ServiceResult<u32> {
        self.expect_state(&[BufferState::Idle], "request_buffers")?;
        if count == 0 || count > MAX_BUFFER_COUNT {
            return Err(ServiceError::InvalidParameter(format!(
                "buffer count {} outside 1..={}",
                count, MAX_BUFFER_COUNT
            )));
        }

        let shared_slots = slots.is_some();
        let mut strategy = strategy_for(mode, slots, &self.live_mappings);
        let mut hal = lock_hal(&self.hal);

        let granted = hal.request_buffers(count, mode)?;
        if granted == 0 {
            return Err(ServiceError::IoFailure(format!(
                "device granted no {} buffers",
                mode
            )));
        }
        if granted != count {
            if shared_slots {
                if let Err(free_err) = hal.request_buffers(0, mode) {
                    warn!(error = %free_err, "Failed to release device buffers");
                }
                return Err(ServiceError::CountMismatch {
                    expected: count,
                    requested: granted,
                });
            }
            warn!(requested = count, granted, %mode, "Device granted a different buffer count");
        }

        if let Err(e) = strategy.allocate(&**hal, granted) {
            warn!(error = %e, %mode, "Buffer setup failed, releasing device buffers");
            if let Err(free_err) = hal.request_buffers(0, mode) {
                warn!(error = %free_err, "Failed to release device buffers");
            }
            return Err(e);
        }
        drop(hal);

        info!(count = granted, %mode, shared_slots, "Capture buffers negotiated");
        self.strategy = Some(strategy);
        self.queued = vec![false; granted as usize];
        self.state = BufferState::Negotiated;
        Ok(granted)
    }

    /// Queue every buffer and turn streaming on.
    ///
    /// On failure the pool stays negotiated; `destroy_buffers` cleans up.
    pub fn start_capture(&mut self) -> ServiceResult<()> {
        self.expect_state(&[BufferState::Negotiated], "start_capture")?;
        let strategy = self
            .strategy
            .as_mut()
            .ok_or_else(|| ServiceError::InvalidState("no buffer strategy".to_string()))?;

        let mut hal = lock_hal(&self.hal);
        strategy.enqueue_all(&mut **hal)?;
        self.queued.iter_mut().for_each(|q| *q = true);
        hal.start_streaming()?;
        drop(hal);

        self.state = BufferState::Streaming;
        debug!(mode = %strategy.mode(), buffers = self.queued.len(), "Streaming started");
        Ok(())
    }

    /// Wait up to `timeout` for a completed buffer.
    ///
    /// The buffer stays with the caller until [`release`](Self::release).
    pub fn dequeue(&mut self, timeout: Duration) -> ServiceResult<FrameBuffer<'_>> {
        self.expect_state(&[BufferState::Streaming], "dequeue")?;

        // Wait without holding the device lock so property calls stay responsive.
        let fd = lock_hal(&self.hal).pollable_handle()?;
        if !wait_readable(fd, timeout)? {
            return Err(ServiceError::NoData);
        }
        let dequeued = lock_hal(&self.hal).dequeue(Duration::ZERO)?;

        let index = dequeued.index;
        let count = self.queued.len();
        let queued = self.queued.get_mut(index as usize).ok_or_else(|| {
            ServiceError::IoFailure(format!(
                "device returned buffer {} but only {} exist",
                index, count
            ))
        })?;
        *queued = false;

        let strategy = self
            .strategy
            .as_mut()
            .ok_or_else(|| ServiceError::InvalidState("no buffer strategy".to_string()))?;
        let transient = match strategy.map_transient(&dequeued) {
            Ok(transient) => transient,
            Err(e) => {
                // Hand the buffer straight back so the pool does not shrink.
                warn!(index, error = %e, "Failed to map dequeued buffer");
                let mut hal = lock_hal(&self.hal);
                if strategy.requeue(&mut **hal, index).is_ok() {
                    *queued = true;
                }
                return Err(e);
            }
        };

        let payload = match transient {
            Some(mapping) => FramePayload::Exported(mapping),
            None => strategy.view(&dequeued).ok_or_else(|| {
                ServiceError::IoFailure(format!("buffer {} has no host view", index))
            })?,
        };

        Ok(FrameBuffer {
            index: dequeued.index,
            length: dequeued.bytes_used,
            sequence: dequeued.sequence,
            timestamp_ns: dequeued.timestamp_ns,
            payload,
        })
    }

    /// Give buffer `index` back to the device.
    pub fn release(&mut self, index: u32) -> ServiceResult<()> {
        self.expect_state(&[BufferState::Streaming], "release")?;
        let count = self.queued.len();
        let queued = self.queued.get_mut(index as usize).ok_or_else(|| {
            ServiceError::InvalidParameter(format!("buffer {} outside pool of {}", index, count))
        })?;
        if *queued {
            return Err(ServiceError::InvalidState(format!(
                "buffer {} is already queued",
                index
            )));
        }

        let strategy = self
            .strategy
            .as_mut()
            .ok_or_else(|| ServiceError::InvalidState("no buffer strategy".to_string()))?;
        let mut hal = lock_hal(&self.hal);
        strategy.requeue(&mut **hal, index)?;
        *queued = true;
        Ok(())
    }

    /// Turn streaming off. Buffers stay allocated.
    pub fn stop_capture(&mut self) -> ServiceResult<()> {
        self.expect_state(&[BufferState::Streaming], "stop_capture")?;
        let result = lock_hal(&self.hal).stop_streaming();
        // The device drops its queue on stream-off even when it reports an error.
        self.queued.iter_mut().for_each(|q| *q = false);
        self.state = BufferState::Stopped;
        result?;
        debug!("Streaming stopped");
        Ok(())
    }

    /// Free host-side resources and the device pool.
    pub fn destroy_buffers(&mut self) -> ServiceResult<()> {
        self.expect_state(
            &[BufferState::Negotiated, BufferState::Stopped],
            "destroy_buffers",
        )?;
        let mode = self.io_mode();
        if let Some(mut strategy) = self.strategy.take() {
            strategy.release();
        }
        self.queued.clear();
        self.state = BufferState::Idle;

        if let Some(mode) = mode {
            lock_hal(&self.hal).request_buffers(0, mode)?;
        }
        debug!(live_mappings = self.live_mappings(), "Capture buffers destroyed");
        Ok(())
    }
}

impl Drop for CaptureBufferManager {
    fn drop(&mut self) {
        if self.state == BufferState::Streaming
            && let Err(e) = self.stop_capture()
        {
            warn!(error = %e, "Failed to stop streaming on drop");
        }
        if matches!(self.state, BufferState::Negotiated | BufferState::Stopped)
            && let Err(e) = self.destroy_buffers()
        {
            warn!(error = %e, "Failed to destroy buffers on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::types::{
        BufferPlacement, DeviceInfo, Dequeued, EnqueuePayload, FormatSpec, Framerate, HalError,
        HalResult,
    };
    use crate::backends::camera::v4l2_controls::V4L2_CID_BRIGHTNESS;
    use crate::backends::camera::virtual_device::VirtualDevice;
    use crate::backends::camera::{DeviceHal, share};
    use crate::ring::SharedRingChannel;
    use std::os::unix::io::{OwnedFd, RawFd};
    use std::sync::Mutex;
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_millis(500);

    fn virtual_hal() -> SharedHal {
        let mut dev = VirtualDevice::new();
        dev.open("virtual0").unwrap();
        dev.set_format(&FormatSpec::new(32, 8, "GREY")).unwrap();
        share(Box::new(dev))
    }

    fn cycle(mode: IoMode) {
        let hal = virtual_hal();
        let mut manager = CaptureBufferManager::new(hal);
        assert_eq!(manager.request_buffers(3, mode).unwrap(), 3);
        manager.start_capture().unwrap();

        for expected in 0..6u64 {
            let frame = manager.dequeue(TIMEOUT).unwrap();
            assert_eq!(frame.length, 256);
            assert_eq!(frame.data().len(), 256);
            assert_eq!(&frame.data()[..8], &expected.to_le_bytes());
            let index = frame.index;
            drop(frame);
            manager.release(index).unwrap();
        }

        manager.stop_capture().unwrap();
        manager.destroy_buffers().unwrap();
        assert_eq!(manager.live_mappings(), 0);
        assert_eq!(manager.state(), BufferState::Idle);
    }

    #[test]
    fn test_mapped_cycle() {
        cycle(IoMode::Mapped);
    }

    #[test]
    fn test_user_pointer_cycle() {
        cycle(IoMode::UserPointer);
    }

    #[test]
    fn test_exported_cycle() {
        cycle(IoMode::ExportedHandle);
    }

    #[test]
    fn test_exported_mapping_lives_until_dropped() {
        let mut manager = CaptureBufferManager::new(virtual_hal());
        manager.request_buffers(2, IoMode::ExportedHandle).unwrap();
        manager.start_capture().unwrap();

        let frame = manager.dequeue(TIMEOUT).unwrap();
        assert!(matches!(frame.payload, FramePayload::Exported(_)));
        let index = frame.index;
        drop(frame);
        assert_eq!(manager.live_mappings(), 0);
        manager.release(index).unwrap();
    }

    #[test]
    fn test_mapped_pool_is_mapped_until_destroy() {
        let mut manager = CaptureBufferManager::new(virtual_hal());
        manager.request_buffers(4, IoMode::Mapped).unwrap();
        assert_eq!(manager.live_mappings(), 4);
        manager.destroy_buffers().unwrap();
        assert_eq!(manager.live_mappings(), 0);
    }

    #[test]
    fn test_state_machine_rejects_out_of_order_calls() {
        let mut manager = CaptureBufferManager::new(virtual_hal());
        assert!(matches!(
            manager.dequeue(TIMEOUT),
            Err(ServiceError::InvalidState(_))
        ));
        assert!(matches!(
            manager.release(0),
            Err(ServiceError::InvalidState(_))
        ));
        assert!(matches!(
            manager.destroy_buffers(),
            Err(ServiceError::InvalidState(_))
        ));

        manager.request_buffers(2, IoMode::Mapped).unwrap();
        assert!(matches!(
            manager.request_buffers(2, IoMode::Mapped),
            Err(ServiceError::InvalidState(_))
        ));
        assert!(matches!(
            manager.stop_capture(),
            Err(ServiceError::InvalidState(_))
        ));
    }

    #[test]
    fn test_release_twice_is_rejected() {
        let mut manager = CaptureBufferManager::new(virtual_hal());
        manager.request_buffers(2, IoMode::Mapped).unwrap();
        manager.start_capture().unwrap();
        let index = manager.dequeue(TIMEOUT).unwrap().index;
        assert_eq!(manager.in_flight(), 1);
        manager.release(index).unwrap();
        assert!(matches!(
            manager.release(index),
            Err(ServiceError::InvalidState(_))
        ));
        assert!(matches!(
            manager.release(9),
            Err(ServiceError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_backpressure_caps_in_flight_buffers() {
        let mut manager = CaptureBufferManager::new(virtual_hal());
        manager.request_buffers(2, IoMode::Mapped).unwrap();
        manager.start_capture().unwrap();
        let _ = manager.dequeue(TIMEOUT).unwrap().index;
        let _ = manager.dequeue(TIMEOUT).unwrap().index;
        assert!(matches!(
            manager.dequeue(Duration::from_millis(20)),
            Err(ServiceError::NoData)
        ));
    }

    #[test]
    fn test_rejects_bad_counts() {
        let mut manager = CaptureBufferManager::new(virtual_hal());
        assert!(matches!(
            manager.request_buffers(0, IoMode::Mapped),
            Err(ServiceError::InvalidParameter(_))
        ));
        assert!(matches!(
            manager.request_buffers(MAX_BUFFER_COUNT + 1, IoMode::Mapped),
            Err(ServiceError::InvalidParameter(_))
        ));
        assert_eq!(manager.state(), BufferState::Idle);
    }

    #[test]
    fn test_drop_tears_down_streaming_pool() {
        let hal = virtual_hal();
        {
            let mut manager = CaptureBufferManager::new(Arc::clone(&hal));
            manager.request_buffers(2, IoMode::Mapped).unwrap();
            manager.start_capture().unwrap();
        }
        let mut dev = lock_hal(&hal);
        assert_eq!(
            dev.dequeue(Duration::from_millis(10)),
            Err(HalError::Io("not streaming".to_string()))
        );
        assert!(dev.query_buffer(0).is_err());
    }

    /// Virtual device that fails buffer setup part way through and logs
    /// every pool request it receives.
    struct FaultyDevice {
        inner: VirtualDevice,
        fail_query_at: Option<u32>,
        zero_frame_size: bool,
        max_grant: Option<u32>,
        pool_requests: Arc<Mutex<Vec<(u32, IoMode)>>>,
    }

    impl FaultyDevice {
        fn new() -> (Self, Arc<Mutex<Vec<(u32, IoMode)>>>) {
            let mut inner = VirtualDevice::new();
            inner.open("virtual0").unwrap();
            inner.set_format(&FormatSpec::new(32, 8, "GREY")).unwrap();
            let pool_requests = Arc::new(Mutex::new(Vec::new()));
            let device = Self {
                inner,
                fail_query_at: None,
                zero_frame_size: false,
                max_grant: None,
                pool_requests: Arc::clone(&pool_requests),
            };
            (device, pool_requests)
        }
    }

    impl DeviceHal for FaultyDevice {
        fn name(&self) -> &'static str {
            "faulty"
        }
        fn open(&mut self, path: &str) -> HalResult<()> {
            self.inner.open(path)
        }
        fn close(&mut self) -> HalResult<()> {
            self.inner.close()
        }
        fn is_open(&self) -> bool {
            self.inner.is_open()
        }
        fn set_format(&mut self, spec: &FormatSpec) -> HalResult<FormatSpec> {
            self.inner.set_format(spec)
        }
        fn get_format(&self) -> HalResult<FormatSpec> {
            let mut format = self.inner.get_format()?;
            if self.zero_frame_size {
                format.size_image = 0;
            }
            Ok(format)
        }
        fn request_buffers(&mut self, count: u32, mode: IoMode) -> HalResult<u32> {
            self.pool_requests.lock().unwrap().push((count, mode));
            let count = self.max_grant.map_or(count, |max| count.min(max));
            self.inner.request_buffers(count, mode)
        }
        fn query_buffer(&self, index: u32) -> HalResult<BufferPlacement> {
            if self.fail_query_at == Some(index) {
                return Err(HalError::Io(format!("injected failure at buffer {index}")));
            }
            self.inner.query_buffer(index)
        }
        fn enqueue(&mut self, index: u32, payload: EnqueuePayload) -> HalResult<()> {
            self.inner.enqueue(index, payload)
        }
        fn dequeue(&mut self, timeout: Duration) -> HalResult<Dequeued> {
            self.inner.dequeue(timeout)
        }
        fn export_buffer(&mut self, index: u32) -> HalResult<OwnedFd> {
            self.inner.export_buffer(index)
        }
        fn start_streaming(&mut self) -> HalResult<()> {
            self.inner.start_streaming()
        }
        fn stop_streaming(&mut self) -> HalResult<()> {
            self.inner.stop_streaming()
        }
        fn pollable_handle(&self) -> HalResult<RawFd> {
            self.inner.pollable_handle()
        }
        fn get_property(&self, id: u32) -> HalResult<i32> {
            self.inner.get_property(id)
        }
        fn set_property(&mut self, id: u32, value: i32) -> HalResult<()> {
            self.inner.set_property(id, value)
        }
        fn device_info(&self, path: &str) -> HalResult<DeviceInfo> {
            self.inner.device_info(path)
        }
    }

    #[test]
    fn test_partial_mapping_failure_unwinds() {
        let (mut device, pool_requests) = FaultyDevice::new();
        device.fail_query_at = Some(2);
        let mut manager = CaptureBufferManager::new(share(Box::new(device)));

        assert!(matches!(
            manager.request_buffers(4, IoMode::Mapped),
            Err(ServiceError::IoFailure(_))
        ));
        // Buffers 0 and 1 were mapped before the failure
        assert_eq!(manager.live_mappings(), 0);
        assert_eq!(manager.state(), BufferState::Idle);
        assert_eq!(
            *pool_requests.lock().unwrap(),
            vec![(4, IoMode::Mapped), (0, IoMode::Mapped)]
        );

        // Nothing left behind: a pool that stops short of the bad buffer works
        assert_eq!(manager.request_buffers(2, IoMode::Mapped).unwrap(), 2);
        assert_eq!(manager.live_mappings(), 2);
        manager.destroy_buffers().unwrap();
        assert_eq!(manager.live_mappings(), 0);
    }

    #[test]
    fn test_user_pointer_setup_failure_frees_device_pool() {
        let (mut device, pool_requests) = FaultyDevice::new();
        device.zero_frame_size = true;
        let mut manager = CaptureBufferManager::new(share(Box::new(device)));

        assert!(matches!(
            manager.request_buffers(3, IoMode::UserPointer),
            Err(ServiceError::InvalidState(_))
        ));
        assert_eq!(manager.state(), BufferState::Idle);
        assert_eq!(manager.buffer_count(), 0);
        assert_eq!(
            *pool_requests.lock().unwrap(),
            vec![(3, IoMode::UserPointer), (0, IoMode::UserPointer)]
        );
    }

    #[test]
    fn test_short_grant_for_shared_slots_frees_device_pool() {
        let (mut device, pool_requests) = FaultyDevice::new();
        device.max_grant = Some(2);
        let mut manager = CaptureBufferManager::new(share(Box::new(device)));

        let mut channel = SharedRingChannel::create(256, 0, 3, 0).unwrap();
        let slots = channel
            .export_slots(3, false)
            .unwrap()
            .into_iter()
            .map(|slot| slot.payload)
            .collect();
        assert!(matches!(
            manager.request_slot_buffers(slots),
            Err(ServiceError::CountMismatch {
                expected: 3,
                requested: 2
            })
        ));
        assert_eq!(manager.state(), BufferState::Idle);
        assert_eq!(
            *pool_requests.lock().unwrap(),
            vec![(3, IoMode::UserPointer), (0, IoMode::UserPointer)]
        );
    }

    #[test]
    fn test_properties_not_blocked_by_waiting_dequeue() {
        let mut device = VirtualDevice::new();
        device.open("virtual0").unwrap();
        let mut format = FormatSpec::new(32, 8, "GREY");
        format.framerate = Some(Framerate::from_int(1));
        device.set_format(&format).unwrap();
        let hal = share(Box::new(device));

        let mut manager = CaptureBufferManager::new(Arc::clone(&hal));
        manager.request_buffers(1, IoMode::Mapped).unwrap();
        manager.start_capture().unwrap();
        let index = manager.dequeue(TIMEOUT).unwrap().index;
        manager.release(index).unwrap();

        // The next frame is a second away; the capture thread waits for it
        let capture = std::thread::spawn(move || {
            let index = manager.dequeue(Duration::from_secs(3)).unwrap().index;
            manager.release(index).unwrap();
            manager
        });
        std::thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        lock_hal(&hal).set_property(V4L2_CID_BRIGHTNESS, 90).unwrap();
        assert_eq!(lock_hal(&hal).get_property(V4L2_CID_BRIGHTNESS).unwrap(), 90);
        assert!(start.elapsed() < Duration::from_millis(500));

        let mut manager = capture.join().unwrap();
        manager.stop_capture().unwrap();
        manager.destroy_buffers().unwrap();
    }
}
