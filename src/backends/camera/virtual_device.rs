// SPDX-License-Identifier: GPL-3.0-only

//! Software capture device
//!
//! Implements the whole device contract in memory so buffer management and
//! the capture session run without hardware. Buffers live in memfds and are
//! really `mmap`ed; readiness is a one-shot `timerfd` armed for the next
//! frame while a buffer is queued, so frames arrive at the format's framerate
//! and the session's poll-based wait works unchanged.
//!
//! Each produced frame starts with its sequence number as a little-endian
//! `u64`, followed by bytes equal to the low byte of the sequence.

use super::mapping::MappedRegion;
use super::types::*;
use super::v4l2_controls::{ControlInfo, builtin_controls};
use super::{DeviceHal, wait_readable};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Paths the virtual backend answers to start with this prefix
pub const VIRTUAL_PATH_PREFIX: &str = "virtual";

const PAGE_SIZE: usize = 4096;

/// FourCCs the virtual device produces
const SUPPORTED_FOURCCS: &[&str] = &["YUYV", "GREY", "RGB3", "NV12"];

enum Backing {
    /// Slice of the shared pool memfd
    Pool { offset: usize },
    /// Address supplied with each enqueue
    User { addr: Option<usize> },
    /// Dedicated memfd, mapped for filling
    Exported { file: File, map: MappedRegion },
}

struct VirtualBuffer {
    backing: Backing,
}

/// In-memory implementation of [`DeviceHal`]
pub struct VirtualDevice {
    path: Option<String>,
    format: FormatSpec,
    mode: Option<IoMode>,
    buffers: Vec<VirtualBuffer>,
    pool: Option<(File, MappedRegion)>,
    queue: VecDeque<u32>,
    /// timerfd that expires when the head of `queue` completes
    ready: Option<OwnedFd>,
    armed: bool,
    streaming: bool,
    sequence: u32,
    /// Earliest time the next frame may complete
    next_frame_at: Option<Instant>,
    properties: HashMap<u32, (i32, ControlInfo)>,
}

impl Default for VirtualDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualDevice {
    pub fn new() -> Self {
        let mut format = FormatSpec::default();
        fill_sizes(&mut format);
        Self {
            path: None,
            format,
            mode: None,
            buffers: Vec::new(),
            pool: None,
            queue: VecDeque::new(),
            ready: None,
            armed: false,
            streaming: false,
            sequence: 0,
            next_frame_at: None,
            properties: builtin_controls()
                .map(|info| (info.id, (info.default_value, info)))
                .collect(),
        }
    }

    fn ensure_open(&self) -> HalResult<()> {
        if self.path.is_none() {
            return Err(HalError::Io("device not open".to_string()));
        }
        Ok(())
    }

    fn frame_len(&self) -> usize {
        self.format.size_image as usize
    }

    /// Pool stride; mmap offsets must be page aligned.
    fn stride(&self) -> usize {
        self.frame_len().div_ceil(PAGE_SIZE) * PAGE_SIZE
    }

    fn free_buffers(&mut self) {
        self.buffers.clear();
        self.pool = None;
        self.queue.clear();
        self.mode = None;
    }

    fn frame_interval(&self) -> Option<Duration> {
        self.format
            .framerate
            .filter(|r| r.num > 0)
            .map(|r| Duration::from_secs_f64(r.denom as f64 / r.num as f64))
    }

    /// Arm the timer for the next queued buffer, no earlier than one frame
    /// interval after the previous frame.
    fn schedule(&mut self) -> HalResult<()> {
        if !self.streaming || self.armed || self.queue.is_empty() {
            return Ok(());
        }
        let Some(fd) = &self.ready else {
            return Ok(());
        };
        let delay = self
            .next_frame_at
            .map(|due| due.saturating_duration_since(Instant::now()))
            .unwrap_or_default();
        // A zero expiry would disarm the timer.
        set_timer(fd, delay.max(Duration::from_nanos(1)))?;
        self.armed = true;
        Ok(())
    }

    fn disarm(&mut self) -> HalResult<()> {
        if let Some(fd) = &self.ready {
            set_timer(fd, Duration::ZERO)?;
        }
        self.armed = false;
        Ok(())
    }

    /// Consume an expired timer; `false` if no frame is due yet.
    fn take_ready(&mut self) -> HalResult<bool> {
        let Some(fd) = &self.ready else {
            return Ok(false);
        };
        let mut expirations: u64 = 0;
        // SAFETY: reads 8 bytes into a valid u64.
        let rc = unsafe {
            libc::read(
                fd.as_raw_fd(),
                &mut expirations as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(false);
            }
            return Err(HalError::Io(format!("timerfd read: {err}")));
        }
        self.armed = false;
        Ok(true)
    }

    fn buffer_target(&self, index: u32) -> HalResult<*mut u8> {
        let buffer = &self.buffers[index as usize];
        match &buffer.backing {
            Backing::Pool { offset } => {
                let (_, map) = self
                    .pool
                    .as_ref()
                    .ok_or_else(|| HalError::BadBuffer("buffer pool missing".to_string()))?;
                // SAFETY: offset + frame_len lies inside the pool mapping.
                Ok(unsafe { map.as_ptr().add(*offset) })
            }
            Backing::User { addr } => addr
                .map(|a| a as *mut u8)
                .ok_or_else(|| HalError::BadBuffer(format!("buffer {index} has no address"))),
            Backing::Exported { map, .. } => Ok(map.as_ptr()),
        }
    }

    fn fill(&self, index: u32, sequence: u32) -> HalResult<u32> {
        let len = self.frame_len();
        let target = self.buffer_target(index)?;
        // SAFETY: every backing is at least frame_len bytes, checked when the
        // buffer was allocated or enqueued.
        let frame = unsafe { std::slice::from_raw_parts_mut(target, len) };
        let header = (sequence as u64).to_le_bytes();
        let split = header.len().min(len);
        frame[..split].copy_from_slice(&header[..split]);
        frame[split..].fill(sequence as u8);
        Ok(len as u32)
    }
}

/// Fill `bytes_per_line`/`size_image` for a validated format.
fn fill_sizes(format: &mut FormatSpec) {
    let bpp = bytes_per_pixel(&format.fourcc).unwrap_or(2.0);
    format.bytes_per_line = match format.fourcc.as_str() {
        "NV12" => format.width,
        _ => (format.width as f32 * bpp) as u32,
    };
    format.size_image = (format.width as f32 * format.height as f32 * bpp).ceil() as u32;
}

fn memfd(name: &std::ffi::CStr, len: usize) -> HalResult<File> {
    // SAFETY: name is a valid C string.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(HalError::last_os_error("memfd_create"));
    }
    // SAFETY: fd is a fresh descriptor we own.
    let file = unsafe { File::from_raw_fd(fd) };
    file.set_len(len as u64)
        .map_err(|e| HalError::Io(format!("ftruncate: {e}")))?;
    Ok(file)
}

/// One-shot relative expiry; `Duration::ZERO` disarms.
fn set_timer(fd: &OwnedFd, after: Duration) -> HalResult<()> {
    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: after.as_secs() as libc::time_t,
            tv_nsec: after.subsec_nanos() as libc::c_long,
        },
    };
    // SAFETY: valid timerfd and itimerspec; the old value is not requested.
    let rc = unsafe { libc::timerfd_settime(fd.as_raw_fd(), 0, &spec, std::ptr::null_mut()) };
    if rc < 0 {
        return Err(HalError::last_os_error("timerfd_settime"));
    }
    Ok(())
}

fn io_err(e: crate::errors::ServiceError) -> HalError {
    HalError::Io(e.to_string())
}

impl DeviceHal for VirtualDevice {
    fn name(&self) -> &'static str {
        "virtual"
    }

    fn open(&mut self, path: &str) -> HalResult<()> {
        if !path.starts_with(VIRTUAL_PATH_PREFIX) {
            return Err(HalError::UnknownDevice(format!(
                "{path} is not a virtual device path"
            )));
        }
        if self.path.is_some() {
            return Err(HalError::Io("device already open".to_string()));
        }

        // SAFETY: plain syscall.
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
            )
        };
        if fd < 0 {
            return Err(HalError::last_os_error("timerfd_create"));
        }
        // SAFETY: fresh descriptor we own.
        self.ready = Some(unsafe { OwnedFd::from_raw_fd(fd) });
        self.path = Some(path.to_string());
        self.sequence = 0;
        info!(path, format = %self.format, "Opened virtual capture device");
        Ok(())
    }

    fn close(&mut self) -> HalResult<()> {
        self.ensure_open()?;
        self.streaming = false;
        self.free_buffers();
        self.ready = None;
        self.armed = false;
        self.next_frame_at = None;
        debug!(path = ?self.path, "Closed virtual capture device");
        self.path = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.path.is_some()
    }

    fn set_format(&mut self, spec: &FormatSpec) -> HalResult<FormatSpec> {
        self.ensure_open()?;
        if !self.buffers.is_empty() {
            return Err(HalError::Io("buffers allocated, format is locked".to_string()));
        }
        if spec.width == 0 || spec.height == 0 {
            return Err(HalError::BadFormat(format!(
                "{}x{} has no pixels",
                spec.width, spec.height
            )));
        }
        if !SUPPORTED_FOURCCS.contains(&spec.fourcc.as_str()) {
            return Err(HalError::BadFormat(format!(
                "{} not supported (supported: {})",
                spec.fourcc,
                SUPPORTED_FOURCCS.join(", ")
            )));
        }

        let mut format = spec.clone();
        fill_sizes(&mut format);
        debug!(format = %format, size_image = format.size_image, "Virtual format set");
        self.format = format.clone();
        Ok(format)
    }

    fn get_format(&self) -> HalResult<FormatSpec> {
        self.ensure_open()?;
        Ok(self.format.clone())
    }

    fn request_buffers(&mut self, count: u32, mode: IoMode) -> HalResult<u32> {
        self.ensure_open()?;
        if self.streaming {
            return Err(HalError::Io("cannot reallocate while streaming".to_string()));
        }
        self.free_buffers();
        if count == 0 {
            return Ok(0);
        }

        let len = self.frame_len();
        let buffers = match mode {
            IoMode::Mapped => {
                let stride = self.stride();
                let file = memfd(c"virtual-camera-pool", stride * count as usize)?;
                let map = MappedRegion::map(file.as_raw_fd(), 0, stride * count as usize, true)
                    .map_err(io_err)?;
                self.pool = Some((file, map));
                (0..count as usize)
                    .map(|i| VirtualBuffer {
                        backing: Backing::Pool { offset: i * stride },
                    })
                    .collect()
            }
            IoMode::UserPointer => (0..count)
                .map(|_| VirtualBuffer {
                    backing: Backing::User { addr: None },
                })
                .collect(),
            IoMode::ExportedHandle => {
                let mut buffers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let file = memfd(c"virtual-camera-buffer", len)?;
                    let map = MappedRegion::map(file.as_raw_fd(), 0, len, true).map_err(io_err)?;
                    buffers.push(VirtualBuffer {
                        backing: Backing::Exported { file, map },
                    });
                }
                buffers
            }
        };

        self.buffers = buffers;
        self.mode = Some(mode);
        debug!(count, %mode, frame_len = len, "Virtual buffers allocated");
        Ok(count)
    }

    fn query_buffer(&self, index: u32) -> HalResult<BufferPlacement> {
        let buffer = self
            .buffers
            .get(index as usize)
            .ok_or_else(|| HalError::BadBuffer(format!("no buffer {index}")))?;
        match &buffer.backing {
            Backing::Pool { offset } => {
                let (file, _) = self
                    .pool
                    .as_ref()
                    .ok_or_else(|| HalError::BadBuffer("buffer pool missing".to_string()))?;
                Ok(BufferPlacement {
                    fd: file.as_raw_fd(),
                    offset: *offset as i64,
                    length: self.frame_len(),
                })
            }
            Backing::Exported { file, .. } => Ok(BufferPlacement {
                fd: file.as_raw_fd(),
                offset: 0,
                length: self.frame_len(),
            }),
            Backing::User { .. } => Err(HalError::BadBuffer(format!(
                "buffer {index} is user memory and cannot be mapped"
            ))),
        }
    }

    fn enqueue(&mut self, index: u32, payload: EnqueuePayload) -> HalResult<()> {
        self.ensure_open()?;
        if self.queue.contains(&index) {
            return Err(HalError::BadBuffer(format!("buffer {index} already queued")));
        }
        let frame_len = self.frame_len();
        let mode = self.mode;
        let buffer = self
            .buffers
            .get_mut(index as usize)
            .ok_or_else(|| HalError::BadBuffer(format!("no buffer {index}")))?;

        match (&mut buffer.backing, payload) {
            (Backing::Pool { .. }, EnqueuePayload::Mapped) => {}
            (Backing::User { addr }, EnqueuePayload::UserPointer { addr: ptr, length }) => {
                if ptr.is_null() || length < frame_len {
                    return Err(HalError::BadBuffer(format!(
                        "user buffer of {length} bytes, frame needs {frame_len}"
                    )));
                }
                *addr = Some(ptr as usize);
            }
            (Backing::Exported { .. }, EnqueuePayload::Exported { fd }) => {
                if fd < 0 {
                    return Err(HalError::BadBuffer(format!("invalid descriptor {fd}")));
                }
            }
            (_, payload) => {
                return Err(HalError::BadBuffer(format!(
                    "{payload:?} does not match {mode:?} buffers"
                )));
            }
        }

        self.queue.push_back(index);
        self.schedule()
    }

    fn dequeue(&mut self, timeout: Duration) -> HalResult<Dequeued> {
        self.ensure_open()?;
        if !self.streaming {
            return Err(HalError::Io("not streaming".to_string()));
        }

        if !self.take_ready()? {
            let fd = self.pollable_handle()?;
            if timeout.is_zero() || !wait_readable(fd, timeout)? || !self.take_ready()? {
                return Err(HalError::Timeout);
            }
        }

        let index = self.queue.pop_front().ok_or(HalError::Timeout)?;
        self.next_frame_at = self.frame_interval().map(|interval| Instant::now() + interval);
        self.schedule()?;
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        let bytes_used = self.fill(index, sequence)?;
        let timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();

        Ok(Dequeued {
            index,
            bytes_used,
            sequence,
            timestamp_ns,
        })
    }

    fn export_buffer(&mut self, index: u32) -> HalResult<OwnedFd> {
        let buffer = self
            .buffers
            .get(index as usize)
            .ok_or_else(|| HalError::BadBuffer(format!("no buffer {index}")))?;
        match &buffer.backing {
            Backing::Exported { file, .. } => file
                .try_clone()
                .map(OwnedFd::from)
                .map_err(|e| HalError::Io(format!("dup: {e}"))),
            _ => Err(HalError::BadBuffer(format!(
                "buffer {index} was not allocated for export"
            ))),
        }
    }

    fn start_streaming(&mut self) -> HalResult<()> {
        self.ensure_open()?;
        if self.buffers.is_empty() {
            return Err(HalError::Io("no buffers requested".to_string()));
        }
        if self.streaming {
            return Ok(());
        }
        self.streaming = true;
        self.next_frame_at = None;
        self.schedule()?;
        debug!(queued = self.queue.len(), "Virtual streaming on");
        Ok(())
    }

    fn stop_streaming(&mut self) -> HalResult<()> {
        self.ensure_open()?;
        self.streaming = false;
        self.queue.clear();
        self.disarm()?;
        debug!("Virtual streaming off");
        Ok(())
    }

    fn pollable_handle(&self) -> HalResult<RawFd> {
        self.ready
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .ok_or_else(|| HalError::Io("device not open".to_string()))
    }

    fn get_property(&self, id: u32) -> HalResult<i32> {
        self.ensure_open()?;
        self.properties
            .get(&id)
            .map(|(value, _)| *value)
            .ok_or_else(|| HalError::BadFormat(format!("control {id:#x} not supported")))
    }

    fn set_property(&mut self, id: u32, value: i32) -> HalResult<()> {
        self.ensure_open()?;
        let (current, info) = self
            .properties
            .get_mut(&id)
            .ok_or_else(|| HalError::BadFormat(format!("control {id:#x} not supported")))?;
        info.check(value)?;
        *current = value;
        Ok(())
    }

    fn device_info(&self, path: &str) -> HalResult<DeviceInfo> {
        if !path.starts_with(VIRTUAL_PATH_PREFIX) {
            return Err(HalError::UnknownDevice(path.to_string()));
        }
        Ok(DeviceInfo {
            card: "Virtual Camera".to_string(),
            driver: "virtual".to_string(),
            bus_info: format!("platform:{path}"),
            path: path.to_string(),
            real_path: path.to_string(),
            formats: SUPPORTED_FOURCCS.iter().map(|s| s.to_string()).collect(),
        })
    }
}
