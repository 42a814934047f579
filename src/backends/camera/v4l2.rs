// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 capture backend
//!
//! Streaming I/O over raw ioctls. The three I/O modes map onto V4L2 memory
//! types as follows:
//!
//! | IoMode           | REQBUFS memory | QBUF payload          |
//! |------------------|----------------|-----------------------|
//! | `Mapped`         | `MMAP`         | none (kernel offset)  |
//! | `UserPointer`    | `USERPTR`      | address + length      |
//! | `ExportedHandle` | `MMAP`         | none; fds via EXPBUF  |
//!
//! Exported buffers stay kernel-allocated; `VIDIOC_EXPBUF` hands out a DMABUF
//! descriptor per buffer that consumers map independently.
//!
//! Device description uses the `v4l` crate.

use super::types::*;
use super::v4l2_controls;
use super::{DeviceHal, wait_readable};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tracing::{debug, info, warn};

// ===== V4L2 ioctl Numbers =====
// Calculated as: (dir << 30) | (size << 16) | ('V' << 8) | nr
// where dir: 2=READ, 1=WRITE, 3=READ|WRITE (sizes for 64-bit targets)

/// Query capabilities (v4l2_capability: 104 bytes)
const VIDIOC_QUERYCAP: libc::c_ulong = 0x80685600;
/// Get format (v4l2_format: 208 bytes)
const VIDIOC_G_FMT: libc::c_ulong = 0xC0D05604;
/// Set format (v4l2_format: 208 bytes)
const VIDIOC_S_FMT: libc::c_ulong = 0xC0D05605;
/// Request buffers (v4l2_requestbuffers: 20 bytes)
const VIDIOC_REQBUFS: libc::c_ulong = 0xC0145608;
/// Query buffer (v4l2_buffer: 88 bytes)
const VIDIOC_QUERYBUF: libc::c_ulong = 0xC0585609;
/// Queue buffer (v4l2_buffer: 88 bytes)
const VIDIOC_QBUF: libc::c_ulong = 0xC058560F;
/// Export buffer as DMABUF (v4l2_exportbuffer: 64 bytes)
const VIDIOC_EXPBUF: libc::c_ulong = 0xC0405610;
/// Dequeue buffer (v4l2_buffer: 88 bytes)
const VIDIOC_DQBUF: libc::c_ulong = 0xC0585611;
/// Stream on (int: 4 bytes)
const VIDIOC_STREAMON: libc::c_ulong = 0x40045612;
/// Stream off (int: 4 bytes)
const VIDIOC_STREAMOFF: libc::c_ulong = 0x40045613;
/// Get streaming parameters (v4l2_streamparm: 204 bytes)
const VIDIOC_G_PARM: libc::c_ulong = 0xC0CC5615;
/// Set streaming parameters (v4l2_streamparm: 204 bytes)
const VIDIOC_S_PARM: libc::c_ulong = 0xC0CC5616;

const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
const V4L2_MEMORY_MMAP: u32 = 1;
const V4L2_MEMORY_USERPTR: u32 = 2;
const V4L2_FIELD_NONE: u32 = 1;

const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

// ===== V4L2 ioctl Structures =====

#[repr(C)]
struct V4l2Capability {
    driver: [u8; 16],
    card: [u8; 32],
    bus_info: [u8; 32],
    version: u32,
    capabilities: u32,
    device_caps: u32,
    reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2PixFormat {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    bytesperline: u32,
    sizeimage: u32,
    colorspace: u32,
    priv_: u32,
    flags: u32,
    ycbcr_enc: u32,
    quantization: u32,
    xfer_func: u32,
}

#[repr(C)]
union V4l2FormatUnion {
    pix: V4l2PixFormat,
    raw: [u8; 200],
    // The kernel union holds pointers, so it is 8-byte aligned.
    _align: [u64; 25],
}

#[repr(C)]
struct V4l2Format {
    type_: u32,
    fmt: V4l2FormatUnion,
}

#[repr(C)]
struct V4l2RequestBuffers {
    count: u32,
    type_: u32,
    memory: u32,
    capabilities: u32,
    flags: u8,
    reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Timecode {
    type_: u32,
    flags: u32,
    frames: u8,
    seconds: u8,
    minutes: u8,
    hours: u8,
    userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
union V4l2BufferM {
    offset: u32,
    userptr: libc::c_ulong,
    fd: i32,
}

#[repr(C)]
struct V4l2Buffer {
    index: u32,
    type_: u32,
    bytesused: u32,
    flags: u32,
    field: u32,
    timestamp: libc::timeval,
    timecode: V4l2Timecode,
    sequence: u32,
    memory: u32,
    m: V4l2BufferM,
    length: u32,
    reserved2: u32,
    request_fd: i32,
}

#[repr(C)]
struct V4l2ExportBuffer {
    type_: u32,
    index: u32,
    plane: u32,
    flags: u32,
    fd: i32,
    reserved: [u32; 11],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Fract {
    numerator: u32,
    denominator: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2CaptureParm {
    capability: u32,
    capturemode: u32,
    timeperframe: V4l2Fract,
    extendedmode: u32,
    readbuffers: u32,
    reserved: [u32; 4],
}

#[repr(C)]
union V4l2StreamParmUnion {
    capture: V4l2CaptureParm,
    raw: [u8; 200],
}

#[repr(C)]
struct V4l2StreamParm {
    type_: u32,
    parm: V4l2StreamParmUnion,
}

const _: () = {
    assert!(std::mem::size_of::<V4l2Format>() == 208);
    assert!(std::mem::size_of::<V4l2RequestBuffers>() == 20);
    assert!(std::mem::size_of::<V4l2Buffer>() == 88);
    assert!(std::mem::size_of::<V4l2ExportBuffer>() == 64);
    assert!(std::mem::size_of::<V4l2StreamParm>() == 204);
};

/// Issue an ioctl, retrying on EINTR.
pub(super) fn xioctl<T>(fd: RawFd, request: libc::c_ulong, arg: &mut T) -> std::io::Result<()> {
    loop {
        // SAFETY: `arg` is a live, correctly sized struct for `request`.
        let rc = unsafe { libc::ioctl(fd, request as _, arg as *mut T) };
        if rc >= 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn ioctl_err(name: &str, err: std::io::Error) -> HalError {
    match err.raw_os_error() {
        Some(libc::EINVAL) if name == "VIDIOC_S_FMT" => {
            HalError::BadFormat(format!("{name}: {err}"))
        }
        _ => HalError::Io(format!("{name}: {err}")),
    }
}

pub(super) fn zeroed<T>() -> T {
    // SAFETY: only used for plain-old-data ioctl structs.
    unsafe { std::mem::zeroed() }
}

pub(super) fn c_string(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&c| c == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).to_string()
}

fn memory_for(mode: IoMode) -> u32 {
    match mode {
        IoMode::Mapped | IoMode::ExportedHandle => V4L2_MEMORY_MMAP,
        IoMode::UserPointer => V4L2_MEMORY_USERPTR,
    }
}

/// V4L2 implementation of [`DeviceHal`]
#[derive(Default)]
pub struct V4l2Device {
    file: Option<File>,
    path: Option<String>,
    mode: Option<IoMode>,
    count: u32,
    streaming: bool,
}

impl V4l2Device {
    pub fn new() -> Self {
        Self::default()
    }

    fn fd(&self) -> HalResult<RawFd> {
        self.file
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or_else(|| HalError::Io("device not open".to_string()))
    }

    fn buffer(&self, index: u32) -> HalResult<V4l2Buffer> {
        let mode = self
            .mode
            .ok_or_else(|| HalError::BadBuffer("no buffers requested".to_string()))?;
        if index >= self.count {
            return Err(HalError::BadBuffer(format!(
                "buffer {} outside pool of {}",
                index, self.count
            )));
        }
        let mut buf: V4l2Buffer = zeroed();
        buf.index = index;
        buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = memory_for(mode);
        Ok(buf)
    }

    fn read_framerate(&self, fd: RawFd) -> Option<Framerate> {
        let mut parm: V4l2StreamParm = zeroed();
        parm.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        xioctl(fd, VIDIOC_G_PARM, &mut parm).ok()?;
        // SAFETY: capture is the active member for capture buffer types.
        let tpf = unsafe { parm.parm.capture.timeperframe };
        (tpf.numerator > 0).then(|| Framerate::new(tpf.denominator, tpf.numerator))
    }

    fn write_framerate(&self, fd: RawFd, rate: Framerate) {
        let mut parm: V4l2StreamParm = zeroed();
        parm.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        parm.parm.capture = V4l2CaptureParm {
            capability: 0,
            capturemode: 0,
            timeperframe: V4l2Fract {
                numerator: rate.denom,
                denominator: rate.num,
            },
            extendedmode: 0,
            readbuffers: 0,
            reserved: [0; 4],
        };
        if let Err(e) = xioctl(fd, VIDIOC_S_PARM, &mut parm) {
            warn!(framerate = %rate, error = %e, "Device rejected framerate");
        }
    }

    fn release_pool(&mut self) {
        if let Ok(fd) = self.fd() {
            if self.streaming {
                let mut kind = V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
                let _ = xioctl(fd, VIDIOC_STREAMOFF, &mut kind);
                self.streaming = false;
            }
            if let Some(mode) = self.mode {
                let mut req = V4l2RequestBuffers {
                    count: 0,
                    type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
                    memory: memory_for(mode),
                    capabilities: 0,
                    flags: 0,
                    reserved: [0; 3],
                };
                let _ = xioctl(fd, VIDIOC_REQBUFS, &mut req);
            }
        }
        self.mode = None;
        self.count = 0;
    }
}

impl DeviceHal for V4l2Device {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn open(&mut self, path: &str) -> HalResult<()> {
        if self.file.is_some() {
            return Err(HalError::Io("device already open".to_string()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => HalError::UnknownDevice(path.to_string()),
                _ => HalError::Io(format!("open {path}: {e}")),
            })?;

        let mut cap: V4l2Capability = zeroed();
        xioctl(file.as_raw_fd(), VIDIOC_QUERYCAP, &mut cap)
            .map_err(|e| HalError::UnknownDevice(format!("{path} is not a V4L2 device: {e}")))?;
        let caps = if cap.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };
        if caps & V4L2_CAP_VIDEO_CAPTURE == 0 || caps & V4L2_CAP_STREAMING == 0 {
            return Err(HalError::UnknownDevice(format!(
                "{path} does not support streaming capture"
            )));
        }

        info!(
            path,
            card = %c_string(&cap.card),
            driver = %c_string(&cap.driver),
            "Opened V4L2 capture device"
        );
        self.file = Some(file);
        self.path = Some(path.to_string());
        Ok(())
    }

    fn close(&mut self) -> HalResult<()> {
        self.fd()?;
        self.release_pool();
        self.file = None;
        debug!(path = ?self.path, "Closed V4L2 device");
        self.path = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn set_format(&mut self, spec: &FormatSpec) -> HalResult<FormatSpec> {
        let fd = self.fd()?;
        let mut fmt: V4l2Format = zeroed();
        fmt.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        let mut pix: V4l2PixFormat = zeroed();
        pix.width = spec.width;
        pix.height = spec.height;
        pix.pixelformat = spec.fourcc_code()?;
        pix.field = V4L2_FIELD_NONE;
        fmt.fmt.pix = pix;

        xioctl(fd, VIDIOC_S_FMT, &mut fmt).map_err(|e| ioctl_err("VIDIOC_S_FMT", e))?;
        if let Some(rate) = spec.framerate {
            self.write_framerate(fd, rate);
        }

        let negotiated = self.get_format()?;
        if negotiated.fourcc != spec.fourcc {
            return Err(HalError::BadFormat(format!(
                "requested {}, device chose {}",
                spec.fourcc, negotiated.fourcc
            )));
        }
        debug!(requested = %spec, negotiated = %negotiated, "V4L2 format set");
        Ok(negotiated)
    }

    fn get_format(&self) -> HalResult<FormatSpec> {
        let fd = self.fd()?;
        let mut fmt: V4l2Format = zeroed();
        fmt.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        xioctl(fd, VIDIOC_G_FMT, &mut fmt).map_err(|e| ioctl_err("VIDIOC_G_FMT", e))?;
        // SAFETY: pix is the active member for capture buffer types.
        let pix = unsafe { fmt.fmt.pix };
        Ok(FormatSpec {
            width: pix.width,
            height: pix.height,
            fourcc: fourcc_string(pix.pixelformat),
            framerate: self.read_framerate(fd),
            bytes_per_line: pix.bytesperline,
            size_image: pix.sizeimage,
        })
    }

    fn request_buffers(&mut self, count: u32, mode: IoMode) -> HalResult<u32> {
        let fd = self.fd()?;
        let mut req = V4l2RequestBuffers {
            count,
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: memory_for(mode),
            capabilities: 0,
            flags: 0,
            reserved: [0; 3],
        };
        xioctl(fd, VIDIOC_REQBUFS, &mut req).map_err(|e| ioctl_err("VIDIOC_REQBUFS", e))?;

        if count == 0 {
            self.mode = None;
            self.count = 0;
        } else {
            self.mode = Some(mode);
            self.count = req.count;
        }
        debug!(requested = count, granted = req.count, %mode, "V4L2 buffers requested");
        Ok(req.count)
    }

    fn query_buffer(&self, index: u32) -> HalResult<BufferPlacement> {
        let fd = self.fd()?;
        let mut buf = self.buffer(index)?;
        if buf.memory != V4L2_MEMORY_MMAP {
            return Err(HalError::BadBuffer(format!(
                "buffer {index} is user memory and cannot be mapped"
            )));
        }
        xioctl(fd, VIDIOC_QUERYBUF, &mut buf).map_err(|e| ioctl_err("VIDIOC_QUERYBUF", e))?;
        Ok(BufferPlacement {
            fd,
            // SAFETY: offset is the active member for MMAP buffers.
            offset: unsafe { buf.m.offset } as i64,
            length: buf.length as usize,
        })
    }

    fn enqueue(&mut self, index: u32, payload: EnqueuePayload) -> HalResult<()> {
        let fd = self.fd()?;
        let mut buf = self.buffer(index)?;
        match (self.mode, payload) {
            (Some(IoMode::Mapped), EnqueuePayload::Mapped) => {}
            (Some(IoMode::ExportedHandle), EnqueuePayload::Exported { .. }) => {}
            (Some(IoMode::UserPointer), EnqueuePayload::UserPointer { addr, length }) => {
                buf.m.userptr = addr as libc::c_ulong;
                buf.length = length as u32;
            }
            (mode, payload) => {
                return Err(HalError::BadBuffer(format!(
                    "{payload:?} does not match {mode:?} buffers"
                )));
            }
        }
        xioctl(fd, VIDIOC_QBUF, &mut buf).map_err(|e| ioctl_err("VIDIOC_QBUF", e))
    }

    fn dequeue(&mut self, timeout: Duration) -> HalResult<Dequeued> {
        let fd = self.fd()?;
        if !timeout.is_zero() && !wait_readable(fd, timeout)? {
            return Err(HalError::Timeout);
        }
        let mode = self
            .mode
            .ok_or_else(|| HalError::Io("no buffers requested".to_string()))?;
        let mut buf: V4l2Buffer = zeroed();
        buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = memory_for(mode);

        match xioctl(fd, VIDIOC_DQBUF, &mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Err(HalError::Timeout),
            Err(e) => return Err(ioctl_err("VIDIOC_DQBUF", e)),
        }

        let timestamp_ns = buf.timestamp.tv_sec as u64 * 1_000_000_000
            + buf.timestamp.tv_usec as u64 * 1_000;
        Ok(Dequeued {
            index: buf.index,
            bytes_used: buf.bytesused,
            sequence: buf.sequence,
            timestamp_ns,
        })
    }

    fn export_buffer(&mut self, index: u32) -> HalResult<OwnedFd> {
        let fd = self.fd()?;
        if self.mode != Some(IoMode::ExportedHandle) {
            return Err(HalError::BadBuffer(format!(
                "buffer {index} was not allocated for export"
            )));
        }
        self.buffer(index)?;
        let mut exp = V4l2ExportBuffer {
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            index,
            plane: 0,
            flags: (libc::O_CLOEXEC | libc::O_RDONLY) as u32,
            fd: -1,
            reserved: [0; 11],
        };
        xioctl(fd, VIDIOC_EXPBUF, &mut exp).map_err(|e| ioctl_err("VIDIOC_EXPBUF", e))?;
        // SAFETY: EXPBUF returned a fresh descriptor we now own.
        Ok(unsafe { OwnedFd::from_raw_fd(exp.fd) })
    }

    fn start_streaming(&mut self) -> HalResult<()> {
        let fd = self.fd()?;
        let mut kind = V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        xioctl(fd, VIDIOC_STREAMON, &mut kind).map_err(|e| ioctl_err("VIDIOC_STREAMON", e))?;
        self.streaming = true;
        Ok(())
    }

    fn stop_streaming(&mut self) -> HalResult<()> {
        let fd = self.fd()?;
        let mut kind = V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        self.streaming = false;
        xioctl(fd, VIDIOC_STREAMOFF, &mut kind).map_err(|e| ioctl_err("VIDIOC_STREAMOFF", e))
    }

    fn pollable_handle(&self) -> HalResult<RawFd> {
        self.fd()
    }

    fn get_property(&self, id: u32) -> HalResult<i32> {
        v4l2_controls::get_control(self.fd()?, id)
    }

    fn set_property(&mut self, id: u32, value: i32) -> HalResult<()> {
        v4l2_controls::set_control(self.fd()?, id, value)
    }

    fn device_info(&self, path: &str) -> HalResult<DeviceInfo> {
        use v4l::video::Capture;

        let device = v4l::Device::with_path(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => HalError::UnknownDevice(path.to_string()),
            _ => HalError::Io(format!("open {path}: {e}")),
        })?;
        let caps = device
            .query_caps()
            .map_err(|e| HalError::UnknownDevice(format!("{path} is not a V4L2 device: {e}")))?;
        let formats = device
            .enum_formats()
            .map(|descs| {
                descs
                    .iter()
                    .map(|d| fourcc_string(u32::from_le_bytes(d.fourcc.repr)))
                    .collect()
            })
            .unwrap_or_else(|e| {
                warn!(path, error = %e, "Failed to enumerate formats");
                Vec::new()
            });

        let real_path = std::fs::canonicalize(path)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| path.to_string());

        Ok(DeviceInfo {
            card: caps.card,
            driver: caps.driver,
            bus_info: caps.bus,
            path: path.to_string(),
            real_path,
            formats,
        })
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        if self.file.is_some() {
            self.release_pool();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_types() {
        assert_eq!(memory_for(IoMode::Mapped), V4L2_MEMORY_MMAP);
        assert_eq!(memory_for(IoMode::ExportedHandle), V4L2_MEMORY_MMAP);
        assert_eq!(memory_for(IoMode::UserPointer), V4L2_MEMORY_USERPTR);
    }

    #[test]
    fn test_ioctl_sizes_match_request_codes() {
        let size = |req: libc::c_ulong| ((req >> 16) & 0x3fff) as usize;
        assert_eq!(size(VIDIOC_S_FMT), std::mem::size_of::<V4l2Format>());
        assert_eq!(size(VIDIOC_REQBUFS), std::mem::size_of::<V4l2RequestBuffers>());
        assert_eq!(size(VIDIOC_QBUF), std::mem::size_of::<V4l2Buffer>());
        assert_eq!(size(VIDIOC_EXPBUF), std::mem::size_of::<V4l2ExportBuffer>());
        assert_eq!(size(VIDIOC_QUERYCAP), std::mem::size_of::<V4l2Capability>());
    }

    #[test]
    fn test_open_missing_device() {
        let mut dev = V4l2Device::new();
        assert!(matches!(
            dev.open("/dev/does-not-exist-video"),
            Err(HalError::UnknownDevice(_))
        ));
        assert!(!dev.is_open());
    }

    #[test]
    fn test_calls_before_open_fail() {
        let dev = V4l2Device::new();
        assert!(matches!(dev.get_format(), Err(HalError::Io(_))));
        assert!(matches!(dev.pollable_handle(), Err(HalError::Io(_))));
    }
}
