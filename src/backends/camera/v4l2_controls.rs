// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 control interface
//!
//! Property ids on the device contract are V4L2 control ids; the virtual
//! backend emulates the same ids and ranges so clients can address both alike.

use super::types::{HalError, HalResult};
use super::v4l2::{c_string, xioctl, zeroed};
use std::os::unix::io::RawFd;
use tracing::{debug, warn};

const V4L2_CTRL_CLASS_USER: u32 = 0x00980000;
const V4L2_CTRL_CLASS_CAMERA: u32 = 0x009a0000;

const V4L2_CID_BASE: u32 = V4L2_CTRL_CLASS_USER | 0x900;
const V4L2_CID_CAMERA_CLASS_BASE: u32 = V4L2_CTRL_CLASS_CAMERA | 0x900;

pub const V4L2_CID_BRIGHTNESS: u32 = V4L2_CID_BASE;
pub const V4L2_CID_CONTRAST: u32 = V4L2_CID_BASE + 1;
pub const V4L2_CID_SATURATION: u32 = V4L2_CID_BASE + 2;
pub const V4L2_CID_AUTO_WHITE_BALANCE: u32 = V4L2_CID_BASE + 12;
pub const V4L2_CID_GAIN: u32 = V4L2_CID_BASE + 19;
/// 0 disabled, 1 50Hz, 2 60Hz
pub const V4L2_CID_POWER_LINE_FREQUENCY: u32 = V4L2_CID_BASE + 24;
pub const V4L2_CID_SHARPNESS: u32 = V4L2_CID_BASE + 27;
/// Absolute exposure time in 100µs units
pub const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 2;

const V4L2_CTRL_FLAG_DISABLED: u32 = 0x0001;
const V4L2_CTRL_FLAG_READ_ONLY: u32 = 0x0004;

const VIDIOC_G_CTRL: libc::c_ulong = 0xC008561B;
const VIDIOC_S_CTRL: libc::c_ulong = 0xC008561C;
const VIDIOC_QUERYCTRL: libc::c_ulong = 0xC0445624;

#[repr(C)]
struct V4l2Control {
    id: u32,
    value: i32,
}

#[repr(C)]
struct V4l2Queryctrl {
    id: u32,
    ctrl_type: u32,
    name: [u8; 32],
    minimum: i32,
    maximum: i32,
    step: i32,
    default_value: i32,
    flags: u32,
    reserved: [u32; 2],
}

const _: () = assert!(size_of::<V4l2Queryctrl>() == 68);

/// Range and flags of one control, as reported by a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlInfo {
    pub id: u32,
    pub name: String,
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default_value: i32,
    pub flags: u32,
}

impl ControlInfo {
    /// Reject values the device would refuse or silently clamp.
    pub fn check(&self, value: i32) -> HalResult<()> {
        if self.flags & (V4L2_CTRL_FLAG_DISABLED | V4L2_CTRL_FLAG_READ_ONLY) != 0 {
            return Err(HalError::Io(format!("control {} is not writable", self.name)));
        }
        if value < self.minimum || value > self.maximum {
            return Err(HalError::BadFormat(format!(
                "{} value {} outside {}..={}",
                self.name, value, self.minimum, self.maximum
            )));
        }
        let offset = i64::from(value) - i64::from(self.minimum);
        if self.step > 1 && offset % i64::from(self.step) != 0 {
            return Err(HalError::BadFormat(format!(
                "{} value {} not a multiple of step {}",
                self.name, value, self.step
            )));
        }
        Ok(())
    }
}

/// (id, name, minimum, maximum, default) of the controls a UVC webcam commonly exposes
const BUILTIN_CONTROLS: &[(u32, &str, i32, i32, i32)] = &[
    (V4L2_CID_BRIGHTNESS, "Brightness", 0, 255, 128),
    (V4L2_CID_CONTRAST, "Contrast", 0, 95, 32),
    (V4L2_CID_SATURATION, "Saturation", 0, 100, 64),
    (V4L2_CID_AUTO_WHITE_BALANCE, "White Balance, Automatic", 0, 1, 1),
    (V4L2_CID_GAIN, "Gain", 0, 100, 0),
    (V4L2_CID_POWER_LINE_FREQUENCY, "Power Line Frequency", 0, 2, 1),
    (V4L2_CID_SHARPNESS, "Sharpness", 0, 7, 3),
    (V4L2_CID_EXPOSURE_ABSOLUTE, "Exposure Time, Absolute", 3, 2047, 156),
];

/// Control table for devices that emulate V4L2 controls.
pub fn builtin_controls() -> impl Iterator<Item = ControlInfo> {
    BUILTIN_CONTROLS
        .iter()
        .map(|&(id, name, minimum, maximum, default_value)| ControlInfo {
            id,
            name: name.to_string(),
            minimum,
            maximum,
            step: 1,
            default_value,
            flags: 0,
        })
}

pub fn query_control(fd: RawFd, id: u32) -> HalResult<ControlInfo> {
    let mut query: V4l2Queryctrl = zeroed();
    query.id = id;
    xioctl(fd, VIDIOC_QUERYCTRL, &mut query).map_err(|e| match e.raw_os_error() {
        Some(libc::EINVAL) => HalError::BadFormat(format!("control {id:#x} not supported")),
        _ => HalError::Io(format!("VIDIOC_QUERYCTRL: {e}")),
    })?;

    Ok(ControlInfo {
        id: query.id,
        name: c_string(&query.name),
        minimum: query.minimum,
        maximum: query.maximum,
        step: query.step,
        default_value: query.default_value,
        flags: query.flags,
    })
}

pub fn get_control(fd: RawFd, id: u32) -> HalResult<i32> {
    let mut ctrl = V4l2Control { id, value: 0 };
    xioctl(fd, VIDIOC_G_CTRL, &mut ctrl).map_err(|e| {
        debug!(id, error = %e, "VIDIOC_G_CTRL failed");
        HalError::Io(format!("VIDIOC_G_CTRL {id:#x}: {e}"))
    })?;
    Ok(ctrl.value)
}

/// Set a control after checking it against the device's own range.
pub fn set_control(fd: RawFd, id: u32, value: i32) -> HalResult<()> {
    query_control(fd, id)?.check(value)?;

    let mut ctrl = V4l2Control { id, value };
    xioctl(fd, VIDIOC_S_CTRL, &mut ctrl).map_err(|e| {
        warn!(id, value, error = %e, "VIDIOC_S_CTRL failed");
        HalError::Io(format!("VIDIOC_S_CTRL {id:#x}: {e}"))
    })?;
    if ctrl.value != value {
        debug!(id, requested = value, actual = ctrl.value, "Control value clamped");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brightness() -> ControlInfo {
        builtin_controls()
            .find(|c| c.id == V4L2_CID_BRIGHTNESS)
            .unwrap()
    }

    #[test]
    fn test_control_id_values() {
        assert_eq!(V4L2_CID_BRIGHTNESS, 0x00980900);
        assert_eq!(V4L2_CID_GAIN, 0x00980913);
        assert_eq!(V4L2_CID_EXPOSURE_ABSOLUTE, 0x009a0902);
    }

    #[test]
    fn test_check_range_and_step() {
        let mut info = brightness();
        assert!(info.check(0).is_ok());
        assert!(info.check(255).is_ok());
        assert!(matches!(info.check(256), Err(HalError::BadFormat(_))));

        info.step = 5;
        assert!(info.check(10).is_ok());
        assert!(matches!(info.check(12), Err(HalError::BadFormat(_))));
    }

    #[test]
    fn test_step_over_full_i32_range() {
        let info = ControlInfo {
            minimum: i32::MIN,
            maximum: i32::MAX,
            step: 3,
            ..brightness()
        };
        assert!(info.check(i32::MIN).is_ok());
        assert!(info.check(i32::MIN + 3).is_ok());
        // i32::MAX - i32::MIN == 2^32 - 1, a multiple of 3
        assert!(info.check(i32::MAX).is_ok());
        assert!(matches!(info.check(i32::MAX - 1), Err(HalError::BadFormat(_))));
    }

    #[test]
    fn test_read_only_rejected() {
        let info = ControlInfo {
            flags: V4L2_CTRL_FLAG_READ_ONLY,
            ..brightness()
        };
        assert!(matches!(info.check(1), Err(HalError::Io(_))));
    }

    #[test]
    fn test_builtin_defaults_in_range() {
        for control in builtin_controls() {
            assert!(control.check(control.default_value).is_ok(), "{}", control.name);
        }
    }
}
