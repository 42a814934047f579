// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the camera service
//!
//! Every fallible operation in the crate returns [`ServiceResult`]. The upward
//! lifecycle surface converts errors into a numeric [`ResultCode`] so callers
//! that only speak result codes (RPC glue) never see a Rust type.

use std::fmt;

/// Result type alias using ServiceError
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Main service error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// A caller-supplied argument is out of range or malformed
    InvalidParameter(String),
    /// Operation called out of sequence (buffer-manager state machine, closed channel)
    InvalidState(String),
    /// The capture device could not be opened
    DeviceOpen(String),
    /// The capture device could not be closed cleanly
    DeviceClose(String),
    /// No device (or backend) answers to the requested name
    DeviceNotFound(String),
    /// ioctl, mmap, or allocation failure
    IoFailure(String),
    /// The writer observed its own index past the wrap point; the index was reset to 0
    Overflow,
    /// Slot-count negotiation mismatch between the channel and a bulk-access caller
    CountMismatch { expected: u32, requested: u32 },
    /// A slot's recorded length is zero or exceeds the unit size
    CorruptSlot { index: u32, length: u32 },
    /// Nothing has been published yet
    NotReady,
    /// The device had no completed buffer within the timeout
    NoData,
    /// No free channel key, or the system refused an allocation
    ResourceExhausted(String),
}

impl ServiceError {
    /// Per-frame errors the capture loop logs and retries instead of tearing down.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ServiceError::NoData
                | ServiceError::NotReady
                | ServiceError::CorruptSlot { .. }
                | ServiceError::Overflow
        )
    }

    /// Build an `IoFailure` from the calling thread's `errno`.
    pub fn last_os_error(context: &str) -> Self {
        ServiceError::IoFailure(format!("{}: {}", context, std::io::Error::last_os_error()))
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            ServiceError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            ServiceError::DeviceOpen(msg) => write!(f, "Failed to open device: {}", msg),
            ServiceError::DeviceClose(msg) => write!(f, "Failed to close device: {}", msg),
            ServiceError::DeviceNotFound(msg) => write!(f, "Device not found: {}", msg),
            ServiceError::IoFailure(msg) => write!(f, "I/O failure: {}", msg),
            ServiceError::Overflow => write!(f, "Write index overflowed and was reset"),
            ServiceError::CountMismatch {
                expected,
                requested,
            } => write!(
                f,
                "Slot count mismatch: channel has {}, caller requested {}",
                expected, requested
            ),
            ServiceError::CorruptSlot { index, length } => {
                write!(f, "Corrupt slot {}: recorded length {}", index, length)
            }
            ServiceError::NotReady => write!(f, "No frame published yet"),
            ServiceError::NoData => write!(f, "No data within timeout"),
            ServiceError::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::IoFailure(err.to_string())
    }
}

/// Numeric result codes handed to the RPC layer.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok = 0,
    InvalidParameter = -1,
    InvalidState = -2,
    DeviceOpen = -3,
    DeviceClose = -4,
    DeviceNotFound = -5,
    IoFailure = -6,
    Overflow = -7,
    CountMismatch = -8,
    CorruptSlot = -9,
    NotReady = -10,
    NoData = -11,
    ResourceExhausted = -12,
}

impl ResultCode {
    /// Result code for any service result.
    pub fn of<T>(result: &ServiceResult<T>) -> Self {
        match result {
            Ok(_) => ResultCode::Ok,
            Err(e) => ResultCode::from(e),
        }
    }

    /// Raw integer value.
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<&ServiceError> for ResultCode {
    fn from(err: &ServiceError) -> Self {
        match err {
            ServiceError::InvalidParameter(_) => ResultCode::InvalidParameter,
            ServiceError::InvalidState(_) => ResultCode::InvalidState,
            ServiceError::DeviceOpen(_) => ResultCode::DeviceOpen,
            ServiceError::DeviceClose(_) => ResultCode::DeviceClose,
            ServiceError::DeviceNotFound(_) => ResultCode::DeviceNotFound,
            ServiceError::IoFailure(_) => ResultCode::IoFailure,
            ServiceError::Overflow => ResultCode::Overflow,
            ServiceError::CountMismatch { .. } => ResultCode::CountMismatch,
            ServiceError::CorruptSlot { .. } => ResultCode::CorruptSlot,
            ServiceError::NotReady => ResultCode::NotReady,
            ServiceError::NoData => ResultCode::NoData,
            ServiceError::ResourceExhausted(_) => ResultCode::ResourceExhausted,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_mapping() {
        assert_eq!(ResultCode::of::<()>(&Ok(())), ResultCode::Ok);
        assert_eq!(
            ResultCode::of::<()>(&Err(ServiceError::NoData)),
            ResultCode::NoData
        );
        assert_eq!(
            ResultCode::from(&ServiceError::CountMismatch {
                expected: 4,
                requested: 3
            })
            .code(),
            -8
        );
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(ServiceError::NoData.is_recoverable());
        assert!(ServiceError::CorruptSlot { index: 0, length: 0 }.is_recoverable());
        assert!(!ServiceError::DeviceNotFound("x".into()).is_recoverable());
        assert!(!ServiceError::IoFailure("x".into()).is_recoverable());
    }
}
