//! USB error taxonomy
//!
//! Mirrors the libusb error domain. Every variant carries a stable negative
//! code so results can cross an integer boundary (`bytes | negative error`)
//! and come back unchanged.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// USB error types
///
/// Maps to libusb error codes. A non-negative transfer result is a byte count;
/// anything negative is one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum UsbError {
    /// Input/output error
    #[error("Input/output error")]
    Io,
    /// Invalid parameter
    #[error("Invalid parameter")]
    InvalidParam,
    /// Access denied (permissions)
    #[error("Access denied (insufficient permissions)")]
    Access,
    /// Device was disconnected
    #[error("No such device (it may have been disconnected)")]
    NoDevice,
    /// Entity not found
    #[error("Entity not found")]
    NotFound,
    /// Resource busy
    #[error("Resource busy")]
    Busy,
    /// Transfer timed out
    #[error("Operation timed out")]
    Timeout,
    /// Device sent more data than requested
    #[error("Overflow")]
    Overflow,
    /// Endpoint stalled (protocol error)
    #[error("Pipe error")]
    Pipe,
    /// Interrupted or cancelled
    #[error("System call interrupted")]
    Interrupted,
    /// Allocation failed
    #[error("Insufficient memory")]
    NoMemory,
    /// Not supported on this platform or backend
    #[error("Operation not supported or unimplemented on this platform")]
    NotSupported,
    /// Anything else
    #[error("Other error")]
    Other,
}

impl UsbError {
    /// Negative libusb error code for this error
    pub const fn code(self) -> i32 {
        match self {
            UsbError::Io => -1,
            UsbError::InvalidParam => -2,
            UsbError::Access => -3,
            UsbError::NoDevice => -4,
            UsbError::NotFound => -5,
            UsbError::Busy => -6,
            UsbError::Timeout => -7,
            UsbError::Overflow => -8,
            UsbError::Pipe => -9,
            UsbError::Interrupted => -10,
            UsbError::NoMemory => -11,
            UsbError::NotSupported => -12,
            UsbError::Other => -99,
        }
    }

    /// Map a libusb error code back to an error
    ///
    /// Unknown negative codes become [`UsbError::Other`]. Non-negative codes
    /// are not errors and also map to `Other`; callers should check the sign
    /// first (see [`check_code`]).
    pub const fn from_code(code: i32) -> Self {
        match code {
            -1 => UsbError::Io,
            -2 => UsbError::InvalidParam,
            -3 => UsbError::Access,
            -4 => UsbError::NoDevice,
            -5 => UsbError::NotFound,
            -6 => UsbError::Busy,
            -7 => UsbError::Timeout,
            -8 => UsbError::Overflow,
            -9 => UsbError::Pipe,
            -10 => UsbError::Interrupted,
            -11 => UsbError::NoMemory,
            -12 => UsbError::NotSupported,
            _ => UsbError::Other,
        }
    }
}

/// Interpret a libusb return value: negative is an error, anything else is a count
pub fn check_code(code: i32) -> Result<usize, UsbError> {
    if code < 0 {
        Err(UsbError::from_code(code))
    } else {
        Ok(code as usize)
    }
}

/// Result of a transfer: bytes moved, or the reason it failed
pub type TransferResult = Result<usize, UsbError>;

/// Flatten a transfer result into the `bytes | negative error` integer form
pub fn result_code(result: &TransferResult) -> i64 {
    match result {
        Ok(len) => *len as i64,
        Err(e) => e.code() as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [UsbError; 13] = [
        UsbError::Io,
        UsbError::InvalidParam,
        UsbError::Access,
        UsbError::NoDevice,
        UsbError::NotFound,
        UsbError::Busy,
        UsbError::Timeout,
        UsbError::Overflow,
        UsbError::Pipe,
        UsbError::Interrupted,
        UsbError::NoMemory,
        UsbError::NotSupported,
        UsbError::Other,
    ];

    #[test]
    fn test_codes_are_negative_and_stable() {
        for err in ALL {
            assert!(err.code() < 0, "{:?} must map to a negative code", err);
            assert_eq!(UsbError::from_code(err.code()), err);
        }
    }

    #[test]
    fn test_unknown_code_is_other() {
        assert_eq!(UsbError::from_code(-42), UsbError::Other);
        assert_eq!(UsbError::from_code(-1000), UsbError::Other);
    }

    #[test]
    fn test_check_code() {
        assert_eq!(check_code(0), Ok(0));
        assert_eq!(check_code(17), Ok(17));
        assert_eq!(check_code(-7), Err(UsbError::Timeout));
        assert_eq!(check_code(-9), Err(UsbError::Pipe));
    }

    #[test]
    fn test_result_code() {
        assert_eq!(result_code(&Ok(64)), 64);
        assert_eq!(result_code(&Err(UsbError::NoDevice)), -4);
    }

    #[test]
    fn test_error_display() {
        let msg = format!("{}", UsbError::Busy);
        assert!(msg.contains("busy"));
    }
}
