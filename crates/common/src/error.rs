//! Common error types

use thiserror::Error;
use usbproto::{TransferKind, UsbError};

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(#[from] UsbError),

    #[error("No completion contract registered for {0} transfers")]
    MissingContract(TransferKind),

    #[error("Completion callbacks have not been initialized")]
    NotInitialized,

    #[error("Invalid or closed device handle")]
    InvalidHandle,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Negative status code for callers that speak `bytes | negative error`
    pub fn code(&self) -> i32 {
        match self {
            Error::Usb(e) => e.code(),
            Error::MissingContract(_) | Error::NotInitialized => UsbError::NotSupported.code(),
            Error::InvalidHandle => UsbError::InvalidParam.code(),
            Error::Channel(_) | Error::Config(_) | Error::Io(_) | Error::Other(_) => {
                UsbError::Other.code()
            }
        }
    }

    /// The USB error, if this is one
    pub fn usb(&self) -> Option<UsbError> {
        match self {
            Error::Usb(e) => Some(*e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_error_code_passthrough() {
        let err = Error::from(UsbError::Busy);
        assert_eq!(err.code(), -6);
        assert_eq!(err.usb(), Some(UsbError::Busy));
    }

    #[test]
    fn test_host_errors_are_negative() {
        assert!(Error::NotInitialized.code() < 0);
        assert!(Error::InvalidHandle.code() < 0);
        assert!(Error::MissingContract(TransferKind::Bulk).code() < 0);
        assert_eq!(Error::InvalidHandle.usb(), None);
    }

    #[test]
    fn test_missing_contract_display() {
        let msg = Error::MissingContract(TransferKind::Isochronous).to_string();
        assert!(msg.contains("isochronous"));
    }
}
