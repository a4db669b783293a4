//! USB transfer types for usb-xfer
//!
//! This crate defines the vocabulary shared by the host transfer engine and
//! its callers: endpoint addressing, the control setup packet, completion
//! statuses, the libusb-compatible error taxonomy and the per-kind completion
//! callback contracts.
//!
//! # Example
//!
//! ```
//! use usbproto::{SetupPacket, UsbError, check_code};
//!
//! // GET_DESCRIPTOR(DEVICE), 18 bytes
//! let setup = SetupPacket::new(0x80, 0x06, 0x0100, 0x0000, 18);
//! assert_eq!(setup.to_bytes()[..2], [0x80, 0x06]);
//!
//! // Integer results: bytes on success, negative libusb code on failure
//! assert_eq!(check_code(18), Ok(18));
//! assert_eq!(check_code(-7), Err(UsbError::Timeout));
//! ```

pub mod callback;
pub mod error;
pub mod types;

pub use callback::{
    BulkTransferCallback, ControlTransferCallback, InterruptTransferCallback, IsoBuffer,
    IsochronousTransferCallback,
};
pub use error::{TransferResult, UsbError, check_code, result_code};
pub use types::{
    DIRECTION_MASK, Direction, EndpointAddress, IsoPacket, SetupPacket, TransferKind,
    TransferStatus, iso_transferred_bytes,
};
