//! USB transfer type definitions
//!
//! Endpoint addressing, the control setup packet, transfer kinds and the
//! completion statuses reported by the host controller.

use crate::error::{TransferResult, UsbError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bit 7 of an endpoint address or `bmRequestType`: set for device-to-host
pub const DIRECTION_MASK: u8 = 0x80;

/// Transfer direction, seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    fn from_bit(byte: u8) -> Self {
        if byte & DIRECTION_MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Endpoint address (includes direction bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointAddress(pub u8);

impl EndpointAddress {
    /// Default control endpoint
    pub const CONTROL: EndpointAddress = EndpointAddress(0x00);

    /// Direction encoded in bit 7
    pub fn direction(self) -> Direction {
        Direction::from_bit(self.0)
    }

    /// True for device-to-host endpoints
    pub fn is_in(self) -> bool {
        self.direction() == Direction::In
    }

    /// Endpoint number without the direction bit
    pub fn number(self) -> u8 {
        self.0 & 0x0f
    }
}

impl From<u8> for EndpointAddress {
    fn from(address: u8) -> Self {
        EndpointAddress(address)
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// USB transfer kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    /// Control transfer (endpoint 0)
    Control,
    /// Bulk transfer
    Bulk,
    /// Interrupt transfer
    Interrupt,
    /// Isochronous transfer
    Isochronous,
}

impl TransferKind {
    /// All kinds, in registry order
    pub const ALL: [TransferKind; 4] = [
        TransferKind::Control,
        TransferKind::Bulk,
        TransferKind::Interrupt,
        TransferKind::Isochronous,
    ];
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferKind::Control => "control",
            TransferKind::Bulk => "bulk",
            TransferKind::Interrupt => "interrupt",
            TransferKind::Isochronous => "isochronous",
        };
        f.write_str(name)
    }
}

/// USB device request (USB 2.0 spec, section 9.3)
///
/// Serialized as the 8-byte setup stage of a control transfer, multi-byte
/// fields little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    /// Size of the setup stage on the wire
    pub const SIZE: usize = 8;

    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// Build a setup packet from wide integers, masking each field to its
    /// protocol width
    pub fn from_raw(request_type: i32, request: i32, value: i32, index: i32, length: i32) -> Self {
        Self {
            request_type: (request_type & 0xff) as u8,
            request: (request & 0xff) as u8,
            value: (value & 0xffff) as u16,
            index: (index & 0xffff) as u16,
            length: (length & 0xffff) as u16,
        }
    }

    /// Data stage direction, from bit 7 of `bmRequestType`
    pub fn direction(&self) -> Direction {
        Direction::from_bit(self.request_type)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }
}

/// Completion status reported by the host controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
    /// A raw status value the controller should never report
    Unrecognized(i32),
}

impl TransferStatus {
    /// Decode a raw `libusb_transfer_status`
    pub fn from_raw(status: i32) -> Self {
        match status {
            0 => TransferStatus::Completed,
            1 => TransferStatus::Error,
            2 => TransferStatus::TimedOut,
            3 => TransferStatus::Cancelled,
            4 => TransferStatus::Stall,
            5 => TransferStatus::NoDevice,
            6 => TransferStatus::Overflow,
            other => TransferStatus::Unrecognized(other),
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            TransferStatus::Completed => 0,
            TransferStatus::Error => 1,
            TransferStatus::TimedOut => 2,
            TransferStatus::Cancelled => 3,
            TransferStatus::Stall => 4,
            TransferStatus::NoDevice => 5,
            TransferStatus::Overflow => 6,
            TransferStatus::Unrecognized(raw) => raw,
        }
    }

    /// Normalize to a caller-visible result
    ///
    /// `Completed` yields the byte count; every failure maps onto the error
    /// taxonomy, with unrecognized statuses collapsing to [`UsbError::Other`].
    pub fn into_result(self, actual_length: usize) -> TransferResult {
        match self {
            TransferStatus::Completed => Ok(actual_length),
            TransferStatus::Error => Err(UsbError::Io),
            TransferStatus::TimedOut => Err(UsbError::Timeout),
            TransferStatus::Cancelled => Err(UsbError::Interrupted),
            TransferStatus::Stall => Err(UsbError::Pipe),
            TransferStatus::NoDevice => Err(UsbError::NoDevice),
            TransferStatus::Overflow => Err(UsbError::Overflow),
            TransferStatus::Unrecognized(_) => Err(UsbError::Other),
        }
    }
}

/// One packet of an isochronous transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsoPacket {
    /// Requested length
    pub length: u32,
    /// Bytes actually transferred
    pub actual_length: u32,
    pub status: TransferStatus,
}

impl IsoPacket {
    pub fn new(length: u32) -> Self {
        Self {
            length,
            actual_length: 0,
            status: TransferStatus::Completed,
        }
    }
}

/// Total bytes moved by an isochronous transfer
///
/// Sums packet actual lengths in order and stops at the first empty packet;
/// a short stream ends there even if later packets report data.
pub fn iso_transferred_bytes(packets: &[IsoPacket]) -> usize {
    packets
        .iter()
        .take_while(|p| p.actual_length != 0)
        .map(|p| p.actual_length as usize)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_direction() {
        assert!(EndpointAddress(0x81).is_in());
        assert!(!EndpointAddress(0x01).is_in());
        assert_eq!(EndpointAddress(0x82).number(), 2);
        assert_eq!(EndpointAddress(0x02).direction(), Direction::Out);
    }

    #[test]
    fn test_setup_packet_layout() {
        let setup = SetupPacket::new(0xA1, 0x01, 0x0300, 0x0000, 8);
        assert_eq!(
            setup.to_bytes(),
            [0xA1, 0x01, 0x00, 0x03, 0x00, 0x00, 0x08, 0x00]
        );
        assert_eq!(setup.direction(), Direction::In);
    }

    #[test]
    fn test_setup_packet_masks_wide_fields() {
        let setup = SetupPacket::from_raw(0x1A1, 0x301, 0x1_0300, -1, 0x2_0008);
        assert_eq!(setup, SetupPacket::new(0xA1, 0x01, 0x0300, 0xffff, 0x0008));
    }

    #[test]
    fn test_setup_packet_from_bytes() {
        let bytes = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let setup = SetupPacket::from_bytes(&bytes);
        assert_eq!(setup.request, 0x06);
        assert_eq!(setup.value, 0x0100);
        assert_eq!(setup.length, 18);
        assert_eq!(setup.to_bytes(), bytes);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(TransferStatus::Completed.into_result(12), Ok(12));
        assert_eq!(
            TransferStatus::TimedOut.into_result(3),
            Err(UsbError::Timeout)
        );
        assert_eq!(TransferStatus::Stall.into_result(0), Err(UsbError::Pipe));
        assert_eq!(
            TransferStatus::Cancelled.into_result(0),
            Err(UsbError::Interrupted)
        );
        assert_eq!(
            TransferStatus::from_raw(77).into_result(0),
            Err(UsbError::Other)
        );
    }

    #[test]
    fn test_status_raw_values() {
        for raw in 0..=6 {
            assert_eq!(TransferStatus::from_raw(raw).to_raw(), raw);
        }
        assert_eq!(
            TransferStatus::from_raw(-3),
            TransferStatus::Unrecognized(-3)
        );
    }

    #[test]
    fn test_iso_sum_stops_at_first_empty_packet() {
        let packets: Vec<IsoPacket> = [64, 64, 0, 64]
            .iter()
            .map(|&actual| IsoPacket {
                length: 64,
                actual_length: actual,
                status: TransferStatus::Completed,
            })
            .collect();
        assert_eq!(iso_transferred_bytes(&packets), 128);
    }

    #[test]
    fn test_iso_sum_empty_table() {
        assert_eq!(iso_transferred_bytes(&[]), 0);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(TransferKind::Isochronous.to_string(), "isochronous");
        assert_eq!(TransferKind::ALL.len(), 4);
    }
}
