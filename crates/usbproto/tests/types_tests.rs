//! Property and layout tests for the USB transfer types
//!
//! Run with: `cargo test -p usbproto --test types_tests`

use proptest::prelude::*;
use usbproto::{
    Direction, EndpointAddress, IsoPacket, SetupPacket, TransferKind, TransferStatus, UsbError,
    iso_transferred_bytes,
};

// ============================================================================
// Setup packet
// ============================================================================

#[test]
fn test_class_request_setup_bytes() {
    // GET_CUR style class request, interface recipient
    let setup = SetupPacket::from_raw(0xA1, 0x01, 0x0300, 0x0000, 8);
    let bytes = setup.to_bytes();

    assert_eq!(bytes.len(), SetupPacket::SIZE);
    assert_eq!(bytes, [0xA1, 0x01, 0x00, 0x03, 0x00, 0x00, 0x08, 0x00]);
}

#[test]
fn test_out_request_direction() {
    let setup = SetupPacket::new(0x21, 0x09, 0x0200, 0x0000, 4);
    assert_eq!(setup.direction(), Direction::Out);
}

proptest! {
    #[test]
    fn prop_setup_fields_are_masked(
        request_type in any::<i32>(),
        request in any::<i32>(),
        value in any::<i32>(),
        index in any::<i32>(),
        length in any::<i32>(),
    ) {
        let setup = SetupPacket::from_raw(request_type, request, value, index, length);
        let bytes = setup.to_bytes();

        prop_assert_eq!(bytes[0], (request_type & 0xff) as u8);
        prop_assert_eq!(bytes[1], (request & 0xff) as u8);
        prop_assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), (value & 0xffff) as u16);
        prop_assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), (index & 0xffff) as u16);
        prop_assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), (length & 0xffff) as u16);
    }

    #[test]
    fn prop_setup_bytes_decode(request_type: u8, request: u8, value: u16, index: u16, length: u16) {
        let setup = SetupPacket::new(request_type, request, value, index, length);
        prop_assert_eq!(SetupPacket::from_bytes(&setup.to_bytes()), setup);
    }

    #[test]
    fn prop_iso_sum_never_exceeds_prefix(actuals in proptest::collection::vec(0u32..1024, 0..32)) {
        let packets: Vec<IsoPacket> = actuals
            .iter()
            .map(|&actual_length| IsoPacket { length: 1024, actual_length, status: TransferStatus::Completed })
            .collect();

        let expected: usize = actuals
            .iter()
            .take_while(|&&a| a != 0)
            .map(|&a| a as usize)
            .sum();

        prop_assert_eq!(iso_transferred_bytes(&packets), expected);
        prop_assert!(iso_transferred_bytes(&packets) <= actuals.iter().map(|&a| a as usize).sum());
    }

    #[test]
    fn prop_error_codes_round_trip(code in -12i32..=-1) {
        prop_assert_eq!(UsbError::from_code(code).code(), code);
    }
}

// ============================================================================
// Status and serialization
// ============================================================================

#[test]
fn test_every_failure_status_is_negative() {
    let failures = [
        TransferStatus::Error,
        TransferStatus::TimedOut,
        TransferStatus::Cancelled,
        TransferStatus::Stall,
        TransferStatus::NoDevice,
        TransferStatus::Overflow,
        TransferStatus::Unrecognized(42),
    ];

    for status in failures {
        let err = status.into_result(100).unwrap_err();
        assert!(err.code() < 0);
    }
}

#[test]
fn test_types_serialize_as_json() {
    let setup = SetupPacket::new(0x80, 0x06, 0x0100, 0, 18);
    let json = serde_json::to_string(&setup).unwrap();
    let parsed: SetupPacket = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, setup);

    let kind: TransferKind = serde_json::from_str("\"Isochronous\"").unwrap();
    assert_eq!(kind, TransferKind::Isochronous);

    let err: UsbError = serde_json::from_str("\"Pipe\"").unwrap();
    assert_eq!(err.code(), -9);

    assert_eq!(EndpointAddress(0x81).to_string(), "0x81");
}
