//! Synchronous transfer execution
//!
//! Blocking control, bulk and interrupt transfers against an open device.
//! The caller's buffer region `[offset, offset + length)` is lent to the
//! controller for the duration of the call: OUT transfers send it, IN
//! transfers fill it.
//!
//! Blocking calls leave the device's drain mark alone, so async work on
//! other endpoints keeps flowing while one of these waits.

use crate::usb::backend::HostController;
use crate::usb::handles::DeviceToken;
use crate::usb::host::UsbHost;
use common::Result;
use std::ops::Range;
use tracing::{debug, warn};
use usbproto::{EndpointAddress, SetupPacket, TransferKind, UsbError};

/// Validate `[offset, offset + length)` against a buffer of `len` bytes
pub(crate) fn checked_range(len: usize, offset: usize, length: usize) -> Result<Range<usize>> {
    let end = offset.checked_add(length).ok_or(UsbError::InvalidParam)?;
    if end > len {
        warn!(
            "Buffer region {}..{} exceeds buffer of {} bytes",
            offset, end, len
        );
        return Err(UsbError::InvalidParam.into());
    }
    Ok(offset..end)
}

impl<C: HostController> UsbHost<C> {
    /// Execute a control transfer
    ///
    /// The data stage occupies `setup.length` bytes of `buffer` starting at
    /// `offset`. Returns the number of data bytes moved.
    pub fn control_transfer(
        &self,
        token: DeviceToken,
        setup: SetupPacket,
        buffer: &mut [u8],
        offset: usize,
        timeout_ms: u32,
    ) -> Result<usize> {
        let entry = self.entry(token)?;
        let range = checked_range(buffer.len(), offset, setup.length as usize)?;

        debug!(
            "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, length={}",
            setup.request_type, setup.request, setup.value, setup.index, setup.length
        );

        let result =
            self.controller
                .control_transfer(&entry.device, setup, &mut buffer[range], timeout_ms);
        finish(TransferKind::Control, result)
    }

    /// Execute a bulk transfer on `endpoint`
    pub fn bulk_transfer(
        &self,
        token: DeviceToken,
        endpoint: EndpointAddress,
        buffer: &mut [u8],
        offset: usize,
        length: usize,
        timeout_ms: u32,
    ) -> Result<usize> {
        let entry = self.entry(token)?;
        let range = checked_range(buffer.len(), offset, length)?;

        debug!(
            "Bulk transfer: endpoint={}, length={}, timeout={}ms",
            endpoint, length, timeout_ms
        );

        let result =
            self.controller
                .bulk_transfer(&entry.device, endpoint, &mut buffer[range], timeout_ms);
        finish(TransferKind::Bulk, result)
    }

    /// Execute an interrupt transfer on `endpoint`
    pub fn interrupt_transfer(
        &self,
        token: DeviceToken,
        endpoint: EndpointAddress,
        buffer: &mut [u8],
        offset: usize,
        length: usize,
        timeout_ms: u32,
    ) -> Result<usize> {
        let entry = self.entry(token)?;
        let range = checked_range(buffer.len(), offset, length)?;

        debug!(
            "Interrupt transfer: endpoint={}, length={}, timeout={}ms",
            endpoint, length, timeout_ms
        );

        let result =
            self.controller
                .interrupt_transfer(&entry.device, endpoint, &mut buffer[range], timeout_ms);
        finish(TransferKind::Interrupt, result)
    }
}

fn finish(kind: TransferKind, result: std::result::Result<usize, UsbError>) -> Result<usize> {
    match result {
        Ok(n) => {
            debug!("{} transfer succeeded: {} bytes", kind, n);
            Ok(n)
        }
        Err(e) => {
            warn!("{} transfer failed: {}", kind, e);
            Err(e.into())
        }
    }
}
