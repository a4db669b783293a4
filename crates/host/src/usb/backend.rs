//! Host controller interface
//!
//! [`HostController`] is the seam between the transfer engine and the
//! native USB stack. The libusb backend drives real hardware; the simulated
//! controller stands in for it in tests.

use crate::usb::transfer::TransferDescriptor;
use std::fmt;
use std::time::Duration;
use usbproto::{EndpointAddress, SetupPacket, UsbError};

/// A submission the controller refused, handed back for release
pub struct SubmitError {
    pub error: UsbError,
    pub transfer: Box<TransferDescriptor>,
}

impl SubmitError {
    pub fn new(error: UsbError, transfer: Box<TransferDescriptor>) -> Self {
        Self { error, transfer }
    }
}

impl fmt::Debug for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitError")
            .field("error", &self.error)
            .field("transfer", &self.transfer.id())
            .finish()
    }
}

/// Native USB host controller operations
///
/// Blocking calls take the data region as a slice and return the number of
/// bytes moved. [`submit`](HostController::submit) only enqueues; the
/// controller hands the descriptor to
/// [`dispatch::complete`](crate::usb::dispatch::complete) from inside
/// [`handle_events`](HostController::handle_events) once it finishes.
pub trait HostController: Send + Sync + 'static {
    /// Open device connection
    type Device: Send + Sync + 'static;

    /// Blocking control transfer; `data` is the data stage
    fn control_transfer(
        &self,
        device: &Self::Device,
        setup: SetupPacket,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, UsbError>;

    fn bulk_transfer(
        &self,
        device: &Self::Device,
        endpoint: EndpointAddress,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, UsbError>;

    fn interrupt_transfer(
        &self,
        device: &Self::Device,
        endpoint: EndpointAddress,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, UsbError>;

    /// Queue a transfer
    ///
    /// On failure the descriptor comes back untouched and will never be
    /// dispatched.
    fn submit(
        &self,
        device: &Self::Device,
        transfer: Box<TransferDescriptor>,
    ) -> Result<(), SubmitError>;

    /// Process pending events, dispatching finished transfers
    ///
    /// Blocks up to `timeout`, or the controller's default when `None`.
    fn handle_events(&self, timeout: Option<Duration>) -> Result<(), UsbError>;

    /// Largest isochronous packet the endpoint accepts per service interval
    fn max_iso_packet_size(
        &self,
        device: &Self::Device,
        endpoint: EndpointAddress,
    ) -> Result<usize, UsbError>;

    fn reset(&self, device: &Self::Device) -> Result<(), UsbError>;

    fn clear_halt(&self, device: &Self::Device, endpoint: EndpointAddress) -> Result<(), UsbError>;

    /// Claim an interface; `force` detaches a kernel driver holding it
    fn claim_interface(&self, device: &Self::Device, interface: u8, force: bool)
    -> Result<(), UsbError>;

    fn release_interface(&self, device: &Self::Device, interface: u8) -> Result<(), UsbError>;

    fn set_interface(
        &self,
        device: &Self::Device,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), UsbError>;

    fn set_configuration(&self, device: &Self::Device, config: u8) -> Result<(), UsbError>;

    /// Release claimed interfaces before the connection is dropped
    fn close(&self, device: &Self::Device);
}
