//! libusb host controller
//!
//! Blocking transfers and device control go through `rusb`. Asynchronous
//! transfers use the raw libusb transfer API: the descriptor is boxed into
//! the transfer's user data on submit and recovered exactly once in
//! [`transfer_completed`], which hands it to the dispatcher.

use crate::usb::backend::{HostController, SubmitError};
use crate::usb::dispatch;
use crate::usb::handles::DeviceToken;
use crate::usb::host::UsbHost;
use crate::usb::transfer::{Kind, TransferDescriptor};
use rusb::ffi::{
    libusb_alloc_transfer, libusb_fill_bulk_transfer, libusb_fill_control_transfer,
    libusb_fill_interrupt_transfer, libusb_fill_iso_transfer, libusb_free_transfer,
    libusb_get_max_iso_packet_size, libusb_set_iso_packet_lengths, libusb_submit_transfer,
    libusb_transfer,
};
use rusb::{Context, DeviceHandle, UsbContext};
use std::ffi::{c_int, c_uint, c_void};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, error, warn};
use usbproto::{Direction, EndpointAddress, SetupPacket, TransferStatus, UsbError};

/// Map rusb::Error to UsbError
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Io => UsbError::Io,
        rusb::Error::InvalidParam => UsbError::InvalidParam,
        rusb::Error::Access => UsbError::Access,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::Busy,
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Pipe => UsbError::Pipe,
        rusb::Error::Interrupted => UsbError::Interrupted,
        rusb::Error::NoMem => UsbError::NoMemory,
        rusb::Error::NotSupported => UsbError::NotSupported,
        _ => UsbError::Other,
    }
}

/// Host controller backed by a libusb context
pub struct LibusbController {
    context: Context,
}

impl LibusbController {
    pub fn new() -> Result<Self, UsbError> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self { context })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Open the first device matching `vendor_id:product_id`
    pub fn open(&self, vendor_id: u16, product_id: u16) -> Result<LibusbDevice, UsbError> {
        let handle = self
            .context
            .open_device_with_vid_pid(vendor_id, product_id)
            .ok_or(UsbError::NotFound)?;

        debug!("Opened device {:04x}:{:04x}", vendor_id, product_id);
        Ok(LibusbDevice {
            handle: RwLock::new(handle),
            claimed: Mutex::new(Vec::new()),
            vendor_id,
            product_id,
        })
    }
}

impl UsbHost<LibusbController> {
    /// Open a device by vendor and product id and register it
    pub fn open(&self, vendor_id: u16, product_id: u16) -> common::Result<DeviceToken> {
        let device = self.controller().open(vendor_id, product_id).inspect_err(|e| {
            warn!("Failed to open device {:04x}:{:04x}: {}", vendor_id, product_id, e);
        })?;
        Ok(self.adopt(device))
    }
}

/// Open libusb device connection
///
/// The native handle is closed when the last reference is dropped, which
/// happens only after every in-flight transfer on it has been dispatched.
pub struct LibusbDevice {
    handle: RwLock<DeviceHandle<Context>>,
    /// Claimed interfaces, with whether a kernel driver was detached for them
    claimed: Mutex<Vec<(u8, bool)>>,
    vendor_id: u16,
    product_id: u16,
}

impl LibusbDevice {
    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    fn handle(&self) -> RwLockReadGuard<'_, DeviceHandle<Context>> {
        self.handle.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_mut(&self) -> RwLockWriteGuard<'_, DeviceHandle<Context>> {
        self.handle.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn claimed(&self) -> std::sync::MutexGuard<'_, Vec<(u8, bool)>> {
        self.claimed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn timeout(timeout_ms: u32) -> Duration {
    Duration::from_millis(u64::from(timeout_ms))
}

impl HostController for LibusbController {
    type Device = LibusbDevice;

    fn control_transfer(
        &self,
        device: &LibusbDevice,
        setup: SetupPacket,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, UsbError> {
        let handle = device.handle();
        let SetupPacket {
            request_type,
            request,
            value,
            index,
            ..
        } = setup;

        match setup.direction() {
            Direction::In => {
                handle.read_control(request_type, request, value, index, data, timeout(timeout_ms))
            }
            Direction::Out => {
                handle.write_control(request_type, request, value, index, data, timeout(timeout_ms))
            }
        }
        .map_err(map_rusb_error)
    }

    fn bulk_transfer(
        &self,
        device: &LibusbDevice,
        endpoint: EndpointAddress,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, UsbError> {
        let handle = device.handle();
        match endpoint.direction() {
            Direction::In => handle.read_bulk(endpoint.0, data, timeout(timeout_ms)),
            Direction::Out => handle.write_bulk(endpoint.0, data, timeout(timeout_ms)),
        }
        .map_err(map_rusb_error)
    }

    fn interrupt_transfer(
        &self,
        device: &LibusbDevice,
        endpoint: EndpointAddress,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, UsbError> {
        let handle = device.handle();
        match endpoint.direction() {
            Direction::In => handle.read_interrupt(endpoint.0, data, timeout(timeout_ms)),
            Direction::Out => handle.write_interrupt(endpoint.0, data, timeout(timeout_ms)),
        }
        .map_err(map_rusb_error)
    }

    fn submit(
        &self,
        device: &LibusbDevice,
        mut transfer: Box<TransferDescriptor>,
    ) -> Result<(), SubmitError> {
        let num_packets = transfer.iso_packets().len();
        let packet_len = transfer.iso_packet_len();
        let endpoint = transfer.endpoint().0;
        let length = transfer.length();
        let timeout_ms = transfer.timeout_ms() as c_uint;
        let is_control = matches!(transfer.kind(), Kind::Control { .. });
        let is_bulk = matches!(transfer.kind(), Kind::Bulk);
        let is_iso = num_packets > 0;
        let buffer = transfer.buffer_ptr();

        if buffer.is_null() {
            return Err(SubmitError::new(UsbError::InvalidParam, transfer));
        }

        // SAFETY: plain allocation; null is handled below
        let raw = unsafe { libusb_alloc_transfer(num_packets as c_int) };
        if raw.is_null() {
            return Err(SubmitError::new(UsbError::NoMemory, transfer));
        }

        let handle = device.handle();
        let dev = handle.as_raw();
        let user_data = Box::into_raw(transfer) as *mut c_void;

        // SAFETY: `raw` was allocated with room for `num_packets` packet
        // descriptors. `buffer` points into memory owned by the boxed
        // descriptor (or its bound IsoBuffer), which stays alive at
        // `user_data` until `transfer_completed` reclaims it.
        let rc = unsafe {
            if is_control {
                libusb_fill_control_transfer(raw, dev, buffer, transfer_completed as _, user_data, timeout_ms);
            } else if is_iso {
                libusb_fill_iso_transfer(
                    raw,
                    dev,
                    endpoint,
                    buffer,
                    length as c_int,
                    num_packets as c_int,
                    transfer_completed as _,
                    user_data,
                    timeout_ms,
                );
                libusb_set_iso_packet_lengths(raw, packet_len as c_uint);
            } else if is_bulk {
                libusb_fill_bulk_transfer(
                    raw,
                    dev,
                    endpoint,
                    buffer,
                    length as c_int,
                    transfer_completed as _,
                    user_data,
                    timeout_ms,
                );
            } else {
                libusb_fill_interrupt_transfer(
                    raw,
                    dev,
                    endpoint,
                    buffer,
                    length as c_int,
                    transfer_completed as _,
                    user_data,
                    timeout_ms,
                );
            }
            libusb_submit_transfer(raw)
        };

        if rc < 0 {
            // SAFETY: libusb refused the transfer, so the callback will never
            // run and `user_data` is still the box leaked above.
            let transfer = unsafe {
                libusb_free_transfer(raw);
                Box::from_raw(user_data as *mut TransferDescriptor)
            };
            return Err(SubmitError::new(UsbError::from_code(rc), transfer));
        }

        Ok(())
    }

    fn handle_events(&self, timeout: Option<Duration>) -> Result<(), UsbError> {
        self.context.handle_events(timeout).map_err(map_rusb_error)
    }

    fn max_iso_packet_size(
        &self,
        device: &LibusbDevice,
        endpoint: EndpointAddress,
    ) -> Result<usize, UsbError> {
        let handle = device.handle();
        let usb_device = handle.device();
        // SAFETY: the device reference is held by `usb_device` for the call
        let rc = unsafe { libusb_get_max_iso_packet_size(usb_device.as_raw(), endpoint.0) };
        usbproto::check_code(rc)
    }

    fn reset(&self, device: &LibusbDevice) -> Result<(), UsbError> {
        device.handle_mut().reset().map_err(map_rusb_error)
    }

    fn clear_halt(&self, device: &LibusbDevice, endpoint: EndpointAddress) -> Result<(), UsbError> {
        device.handle_mut().clear_halt(endpoint.0).map_err(map_rusb_error)
    }

    fn claim_interface(&self, device: &LibusbDevice, interface: u8, force: bool) -> Result<(), UsbError> {
        let handle = device.handle_mut();
        let mut detached = false;

        match handle.claim_interface(interface) {
            Ok(()) => {}
            Err(rusb::Error::Busy) if force => {
                debug!("Interface {} busy, detaching kernel driver", interface);
                match handle.detach_kernel_driver(interface) {
                    Ok(()) => detached = true,
                    Err(e) => warn!("Failed to detach kernel driver from interface {}: {}", interface, e),
                }
                handle.claim_interface(interface).map_err(map_rusb_error)?;
            }
            Err(e) => return Err(map_rusb_error(e)),
        }

        device.claimed().push((interface, detached));
        debug!("Claimed interface {}", interface);
        Ok(())
    }

    fn release_interface(&self, device: &LibusbDevice, interface: u8) -> Result<(), UsbError> {
        device
            .handle_mut()
            .release_interface(interface)
            .map_err(map_rusb_error)?;
        device.claimed().retain(|&(claimed, _)| claimed != interface);
        debug!("Released interface {}", interface);
        Ok(())
    }

    fn set_interface(&self, device: &LibusbDevice, interface: u8, alt_setting: u8) -> Result<(), UsbError> {
        device
            .handle_mut()
            .set_alternate_setting(interface, alt_setting)
            .map_err(map_rusb_error)
    }

    fn set_configuration(&self, device: &LibusbDevice, config: u8) -> Result<(), UsbError> {
        device
            .handle_mut()
            .set_active_configuration(config)
            .map_err(map_rusb_error)
    }

    fn close(&self, device: &LibusbDevice) {
        let handle = device.handle_mut();
        let claimed: Vec<(u8, bool)> = device.claimed().drain(..).collect();

        for (interface, detached) in claimed {
            if let Err(e) = handle.release_interface(interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }

            if detached {
                // Restore the device to kernel control
                if let Err(e) = handle.attach_kernel_driver(interface) {
                    debug!("Could not reattach kernel driver to interface {}: {}", interface, e);
                }
            }
        }

        debug!(
            "Closed device {:04x}:{:04x}",
            device.vendor_id, device.product_id
        );
    }
}

/// libusb completion callback
///
/// Runs inside `libusb_handle_events` on the pumping thread.
extern "system" fn transfer_completed(raw: *mut libusb_transfer) {
    if raw.is_null() {
        return;
    }

    // SAFETY: libusb passes back the transfer handed to it by `submit`
    let user_data = unsafe { (*raw).user_data };
    if user_data.is_null() {
        // Ownership unknown; leave the transfer alone
        error!("libusb transfer completed without user data");
        return;
    }

    // SAFETY: `submit` stored a leaked `Box<TransferDescriptor>` here and this
    // is the only place that reclaims it. The packet descriptors follow the
    // transfer struct and `num_iso_packets` of them were allocated.
    let transfer = unsafe {
        let native = &mut *raw;
        let mut transfer = Box::from_raw(user_data as *mut TransferDescriptor);
        native.user_data = std::ptr::null_mut();

        let num_packets = usize::try_from(native.num_iso_packets).unwrap_or(0);
        if num_packets > 0 {
            let packets = std::slice::from_raw_parts(native.iso_packet_desc.as_ptr(), num_packets);
            for (packet, native_packet) in transfer.iso_packets_mut().iter_mut().zip(packets) {
                packet.actual_length = native_packet.actual_length;
                packet.status = TransferStatus::from_raw(native_packet.status);
            }
        }

        let actual = usize::try_from(native.actual_length).unwrap_or(0);
        transfer.record_completion(TransferStatus::from_raw(native.status), actual);

        libusb_free_transfer(raw);
        transfer
    };

    dispatch::complete(transfer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), UsbError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), UsbError::Pipe);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), UsbError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::NoMem), UsbError::NoMemory);
        assert_eq!(map_rusb_error(rusb::Error::BadDescriptor), UsbError::Other);
    }

    #[test]
    fn test_rusb_and_libusb_codes_agree() {
        // rusb errors carry the libusb code the taxonomy is built on
        assert_eq!(UsbError::from_code(-7), map_rusb_error(rusb::Error::Timeout));
        assert_eq!(UsbError::from_code(-6), map_rusb_error(rusb::Error::Busy));
    }

    #[test]
    fn test_controller_creation() {
        // Context creation may fail without USB access
        match LibusbController::new() {
            Ok(controller) => {
                assert!(controller.open(0xffff, 0xfffe).is_err());
            }
            Err(e) => {
                eprintln!("libusb context unavailable (expected without USB access): {}", e);
            }
        }
    }
}
