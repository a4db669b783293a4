//! Asynchronous transfer submission
//!
//! Each entry point builds a descriptor, attaches the pending completion and
//! hands it to the controller. A submission the controller refuses is
//! released on the spot and reported as an error; an accepted one reports
//! its result only through the completion callback.

use crate::usb::backend::{HostController, SubmitError};
use crate::usb::callbacks::CallbackTarget;
use crate::usb::dispatch::PendingCompletion;
use crate::usb::handles::DeviceToken;
use crate::usb::host::{DeviceEntry, UsbHost, ensure_idle};
use crate::usb::transfer::{ParkSlot, TransferDescriptor, park, unpark};
use crate::usb::transfers::checked_range;
use common::{Error, Result};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};
use usbproto::{
    BulkTransferCallback, ControlTransferCallback, Direction, EndpointAddress,
    InterruptTransferCallback, IsoBuffer, IsochronousTransferCallback, SetupPacket, UsbError,
};

/// A reusable isochronous transfer
///
/// The descriptor and its packet table are allocated once and parked here
/// between submissions. While a submission is in flight the slot is empty.
pub struct IsochronousTransfer {
    token: DeviceToken,
    endpoint: EndpointAddress,
    num_packets: usize,
    packet_len: usize,
    slot: ParkSlot,
}

impl IsochronousTransfer {
    pub fn token(&self) -> DeviceToken {
        self.token
    }

    pub fn endpoint(&self) -> EndpointAddress {
        self.endpoint
    }

    pub fn num_packets(&self) -> usize {
        self.num_packets
    }

    pub fn packet_len(&self) -> usize {
        self.packet_len
    }

    /// Smallest buffer a submission accepts
    pub fn required_capacity(&self) -> usize {
        self.num_packets * self.packet_len
    }

    /// True when no submission is in flight
    pub fn is_idle(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl std::fmt::Debug for IsochronousTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsochronousTransfer")
            .field("token", &self.token)
            .field("endpoint", &self.endpoint)
            .field("num_packets", &self.num_packets)
            .field("packet_len", &self.packet_len)
            .finish()
    }
}

impl<C: HostController> UsbHost<C> {
    /// Submit an asynchronous control transfer
    ///
    /// For host-to-device requests the data stage is copied from
    /// `buffer[offset..offset + setup.length]`; device-to-host requests ignore
    /// `buffer` and deliver the received bytes to `callback`.
    pub fn submit_control_async(
        &self,
        token: DeviceToken,
        callback: Arc<dyn ControlTransferCallback>,
        setup: SetupPacket,
        buffer: &[u8],
        offset: usize,
        timeout_ms: u32,
    ) -> Result<()> {
        let callbacks = self.resolved_callbacks()?;
        let entry = self.entry(token)?;
        ensure_idle(token, &entry)?;

        let out = match setup.direction() {
            Direction::Out => {
                Some(&buffer[checked_range(buffer.len(), offset, setup.length as usize)?])
            }
            Direction::In => None,
        };

        let mut transfer = TransferDescriptor::control(self.next_transfer_id(), setup, out, timeout_ms);
        transfer.pending = Some(PendingCompletion::new(CallbackTarget::Control(callback), callbacks));
        self.submit_descriptor(token, &entry, Box::new(transfer), None)
    }

    /// Submit an asynchronous bulk transfer
    ///
    /// OUT endpoints copy `buffer[offset..offset + length]`; IN endpoints read
    /// up to `length` bytes and ignore `buffer`.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_bulk_async(
        &self,
        token: DeviceToken,
        callback: Arc<dyn BulkTransferCallback>,
        endpoint: EndpointAddress,
        buffer: &[u8],
        offset: usize,
        length: usize,
        timeout_ms: u32,
    ) -> Result<()> {
        let callbacks = self.resolved_callbacks()?;
        let entry = self.entry(token)?;
        ensure_idle(token, &entry)?;

        let out = out_region(endpoint, buffer, offset, length)?;
        let mut transfer =
            TransferDescriptor::bulk(self.next_transfer_id(), endpoint, length, out, timeout_ms);
        transfer.pending = Some(PendingCompletion::new(CallbackTarget::Bulk(callback), callbacks));
        self.submit_descriptor(token, &entry, Box::new(transfer), None)
    }

    /// Submit an asynchronous interrupt transfer
    #[allow(clippy::too_many_arguments)]
    pub fn submit_interrupt_async(
        &self,
        token: DeviceToken,
        callback: Arc<dyn InterruptTransferCallback>,
        endpoint: EndpointAddress,
        buffer: &[u8],
        offset: usize,
        length: usize,
        timeout_ms: u32,
    ) -> Result<()> {
        let callbacks = self.resolved_callbacks()?;
        let entry = self.entry(token)?;
        ensure_idle(token, &entry)?;

        let out = out_region(endpoint, buffer, offset, length)?;
        let mut transfer =
            TransferDescriptor::interrupt(self.next_transfer_id(), endpoint, length, out, timeout_ms);
        transfer.pending = Some(PendingCompletion::new(
            CallbackTarget::Interrupt(callback),
            callbacks,
        ));
        self.submit_descriptor(token, &entry, Box::new(transfer), None)
    }

    /// Allocate a reusable isochronous transfer with `num_packets` packets
    ///
    /// Packets are sized to the endpoint's maximum isochronous packet size
    /// when the controller reports one, otherwise to `packet_size`.
    pub fn allocate_isochronous(
        &self,
        token: DeviceToken,
        endpoint: EndpointAddress,
        num_packets: usize,
        packet_size: Option<usize>,
    ) -> Result<IsochronousTransfer> {
        let entry = self.entry(token)?;
        if num_packets == 0 {
            return Err(UsbError::InvalidParam.into());
        }

        let packet_len = match self.controller.max_iso_packet_size(&entry.device, endpoint) {
            Ok(size) if size > 0 => size,
            queried => match packet_size {
                Some(size) if size > 0 => {
                    debug!(
                        "No usable max iso packet size for {} ({:?}), using {}",
                        endpoint, queried, size
                    );
                    size
                }
                _ => {
                    warn!("Cannot size isochronous packets for {}", endpoint);
                    return Err(queried.err().unwrap_or(UsbError::InvalidParam).into());
                }
            },
        };

        let transfer =
            TransferDescriptor::isochronous(self.next_transfer_id(), endpoint, num_packets, packet_len);
        debug!(
            "Allocated isochronous transfer on {} {}: {} x {} bytes",
            token, endpoint, num_packets, packet_len
        );

        Ok(IsochronousTransfer {
            token,
            endpoint,
            num_packets,
            packet_len,
            slot: Arc::new(Mutex::new(Some(Box::new(transfer)))),
        })
    }

    /// Submit an isochronous transfer into the caller's `buffer`
    ///
    /// The buffer is bound without copying and must hold
    /// `num_packets * packet_len` bytes. Fails with `Busy` while the previous
    /// submission of the same transfer is still in flight.
    pub fn submit_isochronous_async(
        &self,
        iso: &IsochronousTransfer,
        callback: Arc<dyn IsochronousTransferCallback>,
        buffer: IsoBuffer,
        timeout_ms: u32,
    ) -> Result<()> {
        let callbacks = self.resolved_callbacks()?;
        let entry = self.entry(iso.token)?;
        ensure_idle(iso.token, &entry)?;

        if buffer.capacity() < iso.required_capacity() {
            warn!(
                "Isochronous buffer of {} bytes is smaller than {} packets x {} bytes",
                buffer.capacity(),
                iso.num_packets,
                iso.packet_len
            );
            return Err(UsbError::InvalidParam.into());
        }

        let Some(mut transfer) = unpark(&iso.slot) else {
            debug!("Isochronous transfer on {} is still in flight", iso.endpoint);
            return Err(UsbError::Busy.into());
        };

        transfer.set_id(self.next_transfer_id());
        transfer.bind_buffer(buffer.clone(), timeout_ms);
        transfer.pending = Some(
            PendingCompletion::new(CallbackTarget::Isochronous(callback), callbacks)
                .with_buffer(buffer)
                .with_park(iso.slot.clone()),
        );
        self.submit_descriptor(iso.token, &entry, transfer, Some(&iso.slot))
    }

    /// Hand a descriptor to the controller
    ///
    /// A refused reusable descriptor goes back to `park_on_failure`; any
    /// other refused descriptor is released together with its pending
    /// completion.
    fn submit_descriptor(
        &self,
        token: DeviceToken,
        entry: &Arc<DeviceEntry<C::Device>>,
        mut transfer: Box<TransferDescriptor>,
        park_on_failure: Option<&ParkSlot>,
    ) -> Result<()> {
        let id = transfer.id();
        let kind = transfer.kind().tag();
        let endpoint = transfer.endpoint();
        transfer.device = Some(entry.clone());

        match self.controller.submit(&entry.device, transfer) {
            Ok(()) => {
                debug!("Submitted {} {} on {} endpoint {}", id, kind, token, endpoint);
                Ok(())
            }
            Err(SubmitError { error, mut transfer }) => {
                warn!("Submission of {} {} on {} failed: {}", id, kind, token, error);
                match park_on_failure {
                    Some(slot) => {
                        transfer.reset_for_reuse();
                        park(slot, transfer);
                    }
                    None => drop(transfer),
                }
                Err(Error::Usb(error))
            }
        }
    }
}

/// OUT payload for stream transfers; IN endpoints copy nothing
fn out_region(
    endpoint: EndpointAddress,
    buffer: &[u8],
    offset: usize,
    length: usize,
) -> Result<Option<&[u8]>> {
    if endpoint.is_in() {
        return Ok(None);
    }
    let range = checked_range(buffer.len(), offset, length)?;
    Ok(Some(&buffer[range]))
}
