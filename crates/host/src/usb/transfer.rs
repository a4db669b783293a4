//! Transfer descriptors
//!
//! A [`TransferDescriptor`] is one transfer attempt. It is built by the
//! submission engine, owned by the host controller while in flight and
//! consumed exactly once by the completion dispatcher.

use crate::usb::dispatch::PendingCompletion;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use usbproto::{
    Direction, EndpointAddress, IsoBuffer, IsoPacket, SetupPacket, TransferKind, TransferStatus,
};

/// Engine-assigned transfer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xfer#{}", self.0)
    }
}

/// Kind-specific part of a descriptor
#[derive(Debug, Clone)]
pub enum Kind {
    Control { setup: SetupPacket },
    Bulk,
    Interrupt,
    /// The packet table is allocated once; its length never changes
    Isochronous { packets: Box<[IsoPacket]> },
}

impl Kind {
    pub fn tag(&self) -> TransferKind {
        match self {
            Kind::Control { .. } => TransferKind::Control,
            Kind::Bulk => TransferKind::Bulk,
            Kind::Interrupt => TransferKind::Interrupt,
            Kind::Isochronous { .. } => TransferKind::Isochronous,
        }
    }
}

/// Memory backing a transfer
#[derive(Debug)]
pub enum TransferBuffer {
    /// Scratch buffer allocated by the engine
    Owned(Vec<u8>),
    /// Caller-owned isochronous buffer, bound without copying
    Caller(IsoBuffer),
    /// Reusable descriptor waiting for its next buffer
    Unbound,
}

/// Where a reusable descriptor is parked between submissions
pub type ParkSlot = Arc<Mutex<Option<Box<TransferDescriptor>>>>;

/// Put a descriptor back into its owner's slot
pub(crate) fn park(slot: &ParkSlot, transfer: Box<TransferDescriptor>) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    *slot = Some(transfer);
}

/// Take a parked descriptor, if it is not in flight
pub(crate) fn unpark(slot: &ParkSlot) -> Option<Box<TransferDescriptor>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// One transfer attempt
pub struct TransferDescriptor {
    id: TransferId,
    kind: Kind,
    endpoint: EndpointAddress,
    buffer: TransferBuffer,
    length: usize,
    timeout_ms: u32,
    status: Option<TransferStatus>,
    actual_length: usize,
    reusable: bool,
    pub(crate) pending: Option<PendingCompletion>,
    pub(crate) device: Option<Arc<dyn Any + Send + Sync>>,
}

impl TransferDescriptor {
    /// Control transfer; the buffer is the setup stage followed by the data stage
    ///
    /// `out` is copied into the data stage of host-to-device requests.
    pub fn control(id: TransferId, setup: SetupPacket, out: Option<&[u8]>, timeout_ms: u32) -> Self {
        let data_len = setup.length as usize;
        let mut buffer = vec![0u8; SetupPacket::SIZE + data_len];
        buffer[..SetupPacket::SIZE].copy_from_slice(&setup.to_bytes());
        if let (Direction::Out, Some(out)) = (setup.direction(), out) {
            let n = out.len().min(data_len);
            buffer[SetupPacket::SIZE..SetupPacket::SIZE + n].copy_from_slice(&out[..n]);
        }

        Self::new(
            id,
            Kind::Control { setup },
            EndpointAddress::CONTROL,
            TransferBuffer::Owned(buffer),
            SetupPacket::SIZE + data_len,
            timeout_ms,
        )
    }

    pub fn bulk(
        id: TransferId,
        endpoint: EndpointAddress,
        length: usize,
        out: Option<&[u8]>,
        timeout_ms: u32,
    ) -> Self {
        Self::stream(id, Kind::Bulk, endpoint, length, out, timeout_ms)
    }

    pub fn interrupt(
        id: TransferId,
        endpoint: EndpointAddress,
        length: usize,
        out: Option<&[u8]>,
        timeout_ms: u32,
    ) -> Self {
        Self::stream(id, Kind::Interrupt, endpoint, length, out, timeout_ms)
    }

    /// Reusable isochronous descriptor with `num_packets` equal packets
    pub fn isochronous(
        id: TransferId,
        endpoint: EndpointAddress,
        num_packets: usize,
        packet_len: usize,
    ) -> Self {
        let packets = vec![IsoPacket::new(packet_len as u32); num_packets].into_boxed_slice();
        let mut transfer = Self::new(
            id,
            Kind::Isochronous { packets },
            endpoint,
            TransferBuffer::Unbound,
            num_packets * packet_len,
            0,
        );
        transfer.reusable = true;
        transfer
    }

    fn stream(
        id: TransferId,
        kind: Kind,
        endpoint: EndpointAddress,
        length: usize,
        out: Option<&[u8]>,
        timeout_ms: u32,
    ) -> Self {
        let mut buffer = vec![0u8; length];
        if let (false, Some(out)) = (endpoint.is_in(), out) {
            let n = out.len().min(length);
            buffer[..n].copy_from_slice(&out[..n]);
        }
        Self::new(id, kind, endpoint, TransferBuffer::Owned(buffer), length, timeout_ms)
    }

    fn new(
        id: TransferId,
        kind: Kind,
        endpoint: EndpointAddress,
        buffer: TransferBuffer,
        length: usize,
        timeout_ms: u32,
    ) -> Self {
        Self {
            id,
            kind,
            endpoint,
            buffer,
            length,
            timeout_ms,
            status: None,
            actual_length: 0,
            reusable: false,
            pending: None,
            device: None,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    pub fn endpoint(&self) -> EndpointAddress {
        self.endpoint
    }

    /// Data direction; control transfers follow `bmRequestType`
    pub fn direction(&self) -> Direction {
        match &self.kind {
            Kind::Control { setup } => setup.direction(),
            _ => self.endpoint.direction(),
        }
    }

    /// Bytes the controller may move, setup stage included for control
    pub fn length(&self) -> usize {
        self.length
    }

    /// Milliseconds; 0 waits forever
    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    pub fn status(&self) -> Option<TransferStatus> {
        self.status
    }

    pub fn actual_length(&self) -> usize {
        self.actual_length
    }

    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    pub fn iso_packets(&self) -> &[IsoPacket] {
        match &self.kind {
            Kind::Isochronous { packets } => packets,
            _ => &[],
        }
    }

    pub fn iso_packets_mut(&mut self) -> &mut [IsoPacket] {
        match &mut self.kind {
            Kind::Isochronous { packets } => packets,
            _ => &mut [],
        }
    }

    /// Requested length of each isochronous packet
    pub fn iso_packet_len(&self) -> usize {
        self.iso_packets()
            .first()
            .map_or(0, |packet| packet.length as usize)
    }

    /// Store the controller's completion report
    pub fn record_completion(&mut self, status: TransferStatus, actual_length: usize) {
        self.status = Some(status);
        self.actual_length = actual_length;
    }

    /// Run `f` over the transfer's memory
    pub fn with_buffer_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        match &mut self.buffer {
            TransferBuffer::Owned(data) => f(data.as_mut_slice()),
            TransferBuffer::Caller(buffer) => buffer.with_storage(f),
            TransferBuffer::Unbound => f(&mut []),
        }
    }

    /// Bytes the controller wrote past the setup stage, for IN completions
    pub(crate) fn received(&mut self, actual_length: usize) -> Vec<u8> {
        let start = match self.kind {
            Kind::Control { .. } => SetupPacket::SIZE,
            _ => 0,
        };
        self.with_buffer_mut(|data| {
            let start = start.min(data.len());
            let end = (start + actual_length).min(data.len());
            data[start..end].to_vec()
        })
    }

    /// Raw pointer to the transfer's memory, for handing to the controller
    pub(crate) fn buffer_ptr(&mut self) -> *mut u8 {
        match &mut self.buffer {
            TransferBuffer::Owned(data) => data.as_mut_ptr(),
            TransferBuffer::Caller(buffer) => buffer.as_mut_ptr().0,
            TransferBuffer::Unbound => std::ptr::null_mut(),
        }
    }

    pub(crate) fn bind_buffer(&mut self, buffer: IsoBuffer, timeout_ms: u32) {
        self.buffer = TransferBuffer::Caller(buffer);
        self.timeout_ms = timeout_ms;
    }

    pub(crate) fn take_pending(&mut self) -> Option<PendingCompletion> {
        self.pending.take()
    }

    /// Clear per-submission state before parking
    pub(crate) fn reset_for_reuse(&mut self) {
        self.buffer = TransferBuffer::Unbound;
        self.status = None;
        self.actual_length = 0;
        self.pending = None;
        self.device = None;
        for packet in self.iso_packets_mut() {
            packet.actual_length = 0;
            packet.status = TransferStatus::Completed;
        }
    }

    pub(crate) fn set_id(&mut self, id: TransferId) {
        self.id = id;
    }
}

impl fmt::Debug for TransferDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferDescriptor")
            .field("id", &self.id)
            .field("kind", &self.kind.tag())
            .field("endpoint", &self.endpoint)
            .field("length", &self.length)
            .field("timeout_ms", &self.timeout_ms)
            .field("status", &self.status)
            .field("actual_length", &self.actual_length)
            .field("reusable", &self.reusable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_buffer_layout() {
        let setup = SetupPacket::new(0x21, 0x09, 0x0200, 0x0001, 3);
        let mut transfer = TransferDescriptor::control(TransferId(1), setup, Some(&[7, 8, 9]), 100);

        assert_eq!(transfer.length(), 11);
        assert_eq!(transfer.direction(), Direction::Out);
        transfer.with_buffer_mut(|data| {
            assert_eq!(&data[..8], &setup.to_bytes());
            assert_eq!(&data[8..], &[7, 8, 9]);
        });
    }

    #[test]
    fn test_control_in_ignores_out_data() {
        let setup = SetupPacket::new(0x80, 0x06, 0x0100, 0, 4);
        let mut transfer = TransferDescriptor::control(TransferId(1), setup, Some(&[1; 4]), 0);
        transfer.with_buffer_mut(|data| assert_eq!(&data[8..], &[0; 4]));
    }

    #[test]
    fn test_received_skips_setup_stage() {
        let setup = SetupPacket::new(0x80, 0x06, 0x0100, 0, 4);
        let mut transfer = TransferDescriptor::control(TransferId(1), setup, None, 0);
        transfer.with_buffer_mut(|data| data[8..].copy_from_slice(&[1, 2, 3, 4]));

        assert_eq!(transfer.received(2), vec![1, 2]);
        // Clamped to the buffer
        assert_eq!(transfer.received(100), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_bulk_out_copies_payload() {
        let mut transfer =
            TransferDescriptor::bulk(TransferId(2), EndpointAddress(0x02), 4, Some(&[1, 2, 3, 4]), 0);
        transfer.with_buffer_mut(|data| assert_eq!(data, &[1, 2, 3, 4]));
        assert_eq!(transfer.kind().tag(), TransferKind::Bulk);
    }

    #[test]
    fn test_isochronous_packet_table() {
        let mut transfer = TransferDescriptor::isochronous(TransferId(3), EndpointAddress(0x81), 4, 192);

        assert!(transfer.is_reusable());
        assert_eq!(transfer.iso_packets().len(), 4);
        assert_eq!(transfer.iso_packet_len(), 192);
        assert_eq!(transfer.length(), 768);

        transfer.iso_packets_mut()[1].actual_length = 10;
        transfer.record_completion(TransferStatus::Completed, 0);
        transfer.reset_for_reuse();
        assert!(transfer.iso_packets().iter().all(|p| p.actual_length == 0));
        assert!(transfer.status().is_none());
        assert_eq!(transfer.iso_packets().len(), 4);
    }

    #[test]
    fn test_park_and_unpark() {
        let slot: ParkSlot = Arc::new(Mutex::new(None));
        park(
            &slot,
            Box::new(TransferDescriptor::isochronous(TransferId(4), EndpointAddress(0x81), 1, 8)),
        );
        assert_eq!(unpark(&slot).map(|t| t.id()), Some(TransferId(4)));
        assert!(unpark(&slot).is_none());
    }
}
