//! Simulated host controller
//!
//! In-memory [`HostController`] used by the test suites and by the CLI's
//! `--simulate` mode. Devices answer from per-endpoint scripts; every
//! submission, OUT payload, dispatch and control operation is recorded so
//! tests can assert on what the controller observed.

use crate::usb::backend::{HostController, SubmitError};
use crate::usb::dispatch;
use crate::usb::transfer::{Kind, TransferDescriptor, TransferId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;
use usbproto::{
    BulkTransferCallback, ControlTransferCallback, Direction, EndpointAddress,
    InterruptTransferCallback, IsoBuffer, IsochronousTransferCallback, SetupPacket, TransferKind,
    TransferResult, TransferStatus, UsbError,
};

/// A simulated device connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimDevice {
    pub id: u32,
}

/// Scripted answer for the next transfer on an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimResponse {
    /// Device-to-host payload; longer than requested overflows
    Data(Vec<u8>),
    /// Finish with this status and no data
    Status(TransferStatus),
    /// Per-packet actual lengths for an isochronous transfer
    Iso(Vec<u32>),
}

/// Control operation observed by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOp {
    Reset { device: u32 },
    ClearHalt { device: u32, endpoint: EndpointAddress },
    ClaimInterface { device: u32, interface: u8, force: bool },
    ReleaseInterface { device: u32, interface: u8 },
    SetInterface { device: u32, interface: u8, alt_setting: u8 },
    SetConfiguration { device: u32, config: u8 },
    Close { device: u32 },
}

/// An accepted submission, as the controller saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub id: TransferId,
    pub device: u32,
    pub kind: TransferKind,
    pub endpoint: EndpointAddress,
    /// Setup stage of control transfers
    pub setup: Option<[u8; SetupPacket::SIZE]>,
    /// Host-to-device bytes in the controller's receive region
    pub payload: Vec<u8>,
    pub timeout_ms: u32,
}

#[derive(Default)]
struct SimState {
    queue: VecDeque<Box<TransferDescriptor>>,
    scripts: HashMap<(u32, u8), VecDeque<SimResponse>>,
    submissions: Vec<Submission>,
    rejected: Vec<(TransferId, UsbError)>,
    dispatches: HashMap<TransferId, usize>,
    fail_next: VecDeque<UsbError>,
    max_iso: HashMap<(u32, u8), usize>,
    ops: Vec<SimOp>,
    sync_out: Vec<(u32, EndpointAddress, Vec<u8>)>,
    claimed: HashMap<u32, Vec<u8>>,
    disconnected: bool,
    handle_events_calls: usize,
    held: HashSet<(u32, u8)>,
    blocked_sync: usize,
}

/// In-memory host controller
#[derive(Default)]
pub struct SimulatedController {
    state: Mutex<SimState>,
    ready: Condvar,
    released: Condvar,
}

impl SimulatedController {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device connection to adopt into a host
    pub fn device(&self, id: u32) -> SimDevice {
        SimDevice { id }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a response for the next transfer on `endpoint` of `device`
    ///
    /// Control requests are keyed by direction: `0x80` for IN, `0x00` for OUT.
    pub fn script(&self, device: &SimDevice, endpoint: EndpointAddress, response: SimResponse) {
        self.state()
            .scripts
            .entry((device.id, endpoint.0))
            .or_default()
            .push_back(response);
    }

    /// Refuse the next submission with `error`
    pub fn fail_next_submission(&self, error: UsbError) {
        self.state().fail_next.push_back(error);
    }

    pub fn set_max_iso_packet_size(&self, device: &SimDevice, endpoint: EndpointAddress, size: usize) {
        self.state().max_iso.insert((device.id, endpoint.0), size);
    }

    /// Block blocking transfers on `endpoint` until [`release`](Self::release)
    pub fn hold(&self, device: &SimDevice, endpoint: EndpointAddress) {
        self.state().held.insert((device.id, endpoint.0));
    }

    pub fn release(&self, device: &SimDevice, endpoint: EndpointAddress) {
        self.state().held.remove(&(device.id, endpoint.0));
        self.released.notify_all();
    }

    /// Blocking transfers currently parked on a held endpoint
    pub fn blocked_sync(&self) -> usize {
        self.state().blocked_sync
    }

    /// Every later operation fails with `NoDevice`
    pub fn disconnect(&self) {
        self.state().disconnected = true;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    pub fn last_submission(&self) -> Option<Submission> {
        self.state().submissions.last().cloned()
    }

    /// Submissions refused at submit time
    pub fn rejected(&self) -> Vec<(TransferId, UsbError)> {
        self.state().rejected.clone()
    }

    /// Times `id` went through the dispatcher
    pub fn dispatch_count(&self, id: TransferId) -> usize {
        self.state().dispatches.get(&id).copied().unwrap_or(0)
    }

    pub fn total_dispatches(&self) -> usize {
        self.state().dispatches.values().sum()
    }

    /// Accepted transfers not yet dispatched
    pub fn in_flight(&self) -> usize {
        self.state().queue.len()
    }

    pub fn ops(&self) -> Vec<SimOp> {
        self.state().ops.clone()
    }

    /// OUT payloads of blocking transfers
    pub fn sync_out(&self) -> Vec<(u32, EndpointAddress, Vec<u8>)> {
        self.state().sync_out.clone()
    }

    pub fn claimed_interfaces(&self, device: &SimDevice) -> Vec<u8> {
        self.state().claimed.get(&device.id).cloned().unwrap_or_default()
    }

    pub fn handle_events_calls(&self) -> usize {
        self.state().handle_events_calls
    }

    fn check_connected(state: &SimState) -> Result<(), UsbError> {
        if state.disconnected {
            Err(UsbError::NoDevice)
        } else {
            Ok(())
        }
    }

    /// Answer a blocking transfer from the script
    fn answer_sync(
        &self,
        device: &SimDevice,
        key: EndpointAddress,
        direction: Direction,
        data: &mut [u8],
    ) -> Result<usize, UsbError> {
        let mut state = self.state();
        let held = (device.id, key.0);
        if state.held.contains(&held) {
            state.blocked_sync += 1;
            state = self
                .released
                .wait_while(state, |s| s.held.contains(&held))
                .unwrap_or_else(PoisonError::into_inner);
            state.blocked_sync -= 1;
        }
        Self::check_connected(&state)?;

        let response = state
            .scripts
            .get_mut(&(device.id, key.0))
            .and_then(VecDeque::pop_front);

        match (direction, response) {
            (_, Some(SimResponse::Status(status))) => status.into_result(0),
            (Direction::In, Some(SimResponse::Data(payload))) => {
                let n = payload.len().min(data.len());
                data[..n].copy_from_slice(&payload[..n]);
                if payload.len() > data.len() {
                    return Err(UsbError::Overflow);
                }
                Ok(n)
            }
            (Direction::In, _) => Err(UsbError::Timeout),
            (Direction::Out, _) => {
                state.sync_out.push((device.id, key, data.to_vec()));
                Ok(data.len())
            }
        }
    }

    /// Apply the scripted outcome to an accepted descriptor
    fn complete_from_script(response: Option<SimResponse>, transfer: &mut TransferDescriptor) {
        let direction = transfer.direction();
        let is_iso = matches!(transfer.kind(), Kind::Isochronous { .. });
        let header = match transfer.kind() {
            Kind::Control { .. } => SetupPacket::SIZE,
            _ => 0,
        };
        let capacity = transfer.length() - header;

        match response {
            Some(SimResponse::Status(status)) => transfer.record_completion(status, 0),
            Some(SimResponse::Iso(actuals)) if is_iso => {
                let packet_len = transfer.iso_packet_len();
                for (index, packet) in transfer.iso_packets_mut().iter_mut().enumerate() {
                    packet.actual_length = actuals.get(index).copied().unwrap_or(0).min(packet.length);
                    packet.status = TransferStatus::Completed;
                }
                transfer.with_buffer_mut(|data| {
                    for (index, &actual) in actuals.iter().enumerate() {
                        let start = index * packet_len;
                        let end = (start + actual as usize).min(data.len()).min(start + packet_len);
                        if start < end {
                            data[start..end].fill(index as u8);
                        }
                    }
                });
                transfer.record_completion(TransferStatus::Completed, 0);
            }
            Some(SimResponse::Data(payload)) if direction == Direction::In && !is_iso => {
                let n = payload.len().min(capacity);
                transfer.with_buffer_mut(|data| {
                    data[header..header + n].copy_from_slice(&payload[..n]);
                });
                let status = if payload.len() > capacity {
                    TransferStatus::Overflow
                } else {
                    TransferStatus::Completed
                };
                transfer.record_completion(status, n);
            }
            _ if direction == Direction::Out => {
                transfer.record_completion(TransferStatus::Completed, capacity);
            }
            _ => transfer.record_completion(TransferStatus::TimedOut, 0),
        }
    }
}

impl HostController for SimulatedController {
    type Device = SimDevice;

    fn control_transfer(
        &self,
        device: &SimDevice,
        setup: SetupPacket,
        data: &mut [u8],
        _timeout_ms: u32,
    ) -> Result<usize, UsbError> {
        let key = match setup.direction() {
            Direction::In => EndpointAddress(0x80),
            Direction::Out => EndpointAddress::CONTROL,
        };
        self.answer_sync(device, key, setup.direction(), data)
    }

    fn bulk_transfer(
        &self,
        device: &SimDevice,
        endpoint: EndpointAddress,
        data: &mut [u8],
        _timeout_ms: u32,
    ) -> Result<usize, UsbError> {
        self.answer_sync(device, endpoint, endpoint.direction(), data)
    }

    fn interrupt_transfer(
        &self,
        device: &SimDevice,
        endpoint: EndpointAddress,
        data: &mut [u8],
        _timeout_ms: u32,
    ) -> Result<usize, UsbError> {
        self.answer_sync(device, endpoint, endpoint.direction(), data)
    }

    fn submit(
        &self,
        device: &SimDevice,
        mut transfer: Box<TransferDescriptor>,
    ) -> Result<(), SubmitError> {
        let mut state = self.state();

        let refusal = match state.fail_next.pop_front() {
            Some(error) => Some(error),
            None => Self::check_connected(&state).err(),
        };
        if let Some(error) = refusal {
            state.rejected.push((transfer.id(), error));
            return Err(SubmitError::new(error, transfer));
        }

        let kind = transfer.kind().tag();
        let endpoint = transfer.endpoint();
        let direction = transfer.direction();
        let (setup, payload) = transfer.with_buffer_mut(|data| match kind {
            TransferKind::Control => {
                let mut setup = [0u8; SetupPacket::SIZE];
                setup.copy_from_slice(&data[..SetupPacket::SIZE]);
                let payload = match direction {
                    Direction::Out => data[SetupPacket::SIZE..].to_vec(),
                    Direction::In => Vec::new(),
                };
                (Some(setup), payload)
            }
            _ if direction == Direction::Out => (None, data.to_vec()),
            _ => (None, Vec::new()),
        });

        state.submissions.push(Submission {
            id: transfer.id(),
            device: device.id,
            kind,
            endpoint,
            setup,
            payload,
            timeout_ms: transfer.timeout_ms(),
        });

        let key = match kind {
            TransferKind::Control if direction == Direction::In => 0x80,
            _ => endpoint.0,
        };
        let response = state
            .scripts
            .get_mut(&(device.id, key))
            .and_then(VecDeque::pop_front);
        Self::complete_from_script(response, &mut transfer);

        debug!("Simulated controller accepted {}", transfer.id());
        state.queue.push_back(transfer);
        self.ready.notify_all();
        Ok(())
    }

    fn handle_events(&self, timeout: Option<Duration>) -> Result<(), UsbError> {
        let ready: Vec<Box<TransferDescriptor>> = {
            let mut state = self.state();
            state.handle_events_calls += 1;

            if state.queue.is_empty() {
                if let Some(timeout) = timeout {
                    state = self
                        .ready
                        .wait_timeout_while(state, timeout, |s| s.queue.is_empty())
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }

            let ready: Vec<_> = state.queue.drain(..).collect();
            for transfer in &ready {
                *state.dispatches.entry(transfer.id()).or_default() += 1;
            }
            ready
        };

        // Dispatch outside the lock; callbacks may submit again
        for transfer in ready {
            dispatch::complete(transfer);
        }
        Ok(())
    }

    fn max_iso_packet_size(
        &self,
        device: &SimDevice,
        endpoint: EndpointAddress,
    ) -> Result<usize, UsbError> {
        let state = self.state();
        Self::check_connected(&state)?;
        state
            .max_iso
            .get(&(device.id, endpoint.0))
            .copied()
            .ok_or(UsbError::NotFound)
    }

    fn reset(&self, device: &SimDevice) -> Result<(), UsbError> {
        let mut state = self.state();
        Self::check_connected(&state)?;
        state.claimed.remove(&device.id);
        state.ops.push(SimOp::Reset { device: device.id });
        Ok(())
    }

    fn clear_halt(&self, device: &SimDevice, endpoint: EndpointAddress) -> Result<(), UsbError> {
        let mut state = self.state();
        Self::check_connected(&state)?;
        state.ops.push(SimOp::ClearHalt {
            device: device.id,
            endpoint,
        });
        Ok(())
    }

    fn claim_interface(&self, device: &SimDevice, interface: u8, force: bool) -> Result<(), UsbError> {
        let mut state = self.state();
        Self::check_connected(&state)?;
        let claimed = state.claimed.entry(device.id).or_default();
        if claimed.contains(&interface) {
            return Err(UsbError::Busy);
        }
        claimed.push(interface);
        state.ops.push(SimOp::ClaimInterface {
            device: device.id,
            interface,
            force,
        });
        Ok(())
    }

    fn release_interface(&self, device: &SimDevice, interface: u8) -> Result<(), UsbError> {
        let mut state = self.state();
        Self::check_connected(&state)?;
        let claimed = state.claimed.entry(device.id).or_default();
        let Some(position) = claimed.iter().position(|&i| i == interface) else {
            return Err(UsbError::NotFound);
        };
        claimed.remove(position);
        state.ops.push(SimOp::ReleaseInterface {
            device: device.id,
            interface,
        });
        Ok(())
    }

    fn set_interface(&self, device: &SimDevice, interface: u8, alt_setting: u8) -> Result<(), UsbError> {
        let mut state = self.state();
        Self::check_connected(&state)?;
        if !state
            .claimed
            .get(&device.id)
            .is_some_and(|claimed| claimed.contains(&interface))
        {
            return Err(UsbError::NotFound);
        }
        state.ops.push(SimOp::SetInterface {
            device: device.id,
            interface,
            alt_setting,
        });
        Ok(())
    }

    fn set_configuration(&self, device: &SimDevice, config: u8) -> Result<(), UsbError> {
        let mut state = self.state();
        Self::check_connected(&state)?;
        state.ops.push(SimOp::SetConfiguration {
            device: device.id,
            config,
        });
        Ok(())
    }

    fn close(&self, device: &SimDevice) {
        let mut state = self.state();
        state.claimed.remove(&device.id);
        state.ops.push(SimOp::Close { device: device.id });
    }
}

/// One completion seen by a [`RecordingCallback`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCompletion {
    pub kind: TransferKind,
    pub data: Option<Vec<u8>>,
    pub result: TransferResult,
    /// Valid length of the isochronous buffer when the callback ran
    pub iso_valid_len: Option<usize>,
}

/// Callback target that records every completion it receives
#[derive(Default)]
pub struct RecordingCallback {
    seen: Mutex<Vec<RecordedCompletion>>,
    arrived: Condvar,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, completion: RecordedCompletion) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(completion);
        self.arrived.notify_all();
    }

    pub fn completions(&self) -> Vec<RecordedCompletion> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Block until at least `count` completions arrived or `timeout` elapsed
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let (seen, _) = self
            .arrived
            .wait_timeout_while(seen, timeout, |seen| seen.len() < count)
            .unwrap_or_else(PoisonError::into_inner);
        seen.len() >= count
    }
}

impl ControlTransferCallback for RecordingCallback {
    fn on_control_transfer_complete(&self, data: Option<Vec<u8>>, result: TransferResult) {
        self.record(RecordedCompletion {
            kind: TransferKind::Control,
            data,
            result,
            iso_valid_len: None,
        });
    }
}

impl BulkTransferCallback for RecordingCallback {
    fn on_bulk_transfer_complete(&self, data: Option<Vec<u8>>, result: TransferResult) {
        self.record(RecordedCompletion {
            kind: TransferKind::Bulk,
            data,
            result,
            iso_valid_len: None,
        });
    }
}

impl InterruptTransferCallback for RecordingCallback {
    fn on_interrupt_transfer_complete(&self, data: Option<Vec<u8>>, result: TransferResult) {
        self.record(RecordedCompletion {
            kind: TransferKind::Interrupt,
            data,
            result,
            iso_valid_len: None,
        });
    }
}

impl IsochronousTransferCallback for RecordingCallback {
    fn on_isochronous_transfer_complete(&self, buffer: Option<IsoBuffer>, result: TransferResult) {
        self.record(RecordedCompletion {
            kind: TransferKind::Isochronous,
            data: buffer.as_ref().map(IsoBuffer::to_vec),
            result,
            iso_valid_len: buffer.as_ref().map(IsoBuffer::valid_len),
        });
    }
}
