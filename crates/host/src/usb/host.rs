//! USB host facade
//!
//! [`UsbHost`] owns the host controller, the arena of open devices and the
//! resolved completion callbacks. Transfer entry points live in
//! `transfers` (blocking) and `submit` (asynchronous); this module holds
//! device lifecycle, the control operations and event processing.

use crate::usb::backend::HostController;
use crate::usb::callbacks::{CallbackRegistry, Callbacks};
use crate::usb::handles::{DeviceToken, HandleArena};
use crate::usb::pump::EventPump;
use crate::usb::transfer::TransferId;
use common::{Error, Result};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use usbproto::{EndpointAddress, UsbError};

/// Default event pump poll interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An open device and its drain state
pub struct DeviceEntry<D> {
    pub(crate) device: D,
    /// Number of threads currently draining this device's events
    pub(crate) draining: Arc<AtomicUsize>,
}

impl<D> DeviceEntry<D> {
    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire) > 0
    }
}

/// Marks a device as draining its events until dropped
///
/// While any guard is alive, asynchronous submissions to the device fail
/// with [`UsbError::Busy`].
#[must_use = "the device stops draining as soon as the guard is dropped"]
pub struct DrainGuard {
    counter: Arc<AtomicUsize>,
}

impl DrainGuard {
    pub(crate) fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Host-side USB transfer engine
pub struct UsbHost<C: HostController> {
    pub(crate) controller: Arc<C>,
    pub(crate) devices: HandleArena<DeviceEntry<C::Device>>,
    callbacks: RwLock<Option<Callbacks>>,
    next_transfer: AtomicU64,
    poll_interval: Duration,
    pump: Mutex<Option<EventPump>>,
}

impl<C: HostController> UsbHost<C> {
    pub fn new(controller: C) -> Self {
        Self {
            controller: Arc::new(controller),
            devices: HandleArena::new(),
            callbacks: RwLock::new(None),
            next_transfer: AtomicU64::new(1),
            poll_interval: DEFAULT_POLL_INTERVAL,
            pump: Mutex::new(None),
        }
    }

    /// How long each event pump iteration blocks in the controller
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    /// Resolve the completion contracts
    ///
    /// Fails closed: if any kind lacks a contract, async submission stays
    /// unavailable and the error names the missing kind.
    pub fn initialize(&self, registry: &CallbackRegistry) -> Result<()> {
        let callbacks = registry.resolve()?;
        *self.callbacks.write().unwrap_or_else(PoisonError::into_inner) = Some(callbacks);
        info!("Completion callbacks initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub(crate) fn resolved_callbacks(&self) -> Result<Callbacks> {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::NotInitialized)
    }

    pub(crate) fn next_transfer_id(&self) -> TransferId {
        TransferId(self.next_transfer.fetch_add(1, Ordering::Relaxed))
    }

    /// Register an already-open device connection
    pub fn adopt(&self, device: C::Device) -> DeviceToken {
        let token = self.devices.insert(DeviceEntry {
            device,
            draining: Arc::new(AtomicUsize::new(0)),
        });
        debug!("Adopted device {}", token);
        token
    }

    /// Close a device connection
    ///
    /// The token is invalid afterwards. Transfers still in flight keep the
    /// connection alive until they are dispatched.
    pub fn close(&self, token: DeviceToken) -> Result<()> {
        let entry = self.devices.remove(token).ok_or(Error::InvalidHandle)?;
        self.controller.close(&entry.device);
        debug!("Closed device {}", token);
        Ok(())
    }

    /// Tokens of every open device
    pub fn devices(&self) -> Vec<DeviceToken> {
        self.devices.tokens()
    }

    pub(crate) fn entry(&self, token: DeviceToken) -> Result<Arc<DeviceEntry<C::Device>>> {
        self.devices.get(token).ok_or(Error::InvalidHandle)
    }

    /// Mark the device as draining events on this thread
    pub fn begin_drain(&self, token: DeviceToken) -> Result<DrainGuard> {
        let entry = self.entry(token)?;
        Ok(DrainGuard::new(entry.draining.clone()))
    }

    pub fn reset_device(&self, token: DeviceToken) -> Result<()> {
        let entry = self.entry(token)?;
        self.controller.reset(&entry.device).inspect_err(|e| {
            warn!("Reset of {} failed: {}", token, e);
        })?;
        debug!("Reset device {}", token);
        Ok(())
    }

    /// Clear a halt/stall condition on an endpoint
    pub fn clear_stall(&self, token: DeviceToken, endpoint: EndpointAddress) -> Result<()> {
        let entry = self.entry(token)?;
        self.controller
            .clear_halt(&entry.device, endpoint)
            .inspect_err(|e| warn!("Clear halt on {} {} failed: {}", token, endpoint, e))?;
        debug!("Cleared stall on {} endpoint {}", token, endpoint);
        Ok(())
    }

    pub fn claim_interface(&self, token: DeviceToken, interface: u8, force: bool) -> Result<()> {
        let entry = self.entry(token)?;
        self.controller
            .claim_interface(&entry.device, interface, force)?;
        debug!("Claimed interface {} on {}", interface, token);
        Ok(())
    }

    pub fn release_interface(&self, token: DeviceToken, interface: u8) -> Result<()> {
        let entry = self.entry(token)?;
        self.controller.release_interface(&entry.device, interface)?;
        debug!("Released interface {} on {}", interface, token);
        Ok(())
    }

    /// Select an alternate setting of a claimed interface
    pub fn set_interface(&self, token: DeviceToken, interface: u8, alt_setting: u8) -> Result<()> {
        let entry = self.entry(token)?;
        self.controller
            .set_interface(&entry.device, interface, alt_setting)?;
        Ok(())
    }

    pub fn set_configuration(&self, token: DeviceToken, config: u8) -> Result<()> {
        let entry = self.entry(token)?;
        self.controller.set_configuration(&entry.device, config)?;
        Ok(())
    }

    pub fn max_iso_packet_size(&self, token: DeviceToken, endpoint: EndpointAddress) -> Result<usize> {
        let entry = self.entry(token)?;
        Ok(self.controller.max_iso_packet_size(&entry.device, endpoint)?)
    }

    /// Let the controller process events, dispatching finished transfers
    ///
    /// Must be driven from somewhere for as long as asynchronous transfers
    /// may be outstanding; see [`start_event_pump`](Self::start_event_pump).
    pub fn process_events(&self, timeout: Option<Duration>) -> Result<()> {
        self.controller.handle_events(timeout)?;
        Ok(())
    }

    /// Start the dedicated event pump thread, if it is not already running
    pub fn start_event_pump(self: &Arc<Self>) -> Result<()> {
        let mut pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
        if pump.as_ref().is_some_and(EventPump::is_running) {
            return Ok(());
        }
        *pump = Some(EventPump::spawn(Arc::downgrade(self), self.poll_interval)?);
        Ok(())
    }

    /// Stop the event pump thread and wait for it to exit
    pub fn stop_event_pump(&self) {
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(pump);
    }

    pub fn is_pump_running(&self) -> bool {
        self.pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(EventPump::is_running)
    }
}

/// Fail fast while the device is draining its events elsewhere
pub(crate) fn ensure_idle<D>(token: DeviceToken, entry: &DeviceEntry<D>) -> Result<()> {
    if entry.is_draining() {
        debug!("{} is draining events elsewhere, refusing submission", token);
        return Err(UsbError::Busy.into());
    }
    Ok(())
}

impl<C: HostController> Drop for UsbHost<C> {
    fn drop(&mut self) {
        self.stop_event_pump();
        for token in self.devices.tokens() {
            if let Some(entry) = self.devices.remove(token) {
                self.controller.close(&entry.device);
            }
        }
    }
}
