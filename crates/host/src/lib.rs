//! Host-side USB transfer layer
//!
//! Synchronous and asynchronous control, bulk, interrupt and isochronous
//! transfers against open USB devices, with completions delivered to
//! registered callback contracts from a dedicated event pump thread.
//!
//! ```no_run
//! use host::{CallbackRegistry, LibusbController, UsbHost};
//! use std::sync::Arc;
//!
//! # fn main() -> common::Result<()> {
//! let host = Arc::new(UsbHost::new(LibusbController::new()?));
//! host.initialize(&CallbackRegistry::standard())?;
//! host.start_event_pump()?;
//! let device = host.open(0x1234, 0x5678)?;
//! host.reset_device(device)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod usb;

pub use config::HostConfig;
pub use usb::{
    CallbackRegistry, DeviceToken, DrainGuard, HostController, IsochronousTransfer, LibusbController,
    SimulatedController, UsbHost,
};
