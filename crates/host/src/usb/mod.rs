//! USB transfer engine
//!
//! Host-side transfer layer on top of a [`HostController`]:
//! - Blocking control, bulk and interrupt transfers (`transfers`)
//! - Asynchronous submission for all four transfer kinds (`submit`)
//! - Completion dispatch into the registered callback contracts (`dispatch`)
//! - A dedicated event pump thread driving completions (`pump`)
//! - Device reset, stall clearing and interface management (`host`)
//!
//! Two controllers ship with the crate: [`LibusbController`] for real
//! hardware and [`SimulatedController`] for tests and dry runs.

pub mod backend;
pub mod callbacks;
pub mod dispatch;
pub mod handles;
pub mod host;
pub mod libusb;
pub mod pump;
pub mod simulated;
pub mod submit;
pub mod transfer;
pub mod transfers;

// Re-export public types
pub use backend::{HostController, SubmitError};
pub use callbacks::{CallbackRegistry, CallbackTarget, Callbacks};
pub use handles::{DeviceToken, HandleArena};
pub use host::{DEFAULT_POLL_INTERVAL, DrainGuard, UsbHost};
pub use libusb::{LibusbController, LibusbDevice};
pub use pump::{EventPump, PUMP_THREAD_NAME};
pub use simulated::{RecordedCompletion, RecordingCallback, SimDevice, SimOp, SimResponse, SimulatedController, Submission};
pub use submit::IsochronousTransfer;
pub use transfer::{Kind, TransferDescriptor, TransferId};
