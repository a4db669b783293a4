//! Common utilities for usb-xfer
//!
//! This crate provides functionality shared by the host engine and its
//! front ends: the host error type, logging setup, and the async channel
//! bridge that carries transfer completions off the event pump thread.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{Completion, CompletionReceiver, CompletionSender, completion_channel};
pub use error::{Error, Result};
pub use logging::setup_logging;
