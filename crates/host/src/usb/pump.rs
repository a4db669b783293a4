//! Event pump thread
//!
//! Dedicated thread that keeps the host controller processing events so
//! asynchronous transfers complete. Completion callbacks run on this thread.

use crate::usb::backend::HostController;
use crate::usb::host::UsbHost;
use common::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use usbproto::UsbError;

/// Name of the pump thread
pub const PUMP_THREAD_NAME: &str = "usb-event-pump";

/// Back-off after a failed event handling pass
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Handle to a running event pump thread
///
/// Dropping the handle stops the thread and waits for it to exit.
pub struct EventPump {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventPump {
    /// Spawn the pump for `host`
    ///
    /// The thread holds only a weak reference and exits once the host is
    /// dropped.
    pub fn spawn<C: HostController>(host: Weak<UsbHost<C>>, poll_interval: Duration) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();

        let thread = std::thread::Builder::new()
            .name(PUMP_THREAD_NAME.to_string())
            .spawn(move || run(host, flag, poll_interval))
            .map_err(Error::Io)?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    /// Ask the thread to stop after its current pass
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(thread) = self.thread.take() {
            // A callback may drop the last host reference on the pump thread itself
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("Event pump thread panicked");
            }
        }
    }
}

fn run<C: HostController>(host: Weak<UsbHost<C>>, shutdown: Arc<AtomicBool>, poll_interval: Duration) {
    info!("Event pump started");

    while !shutdown.load(Ordering::Acquire) {
        let Some(strong) = host.upgrade() else {
            debug!("Host dropped, stopping event pump");
            break;
        };

        match strong.process_events(Some(poll_interval)) {
            Ok(()) => {}
            Err(Error::Usb(UsbError::Interrupted)) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                drop(strong);
                std::thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    info!("Event pump stopped");
}
