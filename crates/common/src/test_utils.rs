//! Test utilities for usb-xfer
//!
//! Helpers shared by the crate test suites: timeouts, polling and canned
//! USB payloads.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_bulk_data, get_descriptor_setup};
//!
//! let data = create_mock_bulk_data(4);
//! assert_eq!(data, vec![0, 1, 2, 3]);
//!
//! let setup = get_descriptor_setup(0x01, 18);
//! assert_eq!(setup.length, 18);
//! ```

use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use usbproto::SetupPacket;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a future with a timeout
///
/// # Example
/// ```
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug, Error)]
#[error("Test timed out after {duration:?}")]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

/// Poll `condition` from a plain thread until it holds or `timeout` elapses
///
/// Returns the final value of the condition.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Counting byte pattern (wraps at 256)
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

/// Standard device descriptor (18 bytes)
pub fn create_mock_device_descriptor() -> Vec<u8> {
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x00, 0x02, // bcdUSB 2.00
        0x00, // bDeviceClass
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x40, // bMaxPacketSize0
        0x34, 0x12, // idVendor
        0x78, 0x56, // idProduct
        0x00, 0x01, // bcdDevice
        0x01, // iManufacturer
        0x02, // iProduct
        0x03, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}

/// GET_DESCRIPTOR request for `descriptor_type`, index 0
pub fn get_descriptor_setup(descriptor_type: u8, length: u16) -> SetupPacket {
    SetupPacket::new(0x80, 0x06, u16::from(descriptor_type) << 8, 0x0000, length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(result.is_err());
    }

    #[test]
    fn test_wait_until() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            c.store(1, Ordering::SeqCst);
        });

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || counter.load(Ordering::SeqCst) == 1));
        assert!(!wait_until(Duration::from_millis(10), || false));
    }

    #[test]
    fn test_mock_device_descriptor() {
        let desc = create_mock_device_descriptor();
        assert_eq!(desc.len(), 18);
        assert_eq!(desc[0] as usize, desc.len());
        assert_eq!(desc[1], 0x01);
    }

    #[test]
    fn test_get_descriptor_setup() {
        let setup = get_descriptor_setup(0x02, 9);
        assert_eq!(setup.to_bytes(), [0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0x09, 0x00]);
    }
}
