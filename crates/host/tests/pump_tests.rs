//! Event pump integration tests
//!
//! Completions are delivered by the dedicated pump thread.
//!
//! # Test Scenarios
//! - Pump lifecycle (start, idempotent start, stop, host drop)
//! - Callbacks run on the pump thread
//! - A panicking callback does not stop the pump
//! - Completions bridged into Tokio through the completion channel
//!
//! Run with: `cargo test -p host --test pump_tests`

use common::test_utils::{DEFAULT_TEST_TIMEOUT, wait_until, with_timeout};
use common::{Completion, completion_channel};
use host::usb::{PUMP_THREAD_NAME, RecordingCallback, SimResponse, SimulatedController};
use host::{CallbackRegistry, DeviceToken, UsbHost};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use usbproto::{BulkTransferCallback, EndpointAddress, IsoBuffer, TransferKind, TransferResult};

const BULK_IN: EndpointAddress = EndpointAddress(0x81);
const ISO_IN: EndpointAddress = EndpointAddress(0x84);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn pumped_host() -> (Arc<UsbHost<SimulatedController>>, DeviceToken) {
    let host = UsbHost::new(SimulatedController::new()).with_poll_interval(POLL_INTERVAL);
    host.initialize(&CallbackRegistry::standard()).unwrap();
    let token = host.adopt(host.controller().device(1));
    let host = Arc::new(host);
    host.start_event_pump().unwrap();
    (host, token)
}

fn script_bulk(host: &UsbHost<SimulatedController>, data: Vec<u8>) {
    let device = host.controller().device(1);
    host.controller().script(&device, BULK_IN, SimResponse::Data(data));
}

/// Records the name of the thread each completion arrives on
#[derive(Default)]
struct ThreadProbe {
    threads: Mutex<Vec<Option<String>>>,
}

impl BulkTransferCallback for ThreadProbe {
    fn on_bulk_transfer_complete(&self, _data: Option<Vec<u8>>, _result: TransferResult) {
        let name = std::thread::current().name().map(str::to_string);
        self.threads.lock().unwrap().push(name);
    }
}

struct Panicker {
    calls: AtomicUsize,
}

impl BulkTransferCallback for Panicker {
    fn on_bulk_transfer_complete(&self, _data: Option<Vec<u8>>, _result: TransferResult) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("callback failure");
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_pump_start_is_idempotent() {
    let (host, _token) = pumped_host();
    assert!(host.is_pump_running());

    host.start_event_pump().unwrap();
    assert!(host.is_pump_running());

    host.stop_event_pump();
    assert!(!host.is_pump_running());

    host.start_event_pump().unwrap();
    assert!(host.is_pump_running());
}

#[test]
fn test_pump_keeps_polling() {
    let (host, _token) = pumped_host();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        host.controller().handle_events_calls() >= 3
    }));
}

#[test]
fn test_dropping_host_stops_pump() {
    let (host, _token) = pumped_host();
    let weak = Arc::downgrade(&host);
    drop(host);
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || weak.upgrade().is_none()));
}

// ============================================================================
// Delivery
// ============================================================================

#[test]
fn test_pump_delivers_completions() {
    let (host, token) = pumped_host();
    let callback = Arc::new(RecordingCallback::new());

    for i in 0..3u8 {
        script_bulk(&host, vec![i; 2]);
        host.submit_bulk_async(token, callback.clone(), BULK_IN, &[], 0, 8, 100)
            .unwrap();
    }

    assert!(callback.wait_for(3, DEFAULT_TEST_TIMEOUT));
    let data: Vec<_> = callback
        .completions()
        .into_iter()
        .map(|c| c.data.unwrap())
        .collect();
    assert_eq!(data, vec![vec![0, 0], vec![1, 1], vec![2, 2]]);

    for submission in host.controller().submissions() {
        assert_eq!(host.controller().dispatch_count(submission.id), 1);
    }
}

#[test]
fn test_callbacks_run_on_pump_thread() {
    let (host, token) = pumped_host();
    let probe = Arc::new(ThreadProbe::default());

    script_bulk(&host, vec![1]);
    host.submit_bulk_async(token, probe.clone(), BULK_IN, &[], 0, 8, 100)
        .unwrap();

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        !probe.threads.lock().unwrap().is_empty()
    }));
    assert_eq!(
        probe.threads.lock().unwrap()[0].as_deref(),
        Some(PUMP_THREAD_NAME)
    );
}

#[test]
fn test_panicking_callback_does_not_stop_pump() {
    let (host, token) = pumped_host();
    let panicker = Arc::new(Panicker {
        calls: AtomicUsize::new(0),
    });

    script_bulk(&host, vec![1]);
    host.submit_bulk_async(token, panicker.clone(), BULK_IN, &[], 0, 8, 100)
        .unwrap();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        panicker.calls.load(Ordering::SeqCst) == 1
    }));

    let callback = Arc::new(RecordingCallback::new());
    script_bulk(&host, vec![2]);
    host.submit_bulk_async(token, callback.clone(), BULK_IN, &[], 0, 8, 100)
        .unwrap();

    assert!(callback.wait_for(1, DEFAULT_TEST_TIMEOUT));
    assert!(host.is_pump_running());
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || Arc::strong_count(&panicker) == 1));
}

#[test]
fn test_iso_stream_on_pump() {
    let (host, token) = pumped_host();
    let device = host.controller().device(1);
    host.controller().set_max_iso_packet_size(&device, ISO_IN, 32);
    let iso = host.allocate_isochronous(token, ISO_IN, 2, None).unwrap();
    let buffer = IsoBuffer::new(iso.required_capacity());
    let callback = Arc::new(RecordingCallback::new());

    for round in 1..=3usize {
        host.controller()
            .script(&device, ISO_IN, SimResponse::Iso(vec![32, 16]));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || iso.is_idle()));
        host.submit_isochronous_async(&iso, callback.clone(), buffer.clone(), 100)
            .unwrap();
        assert!(callback.wait_for(round, DEFAULT_TEST_TIMEOUT));
    }

    assert!(callback.completions().iter().all(|c| c.result == Ok(48)));
    assert_eq!(buffer.valid_len(), 48);
}

// ============================================================================
// Tokio Bridge
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_completion_channel_into_tokio() {
    let (host, token) = pumped_host();
    let (sender, receiver) = completion_channel();
    let sender = Arc::new(sender);

    script_bulk(&host, vec![0xCA, 0xFE]);
    host.submit_bulk_async(token, sender.clone(), BULK_IN, &[], 0, 8, 100)
        .unwrap();
    host.submit_bulk_async(token, sender.clone(), EndpointAddress(0x02), &[1, 2, 3], 0, 3, 100)
        .unwrap();

    let first = with_timeout(DEFAULT_TEST_TIMEOUT, receiver.recv())
        .await
        .expect("no completion delivered")
        .unwrap();
    let second = with_timeout(DEFAULT_TEST_TIMEOUT, receiver.recv())
        .await
        .expect("no completion delivered")
        .unwrap();

    assert!(matches!(first, Completion::Bulk { .. }));
    assert_eq!(first.kind(), TransferKind::Bulk);
    assert_eq!(first.data(), Some(vec![0xCA, 0xFE]));
    assert_eq!(second.result(), Ok(3));
    assert_eq!(second.data(), None);
}
