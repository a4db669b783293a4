//! Async channel bridge between the event pump thread and Tokio
//!
//! Completion callbacks run synchronously on whichever thread drives the
//! host controller's events. [`CompletionSender`] implements every callback
//! contract by forwarding into a bounded channel, so async code can simply
//! await [`CompletionReceiver::recv`].

use async_channel::{Receiver, Sender, bounded};
use tracing::warn;
use usbproto::{
    BulkTransferCallback, ControlTransferCallback, InterruptTransferCallback, IsoBuffer,
    IsochronousTransferCallback, TransferKind, TransferResult,
};

/// Capacity of the completion channel
pub const COMPLETION_CHANNEL_CAPACITY: usize = 256;

/// A transfer completion delivered from the event pump thread
#[derive(Debug)]
pub enum Completion {
    Control {
        data: Option<Vec<u8>>,
        result: TransferResult,
    },
    Bulk {
        data: Option<Vec<u8>>,
        result: TransferResult,
    },
    Interrupt {
        data: Option<Vec<u8>>,
        result: TransferResult,
    },
    Isochronous {
        buffer: Option<IsoBuffer>,
        result: TransferResult,
    },
}

impl Completion {
    pub fn kind(&self) -> TransferKind {
        match self {
            Completion::Control { .. } => TransferKind::Control,
            Completion::Bulk { .. } => TransferKind::Bulk,
            Completion::Interrupt { .. } => TransferKind::Interrupt,
            Completion::Isochronous { .. } => TransferKind::Isochronous,
        }
    }

    pub fn result(&self) -> TransferResult {
        match self {
            Completion::Control { result, .. }
            | Completion::Bulk { result, .. }
            | Completion::Interrupt { result, .. }
            | Completion::Isochronous { result, .. } => *result,
        }
    }

    /// Received bytes, if any
    ///
    /// For isochronous completions this is a copy of the buffer's valid region.
    pub fn data(&self) -> Option<Vec<u8>> {
        match self {
            Completion::Control { data, .. }
            | Completion::Bulk { data, .. }
            | Completion::Interrupt { data, .. } => data.clone(),
            Completion::Isochronous { buffer, .. } => buffer.as_ref().map(IsoBuffer::to_vec),
        }
    }
}

/// Callback target that forwards completions into the channel (pump side)
#[derive(Clone)]
pub struct CompletionSender {
    tx: Sender<Completion>,
}

impl CompletionSender {
    /// Send a completion, blocking the pump thread while the channel is full
    pub fn send(&self, completion: Completion) -> crate::Result<()> {
        self.tx
            .send_blocking(completion)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    fn forward(&self, completion: Completion) {
        let kind = completion.kind();
        if let Err(e) = self.send(completion) {
            warn!("Dropping {} completion, receiver gone: {}", kind, e);
        }
    }
}

impl ControlTransferCallback for CompletionSender {
    fn on_control_transfer_complete(&self, data: Option<Vec<u8>>, result: TransferResult) {
        self.forward(Completion::Control { data, result });
    }
}

impl BulkTransferCallback for CompletionSender {
    fn on_bulk_transfer_complete(&self, data: Option<Vec<u8>>, result: TransferResult) {
        self.forward(Completion::Bulk { data, result });
    }
}

impl InterruptTransferCallback for CompletionSender {
    fn on_interrupt_transfer_complete(&self, data: Option<Vec<u8>>, result: TransferResult) {
        self.forward(Completion::Interrupt { data, result });
    }
}

impl IsochronousTransferCallback for CompletionSender {
    fn on_isochronous_transfer_complete(&self, buffer: Option<IsoBuffer>, result: TransferResult) {
        self.forward(Completion::Isochronous { buffer, result });
    }
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct CompletionReceiver {
    rx: Receiver<Completion>,
}

impl CompletionReceiver {
    /// Receive the next completion
    pub async fn recv(&self) -> crate::Result<Completion> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next completion (blocking)
    pub fn recv_blocking(&self) -> crate::Result<Completion> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a completion without blocking
    pub fn try_recv(&self) -> Option<Completion> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create the completion channel
///
/// Returns (CompletionSender for callback registration, CompletionReceiver for Tokio)
pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    let (tx, rx) = bounded(COMPLETION_CHANNEL_CAPACITY);
    (CompletionSender { tx }, CompletionReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use usbproto::UsbError;

    #[tokio::test]
    async fn test_completion_crosses_threads() {
        let (sender, receiver) = completion_channel();

        // Simulate the event pump thread delivering a completion
        let handle = std::thread::spawn(move || {
            sender.on_bulk_transfer_complete(Some(vec![1, 2, 3]), Ok(3));
        });

        let completion = receiver.recv().await.unwrap();
        handle.join().unwrap();

        assert_eq!(completion.kind(), TransferKind::Bulk);
        assert_eq!(completion.result(), Ok(3));
        assert_eq!(completion.data(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_error_completion() {
        let (sender, receiver) = completion_channel();
        sender.on_control_transfer_complete(None, Err(UsbError::Pipe));

        let completion = receiver.try_recv().unwrap();
        assert_eq!(completion.kind(), TransferKind::Control);
        assert_eq!(completion.result(), Err(UsbError::Pipe));
        assert!(completion.data().is_none());
        assert!(receiver.is_empty());
    }

    #[test]
    fn test_isochronous_data_is_valid_region() {
        let (sender, receiver) = completion_channel();
        let buffer = IsoBuffer::from_vec(vec![5; 16]);
        buffer.set_valid_len(6);
        sender.on_isochronous_transfer_complete(Some(buffer), Ok(6));

        let completion = receiver.recv_blocking().unwrap();
        assert_eq!(completion.data(), Some(vec![5; 6]));
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (sender, receiver) = completion_channel();
        drop(receiver);
        // Forwarding must not panic the pump thread
        sender.on_interrupt_transfer_complete(None, Ok(0));
        assert!(sender.send(Completion::Bulk { data: None, result: Ok(0) }).is_err());
    }
}
