//! Completion notification contracts
//!
//! One trait per transfer kind. Each is invoked exactly once per accepted
//! submission, on whichever thread is pumping host-controller events, with
//! the received data (IN transfers that succeeded) and the transfer result.

use crate::error::TransferResult;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Completion contract for asynchronous control transfers
pub trait ControlTransferCallback: Send + Sync {
    /// `data` holds the bytes of the data stage for successful IN requests
    fn on_control_transfer_complete(&self, data: Option<Vec<u8>>, result: TransferResult);
}

/// Completion contract for asynchronous bulk transfers
pub trait BulkTransferCallback: Send + Sync {
    fn on_bulk_transfer_complete(&self, data: Option<Vec<u8>>, result: TransferResult);
}

/// Completion contract for asynchronous interrupt transfers
pub trait InterruptTransferCallback: Send + Sync {
    fn on_interrupt_transfer_complete(&self, data: Option<Vec<u8>>, result: TransferResult);
}

/// Completion contract for asynchronous isochronous transfers
///
/// The buffer is the caller's own [`IsoBuffer`]; its valid length has already
/// been updated when this runs, and is zero when the transfer failed.
pub trait IsochronousTransferCallback: Send + Sync {
    fn on_isochronous_transfer_complete(&self, buffer: Option<IsoBuffer>, result: TransferResult);
}

/// Caller-owned buffer backing isochronous transfers
///
/// Cloning shares the same storage. The storage never reallocates, so the
/// host controller may write into it while a transfer is outstanding; the
/// caller must not touch it until the completion arrives.
#[derive(Clone)]
pub struct IsoBuffer {
    inner: Arc<IsoBufferInner>,
}

struct IsoBufferInner {
    data: Mutex<Box<[u8]>>,
    valid: AtomicUsize,
}

impl IsoBuffer {
    /// Allocate a zeroed buffer with nothing valid yet
    pub fn new(capacity: usize) -> Self {
        Self::with_valid(vec![0u8; capacity], 0)
    }

    /// Wrap existing bytes; the whole buffer starts out valid
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self::with_valid(data, len)
    }

    fn with_valid(data: Vec<u8>, valid: usize) -> Self {
        Self {
            inner: Arc::new(IsoBufferInner {
                data: Mutex::new(data.into_boxed_slice()),
                valid: AtomicUsize::new(valid),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().len()
    }

    /// Length of the region written by the last completed transfer
    pub fn valid_len(&self) -> usize {
        self.inner.valid.load(Ordering::Acquire)
    }

    /// Set the valid region, clamped to capacity
    pub fn set_valid_len(&self, len: usize) {
        let len = len.min(self.capacity());
        self.inner.valid.store(len, Ordering::Release);
    }

    /// Copy of the valid region
    pub fn to_vec(&self) -> Vec<u8> {
        let valid = self.valid_len();
        self.lock()[..valid].to_vec()
    }

    /// Run `f` over the whole backing storage
    pub fn with_storage<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.lock())
    }

    /// Raw pointer and length of the backing storage
    ///
    /// The pointer stays valid for as long as any clone of this buffer is
    /// alive.
    pub fn as_mut_ptr(&self) -> (*mut u8, usize) {
        let mut data = self.lock();
        (data.as_mut_ptr(), data.len())
    }

    /// Number of live references to the storage
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.inner
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for IsoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsoBuffer")
            .field("capacity", &self.capacity())
            .field("valid", &self.valid_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_buffer_valid_len_clamped() {
        let buffer = IsoBuffer::new(256);
        assert_eq!(buffer.valid_len(), 0);
        assert!(buffer.to_vec().is_empty());
        buffer.set_valid_len(128);
        assert_eq!(buffer.valid_len(), 128);
        buffer.set_valid_len(1024);
        assert_eq!(buffer.valid_len(), 256);
    }

    #[test]
    fn test_iso_buffer_clones_share_storage() {
        let buffer = IsoBuffer::new(4);
        let other = buffer.clone();
        other.with_storage(|data| data.copy_from_slice(&[9, 8, 7, 6]));
        buffer.set_valid_len(2);
        assert_eq!(buffer.to_vec(), vec![9, 8]);
        assert_eq!(buffer.ref_count(), 2);
        drop(other);
        assert_eq!(buffer.ref_count(), 1);
    }

    #[test]
    fn test_iso_buffer_from_vec_starts_valid() {
        let buffer = IsoBuffer::from_vec(vec![1, 2, 3]);
        assert_eq!(buffer.valid_len(), 3);
        assert_eq!(buffer.to_vec(), vec![1, 2, 3]);
    }
}
