//! Completion dispatcher
//!
//! Runs on whichever thread is pumping host-controller events. Every
//! submitted descriptor comes through [`complete`] exactly once; the pending
//! completion it carries is consumed there on every path.

use crate::usb::callbacks::{CallbackTarget, Callbacks};
use crate::usb::transfer::{Kind, ParkSlot, TransferDescriptor, park};
use tracing::{debug, error, warn};
use usbproto::{Direction, IsoBuffer, TransferStatus, UsbError, iso_transferred_bytes};

/// Everything needed to notify the submitter of one transfer
pub struct PendingCompletion {
    /// Strong reference to the caller's target, released after notification
    pub(crate) target: CallbackTarget,
    pub(crate) callbacks: Callbacks,
    /// Caller-owned isochronous buffer
    pub(crate) buffer: Option<IsoBuffer>,
    /// Owner slot for reusable descriptors
    pub(crate) park: Option<ParkSlot>,
}

impl PendingCompletion {
    pub(crate) fn new(target: CallbackTarget, callbacks: Callbacks) -> Self {
        Self {
            target,
            callbacks,
            buffer: None,
            park: None,
        }
    }

    pub(crate) fn with_buffer(mut self, buffer: IsoBuffer) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub(crate) fn with_park(mut self, slot: ParkSlot) -> Self {
        self.park = Some(slot);
        self
    }
}

/// Deliver a finished transfer to its submitter
///
/// The controller must have recorded the completion status on the descriptor.
pub fn complete(mut transfer: Box<TransferDescriptor>) {
    let id = transfer.id();

    let Some(pending) = transfer.take_pending() else {
        error!("{} completed without a pending completion, no callback delivered", id);
        return;
    };

    let status = transfer.status().unwrap_or_else(|| {
        error!("{} dispatched before the controller recorded a status", id);
        TransferStatus::Unrecognized(-1)
    });

    let mut result = match status {
        TransferStatus::Unrecognized(raw) => {
            error!("{} finished with unrecognized status {}", id, raw);
            Err(UsbError::Other)
        }
        status => status.into_result(transfer.actual_length()),
    };

    let iso_total = match transfer.kind() {
        Kind::Isochronous { packets } => Some(iso_transferred_bytes(packets)),
        Kind::Control { .. } | Kind::Bulk | Kind::Interrupt => None,
    };

    let mut data = None;
    match (result, iso_total) {
        (Ok(_), Some(total)) => {
            match &pending.buffer {
                Some(buffer) => buffer.set_valid_len(total),
                None => warn!("{} is isochronous but has no caller buffer", id),
            }
            result = Ok(total);
        }
        (Err(_), Some(_)) => {
            if let Some(buffer) = &pending.buffer {
                buffer.set_valid_len(0);
            }
        }
        (Ok(actual), None) if transfer.direction() == Direction::In => {
            data = Some(transfer.received(actual));
        }
        _ => {}
    }

    match result {
        Ok(n) => debug!("{} {} completed: {} bytes", id, transfer.kind().tag(), n),
        Err(e) => debug!("{} {} failed: {}", id, transfer.kind().tag(), e),
    }

    let PendingCompletion {
        target,
        callbacks,
        buffer,
        park: slot,
    } = pending;

    match (transfer.is_reusable(), slot) {
        (true, Some(slot)) => {
            transfer.reset_for_reuse();
            park(&slot, transfer);
        }
        (true, None) => {
            warn!("{} is reusable but has no owner slot, releasing it", id);
            drop(transfer);
        }
        (false, _) => drop(transfer),
    }

    callbacks.notify(&target, data, buffer, result);
}
