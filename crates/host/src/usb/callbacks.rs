//! Completion callback registry
//!
//! A [`CallbackRegistry`] holds one notifier per transfer kind. The host
//! resolves it once in `initialize`; the resolved [`Callbacks`] value then
//! travels with every pending completion, so dispatch never consults
//! process-wide state.

use common::{Error, Result};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::error;
use usbproto::{
    BulkTransferCallback, ControlTransferCallback, InterruptTransferCallback, IsoBuffer,
    IsochronousTransferCallback, TransferKind, TransferResult,
};

pub type ControlNotifier =
    Arc<dyn Fn(&dyn ControlTransferCallback, Option<Vec<u8>>, TransferResult) + Send + Sync>;
pub type BulkNotifier =
    Arc<dyn Fn(&dyn BulkTransferCallback, Option<Vec<u8>>, TransferResult) + Send + Sync>;
pub type InterruptNotifier =
    Arc<dyn Fn(&dyn InterruptTransferCallback, Option<Vec<u8>>, TransferResult) + Send + Sync>;
pub type IsochronousNotifier =
    Arc<dyn Fn(&dyn IsochronousTransferCallback, Option<IsoBuffer>, TransferResult) + Send + Sync>;

/// Per-kind completion contracts, before resolution
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    control: Option<ControlNotifier>,
    bulk: Option<BulkNotifier>,
    interrupt: Option<InterruptNotifier>,
    isochronous: Option<IsochronousNotifier>,
}

impl CallbackRegistry {
    /// Registry with no contracts; `resolve` fails until all four are set
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every kind notifies through its callback trait method
    pub fn standard() -> Self {
        Self::empty()
            .on_control(|target, data, result| target.on_control_transfer_complete(data, result))
            .on_bulk(|target, data, result| target.on_bulk_transfer_complete(data, result))
            .on_interrupt(|target, data, result| {
                target.on_interrupt_transfer_complete(data, result)
            })
            .on_isochronous(|target, buffer, result| {
                target.on_isochronous_transfer_complete(buffer, result)
            })
    }

    pub fn on_control<F>(mut self, notifier: F) -> Self
    where
        F: Fn(&dyn ControlTransferCallback, Option<Vec<u8>>, TransferResult) + Send + Sync + 'static,
    {
        self.control = Some(Arc::new(notifier));
        self
    }

    pub fn on_bulk<F>(mut self, notifier: F) -> Self
    where
        F: Fn(&dyn BulkTransferCallback, Option<Vec<u8>>, TransferResult) + Send + Sync + 'static,
    {
        self.bulk = Some(Arc::new(notifier));
        self
    }

    pub fn on_interrupt<F>(mut self, notifier: F) -> Self
    where
        F: Fn(&dyn InterruptTransferCallback, Option<Vec<u8>>, TransferResult)
            + Send
            + Sync
            + 'static,
    {
        self.interrupt = Some(Arc::new(notifier));
        self
    }

    pub fn on_isochronous<F>(mut self, notifier: F) -> Self
    where
        F: Fn(&dyn IsochronousTransferCallback, Option<IsoBuffer>, TransferResult)
            + Send
            + Sync
            + 'static,
    {
        self.isochronous = Some(Arc::new(notifier));
        self
    }

    /// Kinds that have no contract yet
    pub fn missing(&self) -> Vec<TransferKind> {
        let present = [
            self.control.is_some(),
            self.bulk.is_some(),
            self.interrupt.is_some(),
            self.isochronous.is_some(),
        ];
        TransferKind::ALL
            .into_iter()
            .zip(present)
            .filter(|(_, present)| !present)
            .map(|(kind, _)| kind)
            .collect()
    }

    /// Resolve the contracts, failing closed on the first missing kind
    pub fn resolve(&self) -> Result<Callbacks> {
        match (
            self.control.clone(),
            self.bulk.clone(),
            self.interrupt.clone(),
            self.isochronous.clone(),
        ) {
            (Some(control), Some(bulk), Some(interrupt), Some(isochronous)) => Ok(Callbacks {
                inner: Arc::new(Resolved {
                    control,
                    bulk,
                    interrupt,
                    isochronous,
                }),
            }),
            _ => {
                let kind = self.missing().first().copied().unwrap_or(TransferKind::Control);
                Err(Error::MissingContract(kind))
            }
        }
    }
}

struct Resolved {
    control: ControlNotifier,
    bulk: BulkNotifier,
    interrupt: InterruptNotifier,
    isochronous: IsochronousNotifier,
}

/// Resolved completion contracts
#[derive(Clone)]
pub struct Callbacks {
    inner: Arc<Resolved>,
}

/// The caller's completion target, held strongly until dispatch
#[derive(Clone)]
pub enum CallbackTarget {
    Control(Arc<dyn ControlTransferCallback>),
    Bulk(Arc<dyn BulkTransferCallback>),
    Interrupt(Arc<dyn InterruptTransferCallback>),
    Isochronous(Arc<dyn IsochronousTransferCallback>),
}

impl CallbackTarget {
    pub fn kind(&self) -> TransferKind {
        match self {
            CallbackTarget::Control(_) => TransferKind::Control,
            CallbackTarget::Bulk(_) => TransferKind::Bulk,
            CallbackTarget::Interrupt(_) => TransferKind::Interrupt,
            CallbackTarget::Isochronous(_) => TransferKind::Isochronous,
        }
    }
}

impl Callbacks {
    /// Deliver one completion
    ///
    /// A panicking callback is logged; the calling thread keeps running.
    pub fn notify(
        &self,
        target: &CallbackTarget,
        data: Option<Vec<u8>>,
        buffer: Option<IsoBuffer>,
        result: TransferResult,
    ) {
        let kind = target.kind();
        let outcome = catch_unwind(AssertUnwindSafe(|| match target {
            CallbackTarget::Control(cb) => (self.inner.control)(cb.as_ref(), data, result),
            CallbackTarget::Bulk(cb) => (self.inner.bulk)(cb.as_ref(), data, result),
            CallbackTarget::Interrupt(cb) => (self.inner.interrupt)(cb.as_ref(), data, result),
            CallbackTarget::Isochronous(cb) => {
                (self.inner.isochronous)(cb.as_ref(), buffer, result)
            }
        }));

        if let Err(panic) = outcome {
            error!("Panic in {} completion callback: {:?}", kind, panic);
        }
    }
}
