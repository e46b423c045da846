//! Block device abstraction.
//!
//! A `BlockDevice` accepts descriptors and completes each of them exactly
//! once, on any thread, by calling [`IoDescriptor::complete`].
//!
//! # Implementors
//!
//! - `MemDevice` (pagebuf-backend): in-memory disk with a completion
//!   thread and error injection.
//! - `UringDevice` (pagebuf-backend, feature = "io-uring"): file-backed,
//!   `readv`/`writev` through io_uring.

use crate::descriptor::IoDescriptor;

/// Identity of a device, used in descriptors and log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Descriptor submission.
///
/// **Contract:** `submit()` must not block waiting for the transfer. The
/// descriptor is owned by the device until it calls `complete()`. Devices
/// may queue submissions until `run_pending()` kicks them.
pub trait BlockDevice: Send + Sync {
    fn id(&self) -> DeviceId;

    /// Queue a descriptor. Failure is reported through its completion.
    fn submit(&self, desc: IoDescriptor);

    /// Push queued work toward completion. Never blocks.
    fn run_pending(&self);

    /// Largest transfer, in bytes, one descriptor may describe.
    fn max_transfer(&self) -> usize {
        usize::MAX
    }
}
