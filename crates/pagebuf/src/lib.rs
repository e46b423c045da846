//! # pagebuf: page buffer cache
//!
//! Hashed, lockable, reference-counted buffers over a host page cache.
//! A buffer names a byte range of a [`Target`]; the cache finds or
//! creates the pages under it, reads and writes it through the target's
//! block device, and writes dirty buffers back in the background.
//!
//! ```text
//!   get/find ──▶ index ──▶ resolve pages ──▶ io (split) ──▶ BlockDevice
//!                  ▲                                            │
//!                  │        delwri queue ◀── daemon             ▼
//!                  └──────── release ◀──── completion ◀── descriptors
//! ```
//!
//! ## Handles
//!
//! - [`Buf`]: one hold. Clone takes another, drop releases.
//! - [`LockedBuf`]: a hold plus the buffer lock. Content access, I/O and
//!   delayed-write queueing go through it.
//!
//! ## Collaborators
//!
//! The cache only sees the traits in `pagebuf-core`: [`PageCache`],
//! [`BlockDevice`] and [`DescriptorAllocator`]. `pagebuf-backend`
//! provides in-memory and io_uring implementations.

mod buffer;
mod cache;
mod completion;
mod daemon;
mod delwri;
mod index;
mod io;
mod mem;
mod reserve;
mod resolve;
mod sema;
mod stats;
mod target;

pub use buffer::{Buf, IodoneHook, LockedBuf, ReleaseHook};
pub use cache::{BufferCache, BufferCacheBuilder};
pub use mem::{BufMemory, IoMove};
pub use stats::PbStatsSnapshot;
pub use target::Target;

pub use pagebuf_core::{
    AllocPolicy, BlockDevice, BufFlags, DescriptorAllocator, DeviceId, Geometry, IoDescriptor,
    IoDir, IoStatus, Page, PageCache, PageRef, PagebufParams, PbError, Result, VirtMap,
};
