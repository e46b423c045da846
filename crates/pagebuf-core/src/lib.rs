//! # pagebuf-core: Trait definitions for the page buffer cache
//!
//! This crate defines the trait boundaries between the buffer cache and
//! the collaborators it drives. Each trait models one capability the
//! cache needs from its environment:
//!
//! - [`page::PageCache`] / [`page::Page`]: the host page cache that owns
//!   physical pages. The buffer cache only looks pages up or creates them.
//! - [`block::BlockDevice`]: the block layer that accepts
//!   [`descriptor::IoDescriptor`]s and completes them later.
//! - [`alloc::DescriptorAllocator`]: the general allocator descriptors
//!   come from before the reserved pool is touched.
//!
//! The cache itself (`pagebuf`) depends only on these traits, never on
//! concrete types. Default implementations live in `pagebuf-backend`.
//!
//! The ambient pieces shared by every crate live here too: error types,
//! buffer flags, tunables (`config`), environment helpers (`env`) and the
//! stderr logger (`klog`).

pub mod alloc;
pub mod block;
pub mod config;
pub mod descriptor;
pub mod env;
pub mod error;
pub mod flags;
pub mod geometry;
pub mod klog;
pub mod page;

pub use alloc::{DescriptorAllocator, HeapDescriptors};
pub use block::{BlockDevice, DeviceId};
pub use config::PagebufParams;
pub use descriptor::{EndIo, IoDescriptor, IoDir, IoSegment, IoStatus, SECTOR_SHIFT};
pub use error::{PbError, Result};
pub use flags::BufFlags;
pub use geometry::Geometry;
pub use page::{host_page_size, AllocPolicy, Page, PageCache, PageRef, VirtMap};
