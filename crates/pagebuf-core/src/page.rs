//! Page cache abstraction.
//!
//! The host page cache owns physical pages. The buffer cache looks pages
//! up or creates them, locks them around reads, and asks for contiguous
//! mappings of multi-page buffers. It never decides policy for the page
//! cache; it only reacts to failure.
//!
//! # Implementors
//!
//! - `MemPageCache` (pagebuf-backend): pages carved out of a memfd arena,
//!   contiguous mappings built with `mmap(MAP_FIXED)` over the same fd.

use crate::error::Result;
use std::ptr::NonNull;
use std::sync::Arc;

/// A single cached page.
///
/// **Contract:**
/// - `as_ptr()` points at `page_size` bytes that stay valid while any
///   reference to the page is alive.
/// - The page lock is a binary lock that may be released by a thread
///   other than the one that took it (reads unlock from completion).
/// - `lock()` may block; every other method must not.
pub trait Page: Send + Sync {
    /// Page index within its owner (byte offset >> page shift).
    fn index(&self) -> u64;

    /// Start of the page's memory.
    fn as_ptr(&self) -> *mut u8;

    fn is_uptodate(&self) -> bool;

    fn set_uptodate(&self);

    fn clear_uptodate(&self);

    /// Block until the page lock is taken.
    fn lock(&self);

    fn try_lock(&self) -> bool;

    fn unlock(&self);

    fn is_locked(&self) -> bool;

    /// Recency hint for the page cache's own reclaim.
    fn mark_accessed(&self);
}

/// Shared reference to a page.
pub type PageRef = Arc<dyn Page>;

/// How hard the page cache may try when it has to create a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocPolicy {
    /// The caller can tolerate the page cache reclaiming or waiting.
    pub may_block: bool,
}

impl AllocPolicy {
    pub const BLOCKING: Self = Self { may_block: true };
    pub const ATOMIC: Self = Self { may_block: false };
}

/// A contiguous virtual mapping of several pages.
#[derive(Debug)]
pub struct VirtMap {
    base: NonNull<u8>,
    len: usize,
}

// Safety: a mapping is only an address range; access to the bytes behind
// it is governed by the owning buffer's lock.
unsafe impl Send for VirtMap {}
unsafe impl Sync for VirtMap {}

impl VirtMap {
    /// # Safety
    /// `base` must point at `len` mapped bytes that stay mapped until the
    /// map is handed back to the page cache that created it.
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The host page cache for one target.
pub trait PageCache: Send + Sync {
    /// Page size in bytes (power of two).
    fn page_size(&self) -> usize;

    /// Find the page at `index`, creating it if absent.
    ///
    /// Returns `None` under memory pressure. The returned page is unlocked.
    fn find_or_create_page(&self, index: u64, policy: AllocPolicy) -> Option<PageRef>;

    /// Find the page at `index` without creating it.
    fn find_page(&self, index: u64) -> Option<PageRef>;

    /// Map `pages` at consecutive addresses.
    fn vmap(&self, pages: &[PageRef]) -> Result<VirtMap>;

    /// Tear down a mapping created by `vmap`.
    fn vunmap(&self, map: VirtMap);
}

/// Page size of the host, falling back to 4 KiB.
pub fn host_page_size() -> usize {
    match nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE) {
        Ok(Some(sz)) if sz > 0 => sz as usize,
        _ => 4096,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_page_size() {
        let sz = host_page_size();
        assert!(sz.is_power_of_two());
        assert!(sz >= 4096);
    }
}
