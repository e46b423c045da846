//! `MemPageCache`: in-memory `PageCache` over a page arena.
//!
//! Pages live in arena slots and are indexed by page number. A page that
//! nothing but the cache references can be dropped by `shrink()`, which
//! is how tests force the next access to go back to the device. The
//! arena size is the page limit: when every slot is in use, creation
//! reclaims unreferenced pages if the caller may block and otherwise
//! reports memory pressure.

use crate::arena::PageArena;
use pagebuf_core::{host_page_size, AllocPolicy, Page, PageCache, PageRef, PbError, Result, VirtMap};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Arena plus the free slot list; outlives every page carved from it.
struct Slots {
    arena: PageArena,
    free: Mutex<Vec<usize>>,
}

/// A page in a `MemPageCache`.
pub struct MemPage {
    index: u64,
    slot: usize,
    slots: Arc<Slots>,
    uptodate: AtomicBool,
    accessed: AtomicBool,
    locked: Mutex<bool>,
    unlocked: Condvar,
}

impl MemPage {
    /// Cleared by the next `shrink()` that finds the page unreferenced.
    pub fn was_accessed(&self) -> bool {
        self.accessed.load(Ordering::Relaxed)
    }
}

impl Page for MemPage {
    fn index(&self) -> u64 {
        self.index
    }

    fn as_ptr(&self) -> *mut u8 {
        self.slots.arena.slot_ptr(self.slot)
    }

    fn is_uptodate(&self) -> bool {
        self.uptodate.load(Ordering::Acquire)
    }

    fn set_uptodate(&self) {
        self.uptodate.store(true, Ordering::Release);
    }

    fn clear_uptodate(&self) {
        self.uptodate.store(false, Ordering::Release);
    }

    fn lock(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.unlocked.wait(&mut locked);
        }
        *locked = true;
    }

    fn try_lock(&self) -> bool {
        let mut locked = self.locked.lock();
        !std::mem::replace(&mut *locked, true)
    }

    fn unlock(&self) {
        let mut locked = self.locked.lock();
        debug_assert!(*locked, "unlock of unlocked page {}", self.index);
        *locked = false;
        drop(locked);
        self.unlocked.notify_one();
    }

    fn is_locked(&self) -> bool {
        *self.locked.lock()
    }

    fn mark_accessed(&self) {
        self.accessed.store(true, Ordering::Relaxed);
    }
}

impl Drop for MemPage {
    fn drop(&mut self) {
        self.slots.free.lock().push(self.slot);
    }
}

/// Counters for tests and the smoke binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemCacheStats {
    pub created: usize,
    pub reclaimed: usize,
    pub refused: usize,
    pub vmaps: usize,
    pub vunmaps: usize,
}

pub struct MemPageCache {
    slots: Arc<Slots>,
    page_size: usize,
    pages: Mutex<HashMap<u64, Arc<MemPage>>>,
    /// Refuse this many more creations (test hook).
    fail_allocs: AtomicUsize,
    created: AtomicUsize,
    reclaimed: AtomicUsize,
    refused: AtomicUsize,
    vmaps: AtomicUsize,
    vunmaps: AtomicUsize,
}

impl MemPageCache {
    /// `capacity` pages of the host page size.
    pub fn new(capacity: usize) -> Result<Arc<Self>> {
        Self::with_page_size(capacity, host_page_size())
    }

    /// `page_size` must be a multiple of the host page size for `vmap`.
    pub fn with_page_size(capacity: usize, page_size: usize) -> Result<Arc<Self>> {
        let arena = PageArena::new(capacity, page_size)?;
        let free = (0..arena.slots()).rev().collect();
        Ok(Arc::new(Self {
            slots: Arc::new(Slots {
                arena,
                free: Mutex::new(free),
            }),
            page_size,
            pages: Mutex::new(HashMap::new()),
            fail_allocs: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            reclaimed: AtomicUsize::new(0),
            refused: AtomicUsize::new(0),
            vmaps: AtomicUsize::new(0),
            vunmaps: AtomicUsize::new(0),
        }))
    }

    /// Pages currently cached.
    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.arena.slots()
    }

    /// Make the next `n` page creations fail.
    pub fn fail_next_allocs(&self, n: usize) {
        self.fail_allocs.store(n, Ordering::Release);
    }

    /// Drop every page that only the cache references and that is not
    /// locked. Returns how many went.
    pub fn shrink(&self) -> usize {
        let n = shrink_locked(&mut self.pages.lock());
        self.reclaimed.fetch_add(n, Ordering::Relaxed);
        n
    }

    pub fn stats(&self) -> MemCacheStats {
        MemCacheStats {
            created: self.created.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            vmaps: self.vmaps.load(Ordering::Relaxed),
            vunmaps: self.vunmaps.load(Ordering::Relaxed),
        }
    }

    fn take_fail(&self) -> bool {
        self.fail_allocs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn shrink_locked(pages: &mut HashMap<u64, Arc<MemPage>>) -> usize {
    let before = pages.len();
    pages.retain(|_, p| Arc::strong_count(p) > 1 || p.is_locked());
    for p in pages.values() {
        p.accessed.store(false, Ordering::Relaxed);
    }
    before - pages.len()
}

impl PageCache for MemPageCache {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn find_or_create_page(&self, index: u64, policy: AllocPolicy) -> Option<PageRef> {
        let mut pages = self.pages.lock();
        if let Some(p) = pages.get(&index) {
            return Some(p.clone() as PageRef);
        }
        if self.take_fail() {
            self.refused.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let mut slot = self.slots.free.lock().pop();
        if slot.is_none() && policy.may_block {
            let n = shrink_locked(&mut pages);
            self.reclaimed.fetch_add(n, Ordering::Relaxed);
            slot = self.slots.free.lock().pop();
        }
        let Some(slot) = slot else {
            self.refused.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        self.slots.arena.zero_slot(slot);
        let page = Arc::new(MemPage {
            index,
            slot,
            slots: self.slots.clone(),
            uptodate: AtomicBool::new(false),
            accessed: AtomicBool::new(false),
            locked: Mutex::new(false),
            unlocked: Condvar::new(),
        });
        pages.insert(index, page.clone());
        self.created.fetch_add(1, Ordering::Relaxed);
        Some(page as PageRef)
    }

    fn find_page(&self, index: u64) -> Option<PageRef> {
        self.pages.lock().get(&index).map(|p| p.clone() as PageRef)
    }

    fn vmap(&self, pages: &[PageRef]) -> Result<VirtMap> {
        let slots = pages
            .iter()
            .map(|p| self.slots.arena.slot_of(p.as_ptr()))
            .collect::<Option<Vec<_>>>()
            .ok_or(PbError::Unsupported("page from another cache"))?;
        let base = self.slots.arena.map_slots(&slots)?;
        self.vmaps.fetch_add(1, Ordering::Relaxed);
        // Safety: map_slots mapped slots.len() pages at base; they stay
        // mapped until vunmap.
        Ok(unsafe { VirtMap::from_raw(base, slots.len() * self.page_size) })
    }

    fn vunmap(&self, map: VirtMap) {
        self.slots.arena.unmap(map.as_ptr(), map.len());
        self.vunmaps.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for MemPageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemPageCache")
            .field("page_size", &self.page_size)
            .field("capacity", &self.capacity())
            .field("cached", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_find() {
        let c = MemPageCache::with_page_size(4, 4096).unwrap();
        assert!(c.find_page(7).is_none());
        let p = c.find_or_create_page(7, AllocPolicy::BLOCKING).unwrap();
        assert_eq!(p.index(), 7);
        assert!(!p.is_uptodate());
        let q = c.find_page(7).unwrap();
        assert_eq!(p.as_ptr(), q.as_ptr());
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_shrink_keeps_referenced_pages() {
        let c = MemPageCache::with_page_size(4, 4096).unwrap();
        let held = c.find_or_create_page(0, AllocPolicy::BLOCKING).unwrap();
        drop(c.find_or_create_page(1, AllocPolicy::BLOCKING));
        assert_eq!(c.shrink(), 1);
        assert!(c.find_page(0).is_some());
        assert!(c.find_page(1).is_none());
        drop(held);
    }

    #[test]
    fn test_limit_and_reclaim() {
        let c = MemPageCache::with_page_size(2, 4096).unwrap();
        let a = c.find_or_create_page(0, AllocPolicy::BLOCKING).unwrap();
        drop(c.find_or_create_page(1, AllocPolicy::BLOCKING));
        assert!(c.find_or_create_page(2, AllocPolicy::ATOMIC).is_none());
        // Blocking creation reclaims page 1.
        assert!(c.find_or_create_page(2, AllocPolicy::BLOCKING).is_some());
        assert!(c.find_page(1).is_none());
        drop(a);
    }

    #[test]
    fn test_fail_next_allocs() {
        let c = MemPageCache::with_page_size(4, 4096).unwrap();
        c.fail_next_allocs(2);
        assert!(c.find_or_create_page(0, AllocPolicy::BLOCKING).is_none());
        assert!(c.find_or_create_page(0, AllocPolicy::BLOCKING).is_none());
        assert!(c.find_or_create_page(0, AllocPolicy::BLOCKING).is_some());
        assert_eq!(c.stats().refused, 2);
    }

    #[test]
    fn test_page_lock() {
        let c = MemPageCache::with_page_size(1, 4096).unwrap();
        let p = c.find_or_create_page(0, AllocPolicy::BLOCKING).unwrap();
        assert!(p.try_lock());
        assert!(!p.try_lock());
        assert!(p.is_locked());
        p.unlock();
        assert!(!p.is_locked());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_vmap_is_contiguous_view() {
        let ps = host_page_size();
        let c = MemPageCache::with_page_size(4, ps).unwrap();
        let p0 = c.find_or_create_page(10, AllocPolicy::BLOCKING).unwrap();
        let p1 = c.find_or_create_page(11, AllocPolicy::BLOCKING).unwrap();
        unsafe { *p1.as_ptr() = 0x5a };
        let map = c.vmap(&[p0.clone(), p1.clone()]).unwrap();
        assert_eq!(map.len(), 2 * ps);
        assert_eq!(unsafe { *map.as_ptr().add(ps) }, 0x5a);
        c.vunmap(map);
        assert_eq!(c.stats().vunmaps, 1);
    }
}
