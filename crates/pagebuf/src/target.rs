//! Storage targets.

use crate::mem::PageIoState;
use pagebuf_core::{BlockDevice, Geometry, PageCache, PageRef, PbError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Dead entries are swept once the table grows past this.
const PAGE_STATE_SWEEP_MIN: usize = 64;

/// A storage endpoint: geometry, the page cache holding its pages and
/// the device its descriptors go to.
///
/// Identity is the `Arc<Target>` allocation. Two targets built from the
/// same collaborators are still different targets.
pub struct Target {
    geometry: Geometry,
    pages: Arc<dyn PageCache>,
    device: Arc<dyn BlockDevice>,
    page_size: usize,
    page_shift: u32,
    page_states: Mutex<PageStates>,
}

/// Block state of every page some live buffer of this target covers,
/// keyed by page index. The page address guards against a page that was
/// evicted and recreated under the same index.
struct PageStates {
    map: HashMap<u64, (usize, Weak<PageIoState>)>,
    sweep_at: usize,
}

impl Target {
    pub fn new(
        geometry: Geometry,
        pages: Arc<dyn PageCache>,
        device: Arc<dyn BlockDevice>,
    ) -> Result<Arc<Self>> {
        let page_size = pages.page_size();
        if !page_size.is_power_of_two() {
            return Err(PbError::Config("page size must be a power of two"));
        }
        if geometry.block_size > page_size {
            return Err(PbError::Config("block size must not exceed page size"));
        }
        Ok(Arc::new(Self {
            geometry,
            pages,
            device,
            page_size,
            page_shift: page_size.trailing_zeros(),
            page_states: Mutex::new(PageStates {
                map: HashMap::new(),
                sweep_at: PAGE_STATE_SWEEP_MIN,
            }),
        }))
    }

    #[inline]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[inline]
    pub fn page_cache(&self) -> &Arc<dyn PageCache> {
        &self.pages
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn page_shift(&self) -> u32 {
        self.page_shift
    }

    /// Blocks are smaller than pages, so pages carry per-block validity.
    #[inline]
    pub fn sub_page_blocks(&self) -> bool {
        self.geometry.block_size < self.page_size
    }

    /// The block state of page `index`, shared by every buffer covering it.
    pub(crate) fn page_state(&self, index: u64, page: &PageRef) -> Arc<PageIoState> {
        let addr = Arc::as_ptr(page) as *const () as usize;
        let blocks = self.geometry.blocks_per_page(self.page_size);
        let mut states = self.page_states.lock();
        if let Some((a, weak)) = states.map.get(&index) {
            if *a == addr {
                if let Some(io) = weak.upgrade() {
                    if page.is_uptodate() {
                        io.set_valid(0, blocks);
                    }
                    return io;
                }
            }
        }
        let io = Arc::new(PageIoState::new(blocks, page.is_uptodate()));
        states.map.insert(index, (addr, Arc::downgrade(&io)));
        if states.map.len() >= states.sweep_at {
            states.map.retain(|_, (_, w)| w.strong_count() > 0);
            states.sweep_at = (states.map.len() * 2).max(PAGE_STATE_SWEEP_MIN);
        }
        io
    }

    /// Address used for hashing and identity comparisons.
    #[inline]
    pub(crate) fn key(this: &Arc<Self>) -> usize {
        Arc::as_ptr(this) as *const () as usize
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("device", &self.device.id())
            .field("geometry", &self.geometry)
            .field("page_size", &self.page_size)
            .finish()
    }
}
