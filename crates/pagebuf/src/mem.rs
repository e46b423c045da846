//! Buffer memory: page lists, contiguous mappings, private and caller
//! memory, and the per-page block validity state used by sub-page I/O.

use pagebuf_core::{PageRef, PbError, Result, VirtMap};
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Caller-supplied memory attached to a buffer.
///
/// The address returned by `as_mut_ptr` must stay put for as long as the
/// value lives, which holds for heap-backed containers.
pub trait BufMemory: Send {
    fn as_mut_ptr(&mut self) -> *mut u8;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BufMemory for Vec<u8> {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.as_mut_slice().as_mut_ptr()
    }
    fn len(&self) -> usize {
        Vec::len(self)
    }
}

impl BufMemory for Box<[u8]> {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        (**self).as_mut_ptr()
    }
    fn len(&self) -> usize {
        (**self).len()
    }
}

/// Data movement between a buffer and caller memory.
pub enum IoMove<'a> {
    /// Copy buffer contents out into the slice.
    Read(&'a mut [u8]),
    /// Copy the slice into the buffer.
    Write(&'a [u8]),
    /// Zero this many bytes.
    Zero(usize),
}

impl IoMove<'_> {
    pub fn len(&self) -> usize {
        match self {
            IoMove::Read(b) => b.len(),
            IoMove::Write(b) => b.len(),
            IoMove::Zero(n) => *n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Page-aligned memory allocated by the cache.
pub(crate) struct PrivateMem {
    ptr: NonNull<u8>,
    layout: Layout,
}

// Safety: plain heap memory; access is serialized by the buffer lock.
unsafe impl Send for PrivateMem {}
unsafe impl Sync for PrivateMem {}

impl PrivateMem {
    pub(crate) fn alloc(len: usize, align: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len.max(1), align).map_err(|_| PbError::NoMemory)?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(PbError::NoMemory)?;
        Ok(Self { ptr, layout })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for PrivateMem {
    fn drop(&mut self) {
        // Safety: allocated in `alloc` with this layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Caller memory plus its stable address.
pub(crate) struct ExternalMem {
    _mem: Box<dyn BufMemory>,
    ptr: NonNull<u8>,
}

// Safety: the box is Send and the pointer targets memory it owns.
unsafe impl Sync for ExternalMem {}
unsafe impl Send for ExternalMem {}

impl ExternalMem {
    pub(crate) fn new(mut mem: Box<dyn BufMemory>) -> Self {
        let ptr = NonNull::new(mem.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self { _mem: mem, ptr }
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

/// Block validity and I/O bookkeeping for one page.
///
/// One instance per page of a target, shared by `Arc` between every
/// buffer covering the page and every descriptor in flight on it, so
/// completions can update it without touching any buffer's memory lock.
pub(crate) struct PageIoState {
    valid: Box<[AtomicU64]>,
    blocks: usize,
    /// Descriptors in flight for this page.
    pub(crate) pending: AtomicUsize,
    /// The page lock is held on behalf of an I/O.
    pub(crate) io_locked: AtomicBool,
    pub(crate) error: AtomicI32,
}

impl PageIoState {
    pub(crate) fn new(blocks: usize, uptodate: bool) -> Self {
        let words = blocks.div_ceil(64).max(1);
        let valid: Box<[AtomicU64]> = (0..words).map(|_| AtomicU64::new(0)).collect();
        let s = Self {
            valid,
            blocks,
            pending: AtomicUsize::new(0),
            io_locked: AtomicBool::new(false),
            error: AtomicI32::new(0),
        };
        if uptodate {
            s.set_valid(0, blocks);
        }
        s
    }

    #[inline]
    pub(crate) fn blocks(&self) -> usize {
        self.blocks
    }

    #[inline]
    pub(crate) fn is_valid(&self, block: usize) -> bool {
        self.valid[block / 64].load(Ordering::Acquire) & (1u64 << (block % 64)) != 0
    }

    /// Mark blocks `[lo, hi)` valid.
    pub(crate) fn set_valid(&self, lo: usize, hi: usize) {
        for b in lo..hi.min(self.blocks) {
            self.valid[b / 64].fetch_or(1u64 << (b % 64), Ordering::AcqRel);
        }
    }

    pub(crate) fn range_valid(&self, lo: usize, hi: usize) -> bool {
        (lo..hi.min(self.blocks)).all(|b| self.is_valid(b))
    }

    pub(crate) fn all_valid(&self) -> bool {
        self.range_valid(0, self.blocks)
    }
}

/// A page of a buffer together with its I/O state.
pub(crate) struct BufPage {
    pub(crate) page: PageRef,
    pub(crate) io: Arc<PageIoState>,
}

/// What a buffer's bytes live in.
pub(crate) enum Backing {
    None,
    Pages {
        pages: Vec<BufPage>,
        /// Byte offset of the buffer within its first page.
        first_offset: usize,
        /// Contiguous mapping of a multi-page buffer.
        map: Option<VirtMap>,
    },
    Private(PrivateMem),
    External(ExternalMem),
}

impl Backing {
    /// Start of the buffer's bytes when they are addressable as one range.
    pub(crate) fn address(&self) -> Option<*mut u8> {
        match self {
            Backing::None => None,
            Backing::Pages {
                pages,
                first_offset,
                map,
            } => {
                if let Some(map) = map {
                    // Safety: offset lies within the first mapped page.
                    Some(unsafe { map.as_ptr().add(*first_offset) })
                } else if pages.len() == 1 {
                    Some(unsafe { pages[0].page.as_ptr().add(*first_offset) })
                } else {
                    None
                }
            }
            Backing::Private(m) => Some(m.as_ptr()),
            Backing::External(m) => Some(m.as_ptr()),
        }
    }

    pub(crate) fn pages(&self) -> Option<&[BufPage]> {
        match self {
            Backing::Pages { pages, .. } => Some(pages),
            _ => None,
        }
    }

    /// Walk `[boff, boff + len)` of the buffer as contiguous chunks,
    /// calling `f(ptr, chunk_len)` for each.
    pub(crate) fn for_each_chunk(
        &self,
        boff: usize,
        len: usize,
        page_size: usize,
        mut f: impl FnMut(*mut u8, usize),
    ) {
        if let Some(addr) = self.address() {
            // Safety: callers bound boff + len by the buffer length.
            f(unsafe { addr.add(boff) }, len);
            return;
        }
        let Backing::Pages {
            pages,
            first_offset,
            ..
        } = self
        else {
            return;
        };
        let mut pos = first_offset + boff;
        let end = pos + len;
        while pos < end {
            let idx = pos / page_size;
            let in_page = pos % page_size;
            let n = (page_size - in_page).min(end - pos);
            // Safety: idx < pages.len() because end is within the buffer.
            f(unsafe { pages[idx].page.as_ptr().add(in_page) }, n);
            pos += n;
        }
    }
}

/// Copy between caller memory and buffer memory.
pub(crate) fn move_bytes(backing: &Backing, boff: usize, page_size: usize, op: IoMove<'_>) {
    let len = op.len();
    let mut done = 0usize;
    match op {
        IoMove::Read(dst) => backing.for_each_chunk(boff, len, page_size, |p, n| {
            // Safety: p is valid for n bytes; dst has n bytes left.
            unsafe { std::ptr::copy_nonoverlapping(p, dst[done..].as_mut_ptr(), n) };
            done += n;
        }),
        IoMove::Write(src) => backing.for_each_chunk(boff, len, page_size, |p, n| {
            unsafe { std::ptr::copy_nonoverlapping(src[done..].as_ptr(), p, n) };
            done += n;
        }),
        IoMove::Zero(_) => backing.for_each_chunk(boff, len, page_size, |p, n| {
            unsafe { std::ptr::write_bytes(p, 0, n) };
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_io_state() {
        let s = PageIoState::new(8, false);
        assert!(!s.all_valid());
        s.set_valid(0, 4);
        assert!(s.range_valid(0, 4));
        assert!(!s.range_valid(0, 5));
        s.set_valid(4, 8);
        assert!(s.all_valid());

        let s = PageIoState::new(100, true);
        assert!(s.is_valid(99));
    }

    #[test]
    fn test_private_mem_is_aligned_and_zeroed() {
        let m = PrivateMem::alloc(8192, 4096).unwrap();
        assert_eq!(m.as_ptr() as usize % 4096, 0);
        let b = unsafe { std::slice::from_raw_parts(m.as_ptr(), 8192) };
        assert!(b.iter().all(|&x| x == 0));
    }

    #[test]
    fn test_move_bytes_contiguous() {
        let backing = Backing::External(ExternalMem::new(Box::new(vec![0u8; 1024])));
        move_bytes(&backing, 10, 4096, IoMove::Write(b"hello"));
        let mut out = [0u8; 5];
        move_bytes(&backing, 10, 4096, IoMove::Read(&mut out));
        assert_eq!(&out, b"hello");
        move_bytes(&backing, 10, 4096, IoMove::Zero(5));
        move_bytes(&backing, 10, 4096, IoMove::Read(&mut out));
        assert_eq!(out, [0u8; 5]);
    }
}
