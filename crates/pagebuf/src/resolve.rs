//! Page resolution.
//!
//! Finds or creates the pages under a buffer's byte range, records which
//! of them hold valid data, and builds a contiguous address when one is
//! possible or asked for.

use crate::buffer::BufInner;
use crate::cache::Shared;
use crate::mem::{Backing, BufPage};
use crate::target::Target;
use pagebuf_core::{AllocPolicy, BufFlags, PageRef, PbError, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

/// The slice of one page a buffer covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageSpan {
    /// File offset of the page.
    pub(crate) pstart: u64,
    /// Covered file bytes `[lo, hi)`.
    pub(crate) lo: u64,
    pub(crate) hi: u64,
    /// Covered blocks `[b_lo, b_hi)` within the page.
    pub(crate) b_lo: usize,
    pub(crate) b_hi: usize,
}

/// Span of the `i`th page of a buffer at `offset` of `len` bytes.
pub(crate) fn page_span(offset: u64, len: usize, page_shift: u32, block_shift: u32, i: usize) -> PageSpan {
    let first = offset >> page_shift;
    let pstart = (first + i as u64) << page_shift;
    let pend = pstart + (1u64 << page_shift);
    let lo = offset.max(pstart);
    let hi = (offset + len as u64).min(pend);
    PageSpan {
        pstart,
        lo,
        hi,
        b_lo: ((lo - pstart) >> block_shift) as usize,
        b_hi: (((hi - pstart - 1) >> block_shift) + 1) as usize,
    }
}

/// Make sure the buffer has its pages, validity and (if possible) an
/// address.
pub(crate) fn resolve(shared: &Shared, inner: &BufInner, flags: BufFlags) -> Result<()> {
    let target = &inner.target;
    let mut backing = inner.mem.lock();

    if matches!(*backing, Backing::Private(_) | Backing::External(_)) {
        return Ok(());
    }

    if let Some(pages) = backing.pages() {
        if inner.flags.contains(BufFlags::PARTIAL) {
            let geo = target.geometry();
            let all_valid = pages.iter().enumerate().all(|(i, bp)| {
                let span = page_span(inner.offset(), inner.len(), target.page_shift(), geo.block_shift, i);
                if bp.page.is_uptodate() {
                    bp.io.set_valid(0, bp.io.blocks());
                }
                bp.io.range_valid(span.b_lo, span.b_hi)
            });
            if all_valid {
                inner.flags.remove(BufFlags::PARTIAL);
            }
        }
        for bp in pages {
            bp.page.mark_accessed();
        }
    } else {
        let (pages, partial, page_locked) = build_pages(shared, inner, flags)?;
        let first_offset = (inner.offset() & (target.page_size() as u64 - 1)) as usize;
        *backing = Backing::Pages {
            pages,
            first_offset,
            map: None,
        };
        inner.flags.remove(BufFlags::NONE);
        if partial {
            inner.flags.insert(BufFlags::PARTIAL);
        } else {
            inner.flags.remove(BufFlags::PARTIAL);
        }
        if page_locked {
            inner.flags.insert(BufFlags::PAGE_LOCKED);
        }
    }

    if let Err(e) = map_pages(shared, inner, &mut backing, flags) {
        if let Some(pages) = backing.pages() {
            unlock_pages(pages);
        }
        inner.flags.remove(BufFlags::PAGE_LOCKED);
        return Err(e);
    }
    Ok(())
}

/// The caller vouches for the buffer's bytes: mark every block it covers
/// valid so other buffers on the same pages stop reading them from disk.
pub(crate) fn mark_contents_valid(inner: &BufInner) {
    let backing = inner.mem.lock();
    let Some(pages) = backing.pages() else {
        return;
    };
    let target = &inner.target;
    let block_shift = target.geometry().block_shift;
    for (i, bp) in pages.iter().enumerate() {
        let span = page_span(inner.offset(), inner.len(), target.page_shift(), block_shift, i);
        bp.io.set_valid(span.b_lo, span.b_hi);
        if bp.io.all_valid() {
            bp.page.set_uptodate();
        }
    }
    inner.flags.remove(BufFlags::PARTIAL);
}

fn build_pages(shared: &Shared, inner: &BufInner, flags: BufFlags) -> Result<(Vec<BufPage>, bool, bool)> {
    let target = &inner.target;
    let page_shift = target.page_shift();
    let (off, len) = (inner.offset(), inner.len());
    let first = off >> page_shift;
    let last = (off + len as u64 - 1) >> page_shift;
    let count = (last - first + 1) as usize;
    let blocks = target.geometry().blocks_per_page(target.page_size());
    let lock_for_read = !target.sub_page_blocks() && flags.contains(BufFlags::READ);

    let mut pages = Vec::with_capacity(count);
    let mut partial = false;
    let mut page_locked = false;
    for i in 0..count {
        let page = match find_or_create(shared, target, first + i as u64, flags) {
            Ok(p) => p,
            Err(e) => {
                unlock_pages(&pages);
                return Err(e);
            }
        };
        page.mark_accessed();
        let io = target.page_state(first + i as u64, &page);
        let mut uptodate = page.is_uptodate();
        if !uptodate && lock_for_read {
            page.lock();
            if page.is_uptodate() {
                page.unlock();
                io.set_valid(0, blocks);
                uptodate = true;
            } else {
                io.io_locked.store(true, Ordering::Release);
                page_locked = true;
            }
        }
        partial |= !uptodate;
        pages.push(BufPage { page, io });
    }
    Ok((pages, partial, page_locked))
}

/// Look up a page, creating it if needed. Under memory pressure back off
/// (forcing write-back between tries) up to the configured retry limit.
fn find_or_create(shared: &Shared, target: &Arc<Target>, index: u64, flags: BufFlags) -> Result<PageRef> {
    let cache = target.page_cache();
    if let Some(p) = cache.find_page(index) {
        shared.stats.bump(&shared.stats.page_found);
        return Ok(p);
    }
    let dont_block = flags.contains(BufFlags::DONT_BLOCK);
    let policy = if dont_block {
        AllocPolicy::ATOMIC
    } else {
        AllocPolicy::BLOCKING
    };
    let params = &shared.params;
    let mut retries = 0u32;
    loop {
        if let Some(p) = cache.find_or_create_page(index, policy) {
            shared.stats.bump(&shared.stats.page_created);
            return Ok(p);
        }
        if dont_block {
            return Err(PbError::NoMemory);
        }
        retries += 1;
        shared.stats.bump(&shared.stats.page_retries);
        if retries > params.alloc_retry_limit {
            log::error!(
                "giving up on page {} of {} after {} retries",
                index,
                target.device().id(),
                params.alloc_retry_limit
            );
            return Err(PbError::NoMemory);
        }
        if retries % params.alloc_retry_warn == 0 {
            log::warn!(
                "possible memory allocation deadlock: page {} of {}, retry {}",
                index,
                target.device().id(),
                retries
            );
        }
        shared.daemon.wake(true);
        thread::sleep(params.alloc_retry_delay);
    }
}

/// Single pages are always addressable; several pages are mapped only
/// when `MAPPABLE` is asked for.
fn map_pages(shared: &Shared, inner: &BufInner, backing: &mut Backing, flags: BufFlags) -> Result<()> {
    let Backing::Pages { pages, map, .. } = backing else {
        return Ok(());
    };
    if pages.len() == 1 {
        inner.flags.insert(BufFlags::MAPPED);
        return Ok(());
    }
    if map.is_some() || !flags.contains(BufFlags::MAPPABLE) {
        return Ok(());
    }
    shared.purge_vmaps(false);
    let refs: Vec<PageRef> = pages.iter().map(|bp| bp.page.clone()).collect();
    *map = Some(inner.target.page_cache().vmap(&refs)?);
    inner.flags.insert(BufFlags::MAPPED);
    Ok(())
}

fn unlock_pages(pages: &[BufPage]) {
    for bp in pages {
        if bp.io.pending.load(Ordering::Acquire) == 0 && bp.io.io_locked.swap(false, Ordering::AcqRel) {
            bp.page.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_span_single_page() {
        // 512-byte buffer at 1024 in a 4 KiB page, 512-byte blocks.
        let s = page_span(1024, 512, 12, 9, 0);
        assert_eq!(s.pstart, 0);
        assert_eq!((s.lo, s.hi), (1024, 1536));
        assert_eq!((s.b_lo, s.b_hi), (2, 3));
    }

    #[test]
    fn test_page_span_straddling() {
        // 8 KiB buffer at 2 KiB spans three pages.
        let s0 = page_span(2048, 8192, 12, 12, 0);
        let s1 = page_span(2048, 8192, 12, 12, 1);
        let s2 = page_span(2048, 8192, 12, 12, 2);
        assert_eq!((s0.lo, s0.hi), (2048, 4096));
        assert_eq!((s1.lo, s1.hi), (4096, 8192));
        assert_eq!((s2.lo, s2.hi), (8192, 10240));
        assert_eq!((s2.b_lo, s2.b_hi), (0, 1));
    }
}
