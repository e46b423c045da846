//! I/O splitting and submission.
//!
//! A buffer I/O becomes one or more descriptors:
//!
//! - **block path**: blocks smaller than pages and shared page state
//!   allowed. One descriptor per block; reads skip blocks already valid.
//! - **page path**: consecutive pages gathered as segments of one
//!   descriptor until the device's transfer limit or the descriptor's
//!   capacity is hit. Reads skip pages already up to date.
//! - **contiguous path**: private or caller memory, cut into page-sized
//!   segments.
//!
//! `io_remaining` starts at 1 so completions racing with submission can't
//! finish the buffer early; the bias is dropped after the last descriptor
//! is issued.

use crate::buffer::{BufInner, LockedBuf};
use crate::cache::Shared;
use crate::completion::{self, CoveredPage};
use crate::mem::{Backing, BufPage};
use crate::resolve::page_span;
use crate::target::Target;
use pagebuf_core::{BlockDevice, BufFlags, IoDescriptor, IoDir, Result, SECTOR_SHIFT};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Segments asked of the allocator for one gathered descriptor.
const MAX_GATHER_SEGMENTS: usize = 256;

/// Start a read or write. `owner` carries lock and hold for async I/O.
pub(crate) fn start(
    inner: &Arc<BufInner>,
    shared: &Arc<Shared>,
    flags: BufFlags,
    owner: Option<LockedBuf>,
) {
    let dir = match (flags.contains(BufFlags::READ), flags.contains(BufFlags::WRITE)) {
        (true, false) => IoDir::Read,
        (false, true) => IoDir::Write,
        _ => panic!("I/O needs exactly one of READ or WRITE, got {flags:?}"),
    };
    let target = inner.target.clone();
    let state = inner.flags.load();
    assert!(!state.contains(BufFlags::NONE), "I/O on a buffer without memory");
    assert!(
        target.geometry().is_aligned(inner.offset(), inner.len()),
        "misaligned buffer I/O: {} bytes at {}",
        inner.len(),
        inner.offset()
    );
    assert_eq!(inner.io_remaining.load(Ordering::Acquire), 0, "I/O already in flight");

    let is_async = owner.is_some();
    let mut set = match dir {
        IoDir::Read => BufFlags::READ,
        IoDir::Write => BufFlags::WRITE,
    };
    if is_async {
        set |= BufFlags::ASYNC;
    }
    inner
        .flags
        .remove(BufFlags::READ | BufFlags::WRITE | BufFlags::ASYNC);
    if dir == IoDir::Write {
        inner.flags.remove(BufFlags::DELWRI);
        inner.wait_unpinned();
        shared.stats.bump(&shared.stats.writes);
    } else {
        shared.stats.bump(&shared.stats.reads);
    }
    inner.flags.insert(set);
    inner.set_error(0);

    inner.io_wait.reset();
    if let Some(owner) = owner {
        *inner.async_owner.lock() = Some(owner);
    }
    shared.inflight.fetch_add(1, Ordering::AcqRel);
    inner.io_remaining.store(1, Ordering::Release);

    let res = {
        let backing = inner.mem.lock();
        match &*backing {
            Backing::Pages { pages, .. }
                if target.sub_page_blocks() && !state.contains(BufFlags::PRIVATE_DESC) =>
            {
                submit_blocks(shared, inner, &target, pages, dir)
            }
            Backing::Pages { pages, .. } => submit_pages(shared, inner, &target, pages, dir),
            other => match other.address() {
                Some(addr) => submit_contiguous(shared, inner, &target, addr, dir),
                None => Ok(()),
            },
        }
    };
    if let Err(e) = res {
        log::warn!(
            "aborted {:?} of {} bytes at {} on {}: {}",
            dir,
            inner.len(),
            inner.offset(),
            target.device().id(),
            e
        );
        inner.set_error(e.errno());
    }

    if flags.contains(BufFlags::RUN_QUEUES) || !is_async {
        target.device().run_pending();
    }
    completion::io_done_one(shared, inner);
}

/// Descriptor from the allocator, or from the reserved pool when the
/// allocator refuses.
fn alloc_descriptor(
    shared: &Shared,
    device: &dyn BlockDevice,
    segments: usize,
) -> Result<IoDescriptor> {
    if let Some(d) = shared.allocator.alloc(segments) {
        return Ok(d);
    }
    let d = shared.reserve.acquire(device)?;
    shared.stats.bump(&shared.stats.reserve_uses);
    log::debug!("using reserved descriptor on {}", device.id());
    Ok(d)
}

fn issue(shared: &Shared, inner: &BufInner, device: &dyn BlockDevice, desc: IoDescriptor) {
    inner.io_remaining.fetch_add(1, Ordering::AcqRel);
    shared.stats.bump(&shared.stats.descriptors);
    device.submit(desc);
}

/// Lock a page for reading unless an I/O on it already holds it. Returns
/// false if the page turned out to be up to date once locked.
fn lock_for_read(bp: &BufPage) -> bool {
    if !bp.io.io_locked.load(Ordering::Acquire) {
        bp.page.lock();
        bp.io.io_locked.store(true, Ordering::Release);
    }
    if bp.page.is_uptodate() {
        bp.io.set_valid(0, bp.io.blocks());
        release_page(bp);
        return false;
    }
    true
}

/// Drop a page lock held for I/O when nothing is pending on the page.
fn release_page(bp: &BufPage) {
    if bp.io.pending.load(Ordering::Acquire) == 0 && bp.io.io_locked.swap(false, Ordering::AcqRel) {
        bp.page.unlock();
    }
}

fn submit_blocks(
    shared: &Arc<Shared>,
    inner: &Arc<BufInner>,
    target: &Arc<Target>,
    pages: &[BufPage],
    dir: IoDir,
) -> Result<()> {
    let geo = target.geometry();
    let device = target.device().as_ref();
    let (off, len) = (inner.offset(), inner.len());

    for (i, bp) in pages.iter().enumerate() {
        let span = page_span(off, len, target.page_shift(), geo.block_shift, i);
        if dir == IoDir::Read && !lock_for_read(bp) {
            continue;
        }
        let todo: Vec<usize> = (span.b_lo..span.b_hi)
            .filter(|&b| dir == IoDir::Write || !bp.io.is_valid(b))
            .collect();
        if todo.is_empty() {
            release_page(bp);
            continue;
        }

        bp.io.pending.fetch_add(todo.len(), Ordering::AcqRel);
        for (k, &b) in todo.iter().enumerate() {
            let mut desc = match alloc_descriptor(shared, device, 1) {
                Ok(d) => d,
                Err(e) => {
                    let missing = todo.len() - k;
                    completion::page_io_put(&bp.page, &bp.io, missing);
                    abort_pages(&pages[i + 1..]);
                    return Err(e);
                }
            };
            let byte = span.pstart + ((b as u64) << geo.block_shift);
            desc.setup(device.id(), byte >> SECTOR_SHIFT, dir);
            // Safety: block b lies within the page.
            let ptr = unsafe { bp.page.as_ptr().add(b << geo.block_shift) };
            desc.push_segment(ptr, geo.block_size);

            let covered = vec![CoveredPage {
                page: bp.page.clone(),
                io: bp.io.clone(),
                b_lo: b,
                b_hi: b + 1,
            }];
            let (sh, inr) = (shared.clone(), inner.clone());
            desc.set_end_io(Box::new(move |desc, status| {
                completion::end_descriptor(&sh, &inr, &covered, desc, status)
            }));
            issue(shared, inner, device, desc);
        }
    }
    Ok(())
}

fn submit_pages(
    shared: &Arc<Shared>,
    inner: &Arc<BufInner>,
    target: &Arc<Target>,
    pages: &[BufPage],
    dir: IoDir,
) -> Result<()> {
    let geo = target.geometry();
    let device = target.device().as_ref();
    let max_transfer = device.max_transfer().max(geo.sector_size);
    let (off, len) = (inner.offset(), inner.len());

    let mut cur: Option<(IoDescriptor, Vec<CoveredPage>, usize, u64)> = None;

    for (i, bp) in pages.iter().enumerate() {
        let span = page_span(off, len, target.page_shift(), geo.block_shift, i);
        if dir == IoDir::Read {
            let valid = bp.page.is_uptodate() || bp.io.range_valid(span.b_lo, span.b_hi);
            if valid || !lock_for_read(bp) {
                release_page(bp);
                if let Some(c) = cur.take() {
                    send_gathered(shared, inner, device, c);
                }
                continue;
            }
        }
        let seg_len = (span.hi - span.lo) as usize;
        let fits = cur.as_ref().map_or(false, |(d, _, bytes, next)| {
            *next == span.lo && !d.is_full() && bytes + seg_len <= max_transfer
        });
        if !fits {
            if let Some(c) = cur.take() {
                send_gathered(shared, inner, device, c);
            }
            let wanted = (pages.len() - i).min(MAX_GATHER_SEGMENTS);
            let mut desc = match alloc_descriptor(shared, device, wanted) {
                Ok(d) => d,
                Err(e) => {
                    abort_pages(&pages[i..]);
                    return Err(e);
                }
            };
            desc.setup(device.id(), span.lo >> SECTOR_SHIFT, dir);
            cur = Some((desc, Vec::new(), 0, span.lo));
        }
        if let Some((desc, covered, bytes, next)) = cur.as_mut() {
            // Safety: [lo, hi) lies within the page.
            let ptr = unsafe { bp.page.as_ptr().add((span.lo - span.pstart) as usize) };
            desc.push_segment(ptr, seg_len);
            bp.io.pending.fetch_add(1, Ordering::AcqRel);
            covered.push(CoveredPage {
                page: bp.page.clone(),
                io: bp.io.clone(),
                b_lo: span.b_lo,
                b_hi: span.b_hi,
            });
            *bytes += seg_len;
            *next = span.hi;
        }
    }
    if let Some(c) = cur.take() {
        send_gathered(shared, inner, device, c);
    }
    Ok(())
}

fn send_gathered(
    shared: &Arc<Shared>,
    inner: &Arc<BufInner>,
    device: &dyn BlockDevice,
    (mut desc, covered, _, _): (IoDescriptor, Vec<CoveredPage>, usize, u64),
) {
    let (sh, inr) = (shared.clone(), inner.clone());
    desc.set_end_io(Box::new(move |desc, status| {
        completion::end_descriptor(&sh, &inr, &covered, desc, status)
    }));
    issue(shared, inner, device, desc);
}

fn submit_contiguous(
    shared: &Arc<Shared>,
    inner: &Arc<BufInner>,
    target: &Arc<Target>,
    addr: *mut u8,
    dir: IoDir,
) -> Result<()> {
    let device = target.device().as_ref();
    let page_size = target.page_size();
    let max_transfer = device.max_transfer().max(target.geometry().sector_size);
    let (off, len) = (inner.offset(), inner.len());

    let mut pos = 0usize;
    while pos < len {
        let wanted = (len - pos).div_ceil(page_size).min(MAX_GATHER_SEGMENTS);
        let mut desc = alloc_descriptor(shared, device, wanted)?;
        desc.setup(device.id(), (off + pos as u64) >> SECTOR_SHIFT, dir);
        let mut bytes = 0usize;
        while pos < len && !desc.is_full() && bytes < max_transfer {
            let n = (len - pos).min(page_size).min(max_transfer - bytes);
            // Safety: pos + n <= len, the length of the memory at addr.
            desc.push_segment(unsafe { addr.add(pos) }, n);
            pos += n;
            bytes += n;
        }
        let (sh, inr) = (shared.clone(), inner.clone());
        desc.set_end_io(Box::new(move |desc, status| {
            completion::end_descriptor(&sh, &inr, &[], desc, status)
        }));
        issue(shared, inner, device, desc);
    }
    Ok(())
}

/// Give back page locks taken for pages that will not be read.
fn abort_pages(pages: &[BufPage]) {
    for bp in pages {
        release_page(bp);
    }
}
