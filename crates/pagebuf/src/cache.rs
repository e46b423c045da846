//! The buffer cache context.
//!
//! `BufferCache` owns everything that used to be global: the index, the
//! delayed-write queue, the daemon, the completion workers, the reserved
//! pool and the deferred unmap list. Buffers point back at the shared
//! part, so a `Buf` stays usable for as long as it is held, but the
//! cache refuses new work once `close` starts.

use crate::buffer::{self, Buf, BufInner, LockedBuf};
use crate::completion::{spawn_workers, CompletionClass, CompletionQueues};
use crate::daemon::{spawn_daemon, DaemonSignal, DaemonStats};
use crate::delwri::DelwriQueue;
use crate::index::{BufIndex, Lookup};
use crate::mem::{Backing, BufMemory, PrivateMem};
use crate::reserve::ReservePool;
use crate::resolve::resolve;
use crate::stats::{PbStats, PbStatsSnapshot};
use crate::target::Target;
use pagebuf_core::{
    BufFlags, DescriptorAllocator, HeapDescriptors, PageCache, PagebufParams, PbError, Result,
    VirtMap,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long `close` waits for in-flight I/O before giving up on it.
const CLOSE_DRAIN_LIMIT: Duration = Duration::from_secs(5);
const CLOSE_DRAIN_POLL: Duration = Duration::from_millis(1);

/// State shared by the cache, its threads and every buffer.
pub(crate) struct Shared {
    pub(crate) params: PagebufParams,
    pub(crate) index: BufIndex,
    pub(crate) delwri: DelwriQueue,
    pub(crate) daemon: DaemonSignal,
    pub(crate) completion: CompletionQueues,
    pub(crate) reserve: ReservePool,
    pub(crate) allocator: Arc<dyn DescriptorAllocator>,
    /// Mappings of destroyed buffers waiting for a batched unmap.
    vmaps: Mutex<Vec<(Arc<dyn PageCache>, VirtMap)>>,
    pub(crate) stats: PbStats,
    closed: AtomicBool,
    /// Buffer I/Os between `start` and the end of their completion.
    pub(crate) inflight: AtomicUsize,
}

impl Shared {
    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue a dead buffer's mapping for unmapping.
    pub(crate) fn vmap_release(&self, cache: Arc<dyn PageCache>, map: VirtMap) {
        if self.is_closed() {
            cache.vunmap(map);
            return;
        }
        let over = {
            let mut list = self.vmaps.lock();
            list.push((cache, map));
            list.len() > self.params.vmap_purge_threshold
        };
        if over {
            self.purge_vmaps(true);
        }
    }

    /// Unmap queued mappings; without `all`, only when over the threshold.
    pub(crate) fn purge_vmaps(&self, all: bool) {
        let batch = {
            let mut list = self.vmaps.lock();
            if !all && list.len() <= self.params.vmap_purge_threshold {
                return;
            }
            std::mem::take(&mut *list)
        };
        if !batch.is_empty() {
            log::trace!("unmapping {} buffer mappings", batch.len());
        }
        for (cache, map) in batch {
            cache.vunmap(map);
        }
    }
}

/// Builder for [`BufferCache`].
pub struct BufferCacheBuilder {
    params: PagebufParams,
    allocator: Arc<dyn DescriptorAllocator>,
}

impl BufferCacheBuilder {
    /// Parameters from the environment, heap descriptors.
    pub fn new() -> Self {
        Self {
            params: PagebufParams::from_env(),
            allocator: Arc::new(HeapDescriptors),
        }
    }

    pub fn params(mut self, params: PagebufParams) -> Self {
        self.params = params;
        self
    }

    /// Where descriptors come from before the reserved pool is touched.
    pub fn allocator(mut self, allocator: Arc<dyn DescriptorAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Validate parameters, fill the reserved pool, start the daemon and
    /// the completion workers.
    pub fn open(self) -> Result<BufferCache> {
        self.params.validate()?;
        let reserve = ReservePool::new(
            self.params.reserve_size,
            self.params.reserve_segments,
            self.params.reserve_retry,
        )?;
        let shared = Arc::new(Shared {
            index: BufIndex::new(self.params.hash_bits),
            delwri: DelwriQueue::new(),
            daemon: DaemonSignal::new(),
            completion: CompletionQueues::new(),
            reserve,
            allocator: self.allocator,
            vmaps: Mutex::new(Vec::new()),
            stats: PbStats::new(self.params.stats),
            closed: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
            params: self.params,
        });

        // Dropping a half-built cache shuts down whatever did start.
        let mut cache = BufferCache {
            shared: shared.clone(),
            daemon: None,
            workers: Vec::new(),
            shut: false,
        };
        cache.daemon = Some(spawn_daemon(shared.clone())?);
        cache
            .workers
            .extend(spawn_workers(&shared, CompletionClass::Log, shared.params.log_workers)?);
        cache
            .workers
            .extend(spawn_workers(&shared, CompletionClass::Data, shared.params.data_workers)?);

        log::info!(
            "buffer cache open: {} buckets, {} reserved descriptors, {}+{} completion workers",
            1usize << shared.params.hash_bits,
            shared.params.reserve_size,
            shared.params.log_workers,
            shared.params.data_workers
        );
        Ok(cache)
    }
}

impl Default for BufferCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A page buffer cache.
pub struct BufferCache {
    shared: Arc<Shared>,
    daemon: Option<JoinHandle<DaemonStats>>,
    workers: Vec<JoinHandle<()>>,
    shut: bool,
}

impl BufferCache {
    pub fn builder() -> BufferCacheBuilder {
        BufferCacheBuilder::new()
    }

    /// Open with `params` and heap descriptors.
    pub fn open(params: PagebufParams) -> Result<Self> {
        BufferCacheBuilder::new().params(params).open()
    }

    pub fn params(&self) -> &PagebufParams {
        &self.shared.params
    }

    /// Find or create the buffer for `[offset, offset + len)`, locked.
    ///
    /// With `READ`, a buffer whose range is not fully valid is read before
    /// it is returned and a read error is returned as the error.
    /// Creation bits (`FS_MANAGED`, `DATA_IO`, `DEFER_IODONE`,
    /// `PRIVATE_DESC`) are added to a cached buffer too; they are never
    /// cleared by a later request.
    /// `TRYLOCK` is ignored here; see [`try_get`](Self::try_get).
    pub fn get(&self, target: &Arc<Target>, offset: u64, len: usize, flags: BufFlags) -> Result<LockedBuf> {
        let flags = flags - BufFlags::TRYLOCK;
        let Some(lb) = self.get_locked(target, offset, len, flags, true)? else {
            unreachable!("blocking creating lookup always yields a buffer");
        };
        self.read_if_partial(lb, flags)
    }

    /// Like `get`, but `None` when the buffer is locked by someone else.
    pub fn try_get(
        &self,
        target: &Arc<Target>,
        offset: u64,
        len: usize,
        flags: BufFlags,
    ) -> Result<Option<LockedBuf>> {
        match self.get_locked(target, offset, len, flags | BufFlags::TRYLOCK, true)? {
            Some(lb) => self.read_if_partial(lb, flags).map(Some),
            None => Ok(None),
        }
    }

    /// Existing buffer only; never creates and never resolves pages.
    pub fn find(&self, target: &Arc<Target>, offset: u64, len: usize, flags: BufFlags) -> Option<LockedBuf> {
        self.get_locked(target, offset, len, flags, false).ok().flatten()
    }

    /// Find or create with pages resolved, without any I/O.
    pub fn lookup(&self, target: &Arc<Target>, offset: u64, len: usize, flags: BufFlags) -> Result<LockedBuf> {
        // No READ, so no page is left locked for a read that never comes.
        self.get(target, offset, len, flags - BufFlags::READ)
    }

    /// Start an async read of the range if it is not cached. Skipped when
    /// the buffer is busy or memory is short.
    pub fn readahead(&self, target: &Arc<Target>, offset: u64, len: usize) {
        let flags = BufFlags::TRYLOCK | BufFlags::DONT_BLOCK | BufFlags::READ | BufFlags::READ_AHEAD;
        match self.get_locked(target, offset, len, flags, true) {
            Ok(Some(lb)) => {
                if lb.flags().contains(BufFlags::PARTIAL) {
                    lb.start_io_async(BufFlags::READ);
                }
            }
            Ok(None) => {}
            Err(e) => log::trace!("readahead of {} bytes at {} skipped: {}", len, offset, e),
        }
    }

    /// Unhashed buffer without memory. Attach memory with
    /// `associate_memory` before doing I/O.
    pub fn get_empty(&self, target: &Arc<Target>, len: usize) -> Result<LockedBuf> {
        self.unhashed(target, 0, len, BufFlags::NONE, Backing::None)
    }

    /// Unhashed buffer over zeroed, page-aligned memory owned by the cache.
    pub fn get_no_daddr(&self, target: &Arc<Target>, len: usize) -> Result<LockedBuf> {
        let mem = PrivateMem::alloc(len, target.page_size())?;
        self.unhashed(
            target,
            0,
            len,
            BufFlags::MEM_PRIVATE | BufFlags::MAPPED,
            Backing::Private(mem),
        )
    }

    /// Unhashed buffer at `offset` over caller memory.
    pub fn get_with_memory(
        &self,
        target: &Arc<Target>,
        offset: u64,
        memory: Box<dyn BufMemory>,
    ) -> Result<LockedBuf> {
        let mut lb = self.get_empty(target, memory.len())?;
        lb.set_disk_offset(offset);
        lb.associate_memory(memory);
        Ok(lb)
    }

    /// Write the target's delayed writes. Pinned buffers and buffers
    /// someone holds locked stay queued. Returns how many stayed queued
    /// because they were pinned.
    pub fn flush_target(&self, target: &Arc<Target>, wait: bool) -> usize {
        self.shared.delwri.flush(Some(target), wait)
    }

    /// `flush_target` over every target.
    pub fn flush_all(&self, wait: bool) -> usize {
        self.shared.delwri.flush(None, wait)
    }

    /// Run a write-back pass now; `force` ignores buffer age.
    pub fn wake_daemon(&self, force: bool) {
        self.shared.daemon.wake(force);
    }

    pub fn stats(&self) -> PbStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn clear_stats(&self) {
        self.shared.stats.clear();
    }

    /// Buffers on the delayed-write queue.
    pub fn delwri_count(&self) -> usize {
        self.shared.delwri.len()
    }

    /// Buffers in the index, held or cached.
    pub fn buffer_count(&self) -> usize {
        self.shared.index.len()
    }

    /// Reserved descriptors currently in the pool.
    pub fn reserve_available(&self) -> usize {
        self.shared.reserve.available()
    }

    /// Async completions waiting for a worker.
    pub fn completions_pending(&self) -> usize {
        self.shared.completion.pending()
    }

    /// Flush everything, stop the threads and free every unheld buffer.
    /// Delayed writes that are pinned or locked by a caller are dropped
    /// with a warning.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn get_locked(
        &self,
        target: &Arc<Target>,
        offset: u64,
        len: usize,
        flags: BufFlags,
        create: bool,
    ) -> Result<Option<LockedBuf>> {
        let sh = &self.shared;
        if sh.is_closed() {
            return Err(PbError::Shutdown);
        }
        assert!(len > 0, "zero-length buffer at {offset}");
        assert!(
            target.geometry().is_aligned(offset, len),
            "misaligned buffer: {len} bytes at {offset}"
        );
        sh.stats.bump(&sh.stats.gets);

        let make = || {
            let state = (flags & BufFlags::CREATE_MASK) | BufFlags::NONE;
            Arc::new(BufInner::new(target.clone(), offset, len, state, true))
        };
        let create_fn: Option<&dyn Fn() -> Arc<BufInner>> = if create { Some(&make) } else { None };

        let (inner, created) = match sh.index.find_or_insert(target, offset, len, create_fn) {
            Lookup::Found(inner) => {
                sh.stats.bump(&sh.stats.hits);
                (inner, false)
            }
            Lookup::Created(inner) => {
                sh.stats.bump(&sh.stats.creates);
                (inner, true)
            }
            Lookup::Missing => {
                sh.stats.bump(&sh.stats.misses);
                return Ok(None);
            }
        };

        let buf = Buf::from_held(inner, sh.clone());
        let lb = if created {
            LockedBuf::new(buf)
        } else if flags.contains(BufFlags::TRYLOCK) {
            match buf.try_lock() {
                Ok(lb) => lb,
                Err(_busy) => {
                    sh.stats.bump(&sh.stats.busy);
                    return Ok(None);
                }
            }
        } else {
            buf.lock()
        };

        let state = lb.flags();
        if !created && state.contains(BufFlags::STALE) {
            lb.inner()
                .flags
                .retain(BufFlags::STALE_KEEP | (state & (BufFlags::DELWRI_Q | BufFlags::NONE)));
        }
        if !created {
            lb.inner().flags.insert(flags & BufFlags::CREATE_MASK);
        }

        if create {
            if let Err(e) = resolve(sh, lb.inner(), flags) {
                if created {
                    lb.inner().flags.insert(BufFlags::STALE);
                    lb.inner().flags.remove(BufFlags::FS_MANAGED);
                }
                return Err(e);
            }
        }
        Ok(Some(lb))
    }

    fn read_if_partial(&self, mut lb: LockedBuf, flags: BufFlags) -> Result<LockedBuf> {
        if flags.contains(BufFlags::READ) && lb.flags().contains(BufFlags::PARTIAL) {
            lb.start_io(BufFlags::READ | (flags & BufFlags::RUN_QUEUES))?;
        }
        Ok(lb)
    }

    fn unhashed(
        &self,
        target: &Arc<Target>,
        offset: u64,
        len: usize,
        state: BufFlags,
        backing: Backing,
    ) -> Result<LockedBuf> {
        if self.shared.is_closed() {
            return Err(PbError::Shutdown);
        }
        assert!(len > 0, "zero-length buffer");
        let inner = BufInner::new(target.clone(), offset, len, state, false);
        *inner.mem.lock() = backing;
        self.shared.stats.bump(&self.shared.stats.creates);
        Ok(LockedBuf::new(Buf::from_held(Arc::new(inner), self.shared.clone())))
    }

    fn shutdown(&mut self) {
        if self.shut {
            return;
        }
        self.shut = true;
        let sh = self.shared.clone();

        let pinned = sh.delwri.flush(None, true);
        if pinned > 0 {
            log::warn!("closing with {} pinned delayed writes", pinned);
        }

        sh.daemon.shutdown();
        if let Some(h) = self.daemon.take() {
            match h.join() {
                Ok(st) => log::debug!(
                    "write-back daemon: {} passes ({} forced), {} writes",
                    st.cycles,
                    st.forced,
                    st.flushed
                ),
                Err(_) => log::error!("write-back daemon panicked"),
            }
        }

        let start = Instant::now();
        while sh.inflight.load(Ordering::Acquire) > 0 {
            if start.elapsed() > CLOSE_DRAIN_LIMIT {
                log::warn!(
                    "closing with {} buffer I/Os still in flight",
                    sh.inflight.load(Ordering::Acquire)
                );
                break;
            }
            thread::sleep(CLOSE_DRAIN_POLL);
        }

        sh.closed.store(true, Ordering::Release);
        sh.completion.shutdown();
        for w in self.workers.drain(..) {
            if w.join().is_err() {
                log::error!("completion worker panicked");
            }
        }
        sh.completion.clear_workers();

        let left = sh.delwri.drain();
        if !left.is_empty() {
            log::warn!(
                "dropping {} pinned or locked delayed writes at close",
                left.len()
            );
        }
        drop(left);

        let mut held = 0usize;
        for inner in sh.index.drain() {
            if inner.hold.load(Ordering::Acquire) == 0 {
                buffer::destroy(&inner, &sh);
            } else {
                held += 1;
            }
        }
        if held > 0 {
            log::warn!("{} buffers still held at close", held);
        }

        sh.purge_vmaps(true);
        sh.reserve.close();
        log::info!("buffer cache closed");
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("buffers", &self.buffer_count())
            .field("delwri", &self.delwri_count())
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}
