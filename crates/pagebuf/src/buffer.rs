//! Buffer handles.
//!
//! `Buf` is a hold: cloning takes one, dropping releases one. `LockedBuf`
//! is a hold plus the buffer lock. Locking consumes a `Buf`, so a handle
//! can't lock twice, and dropping a `LockedBuf` unlocks then releases.
//!
//! ```text
//!   Buf ──lock()/try_lock()──▶ LockedBuf ──unlock()──▶ Buf
//!    │                            │
//!  drop: release             drop: unlock + release
//!                            start_io_async: moves into the I/O
//! ```

use crate::cache::Shared;
use crate::completion::IoWait;
use crate::mem::{self, Backing, BufMemory, ExternalMem, IoMove};
use crate::resolve;
use crate::sema::Sema;
use crate::target::Target;
use crate::io;
use pagebuf_core::flags::AtomicBufFlags;
use pagebuf_core::{BufFlags, PbError, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Called with the locked buffer when an async I/O completes. The hook
/// owns the handle; dropping it unlocks and releases.
pub type IodoneHook = Arc<dyn Fn(LockedBuf) + Send + Sync>;

/// Called once, instead of freeing, when the last hold goes away.
pub type ReleaseHook = Box<dyn FnOnce(Buf) + Send>;

const PIN_WAIT_SLICE: Duration = Duration::from_millis(10);

pub(crate) struct BufInner {
    pub(crate) target: Arc<Target>,
    offset: AtomicU64,
    length: AtomicUsize,
    pub(crate) hashed: bool,
    pub(crate) hold: AtomicUsize,
    pub(crate) sema: Sema,
    pin: AtomicUsize,
    pin_lock: Mutex<()>,
    pin_cv: Condvar,
    pub(crate) io_remaining: AtomicUsize,
    pub(crate) flags: AtomicBufFlags,
    error: AtomicI32,
    pub(crate) mem: Mutex<Backing>,
    pub(crate) io_wait: IoWait,
    pub(crate) iodone: Mutex<Option<IodoneHook>>,
    release_hook: Mutex<Option<ReleaseHook>>,
    /// Lock and hold of an async I/O in flight.
    pub(crate) async_owner: Mutex<Option<LockedBuf>>,
}

impl BufInner {
    /// A new buffer: one hold, lock already taken by the creator.
    pub(crate) fn new(
        target: Arc<Target>,
        offset: u64,
        length: usize,
        flags: BufFlags,
        hashed: bool,
    ) -> Self {
        Self {
            target,
            offset: AtomicU64::new(offset),
            length: AtomicUsize::new(length),
            hashed,
            hold: AtomicUsize::new(1),
            sema: Sema::new(true),
            pin: AtomicUsize::new(0),
            pin_lock: Mutex::new(()),
            pin_cv: Condvar::new(),
            io_remaining: AtomicUsize::new(0),
            flags: AtomicBufFlags::new(flags),
            error: AtomicI32::new(0),
            mem: Mutex::new(Backing::None),
            io_wait: IoWait::new(),
            iodone: Mutex::new(None),
            release_hook: Mutex::new(None),
            async_owner: Mutex::new(None),
        }
    }

    #[inline]
    pub(crate) fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.length.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn error(&self) -> i32 {
        self.error.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_error(&self, errno: i32) {
        self.error.store(errno, Ordering::Release);
    }

    /// Keep the first error of an I/O.
    pub(crate) fn record_error(&self, errno: i32) {
        let _ = self
            .error
            .compare_exchange(0, errno, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pin.load(Ordering::Acquire) > 0
    }

    /// Sleep until the pin count drops to zero, kicking the device while
    /// I/O is outstanding.
    pub(crate) fn wait_unpinned(&self) {
        if !self.is_pinned() {
            return;
        }
        let mut g = self.pin_lock.lock();
        while self.is_pinned() {
            if self.io_remaining.load(Ordering::Acquire) > 0 {
                // Completions may unpin.
                MutexGuard::unlocked(&mut g, || self.target.device().run_pending());
                if !self.is_pinned() {
                    break;
                }
            }
            self.pin_cv.wait_for(&mut g, PIN_WAIT_SLICE);
        }
    }
}

/// A hold on a buffer.
pub struct Buf {
    inner: Arc<BufInner>,
    shared: Arc<Shared>,
}

impl Buf {
    /// Wrap a hold that has already been counted.
    pub(crate) fn from_held(inner: Arc<BufInner>, shared: Arc<Shared>) -> Self {
        Self { inner, shared }
    }

    #[inline]
    pub(crate) fn inner(&self) -> &Arc<BufInner> {
        &self.inner
    }

    #[inline]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Same buffer object.
    pub fn ptr_eq(&self, other: &Buf) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn target(&self) -> &Arc<Target> {
        &self.inner.target
    }

    /// Byte offset on the target.
    pub fn offset(&self) -> u64 {
        self.inner.offset()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flags(&self) -> BufFlags {
        self.inner.flags.load()
    }

    /// Last I/O error as an errno, 0 for none.
    pub fn error(&self) -> i32 {
        self.inner.error()
    }

    pub fn hold_count(&self) -> usize {
        self.inner.hold.load(Ordering::Acquire)
    }

    pub fn io_remaining(&self) -> usize {
        self.inner.io_remaining.load(Ordering::Acquire)
    }

    /// 1 if the buffer lock is free, 0 if held.
    pub fn lock_value(&self) -> i32 {
        self.inner.sema.value()
    }

    pub fn is_hashed(&self) -> bool {
        self.inner.hashed
    }

    /// Take the buffer lock, sleeping if another holder has it.
    pub fn lock(self) -> LockedBuf {
        if !self.inner.sema.try_lock() {
            self.shared.stats.bump(&self.shared.stats.lock_waits);
            if self.io_remaining() > 0 {
                self.inner.target.device().run_pending();
            }
            self.inner.sema.lock();
        }
        LockedBuf::new(self)
    }

    /// Take the buffer lock if it is free; hand the hold back otherwise.
    pub fn try_lock(self) -> std::result::Result<LockedBuf, Buf> {
        if self.inner.sema.try_lock() {
            Ok(LockedBuf::new(self))
        } else {
            Err(self)
        }
    }

    /// Forbid write-back until a matching `unpin`.
    pub fn pin(&self) {
        self.inner.pin.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        let prev = self.inner.pin.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "unpin of an unpinned buffer");
        if prev == 1 {
            let _g = self.inner.pin_lock.lock();
            self.inner.pin_cv.notify_all();
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    pub fn pin_count(&self) -> usize {
        self.inner.pin.load(Ordering::Acquire)
    }

    /// Sleep until every pin is dropped.
    pub fn wait_unpinned(&self) {
        self.inner.wait_unpinned();
    }

    /// Take the buffer off the delayed-write queue and clear its dirty
    /// state.
    pub fn delwri_dequeue(&self) {
        self.shared.delwri.dequeue(self);
    }
}

impl Clone for Buf {
    fn clone(&self) -> Self {
        self.inner.hold.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: self.inner.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        release(&self.inner, &self.shared);
    }
}

impl std::fmt::Debug for Buf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buf")
            .field("offset", &self.offset())
            .field("len", &self.len())
            .field("flags", &self.flags())
            .field("hold", &self.hold_count())
            .field("pin", &self.pin_count())
            .field("error", &self.error())
            .finish()
    }
}

/// Drop one hold. At zero: release hook, else delayed-write queue, else
/// stay cached if fs-managed, else unlink and free.
fn release(inner: &Arc<BufInner>, shared: &Arc<Shared>) {
    let mut chain = inner.hashed.then(|| shared.index.lock_bucket_of(inner));
    let prev = inner.hold.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev > 0, "hold count underflow");
    if prev != 1 {
        return;
    }
    debug_assert_eq!(inner.pin.load(Ordering::Acquire), 0, "released while pinned");

    let hook = inner.release_hook.lock().take();
    if let Some(hook) = hook {
        inner.hold.fetch_add(1, Ordering::AcqRel);
        drop(chain);
        hook(Buf::from_held(inner.clone(), shared.clone()));
        return;
    }

    let flags = inner.flags.load();
    if flags.contains(BufFlags::DELWRI) && !shared.is_closed() {
        inner.hold.fetch_add(1, Ordering::AcqRel);
        drop(chain);
        shared
            .delwri
            .enqueue_released(Buf::from_held(inner.clone(), shared.clone()), shared.params.age_buffer);
        return;
    }

    if inner.hashed && flags.contains(BufFlags::FS_MANAGED) && !shared.is_closed() {
        return;
    }

    if let Some(chain) = chain.as_mut() {
        if let Some(pos) = chain.iter().position(|b| Arc::ptr_eq(b, inner)) {
            chain.remove(pos);
        }
    }
    drop(chain);
    destroy(inner, shared);
}

/// Give back everything the buffer owns.
pub(crate) fn destroy(inner: &BufInner, shared: &Shared) {
    let backing = std::mem::replace(&mut *inner.mem.lock(), Backing::None);
    if let Backing::Pages { pages, map, .. } = backing {
        // Page state is shared with other buffers: only give back a page
        // lock this buffer took and no I/O is still using.
        if inner.flags.contains(BufFlags::PAGE_LOCKED) {
            for p in &pages {
                if p.io.pending.load(Ordering::Acquire) == 0 && p.io.io_locked.swap(false, Ordering::AcqRel) {
                    p.page.unlock();
                }
            }
        }
        if let Some(map) = map {
            shared.vmap_release(inner.target.page_cache().clone(), map);
        }
    }
    log::trace!(
        "freed buffer {}@{} on {}",
        inner.len(),
        inner.offset(),
        inner.target.device().id()
    );
}

/// A hold plus the buffer lock.
pub struct LockedBuf {
    buf: ManuallyDrop<Buf>,
}

impl LockedBuf {
    /// `buf`'s lock must already be taken.
    pub(crate) fn new(buf: Buf) -> Self {
        Self {
            buf: ManuallyDrop::new(buf),
        }
    }

    /// Drop the lock, keep the hold.
    pub fn unlock(self) -> Buf {
        let mut this = ManuallyDrop::new(self);
        // Safety: `this` is never dropped, so the handle is taken once.
        let buf = unsafe { ManuallyDrop::take(&mut this.buf) };
        buf.inner.sema.unlock();
        buf
    }

    /// Contents, when the buffer has a contiguous address.
    pub fn mapped(&self) -> Option<&[u8]> {
        if !self.flags().contains(BufFlags::MAPPED) {
            return None;
        }
        let addr = self.inner.mem.lock().address()?;
        // Safety: the buffer lock gives exclusive access to the content and
        // the backing can't change while this handle is borrowed.
        Some(unsafe { std::slice::from_raw_parts(addr, self.len()) })
    }

    pub fn mapped_mut(&mut self) -> Option<&mut [u8]> {
        if !self.flags().contains(BufFlags::MAPPED) {
            return None;
        }
        debug_assert_eq!(self.io_remaining(), 0, "content access during I/O");
        let addr = self.inner.mem.lock().address()?;
        // Safety: as for `mapped`, plus `&mut self` excludes other borrows.
        Some(unsafe { std::slice::from_raw_parts_mut(addr, self.len()) })
    }

    /// Copy to, from or zero part of the buffer, mapped or not.
    ///
    /// Panics if the range runs past the end of the buffer.
    pub fn move_bytes(&mut self, offset: usize, op: IoMove<'_>) {
        assert!(
            offset + op.len() <= self.len(),
            "move of {} bytes at {} past buffer end {}",
            op.len(),
            offset,
            self.len()
        );
        let backing = self.inner.mem.lock();
        assert!(!matches!(*backing, Backing::None), "buffer has no memory");
        mem::move_bytes(&backing, offset, self.target().page_size(), op);
    }

    pub fn set_error(&self, errno: i32) {
        self.inner.set_error(errno);
    }

    pub fn set_iodone(&self, hook: IodoneHook) {
        *self.inner.iodone.lock() = Some(hook);
    }

    pub fn clear_iodone(&self) {
        *self.inner.iodone.lock() = None;
    }

    pub fn set_release_hook(&self, hook: ReleaseHook) {
        *self.inner.release_hook.lock() = Some(hook);
    }

    /// Keep the buffer cached at hold zero.
    pub fn set_fs_managed(&self, on: bool) {
        if on {
            self.inner.flags.insert(BufFlags::FS_MANAGED);
        } else {
            self.inner.flags.remove(BufFlags::FS_MANAGED);
        }
    }

    /// Content must not be reused; drop any pending delayed write.
    pub fn mark_stale(&self) {
        self.inner.flags.insert(BufFlags::STALE);
        self.delwri_dequeue();
    }

    /// Start I/O; `flags` carries `READ` or `WRITE`. The lock stays with
    /// this handle. Errors show up in `wait_io`.
    ///
    /// `DELWRI` in `flags` queues a delayed write instead.
    pub fn submit(&mut self, flags: BufFlags) {
        if flags.contains(BufFlags::DELWRI) {
            self.delwri_queue();
            return;
        }
        let inner = self.inner.clone();
        let shared = self.shared.clone();
        io::start(&inner, &shared, flags - BufFlags::ASYNC, None);
    }

    /// Wait for the I/O started by `submit`.
    pub fn wait_io(&self) -> Result<()> {
        if self.io_remaining() > 0 {
            self.target().device().run_pending();
        }
        self.inner.io_wait.wait();
        match self.error() {
            0 => Ok(()),
            e => Err(PbError::from_errno(e)),
        }
    }

    /// Synchronous I/O.
    pub fn start_io(&mut self, flags: BufFlags) -> Result<()> {
        if flags.contains(BufFlags::DELWRI) {
            self.delwri_queue();
            return Ok(());
        }
        self.submit(flags);
        self.wait_io()
    }

    /// Asynchronous I/O. Lock and hold move into the I/O; completion hands
    /// them to the iodone hook or drops them.
    pub fn start_io_async(self, flags: BufFlags) {
        if flags.contains(BufFlags::DELWRI) {
            drop(self.delwri());
            return;
        }
        let inner = self.inner.clone();
        let shared = self.shared.clone();
        io::start(&inner, &shared, flags | BufFlags::ASYNC, Some(self));
    }

    /// Mark dirty and queue for write-back, keeping the lock.
    pub fn delwri_queue(&self) {
        resolve::mark_contents_valid(&self.inner);
        self.shared.delwri.queue(self, self.shared.params.age_buffer);
    }

    /// Mark dirty, queue for write-back, unlock.
    pub fn delwri(self) -> Buf {
        self.delwri_queue();
        self.unlock()
    }

    /// Replace the buffer's memory with caller memory. The buffer length
    /// becomes the memory's length.
    pub fn associate_memory(&mut self, memory: Box<dyn BufMemory>) {
        assert!(!self.is_hashed(), "memory can only be attached to unhashed buffers");
        let len = memory.len();
        let old = std::mem::replace(
            &mut *self.inner.mem.lock(),
            Backing::External(ExternalMem::new(memory)),
        );
        drop(old);
        self.inner.length.store(len, Ordering::Release);
        self.inner
            .flags
            .remove(BufFlags::NONE | BufFlags::MEM_PRIVATE | BufFlags::PARTIAL);
        self.inner
            .flags
            .insert(BufFlags::MEM_EXTERNAL | BufFlags::MAPPED);
    }

    /// Point an unhashed buffer at a device byte offset.
    pub fn set_disk_offset(&mut self, offset: u64) {
        assert!(!self.is_hashed(), "hashed buffers are keyed by their offset");
        self.inner.offset.store(offset, Ordering::Release);
    }
}

impl Deref for LockedBuf {
    type Target = Buf;

    fn deref(&self) -> &Buf {
        &self.buf
    }
}

impl Drop for LockedBuf {
    fn drop(&mut self) {
        // Safety: drop runs once; the handle is not used afterwards.
        let buf = unsafe { ManuallyDrop::take(&mut self.buf) };
        buf.inner.sema.unlock();
        drop(buf);
    }
}

impl std::fmt::Debug for LockedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LockedBuf").field(&*self.buf).finish()
    }
}
