//! Completion aggregation and the completion worker pool.
//!
//! Each descriptor completion updates the page state it covered and
//! drops one count from the buffer's `io_remaining`. The completion that
//! takes it to zero finishes the buffer I/O: it settles the flags, then
//! either wakes the synchronous waiter or runs the async completion,
//! inline or on a worker of the buffer's class.
//!
//! Workers are fixed per class and fed by a lock-free queue; idle
//! workers park and are unparked round-robin on push.

use crate::buffer::{BufInner, LockedBuf};
use crate::cache::Shared;
use crate::mem::PageIoState;
use crossbeam_queue::SegQueue;
use pagebuf_core::{BufFlags, IoDescriptor, IoStatus, PageRef, PbError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

const WORKER_IDLE: Duration = Duration::from_millis(50);

/// Single-shot completion signal for synchronous I/O. Starts signalled.
pub(crate) struct IoWait {
    done: Mutex<bool>,
    cv: Condvar,
}

impl IoWait {
    pub(crate) fn new() -> Self {
        Self {
            done: Mutex::new(true),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn reset(&self) {
        *self.done.lock() = false;
    }

    pub(crate) fn signal(&self) {
        *self.done.lock() = true;
        self.cv.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }
}

/// The part of one page a descriptor transferred.
pub(crate) struct CoveredPage {
    pub(crate) page: PageRef,
    pub(crate) io: Arc<PageIoState>,
    pub(crate) b_lo: usize,
    pub(crate) b_hi: usize,
}

/// Drop `n` pending descriptors from a page; the last one out releases
/// the page lock taken for the I/O.
pub(crate) fn page_io_put(page: &PageRef, io: &PageIoState, n: usize) {
    if n == 0 {
        return;
    }
    let prev = io.pending.fetch_sub(n, Ordering::AcqRel);
    debug_assert!(prev >= n);
    if prev == n && io.io_locked.swap(false, Ordering::AcqRel) {
        page.unlock();
    }
}

/// Completion callback body shared by every descriptor kind.
pub(crate) fn end_descriptor(
    shared: &Arc<Shared>,
    inner: &Arc<BufInner>,
    covered: &[CoveredPage],
    desc: IoDescriptor,
    status: IoStatus,
) {
    for c in covered {
        match status {
            Ok(()) => {
                c.io.set_valid(c.b_lo, c.b_hi);
                if c.io.all_valid() {
                    c.page.set_uptodate();
                }
            }
            Err(e) => c.io.error.store(e, Ordering::Release),
        }
        page_io_put(&c.page, &c.io, 1);
    }
    if let Err(e) = status {
        log::warn!(
            "{:?} error {} at sector {} on {}",
            desc.dir(),
            e,
            desc.sector(),
            desc.device()
        );
        inner.record_error(e);
    }
    shared.reserve.put(desc);
    io_done_one(shared, inner);
}

/// One descriptor (or the submission bias) done.
pub(crate) fn io_done_one(shared: &Arc<Shared>, inner: &Arc<BufInner>) {
    if inner.io_remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
        finish(shared, inner);
    }
}

fn finish(shared: &Arc<Shared>, inner: &Arc<BufInner>) {
    let err = inner.error();
    let prev = inner
        .flags
        .remove(BufFlags::READ | BufFlags::WRITE | BufFlags::PAGE_LOCKED | BufFlags::ASYNC);
    if err == 0 {
        inner.flags.remove(BufFlags::PARTIAL);
    } else if prev.contains(BufFlags::WRITE) {
        inner.flags.insert(BufFlags::DELWRI);
    }

    if !prev.contains(BufFlags::ASYNC) {
        shared.inflight.fetch_sub(1, Ordering::AcqRel);
        inner.io_wait.signal();
        return;
    }

    let owner = inner.async_owner.lock().take();
    if let Some(lb) = owner {
        if prev.contains(BufFlags::DEFER_IODONE) {
            let class = if prev.contains(BufFlags::DATA_IO) {
                CompletionClass::Data
            } else {
                CompletionClass::Log
            };
            shared.stats.bump(&shared.stats.deferred);
            shared.completion.push(class, lb);
        } else {
            run_iodone(lb);
        }
    }
    shared.inflight.fetch_sub(1, Ordering::AcqRel);
}

/// Hand an async-completed buffer to its iodone hook, or unlock and
/// release it.
pub(crate) fn run_iodone(lb: LockedBuf) {
    let hook = lb.inner().iodone.lock().clone();
    match hook {
        Some(hook) => hook(lb),
        None => drop(lb),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompletionClass {
    /// Metadata and log buffers.
    Log = 0,
    /// `DATA_IO` buffers.
    Data = 1,
}

impl CompletionClass {
    fn name(self) -> &'static str {
        match self {
            CompletionClass::Log => "log",
            CompletionClass::Data => "data",
        }
    }
}

struct ClassQueue {
    jobs: SegQueue<LockedBuf>,
    workers: Mutex<Vec<Thread>>,
    next: AtomicUsize,
}

impl ClassQueue {
    fn new() -> Self {
        Self {
            jobs: SegQueue::new(),
            workers: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }
}

pub(crate) struct CompletionQueues {
    classes: [ClassQueue; 2],
    shutdown: AtomicBool,
}

impl CompletionQueues {
    pub(crate) fn new() -> Self {
        Self {
            classes: [ClassQueue::new(), ClassQueue::new()],
            shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn push(&self, class: CompletionClass, lb: LockedBuf) {
        let q = &self.classes[class as usize];
        q.jobs.push(lb);
        let workers = q.workers.lock();
        if workers.is_empty() {
            drop(workers);
            // No workers (not started or already stopped): run here.
            while let Some(lb) = q.jobs.pop() {
                run_iodone(lb);
            }
            return;
        }
        let i = q.next.fetch_add(1, Ordering::Relaxed) % workers.len();
        workers[i].unpark();
    }

    pub(crate) fn pending(&self) -> usize {
        self.classes.iter().map(|q| q.jobs.len()).sum()
    }

    /// Workers finish queued jobs, then exit.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for q in &self.classes {
            for t in q.workers.lock().iter() {
                t.unpark();
            }
        }
    }

    /// Forget worker threads after they have been joined and run anything
    /// still queued on the calling thread.
    pub(crate) fn clear_workers(&self) {
        for q in &self.classes {
            q.workers.lock().clear();
            while let Some(lb) = q.jobs.pop() {
                run_iodone(lb);
            }
        }
    }
}

/// Spawn `n` workers for `class`.
pub(crate) fn spawn_workers(
    shared: &Arc<Shared>,
    class: CompletionClass,
    n: usize,
) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(n);
    for worker_id in 0..n {
        let sh = Arc::clone(shared);
        let handle = thread::Builder::new()
            .name(format!("pb-{}-{}", class.name(), worker_id))
            .spawn(move || worker_loop(sh, class))
            .map_err(|e| PbError::Os(e.raw_os_error().unwrap_or(libc::EAGAIN)))?;
        shared.completion.classes[class as usize]
            .workers
            .lock()
            .push(handle.thread().clone());
        handles.push(handle);
    }
    Ok(handles)
}

fn worker_loop(shared: Arc<Shared>, class: CompletionClass) {
    let queues = &shared.completion;
    let q = &queues.classes[class as usize];
    loop {
        match q.jobs.pop() {
            Some(lb) => run_iodone(lb),
            None => {
                if queues.shutdown.load(Ordering::Acquire) {
                    break;
                }
                thread::park_timeout(WORKER_IDLE);
            }
        }
    }
    log::trace!("{} completion worker exiting", class.name());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_wait_starts_signalled() {
        let w = IoWait::new();
        w.wait();
        w.reset();
        w.signal();
        w.wait();
    }

    #[test]
    fn test_io_wait_cross_thread() {
        let w = Arc::new(IoWait::new());
        w.reset();
        let w2 = w.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            w2.signal();
        });
        w.wait();
        h.join().unwrap();
    }
}
