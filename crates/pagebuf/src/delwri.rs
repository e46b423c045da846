//! Delayed-write queue.
//!
//! Dirty buffers wait here, oldest first, each entry holding one hold on
//! its buffer. Re-queueing moves an entry to the tail with a fresh
//! deadline. The write-back daemon and explicit flushes pull entries off
//! and write them; an entry is never on the queue while its write runs.
//!
//! Holds are never dropped while the queue lock is held: release can take
//! a bucket lock and re-enter the queue.

use crate::buffer::{Buf, LockedBuf};
use crate::target::Target;
use pagebuf_core::BufFlags;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct DelwriEntry {
    buf: Buf,
    deadline: Instant,
}

pub(crate) struct DelwriQueue {
    entries: Mutex<VecDeque<DelwriEntry>>,
}

impl DelwriQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Queue a locked buffer, taking a new hold unless it is already queued.
    pub(crate) fn queue(&self, lb: &LockedBuf, age: Duration) {
        let stats = &lb.shared().stats;
        lb.inner().flags.insert(BufFlags::DELWRI);
        let mut q = self.entries.lock();
        let deadline = Instant::now() + age;
        if requeue(&mut q, lb, deadline) {
            return;
        }
        lb.inner().flags.insert(BufFlags::DELWRI_Q);
        q.push_back(DelwriEntry {
            buf: Buf::clone(lb),
            deadline,
        });
        stats.bump(&stats.delwri_queued);
    }

    /// Queue a buffer whose last hold just went away; `buf` is the hold
    /// the queue keeps.
    pub(crate) fn enqueue_released(&self, buf: Buf, age: Duration) {
        let deadline = Instant::now() + age;
        let extra = {
            let mut q = self.entries.lock();
            if requeue(&mut q, &buf, deadline) {
                Some(buf)
            } else {
                buf.inner().flags.insert(BufFlags::DELWRI_Q);
                let stats = &buf.shared().stats;
                stats.bump(&stats.delwri_queued);
                q.push_back(DelwriEntry { buf, deadline });
                None
            }
        };
        drop(extra);
    }

    /// Remove the buffer's entry and clear its dirty state.
    pub(crate) fn dequeue(&self, buf: &Buf) {
        let taken = self.take_entry(buf);
        buf.inner().flags.remove(BufFlags::DELWRI);
        drop(taken);
    }

    /// Remove the buffer's entry, returning the queue's hold.
    fn take_entry(&self, buf: &Buf) -> Option<Buf> {
        let mut q = self.entries.lock();
        if !buf.inner().flags.contains(BufFlags::DELWRI_Q) {
            return None;
        }
        let pos = q.iter().position(|e| e.buf.ptr_eq(buf))?;
        buf.inner().flags.remove(BufFlags::DELWRI_Q);
        q.remove(pos).map(|e| e.buf)
    }

    /// One daemon pass: write entries that are due (all of them if
    /// `force`), skipping pinned or locked buffers. Returns how many
    /// writes were started.
    pub(crate) fn flush_expired(&self, force: bool) -> usize {
        let now = Instant::now();
        let mut batch = Vec::new();
        let mut clean = Vec::new();
        {
            let mut q = self.entries.lock();
            let mut i = 0;
            while i < q.len() {
                let e = &q[i];
                if !e.buf.flags().contains(BufFlags::DELWRI) {
                    if let Some(e) = q.remove(i) {
                        e.buf.inner().flags.remove(BufFlags::DELWRI_Q);
                        clean.push(e.buf);
                    }
                    continue;
                }
                if !force && e.deadline > now {
                    break;
                }
                if e.buf.is_pinned() || !e.buf.inner().sema.try_lock() {
                    i += 1;
                    continue;
                }
                if let Some(e) = q.remove(i) {
                    e.buf.inner().flags.remove(BufFlags::DELWRI_Q);
                    batch.push(LockedBuf::new(e.buf));
                }
            }
        }
        drop(clean);

        let started = batch.len();
        let mut targets: Vec<Arc<Target>> = Vec::new();
        for lb in batch {
            note_target(&mut targets, lb.target());
            let stats = &lb.shared().stats;
            stats.bump(&stats.delwri_flushed);
            lb.start_io_async(BufFlags::WRITE);
        }
        for t in &targets {
            t.device().run_pending();
        }
        started
    }

    /// Write every unpinned, unlocked entry of `target` (every target for
    /// `None`). Pinned and locked entries stay queued for a later pass.
    /// With `wait`, returns only after the started writes finished.
    /// Returns how many entries stayed queued because they were pinned.
    pub(crate) fn flush(&self, target: Option<&Arc<Target>>, wait: bool) -> usize {
        let mut pinned = 0;
        let mut locked = 0;
        let mut batch = Vec::new();
        let mut clean = Vec::new();
        {
            let mut q = self.entries.lock();
            let mut kept = VecDeque::with_capacity(q.len());
            for e in q.drain(..) {
                let ours = target.map_or(true, |t| Arc::ptr_eq(t, e.buf.target()));
                if !ours {
                    kept.push_back(e);
                } else if !e.buf.flags().contains(BufFlags::DELWRI) {
                    e.buf.inner().flags.remove(BufFlags::DELWRI_Q);
                    clean.push(e.buf);
                } else if e.buf.is_pinned() {
                    pinned += 1;
                    kept.push_back(e);
                } else if !e.buf.inner().sema.try_lock() {
                    locked += 1;
                    kept.push_back(e);
                } else {
                    e.buf.inner().flags.remove(BufFlags::DELWRI_Q);
                    batch.push(LockedBuf::new(e.buf));
                }
            }
            *q = kept;
        }
        drop(clean);

        let mut flight = Flight::new(wait);
        for lb in batch {
            self.write_one(lb, &mut flight);
        }
        flight.finish();
        if pinned > 0 || locked > 0 {
            log::debug!(
                "flush left {} pinned and {} locked buffers queued",
                pinned,
                locked
            );
        }
        pinned
    }

    fn write_one(&self, mut lb: LockedBuf, flight: &mut Flight) {
        note_target(&mut flight.targets, lb.target());
        let stats = &lb.shared().stats;
        stats.bump(&stats.delwri_flushed);
        if flight.wait {
            lb.submit(BufFlags::WRITE);
            flight.waiting.push(lb);
        } else {
            lb.start_io_async(BufFlags::WRITE);
        }
    }

    /// Empty the queue (at close). Returns the queue's holds.
    pub(crate) fn drain(&self) -> Vec<Buf> {
        let mut q = self.entries.lock();
        q.drain(..)
            .map(|e| {
                e.buf.inner().flags.remove(BufFlags::DELWRI_Q);
                e.buf
            })
            .collect()
    }
}

/// Move an already-queued buffer to the tail. False if it is not queued.
fn requeue(q: &mut VecDeque<DelwriEntry>, buf: &Buf, deadline: Instant) -> bool {
    if !buf.inner().flags.contains(BufFlags::DELWRI_Q) {
        return false;
    }
    match q.iter().position(|e| e.buf.ptr_eq(buf)) {
        Some(pos) => {
            if let Some(mut e) = q.remove(pos) {
                e.deadline = deadline;
                q.push_back(e);
            }
            true
        }
        None => false,
    }
}

fn note_target(targets: &mut Vec<Arc<Target>>, t: &Arc<Target>) {
    if !targets.iter().any(|x| Arc::ptr_eq(x, t)) {
        targets.push(t.clone());
    }
}

/// Writes started by one flush.
struct Flight {
    wait: bool,
    waiting: Vec<LockedBuf>,
    targets: Vec<Arc<Target>>,
}

impl Flight {
    fn new(wait: bool) -> Self {
        Self {
            wait,
            waiting: Vec::new(),
            targets: Vec::new(),
        }
    }

    /// Kick devices, then wait for synchronous writes and drop them.
    fn finish(&mut self) {
        for t in self.targets.drain(..) {
            t.device().run_pending();
        }
        for lb in self.waiting.drain(..) {
            if let Err(e) = lb.wait_io() {
                log::warn!(
                    "delayed write of {} bytes at {} failed: {}",
                    lb.len(),
                    lb.offset(),
                    e
                );
            }
        }
    }
}
