//! `MemDevice`: in-memory block device.
//!
//! Two completion modes:
//!
//! - **threaded**: a completion thread performs queued transfers in
//!   submission order and completes the descriptors from that thread,
//!   like an interrupt handler would.
//! - **manual**: descriptors queue up until `run_pending()` (or
//!   `complete_all()`) performs them on the calling thread. With
//!   `hold_completions(true)`, `run_pending()` only counts the kick, so a
//!   test can look at what is in flight before letting it finish.
//!
//! Sectors can be marked faulty; a transfer touching one fails with `EIO`
//! and moves no data.

use pagebuf_core::{BlockDevice, DeviceId, IoDescriptor, IoDir, SECTOR_SHIFT};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Counters for tests and the smoke binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemDeviceStats {
    pub submitted: u64,
    pub reads: u64,
    pub writes: u64,
    pub bytes: u64,
    pub errors: u64,
    pub kicks: u64,
}

struct Core {
    id: DeviceId,
    data: Mutex<Box<[u8]>>,
    faults: Mutex<HashSet<u64>>,
    max_transfer: AtomicUsize,
    queue: Mutex<VecDeque<IoDescriptor>>,
    queued: Condvar,
    stop: AtomicBool,
    hold: AtomicBool,
    submitted: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    kicks: AtomicU64,
}

impl Core {
    /// Move the data and complete the descriptor.
    fn perform(&self, desc: IoDescriptor) {
        let status = self.transfer(&desc);
        if status.is_err() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        desc.complete(status);
    }

    fn transfer(&self, desc: &IoDescriptor) -> Result<(), i32> {
        let start = desc.byte_offset();
        let len = desc.len();
        if len > self.max_transfer.load(Ordering::Relaxed) {
            log::error!("{}: {} byte transfer exceeds the device limit", self.id, len);
            return Err(libc::EIO);
        }
        let first = desc.sector();
        let last = first + (len as u64).div_ceil(1 << SECTOR_SHIFT);
        {
            let faults = self.faults.lock();
            if !faults.is_empty() && (first..last).any(|s| faults.contains(&s)) {
                log::debug!("{}: injected fault in sectors {}..{}", self.id, first, last);
                return Err(libc::EIO);
            }
        }

        let mut data = self.data.lock();
        let end = start
            .checked_add(len as u64)
            .filter(|&e| e <= data.len() as u64)
            .ok_or(libc::EIO)?;
        let mut pos = start as usize;
        for seg in desc.segments() {
            let disk = &mut data[pos..pos + seg.len];
            // Safety: the submitter keeps segment memory alive and
            // untouched until completion.
            match desc.dir() {
                IoDir::Read => unsafe { seg.as_mut_slice() }.copy_from_slice(disk),
                IoDir::Write => disk.copy_from_slice(unsafe { seg.as_slice() }),
            }
            pos += seg.len;
        }
        debug_assert_eq!(pos as u64, end);

        match desc.dir() {
            IoDir::Read => self.reads.fetch_add(1, Ordering::Relaxed),
            IoDir::Write => self.writes.fetch_add(1, Ordering::Relaxed),
        };
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
        Ok(())
    }

    fn drain(&self) -> usize {
        let mut n = 0;
        loop {
            let next = self.queue.lock().pop_front();
            match next {
                Some(desc) => {
                    self.perform(desc);
                    n += 1;
                }
                None => return n,
            }
        }
    }
}

pub struct MemDevice {
    core: Arc<Core>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MemDevice {
    /// Device of `size` bytes completing on its own thread.
    pub fn threaded(id: u32, size: usize) -> Arc<Self> {
        let dev = Self::build(id, size);
        let core = dev.core.clone();
        let spawned = thread::Builder::new()
            .name(format!("memdev-{id}"))
            .spawn(move || completion_loop(core));
        match spawned {
            Ok(h) => *dev.worker.lock() = Some(h),
            // Without a thread the device still works, completing on
            // run_pending like a manual one.
            Err(e) => log::warn!("dev{}: no completion thread ({}), manual completion", id, e),
        }
        Arc::new(dev)
    }

    /// Device of `size` bytes completing only on `run_pending`.
    pub fn manual(id: u32, size: usize) -> Arc<Self> {
        Arc::new(Self::build(id, size))
    }

    fn build(id: u32, size: usize) -> Self {
        Self {
            core: Arc::new(Core {
                id: DeviceId(id),
                data: Mutex::new(vec![0u8; size].into_boxed_slice()),
                faults: Mutex::new(HashSet::new()),
                max_transfer: AtomicUsize::new(usize::MAX),
                queue: Mutex::new(VecDeque::new()),
                queued: Condvar::new(),
                stop: AtomicBool::new(false),
                hold: AtomicBool::new(false),
                submitted: AtomicU64::new(0),
                reads: AtomicU64::new(0),
                writes: AtomicU64::new(0),
                bytes: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                kicks: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn size(&self) -> usize {
        self.core.data.lock().len()
    }

    pub fn set_max_transfer(&self, bytes: usize) {
        self.core.max_transfer.store(bytes, Ordering::Relaxed);
    }

    /// Fail any transfer that touches `sector`.
    pub fn fail_sector(&self, sector: u64) {
        self.core.faults.lock().insert(sector);
    }

    pub fn clear_faults(&self) {
        self.core.faults.lock().clear();
    }

    /// Manual mode: while on, `run_pending` leaves the queue alone.
    pub fn hold_completions(&self, on: bool) {
        self.core.hold.store(on, Ordering::Release);
    }

    /// Descriptors submitted but not completed.
    pub fn pending(&self) -> usize {
        self.core.queue.lock().len()
    }

    /// Perform everything queued on the calling thread.
    pub fn complete_all(&self) -> usize {
        self.core.drain()
    }

    /// Copy device bytes out, bypassing the cache.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) {
        out.copy_from_slice(&self.core.data.lock()[offset..offset + out.len()]);
    }

    /// Copy bytes onto the device, bypassing the cache.
    pub fn write_at(&self, offset: usize, src: &[u8]) {
        self.core.data.lock()[offset..offset + src.len()].copy_from_slice(src);
    }

    pub fn stats(&self) -> MemDeviceStats {
        let c = &self.core;
        MemDeviceStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            reads: c.reads.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            bytes: c.bytes.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            kicks: c.kicks.load(Ordering::Relaxed),
        }
    }

    fn is_threaded(&self) -> bool {
        self.worker.lock().is_some()
    }
}

impl BlockDevice for MemDevice {
    fn id(&self) -> DeviceId {
        self.core.id
    }

    fn submit(&self, desc: IoDescriptor) {
        self.core.submitted.fetch_add(1, Ordering::Relaxed);
        self.core.queue.lock().push_back(desc);
        self.core.queued.notify_one();
    }

    fn run_pending(&self) {
        self.core.kicks.fetch_add(1, Ordering::Relaxed);
        if self.is_threaded() {
            self.core.queued.notify_one();
        } else if !self.core.hold.load(Ordering::Acquire) {
            self.core.drain();
        }
    }

    fn max_transfer(&self) -> usize {
        self.core.max_transfer.load(Ordering::Relaxed)
    }
}

impl Drop for MemDevice {
    fn drop(&mut self) {
        self.core.stop.store(true, Ordering::Release);
        {
            let _q = self.core.queue.lock();
            self.core.queued.notify_all();
        }
        if let Some(h) = self.worker.lock().take() {
            let _ = h.join();
        }
        // Anything left over still completes exactly once.
        self.core.drain();
    }
}

impl std::fmt::Debug for MemDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDevice")
            .field("id", &self.core.id)
            .field("size", &self.size())
            .field("pending", &self.pending())
            .finish()
    }
}

fn completion_loop(core: Arc<Core>) {
    loop {
        let next = {
            let mut q = core.queue.lock();
            loop {
                if let Some(d) = q.pop_front() {
                    break Some(d);
                }
                if core.stop.load(Ordering::Acquire) {
                    break None;
                }
                core.queued.wait(&mut q);
            }
        };
        match next {
            Some(desc) => core.perform(desc),
            None => break,
        }
    }
    log::trace!("{} completion thread exiting", core.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn desc(dir: IoDir, sector: u64, buf: &mut [u8]) -> (IoDescriptor, mpsc::Receiver<Result<(), i32>>) {
        let mut d = IoDescriptor::try_with_capacity(1).unwrap();
        d.setup(DeviceId(1), sector, dir);
        d.push_segment(buf.as_mut_ptr(), buf.len());
        let (tx, rx) = mpsc::channel();
        d.set_end_io(Box::new(move |_d, st| {
            let _ = tx.send(st);
        }));
        (d, rx)
    }

    #[test]
    fn test_manual_write_then_read() {
        let dev = MemDevice::manual(1, 8192);
        let mut src = vec![7u8; 512];
        let (d, rx) = desc(IoDir::Write, 2, &mut src);
        dev.submit(d);
        assert_eq!(dev.pending(), 1);
        dev.run_pending();
        assert_eq!(rx.recv().unwrap(), Ok(()));

        let mut out = [0u8; 512];
        dev.read_at(1024, &mut out);
        assert_eq!(out, [7u8; 512]);

        let mut dst = vec![0u8; 512];
        let (d, rx) = desc(IoDir::Read, 2, &mut dst);
        dev.submit(d);
        dev.complete_all();
        assert_eq!(rx.recv().unwrap(), Ok(()));
        assert_eq!(dst, src);
    }

    #[test]
    fn test_hold_completions() {
        let dev = MemDevice::manual(1, 4096);
        dev.hold_completions(true);
        let mut b = vec![0u8; 512];
        let (d, rx) = desc(IoDir::Read, 0, &mut b);
        dev.submit(d);
        dev.run_pending();
        assert_eq!(dev.pending(), 1);
        assert!(rx.try_recv().is_err());
        dev.hold_completions(false);
        dev.run_pending();
        assert_eq!(rx.recv().unwrap(), Ok(()));
        assert_eq!(dev.stats().kicks, 2);
    }

    #[test]
    fn test_fault_and_range() {
        let dev = MemDevice::manual(1, 4096);
        dev.fail_sector(3);
        let mut b = vec![0u8; 1024];
        let (d, rx) = desc(IoDir::Read, 2, &mut b);
        dev.submit(d);
        dev.complete_all();
        assert_eq!(rx.recv().unwrap(), Err(libc::EIO));

        dev.clear_faults();
        let (d, rx) = desc(IoDir::Read, 7, &mut b);
        dev.submit(d);
        dev.complete_all();
        assert_eq!(rx.recv().unwrap(), Err(libc::EIO));
        assert_eq!(dev.stats().errors, 2);
    }

    #[test]
    fn test_threaded_completes() {
        let dev = MemDevice::threaded(4, 4096);
        let mut b = vec![1u8; 512];
        let (d, rx) = desc(IoDir::Write, 0, &mut b);
        dev.submit(d);
        assert_eq!(rx.recv().unwrap(), Ok(()));
        assert_eq!(dev.stats().writes, 1);
    }
}
