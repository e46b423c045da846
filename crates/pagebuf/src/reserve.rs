//! Reserved descriptor pool.
//!
//! Filled once at open. When the allocator refuses a descriptor, I/O
//! takes one from here instead, waiting for in-flight reserved
//! descriptors to come back if the pool is empty. Write-back therefore
//! keeps moving even when memory is exhausted.

use crossbeam_queue::ArrayQueue;
use pagebuf_core::{BlockDevice, IoDescriptor, PbError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub(crate) struct ReservePool {
    pool: ArrayQueue<IoDescriptor>,
    retry: Duration,
    lock: Mutex<()>,
    cv: Condvar,
    closed: AtomicBool,
}

impl ReservePool {
    pub(crate) fn new(size: usize, segments: usize, retry: Duration) -> Result<Self> {
        let pool = ArrayQueue::new(size.max(1));
        for _ in 0..size {
            let mut d = IoDescriptor::try_with_capacity(segments).ok_or(PbError::NoMemory)?;
            d.set_reserved(true);
            // Capacity matches the fill count.
            let _ = pool.push(d);
        }
        Ok(Self {
            pool,
            retry,
            lock: Mutex::new(()),
            cv: Condvar::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Take a reserved descriptor, waiting for one to be returned.
    pub(crate) fn acquire(&self, device: &dyn BlockDevice) -> Result<IoDescriptor> {
        loop {
            if let Some(d) = self.pool.pop() {
                return Ok(d);
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(PbError::Shutdown);
            }
            device.run_pending();
            let mut g = self.lock.lock();
            if self.pool.is_empty() {
                self.cv.wait_for(&mut g, self.retry);
            }
        }
    }

    /// Return a descriptor after completion. Descriptors that did not come
    /// from the pool are simply dropped.
    pub(crate) fn put(&self, mut desc: IoDescriptor) {
        if !desc.is_reserved() {
            return;
        }
        desc.reset();
        if self.pool.push(desc).is_ok() {
            let _g = self.lock.lock();
            self.cv.notify_one();
        }
    }

    pub(crate) fn available(&self) -> usize {
        self.pool.len()
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _g = self.lock.lock();
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagebuf_core::DeviceId;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    struct Kicks(AtomicUsize);

    impl BlockDevice for Kicks {
        fn id(&self) -> DeviceId {
            DeviceId(9)
        }
        fn submit(&self, desc: IoDescriptor) {
            desc.complete(Ok(()));
        }
        fn run_pending(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_fill_and_return() {
        let pool = ReservePool::new(2, 4, Duration::from_millis(1)).unwrap();
        assert_eq!(pool.available(), 2);
        let dev = Kicks(AtomicUsize::new(0));
        let a = pool.acquire(&dev).unwrap();
        assert!(a.is_reserved());
        assert_eq!(a.capacity(), 4);
        pool.put(a);
        assert_eq!(pool.available(), 2);

        pool.put(IoDescriptor::try_with_capacity(1).unwrap());
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_acquire_waits_for_return() {
        let pool = Arc::new(ReservePool::new(1, 1, Duration::from_millis(5)).unwrap());
        let dev = Arc::new(Kicks(AtomicUsize::new(0)));
        let held = pool.acquire(dev.as_ref()).unwrap();

        let (p2, d2) = (pool.clone(), dev.clone());
        let h = thread::spawn(move || p2.acquire(d2.as_ref()).map(|d| d.is_reserved()));
        thread::sleep(Duration::from_millis(30));
        pool.put(held);
        assert_eq!(h.join().unwrap(), Ok(true));
        assert!(dev.0.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_closed_pool_fails_when_empty() {
        let pool = ReservePool::new(1, 1, Duration::from_millis(1)).unwrap();
        let dev = Kicks(AtomicUsize::new(0));
        let _held = pool.acquire(&dev).unwrap();
        pool.close();
        assert_eq!(pool.acquire(&dev).unwrap_err(), PbError::Shutdown);
    }
}
