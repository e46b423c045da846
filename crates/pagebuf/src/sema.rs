//! Binary semaphore used as the buffer lock.
//!
//! Unlike a mutex guard, the lock is not tied to a thread: an async I/O
//! takes ownership of a locked buffer and its completion releases the
//! lock from a device or worker thread.

use parking_lot::{Condvar, Mutex};

pub(crate) struct Sema {
    locked: Mutex<bool>,
    cv: Condvar,
}

impl Sema {
    pub(crate) fn new(locked: bool) -> Self {
        Self {
            locked: Mutex::new(locked),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.cv.wait(&mut locked);
        }
        *locked = true;
    }

    pub(crate) fn try_lock(&self) -> bool {
        let mut locked = self.locked.lock();
        if *locked {
            false
        } else {
            *locked = true;
            true
        }
    }

    pub(crate) fn unlock(&self) {
        let mut locked = self.locked.lock();
        debug_assert!(*locked, "unlocking an unlocked buffer");
        *locked = false;
        drop(locked);
        self.cv.notify_one();
    }

    /// 1 when free, 0 when held.
    pub(crate) fn value(&self) -> i32 {
        if *self.locked.lock() {
            0
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_try_lock() {
        let s = Sema::new(false);
        assert!(s.try_lock());
        assert!(!s.try_lock());
        assert_eq!(s.value(), 0);
        s.unlock();
        assert_eq!(s.value(), 1);
    }

    #[test]
    fn test_unlock_from_other_thread() {
        let s = Arc::new(Sema::new(true));
        let s2 = s.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            s2.unlock();
        });
        s.lock();
        assert_eq!(s.value(), 0);
        h.join().unwrap();
    }
}
