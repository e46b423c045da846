//! `FaultyDescriptors`: an allocator that can be told to refuse.

use pagebuf_core::{DescriptorAllocator, IoDescriptor};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Heap descriptors, except while failing is switched on. Lets tests drive
/// the cache onto its reserved pool.
#[derive(Debug, Default)]
pub struct FaultyDescriptors {
    failing: AtomicBool,
    granted: AtomicU64,
    refused: AtomicU64,
}

impl FaultyDescriptors {
    pub fn new(failing: bool) -> Self {
        Self {
            failing: AtomicBool::new(failing),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, on: bool) {
        self.failing.store(on, Ordering::Release);
    }

    pub fn granted(&self) -> u64 {
        self.granted.load(Ordering::Relaxed)
    }

    pub fn refused(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }
}

impl DescriptorAllocator for FaultyDescriptors {
    fn alloc(&self, segments: usize) -> Option<IoDescriptor> {
        if self.failing.load(Ordering::Acquire) {
            self.refused.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let d = IoDescriptor::try_with_capacity(segments)?;
        self.granted.fetch_add(1, Ordering::Relaxed);
        Some(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle() {
        let a = FaultyDescriptors::new(true);
        assert!(a.alloc(4).is_none());
        a.set_failing(false);
        assert!(a.alloc(4).is_some());
        assert_eq!((a.granted(), a.refused()), (1, 1));
    }
}
