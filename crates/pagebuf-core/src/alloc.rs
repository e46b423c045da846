//! Descriptor allocation.
//!
//! The cache asks its allocator first and falls back to the reserved pool
//! when the allocator refuses. Allocators must fail instead of blocking.

use crate::descriptor::IoDescriptor;

pub trait DescriptorAllocator: Send + Sync {
    /// A fresh descriptor with room for `segments` segments, or `None`.
    fn alloc(&self, segments: usize) -> Option<IoDescriptor>;
}

/// Heap allocator using fallible reservation.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapDescriptors;

impl DescriptorAllocator for HeapDescriptors {
    fn alloc(&self, segments: usize) -> Option<IoDescriptor> {
        IoDescriptor::try_with_capacity(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_alloc() {
        let d = HeapDescriptors.alloc(16).unwrap();
        assert!(d.capacity() >= 16);
        assert!(!d.is_reserved());
    }
}
