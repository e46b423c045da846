//! Low-level I/O descriptors.
//!
//! A descriptor is one device-addressed unit of a buffer's read or
//! write: a starting sector, a direction, a scatter-gather list of memory
//! segments and a completion callback. One buffer I/O becomes one or more
//! descriptors; the cache counts them back in as they complete.
//!
//! Sectors are always 512-byte units, whatever the target's own sector
//! size is.

use crate::block::DeviceId;

/// Descriptor sectors are 512-byte units.
pub const SECTOR_SHIFT: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDir {
    Read,
    Write,
}

/// Outcome of a descriptor: `Err(errno)` on failure.
pub type IoStatus = std::result::Result<(), i32>;

/// Completion callback. Runs exactly once, possibly on a device thread;
/// it must not block.
pub type EndIo = Box<dyn FnOnce(IoDescriptor, IoStatus) + Send>;

/// One contiguous piece of memory taking part in a transfer.
#[derive(Debug, Clone, Copy)]
pub struct IoSegment {
    pub ptr: *mut u8,
    pub len: usize,
}

// Safety: segments point at page or buffer memory that the submitting
// buffer keeps alive until the descriptor completes.
unsafe impl Send for IoSegment {}
unsafe impl Sync for IoSegment {}

impl IoSegment {
    /// # Safety
    /// The segment's memory must still be alive and not accessed
    /// concurrently (true between submission and completion).
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }

    /// # Safety
    /// Same as [`as_mut_slice`](Self::as_mut_slice).
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }
}

pub struct IoDescriptor {
    device: DeviceId,
    sector: u64,
    dir: IoDir,
    segments: Vec<IoSegment>,
    end_io: Option<EndIo>,
    reserved: bool,
}

impl IoDescriptor {
    /// Allocate a descriptor able to carry `segments` segments.
    ///
    /// Returns `None` if the allocator refuses; no panic, no abort.
    pub fn try_with_capacity(segments: usize) -> Option<Self> {
        let mut v = Vec::new();
        v.try_reserve_exact(segments.max(1)).ok()?;
        Some(Self {
            device: DeviceId(0),
            sector: 0,
            dir: IoDir::Read,
            segments: v,
            end_io: None,
            reserved: false,
        })
    }

    /// Point the descriptor at a device range.
    pub fn setup(&mut self, device: DeviceId, sector: u64, dir: IoDir) {
        self.device = device;
        self.sector = sector;
        self.dir = dir;
    }

    /// Append a segment. Returns `false` when the descriptor is full; it
    /// never grows past the capacity it was allocated with.
    pub fn push_segment(&mut self, ptr: *mut u8, len: usize) -> bool {
        if self.is_full() {
            return false;
        }
        self.segments.push(IoSegment { ptr, len });
        true
    }

    pub fn set_end_io(&mut self, end_io: EndIo) {
        self.end_io = Some(end_io);
    }

    /// Deliver the outcome. Called by the block device, once.
    pub fn complete(mut self, status: IoStatus) {
        if let Some(end_io) = self.end_io.take() {
            end_io(self, status);
        }
    }

    /// Drop segments and callback so the descriptor can be reused.
    pub fn reset(&mut self) {
        self.segments.clear();
        self.end_io = None;
        self.sector = 0;
        self.dir = IoDir::Read;
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[inline]
    pub fn sector(&self) -> u64 {
        self.sector
    }

    /// Byte offset on the device.
    #[inline]
    pub fn byte_offset(&self) -> u64 {
        self.sector << SECTOR_SHIFT
    }

    #[inline]
    pub fn dir(&self) -> IoDir {
        self.dir
    }

    #[inline]
    pub fn segments(&self) -> &[IoSegment] {
        &self.segments
    }

    /// Total bytes covered.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.segments.capacity()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.segments.len() >= self.segments.capacity()
    }

    /// Descriptor came from the reserved pool and must go back to it.
    #[inline]
    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    pub fn set_reserved(&mut self, reserved: bool) {
        self.reserved = reserved;
    }
}

impl std::fmt::Debug for IoDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoDescriptor")
            .field("device", &self.device)
            .field("sector", &self.sector)
            .field("dir", &self.dir)
            .field("segments", &self.segments.len())
            .field("bytes", &self.len())
            .field("reserved", &self.reserved)
            .finish()
    }
}

/// A descriptor dropped by a device without `complete()` still completes,
/// with `EIO`, so the owning buffer's I/O count drains.
impl Drop for IoDescriptor {
    fn drop(&mut self) {
        if let Some(end_io) = self.end_io.take() {
            log::error!(
                "descriptor for sector {} dropped without completion",
                self.sector
            );
            let orphan = IoDescriptor {
                device: self.device,
                sector: self.sector,
                dir: self.dir,
                segments: std::mem::take(&mut self.segments),
                end_io: None,
                reserved: self.reserved,
            };
            end_io(orphan, Err(libc::EIO));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_capacity_is_fixed() {
        let mut d = IoDescriptor::try_with_capacity(2).unwrap();
        let mut mem = [0u8; 1024];
        assert!(d.push_segment(mem.as_mut_ptr(), 512));
        assert!(d.push_segment(unsafe { mem.as_mut_ptr().add(512) }, 512));
        assert!(!d.push_segment(mem.as_mut_ptr(), 512));
        assert_eq!(d.len(), 1024);
        assert_eq!(d.capacity(), 2);
    }

    #[test]
    fn test_complete_runs_end_io_once() {
        let seen = Arc::new(AtomicI32::new(0));
        let seen2 = seen.clone();
        let mut d = IoDescriptor::try_with_capacity(1).unwrap();
        d.setup(DeviceId(1), 8, IoDir::Write);
        assert_eq!(d.byte_offset(), 4096);
        d.set_end_io(Box::new(move |desc, status| {
            assert_eq!(desc.sector(), 8);
            seen2.store(status.err().unwrap_or(-1), Ordering::SeqCst);
        }));
        d.complete(Err(libc::EIO));
        assert_eq!(seen.load(Ordering::SeqCst), libc::EIO);
    }

    #[test]
    fn test_dropped_descriptor_completes_with_eio() {
        let seen = Arc::new(AtomicI32::new(0));
        let seen2 = seen.clone();
        let mut d = IoDescriptor::try_with_capacity(1).unwrap();
        d.set_end_io(Box::new(move |_, status| {
            seen2.store(status.err().unwrap_or(0), Ordering::SeqCst);
        }));
        drop(d);
        assert_eq!(seen.load(Ordering::SeqCst), libc::EIO);
    }

    #[test]
    fn test_reset() {
        let mut d = IoDescriptor::try_with_capacity(4).unwrap();
        let mut mem = [0u8; 512];
        d.push_segment(mem.as_mut_ptr(), 512);
        d.set_end_io(Box::new(|_, _| {}));
        d.reset();
        assert!(d.is_empty());
        assert_eq!(d.capacity(), 4);
        drop(d);
    }
}
