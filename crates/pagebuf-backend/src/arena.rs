//! Page arena.
//!
//! A fixed number of page slots in one shared memory object. On Linux the
//! object is a memfd, so any set of slots can be mapped again at
//! consecutive addresses with `MAP_FIXED`, which is how multi-page
//! buffers get a contiguous view. Elsewhere the arena is anonymous memory
//! and remapping is unsupported.

use pagebuf_core::{PbError, Result};
use std::ptr::NonNull;

pub(crate) struct PageArena {
    base: NonNull<u8>,
    len: usize,
    page_size: usize,
    slots: usize,
    /// memfd backing the arena, -1 for anonymous memory.
    fd: i32,
}

// Safety: the arena is a fixed mapping; who touches which slot is decided
// by the page cache on top of it.
unsafe impl Send for PageArena {}
unsafe impl Sync for PageArena {}

impl PageArena {
    pub(crate) fn new(slots: usize, page_size: usize) -> Result<Self> {
        assert!(page_size.is_power_of_two(), "page size {page_size} not a power of two");
        let len = slots
            .checked_mul(page_size)
            .filter(|&l| l > 0)
            .ok_or(PbError::Config("arena size"))?;
        let fd = open_backing(len)?;

        let (flags, map_fd) = if fd >= 0 {
            (libc::MAP_SHARED, fd)
        } else {
            (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS, -1)
        };
        // Safety: fresh mapping, no address hint.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                map_fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = PbError::last_os_error();
            if fd >= 0 {
                // Safety: fd came from memfd_create above.
                unsafe { libc::close(fd) };
            }
            return Err(err);
        }
        let base = NonNull::new(ptr as *mut u8).ok_or(PbError::NoMemory)?;
        log::debug!("page arena: {} slots of {} bytes (fd {})", slots, page_size, fd);
        Ok(Self {
            base,
            len,
            page_size,
            slots,
            fd,
        })
    }

    #[inline]
    pub(crate) fn slots(&self) -> usize {
        self.slots
    }

    #[inline]
    pub(crate) fn slot_ptr(&self, slot: usize) -> *mut u8 {
        debug_assert!(slot < self.slots);
        // Safety: slot < slots keeps the offset inside the mapping.
        unsafe { self.base.as_ptr().add(slot * self.page_size) }
    }

    /// Slot whose page starts at `ptr`.
    pub(crate) fn slot_of(&self, ptr: *mut u8) -> Option<usize> {
        let off = (ptr as usize).checked_sub(self.base.as_ptr() as usize)?;
        (off < self.len && off % self.page_size == 0).then(|| off / self.page_size)
    }

    pub(crate) fn zero_slot(&self, slot: usize) {
        // Safety: one whole slot inside the mapping.
        unsafe { std::ptr::write_bytes(self.slot_ptr(slot), 0, self.page_size) };
    }

    /// Map `slots` at consecutive addresses.
    pub(crate) fn map_slots(&self, slots: &[usize]) -> Result<NonNull<u8>> {
        if self.fd < 0 {
            return Err(PbError::Unsupported("remapping anonymous arena pages"));
        }
        let len = slots.len() * self.page_size;
        // Reserve the range first so the fixed mappings can't land on
        // anything else.
        // Safety: fresh anonymous reservation.
        let area = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if area == libc::MAP_FAILED {
            return Err(PbError::last_os_error());
        }
        for (i, &slot) in slots.iter().enumerate() {
            // Safety: replaces one page of our own reservation.
            let p = unsafe {
                libc::mmap(
                    (area as *mut u8).add(i * self.page_size) as *mut libc::c_void,
                    self.page_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    self.fd,
                    (slot * self.page_size) as libc::off_t,
                )
            };
            if p == libc::MAP_FAILED {
                let err = PbError::last_os_error();
                // Safety: the whole reservation is ours.
                unsafe { libc::munmap(area, len) };
                return Err(err);
            }
        }
        NonNull::new(area as *mut u8).ok_or(PbError::NoMemory)
    }

    /// Undo `map_slots`.
    pub(crate) fn unmap(&self, ptr: *mut u8, len: usize) {
        // Safety: ptr/len describe a mapping made by map_slots.
        if unsafe { libc::munmap(ptr as *mut libc::c_void, len) } != 0 {
            log::warn!("munmap of {} bytes at {:p} failed: {}", len, ptr, PbError::last_os_error());
        }
    }
}

impl Drop for PageArena {
    fn drop(&mut self) {
        // Safety: base/len is the arena mapping; fd is ours.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
            if self.fd >= 0 {
                libc::close(self.fd);
            }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn open_backing(len: usize) -> Result<i32> {
            // Safety: static NUL-terminated name.
            let fd = unsafe { libc::memfd_create(c"pagebuf-arena".as_ptr(), libc::MFD_CLOEXEC) };
            if fd < 0 {
                return Err(PbError::last_os_error());
            }
            // Safety: fd is the memfd just created.
            if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
                let err = PbError::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
            Ok(fd)
        }
    } else {
        fn open_backing(_len: usize) -> Result<i32> {
            Ok(-1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_addressing() {
        let a = PageArena::new(4, 4096).unwrap();
        assert_eq!(a.slots(), 4);
        let p2 = a.slot_ptr(2);
        assert_eq!(a.slot_of(p2), Some(2));
        assert_eq!(a.slot_of(unsafe { p2.add(1) }), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_remap_shares_bytes() {
        let a = PageArena::new(4, 4096).unwrap();
        unsafe {
            *a.slot_ptr(3) = 0xaa;
            *a.slot_ptr(1) = 0xbb;
        }
        let m = a.map_slots(&[3, 1]).unwrap();
        unsafe {
            assert_eq!(*m.as_ptr(), 0xaa);
            assert_eq!(*m.as_ptr().add(4096), 0xbb);
            *m.as_ptr().add(4096 + 1) = 0xcc;
            assert_eq!(*a.slot_ptr(1).add(1), 0xcc);
        }
        a.unmap(m.as_ptr(), 8192);
    }
}
