//! Buffer flags.
//!
//! One bit set carries both the persistent state of a buffer and the
//! per-request options callers pass to `get`/`find`/`start_io`. The
//! request-only bits are stripped before a buffer's state is stored.

use bitflags::bitflags;
use std::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufFlags: u32 {
        /// Read in progress / read requested.
        const READ          = 1 << 0;
        /// Write in progress / write requested.
        const WRITE         = 1 << 1;
        /// Has a contiguous address.
        const MAPPED        = 1 << 2;
        /// Completion releases lock and hold instead of waking a waiter.
        const ASYNC         = 1 << 4;
        /// No backing memory yet.
        const NONE          = 1 << 5;
        /// Dirty, to be written back by the daemon.
        const DELWRI        = 1 << 6;
        /// Content must not be reused.
        const STALE         = 1 << 7;
        /// Lifetime managed by the caller, not by the hold count.
        const FS_MANAGED    = 1 << 8;
        /// Complete on the data worker class instead of the log class.
        const DATA_IO       = 1 << 9;
        /// Run completion work on a completion worker.
        const DEFER_IODONE  = 1 << 10;
        /// Not every block in the range is valid.
        const PARTIAL       = 1 << 11;
        /// Pages stay locked from resolution until the read completes.
        const PAGE_LOCKED   = 1 << 12;
        /// Memory allocated by the cache.
        const MEM_PRIVATE   = 1 << 13;
        /// Memory supplied by the caller.
        const MEM_EXTERNAL  = 1 << 14;
        /// Never share page-level I/O state at block granularity.
        const PRIVATE_DESC  = 1 << 15;
        /// On the delayed-write queue.
        const DELWRI_Q      = 1 << 16;

        // Request-only bits.

        /// Take the buffer lock (always implied for get/find).
        const LOCK          = 1 << 20;
        /// Don't block on a busy buffer.
        const TRYLOCK       = 1 << 21;
        /// Don't block on page allocation.
        const DONT_BLOCK    = 1 << 22;
        /// Build a contiguous mapping for multi-page buffers.
        const MAPPABLE      = 1 << 23;
        /// Read issued as readahead.
        const READ_AHEAD    = 1 << 24;
        /// Kick the device after submission.
        const RUN_QUEUES    = 1 << 25;
    }
}

impl BufFlags {
    /// Bits that only describe a request and never land on a buffer.
    pub const REQUEST_ONLY: Self = Self::LOCK
        .union(Self::TRYLOCK)
        .union(Self::DONT_BLOCK)
        .union(Self::MAPPABLE)
        .union(Self::READ_AHEAD)
        .union(Self::RUN_QUEUES);

    /// Bits a stale buffer keeps when it is handed out again.
    pub const STALE_KEEP: Self = Self::MAPPED
        .union(Self::MEM_PRIVATE)
        .union(Self::MEM_EXTERNAL);

    /// Bits a caller may set on a new buffer.
    pub const CREATE_MASK: Self = Self::FS_MANAGED
        .union(Self::DATA_IO)
        .union(Self::DEFER_IODONE)
        .union(Self::PRIVATE_DESC);
}

/// Atomically updated flag word stored in each buffer.
#[derive(Debug, Default)]
pub struct AtomicBufFlags(AtomicU32);

impl AtomicBufFlags {
    pub const fn new(flags: BufFlags) -> Self {
        Self(AtomicU32::new(flags.bits()))
    }

    #[inline]
    pub fn load(&self) -> BufFlags {
        BufFlags::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn contains(&self, flags: BufFlags) -> bool {
        self.load().contains(flags)
    }

    #[inline]
    pub fn intersects(&self, flags: BufFlags) -> bool {
        self.load().intersects(flags)
    }

    /// Set bits, returning the previous word.
    #[inline]
    pub fn insert(&self, flags: BufFlags) -> BufFlags {
        BufFlags::from_bits_retain(self.0.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clear bits, returning the previous word.
    #[inline]
    pub fn remove(&self, flags: BufFlags) -> BufFlags {
        BufFlags::from_bits_retain(self.0.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    /// Keep only `flags`.
    #[inline]
    pub fn retain(&self, flags: BufFlags) {
        self.0.fetch_and(flags.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn store(&self, flags: BufFlags) {
        self.0.store(flags.bits(), Ordering::Release);
    }
}
