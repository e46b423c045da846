//! Hash index of live buffers.
//!
//! Fixed number of buckets, each a short MRU-ordered chain behind its
//! own lock. The bucket lock guards membership and the hold count's
//! transitions through zero; it is never held while sleeping on a buffer
//! lock.

use crate::buffer::BufInner;
use crate::target::Target;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub(crate) type Bucket = Mutex<Vec<Arc<BufInner>>>;

pub(crate) enum Lookup {
    /// Existing buffer, hold already taken.
    Found(Arc<BufInner>),
    /// The caller's new buffer was published.
    Created(Arc<BufInner>),
    Missing,
}

pub(crate) struct BufIndex {
    buckets: Box<[Bucket]>,
    bits: u32,
}

/// Fold the sector number mixed with the target address into `bits` bits.
#[inline]
pub(crate) fn hash(target_key: usize, offset: u64, bits: u32) -> usize {
    let mask = (1u64 << bits) - 1;
    let mut base = (offset >> 9) ^ (target_key as u64).rotate_left(17);
    let mut hval = 0u64;
    while base != 0 {
        hval ^= base & mask;
        base >>= bits;
    }
    hval as usize
}

impl BufIndex {
    pub(crate) fn new(bits: u32) -> Self {
        let buckets = (0..1usize << bits).map(|_| Mutex::new(Vec::new())).collect();
        Self { buckets, bits }
    }

    #[inline]
    pub(crate) fn bucket(&self, target: &Arc<Target>, offset: u64) -> &Bucket {
        &self.buckets[hash(Target::key(target), offset, self.bits)]
    }

    #[inline]
    pub(crate) fn lock_bucket_of(&self, inner: &BufInner) -> MutexGuard<'_, Vec<Arc<BufInner>>> {
        self.bucket(&inner.target, inner.offset()).lock()
    }

    /// Look up `(target, offset, len)`. On a miss with `create`, the buffer
    /// it builds is linked before the bucket lock drops.
    pub(crate) fn find_or_insert(
        &self,
        target: &Arc<Target>,
        offset: u64,
        len: usize,
        create: Option<&dyn Fn() -> Arc<BufInner>>,
    ) -> Lookup {
        let mut chain = self.bucket(target, offset).lock();
        let hit = chain.iter().position(|b| {
            Arc::ptr_eq(&b.target, target) && b.offset() == offset && b.len() == len
        });
        if let Some(pos) = hit {
            let b = chain.remove(pos);
            b.hold.fetch_add(1, Ordering::AcqRel);
            chain.insert(0, b.clone());
            return Lookup::Found(b);
        }
        match create {
            Some(make) => {
                let b = make();
                chain.insert(0, b.clone());
                Lookup::Created(b)
            }
            None => Lookup::Missing,
        }
    }

    /// Unlink every buffer, returning them.
    pub(crate) fn drain(&self) -> Vec<Arc<BufInner>> {
        let mut all = Vec::new();
        for bucket in self.buckets.iter() {
            all.append(&mut bucket.lock());
        }
        all
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }
}
