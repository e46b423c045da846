//! Cache statistics.
//!
//! Counters are relaxed atomics bumped on the hot paths when
//! `PagebufParams::stats` is set. A snapshot is a plain copy.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

macro_rules! pb_stats {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        #[derive(Debug, Default)]
        pub(crate) struct PbStats {
            enabled: AtomicBool,
            $(pub(crate) $name: AtomicU64,)*
        }

        /// Point-in-time copy of the counters.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct PbStatsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl PbStats {
            pub(crate) fn snapshot(&self) -> PbStatsSnapshot {
                PbStatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }

            pub(crate) fn clear(&self) {
                $(self.$name.store(0, Ordering::Relaxed);)*
            }
        }
    };
}

pb_stats! {
    /// `get`/`lookup`/`find` calls.
    gets,
    /// Buffers created on a miss.
    creates,
    /// Lookups that found a live buffer.
    hits,
    /// `find` calls that found nothing.
    misses,
    /// Try-lock failures.
    busy,
    /// Lock requests that had to sleep.
    lock_waits,
    page_found,
    page_created,
    /// Page allocation retries.
    page_retries,
    reads,
    writes,
    descriptors,
    /// Descriptors taken from the reserved pool.
    reserve_uses,
    delwri_queued,
    delwri_flushed,
    /// Completions pushed to a worker class.
    deferred,
}

impl PbStats {
    pub(crate) fn new(enabled: bool) -> Self {
        let s = Self::default();
        s.enabled.store(enabled, Ordering::Relaxed);
        s
    }

    #[inline]
    pub(crate) fn bump(&self, counter: &AtomicU64) {
        if self.enabled.load(Ordering::Relaxed) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_counts_nothing() {
        let s = PbStats::new(false);
        s.bump(&s.gets);
        assert_eq!(s.snapshot().gets, 0);
    }

    #[test]
    fn test_snapshot_and_clear() {
        let s = PbStats::new(true);
        s.bump(&s.gets);
        s.bump(&s.gets);
        s.bump(&s.reserve_uses);
        let snap = s.snapshot();
        assert_eq!(snap.gets, 2);
        assert_eq!(snap.reserve_uses, 1);
        s.clear();
        assert_eq!(s.snapshot(), PbStatsSnapshot::default());
    }
}
