//! Write-back daemon.
//!
//! One thread per cache. Every flush interval, or sooner when woken, it
//! writes delayed-write buffers whose age has expired. A forced wake
//! (memory pressure) writes everything unpinned regardless of age.
//!
//! ```text
//!   wait(flush_interval) ──▶ flush_expired(force) ──▶ kick devices
//!        ▲      ▲                                         │
//!        │    wake(force)                                 │
//!        └────────────────────────────────────────────────┘
//! ```

use crate::cache::Shared;
use pagebuf_core::{PbError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

#[derive(Default)]
struct DaemonState {
    wake: bool,
    force: bool,
    shutdown: bool,
}

/// Wake-up and shutdown requests for the daemon.
pub(crate) struct DaemonSignal {
    state: Mutex<DaemonState>,
    cv: Condvar,
}

impl DaemonSignal {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(DaemonState::default()),
            cv: Condvar::new(),
        }
    }

    /// Run a pass now; `force` ignores buffer age.
    pub(crate) fn wake(&self, force: bool) {
        let mut st = self.state.lock();
        st.wake = true;
        st.force |= force;
        self.cv.notify_one();
    }

    pub(crate) fn shutdown(&self) {
        let mut st = self.state.lock();
        st.shutdown = true;
        self.cv.notify_one();
    }
}

/// What the daemon did over its lifetime.
#[derive(Debug, Clone, Default)]
pub(crate) struct DaemonStats {
    /// Passes run.
    pub cycles: u64,

    /// Forced passes.
    pub forced: u64,

    /// Writes started.
    pub flushed: u64,
}

pub(crate) fn spawn_daemon(shared: Arc<Shared>) -> Result<JoinHandle<DaemonStats>> {
    thread::Builder::new()
        .name("pb-flushd".into())
        .spawn(move || daemon_loop(shared))
        .map_err(|e| PbError::Os(e.raw_os_error().unwrap_or(libc::EAGAIN)))
}

fn daemon_loop(shared: Arc<Shared>) -> DaemonStats {
    let mut stats = DaemonStats::default();
    let signal = &shared.daemon;
    log::debug!(
        "write-back daemon started, interval {:?}, age {:?}",
        shared.params.flush_interval,
        shared.params.age_buffer
    );

    loop {
        let force = {
            let mut st = signal.state.lock();
            if !st.wake && !st.shutdown {
                let deadline = Instant::now() + shared.params.flush_interval;
                while !st.wake && !st.shutdown {
                    if signal.cv.wait_until(&mut st, deadline).timed_out() {
                        break;
                    }
                }
            }
            if st.shutdown {
                break;
            }
            st.wake = false;
            std::mem::take(&mut st.force)
        };

        let n = shared.delwri.flush_expired(force);
        stats.cycles += 1;
        stats.flushed += n as u64;
        if force {
            stats.forced += 1;
        }
        if n > 0 {
            log::trace!("write-back pass started {} writes (force={})", n, force);
        }
    }

    log::debug!(
        "write-back daemon exiting after {} passes, {} writes",
        stats.cycles,
        stats.flushed
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_accumulates_force() {
        let s = DaemonSignal::new();
        s.wake(true);
        s.wake(false);
        let st = s.state.lock();
        assert!(st.wake);
        assert!(st.force);
        assert!(!st.shutdown);
    }

    #[test]
    fn test_shutdown_sets_flag() {
        let s = DaemonSignal::new();
        s.shutdown();
        assert!(s.state.lock().shutdown);
    }
}
