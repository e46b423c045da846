//! `UringDevice`: file-backed block device over io_uring.
//!
//! One reaper thread owns the ring. `submit` only queues the descriptor
//! and unparks the reaper, which turns queued descriptors into
//! `READV`/`WRITEV` entries at the descriptor's byte offset, submits them
//! in batches and completes descriptors from their CQEs. A short transfer
//! is an `EIO`.

use crossbeam_queue::SegQueue;
use io_uring::{opcode, types, IoUring};
use pagebuf_core::{BlockDevice, DeviceId, IoDescriptor, IoDir, PbError, Result};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};

const RING_ENTRIES: u32 = 128;
const MAX_TRANSFER: usize = 1 << 20;
/// Longest the reaper sleeps in the kernel before looking at new work.
const REAP_WAIT_NS: u32 = 5_000_000;

struct Core {
    pending: SegQueue<IoDescriptor>,
    stop: AtomicBool,
    completed: AtomicU64,
}

struct InFlight {
    desc: IoDescriptor,
    // Kept alive until the kernel is done with it.
    _iov: Vec<libc::iovec>,
}

// Safety: the iovecs point into descriptor segments, which are Send.
unsafe impl Send for InFlight {}

pub struct UringDevice {
    id: DeviceId,
    core: Arc<Core>,
    reaper: Thread,
    handle: Option<JoinHandle<()>>,
    _file: File,
}

impl UringDevice {
    /// Open (creating if needed) `path` as a device of `size` bytes.
    pub fn open(id: u32, path: impl AsRef<Path>, size: u64) -> Result<Arc<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())
            .map_err(|e| PbError::Os(e.raw_os_error().unwrap_or(libc::EIO)))?;
        file.set_len(size)
            .map_err(|e| PbError::Os(e.raw_os_error().unwrap_or(libc::EIO)))?;
        let ring = IoUring::new(RING_ENTRIES)
            .map_err(|e| PbError::Os(e.raw_os_error().unwrap_or(libc::ENOSYS)))?;

        let core = Arc::new(Core {
            pending: SegQueue::new(),
            stop: AtomicBool::new(false),
            completed: AtomicU64::new(0),
        });
        let fd = file.as_raw_fd();
        let c = core.clone();
        let handle = thread::Builder::new()
            .name(format!("uring-dev{id}"))
            .spawn(move || reap_loop(ring, fd, c))
            .map_err(|e| PbError::Os(e.raw_os_error().unwrap_or(libc::EAGAIN)))?;
        log::debug!("dev{}: io_uring device on {}", id, path.as_ref().display());
        Ok(Arc::new(Self {
            id: DeviceId(id),
            core,
            reaper: handle.thread().clone(),
            handle: Some(handle),
            _file: file,
        }))
    }

    pub fn completed(&self) -> u64 {
        self.core.completed.load(Ordering::Relaxed)
    }
}

impl BlockDevice for UringDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn submit(&self, desc: IoDescriptor) {
        self.core.pending.push(desc);
        self.reaper.unpark();
    }

    fn run_pending(&self) {
        self.reaper.unpark();
    }

    fn max_transfer(&self) -> usize {
        MAX_TRANSFER
    }
}

impl Drop for UringDevice {
    fn drop(&mut self) {
        self.core.stop.store(true, Ordering::Release);
        self.reaper.unpark();
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                log::error!("{}: reaper thread panicked", self.id);
            }
        }
    }
}

fn sqe_for(desc: &IoDescriptor, iov: &[libc::iovec], fd: RawFd, token: u64) -> io_uring::squeue::Entry {
    let fd = types::Fd(fd);
    let entry = match desc.dir() {
        IoDir::Read => opcode::Readv::new(fd, iov.as_ptr(), iov.len() as u32)
            .offset(desc.byte_offset())
            .build(),
        IoDir::Write => opcode::Writev::new(fd, iov.as_ptr(), iov.len() as u32)
            .offset(desc.byte_offset())
            .build(),
    };
    entry.user_data(token)
}

fn reap_loop(mut ring: IoUring, fd: RawFd, core: Arc<Core>) {
    let mut inflight: HashMap<u64, InFlight> = HashMap::new();
    let mut backlog: VecDeque<IoDescriptor> = VecDeque::new();
    let mut next_token = 0u64;

    loop {
        while let Some(d) = core.pending.pop() {
            backlog.push_back(d);
        }

        // Queue as much as the SQ takes.
        while let Some(desc) = backlog.pop_front() {
            let iov: Vec<libc::iovec> = desc
                .segments()
                .iter()
                .map(|s| libc::iovec {
                    iov_base: s.ptr as *mut libc::c_void,
                    iov_len: s.len,
                })
                .collect();
            let token = next_token;
            let sqe = sqe_for(&desc, &iov, fd, token);
            // Safety: iov and the segment memory outlive the operation;
            // both are kept in `inflight` until its CQE arrives.
            if unsafe { ring.submission().push(&sqe) }.is_err() {
                backlog.push_front(desc);
                break;
            }
            next_token = next_token.wrapping_add(1);
            inflight.insert(token, InFlight { desc, _iov: iov });
        }

        if inflight.is_empty() {
            if core.stop.load(Ordering::Acquire) && core.pending.is_empty() {
                break;
            }
            thread::park();
            continue;
        }

        let ts = types::Timespec::new().nsec(REAP_WAIT_NS);
        let args = types::SubmitArgs::new().timespec(&ts);
        if let Err(e) = ring.submitter().submit_with_args(1, &args) {
            match e.raw_os_error() {
                Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) => {}
                _ => {
                    log::warn!("io_uring submit failed: {}", e);
                    thread::yield_now();
                }
            }
        }

        let done: Vec<(u64, i32)> = ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();
        for (token, res) in done {
            let Some(op) = inflight.remove(&token) else {
                log::warn!("io_uring completion for unknown token {}", token);
                continue;
            };
            let want = op.desc.len();
            let status = if res < 0 {
                Err(-res)
            } else if res as usize != want {
                log::warn!("short transfer: {} of {} bytes", res, want);
                Err(libc::EIO)
            } else {
                Ok(())
            };
            core.completed.fetch_add(1, Ordering::Relaxed);
            op.desc.complete(status);
        }
    }
    log::trace!("io_uring reaper exiting");
}
