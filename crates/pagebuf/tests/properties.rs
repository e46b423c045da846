//! End-to-end behaviour of the cache over the reference collaborators.

use pagebuf::{
    Buf, BufFlags, BufferCache, Geometry, IoMove, LockedBuf, PageCache, PagebufParams, PbError,
    Target,
};
use pagebuf_backend::{FaultyDescriptors, MemDevice, MemPageCache};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const PAGE: usize = 4096;
const DEV_SIZE: usize = 1 << 20;

struct Rig {
    cache: BufferCache,
    pages: Arc<MemPageCache>,
    dev: Arc<MemDevice>,
    target: Arc<Target>,
}

/// Long daemon period and age so only explicit flushes write, unless a
/// test asks otherwise.
fn quiet_params() -> PagebufParams {
    PagebufParams::new()
        .stats(true)
        .flush_interval(Duration::from_secs(60))
        .age_buffer(Duration::from_secs(600))
}

fn rig_with(dev: Arc<MemDevice>, block: usize, params: PagebufParams) -> Rig {
    let pages = MemPageCache::with_page_size(64, PAGE).unwrap();
    let target = Target::new(
        Geometry::new(512, block).unwrap(),
        pages.clone() as Arc<dyn PageCache>,
        dev.clone(),
    )
    .unwrap();
    let cache = BufferCache::open(params).unwrap();
    Rig {
        cache,
        pages,
        dev,
        target,
    }
}

fn rig() -> Rig {
    rig_with(MemDevice::threaded(1, DEV_SIZE), PAGE, quiet_params())
}

fn manual_rig() -> Rig {
    rig_with(MemDevice::manual(2, DEV_SIZE), PAGE, quiet_params())
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn concurrent_get_yields_one_buffer() {
    let r = rig();
    let barrier = Barrier::new(8);
    let bufs: Vec<Buf> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    r.cache
                        .get(&r.target, 8 * PAGE as u64, PAGE, BufFlags::empty())
                        .unwrap()
                        .unlock()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(bufs.iter().all(|b| b.ptr_eq(&bufs[0])));
    assert_eq!(bufs[0].hold_count(), 8);
    assert_eq!(r.cache.buffer_count(), 1);
    let st = r.cache.stats();
    assert_eq!(st.creates, 1);
    assert_eq!(st.hits, 7);
}

#[test]
fn buffer_lock_serializes_content() {
    let r = rig();
    let keep = r
        .cache
        .get(&r.target, 0, PAGE, BufFlags::empty())
        .unwrap()
        .unlock();

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..200 {
                    let mut lb = r.cache.get(&r.target, 0, PAGE, BufFlags::empty()).unwrap();
                    let bytes = lb.mapped_mut().unwrap();
                    let n = u64::from_le_bytes(bytes[..8].try_into().unwrap());
                    thread::yield_now();
                    bytes[..8].copy_from_slice(&(n + 1).to_le_bytes());
                }
            });
        }
    });

    let lb = keep.lock();
    let n = u64::from_le_bytes(lb.mapped().unwrap()[..8].try_into().unwrap());
    assert_eq!(n, 800);
}

#[test]
fn last_release_frees_unless_fs_managed() {
    let r = rig();
    let b = r
        .cache
        .get(&r.target, 0, PAGE, BufFlags::empty())
        .unwrap()
        .unlock();
    let b2 = b.clone();
    assert_eq!(b.hold_count(), 2);
    drop(b);
    assert_eq!(r.cache.buffer_count(), 1);
    drop(b2);
    assert_eq!(r.cache.buffer_count(), 0);
    assert!(r.cache.find(&r.target, 0, PAGE, BufFlags::empty()).is_none());

    let lb = r.cache.get(&r.target, PAGE as u64, PAGE, BufFlags::FS_MANAGED).unwrap();
    assert!(lb.flags().contains(BufFlags::FS_MANAGED));
    drop(lb);
    assert_eq!(r.cache.buffer_count(), 1);
    let found = r.cache.find(&r.target, PAGE as u64, PAGE, BufFlags::empty()).unwrap();
    assert_eq!(found.hold_count(), 1);
}

#[test]
fn release_hook_runs_once_instead_of_free() {
    let r = rig();
    let (tx, rx) = mpsc::channel();
    let lb = r.cache.get(&r.target, 0, PAGE, BufFlags::empty()).unwrap();
    lb.set_release_hook(Box::new(move |buf: Buf| {
        tx.send(buf.hold_count()).unwrap();
    }));
    drop(lb);
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
    // The hook's handle dropped normally.
    assert_eq!(r.cache.buffer_count(), 0);
}

#[test]
fn write_then_read_after_pages_dropped() {
    let r = rig();
    let data = pattern(2 * PAGE, 7);
    let off = 4 * PAGE as u64;

    let mut lb = r
        .cache
        .get(&r.target, off, 2 * PAGE, BufFlags::MAPPABLE)
        .unwrap();
    lb.mapped_mut().unwrap().copy_from_slice(&data);
    lb.start_io(BufFlags::WRITE).unwrap();
    drop(lb);
    assert_eq!(r.cache.buffer_count(), 0);
    assert!(r.pages.shrink() >= 2);

    let lb = r
        .cache
        .get(&r.target, off, 2 * PAGE, BufFlags::READ | BufFlags::MAPPABLE)
        .unwrap();
    assert!(!lb.flags().contains(BufFlags::PARTIAL));
    assert_eq!(lb.mapped().unwrap(), &data[..]);

    let mut on_disk = vec![0u8; 2 * PAGE];
    r.dev.read_at(off as usize, &mut on_disk);
    assert_eq!(on_disk, data);
    assert!(r.cache.stats().reads >= 1);
}

#[test]
fn unmapped_multi_page_buffer_moves_bytes() {
    let r = rig();
    let data = pattern(3 * PAGE, 1);
    let mut lb = r.cache.get(&r.target, 0, 3 * PAGE, BufFlags::empty()).unwrap();
    assert!(lb.mapped().is_none());
    lb.move_bytes(0, IoMove::Write(&data));
    lb.move_bytes(PAGE - 10, IoMove::Zero(20));

    let mut out = vec![0u8; 3 * PAGE];
    lb.move_bytes(0, IoMove::Read(&mut out));
    assert!(out[PAGE - 10..PAGE + 10].iter().all(|&b| b == 0));
    assert_eq!(&out[..PAGE - 10], &data[..PAGE - 10]);
    assert_eq!(&out[PAGE + 10..], &data[PAGE + 10..]);
}

#[test]
fn delayed_write_queues_once() {
    let r = manual_rig();
    let data = pattern(PAGE, 3);
    let mut lb = r.cache.get(&r.target, 0, PAGE, BufFlags::empty()).unwrap();
    lb.mapped_mut().unwrap().copy_from_slice(&data);
    lb.delwri_queue();
    lb.delwri_queue();
    assert_eq!(r.cache.delwri_count(), 1);
    assert_eq!(lb.hold_count(), 2);
    assert!(lb.flags().contains(BufFlags::DELWRI | BufFlags::DELWRI_Q));

    let b = lb.delwri();
    assert_eq!(r.cache.delwri_count(), 1);
    drop(b);
    assert_eq!(r.cache.buffer_count(), 1);

    assert_eq!(r.cache.flush_target(&r.target, true), 0);
    assert_eq!(r.cache.delwri_count(), 0);
    assert_eq!(r.dev.stats().writes, 1);
    assert_eq!(r.cache.buffer_count(), 0);

    let mut on_disk = vec![0u8; PAGE];
    r.dev.read_at(0, &mut on_disk);
    assert_eq!(on_disk, data);
}

#[test]
fn dequeue_drops_dirty_state() {
    let r = manual_rig();
    let lb = r.cache.get(&r.target, 0, PAGE, BufFlags::empty()).unwrap();
    lb.delwri_queue();
    lb.delwri_dequeue();
    assert_eq!(r.cache.delwri_count(), 0);
    assert!(!lb.flags().intersects(BufFlags::DELWRI | BufFlags::DELWRI_Q));
    assert_eq!(lb.hold_count(), 1);
    drop(lb);
    assert_eq!(r.cache.flush_all(true), 0);
    assert_eq!(r.dev.stats().writes, 0);
}

#[test]
fn pinned_buffer_is_not_flushed() {
    let r = manual_rig();
    let lb = r.cache.get(&r.target, 0, PAGE, BufFlags::empty()).unwrap();
    lb.pin();
    let b = lb.delwri();

    assert_eq!(r.cache.flush_target(&r.target, true), 1);
    r.cache.wake_daemon(true);
    thread::sleep(Duration::from_millis(50));
    r.dev.complete_all();
    assert_eq!(r.dev.stats().writes, 0);
    assert_eq!(r.cache.delwri_count(), 1);

    b.unpin();
    drop(b);
    assert_eq!(r.cache.flush_target(&r.target, true), 0);
    assert_eq!(r.dev.stats().writes, 1);
}

#[test]
fn write_waits_for_unpin() {
    let r = rig();
    let mut lb = r.cache.get(&r.target, 0, PAGE, BufFlags::empty()).unwrap();
    lb.pin();
    let pinner = Buf::clone(&lb);
    let start = Instant::now();
    let h = thread::spawn(move || {
        thread::sleep(Duration::from_millis(40));
        pinner.unpin();
    });
    lb.start_io(BufFlags::WRITE).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(30));
    h.join().unwrap();
    assert!(!lb.is_pinned());
}

#[test]
fn reserved_pool_keeps_io_moving() {
    let alloc = Arc::new(FaultyDescriptors::new(true));
    let dev = MemDevice::manual(3, DEV_SIZE);
    let pages = MemPageCache::with_page_size(64, PAGE).unwrap();
    let target = Target::new(Geometry::new(512, PAGE).unwrap(), pages, dev.clone()).unwrap();
    let cache = BufferCache::builder()
        .params(quiet_params().reserve_size(1).reserve_segments(2))
        .allocator(alloc.clone())
        .open()
        .unwrap();

    let data = pattern(8 * PAGE, 9);
    let mut lb = cache.get(&target, 0, 8 * PAGE, BufFlags::empty()).unwrap();
    lb.move_bytes(0, IoMove::Write(&data));
    lb.start_io(BufFlags::WRITE).unwrap();

    assert_eq!(dev.stats().writes, 4);
    assert_eq!(cache.stats().reserve_uses, 4);
    assert!(alloc.refused() >= 4);
    assert_eq!(cache.reserve_available(), 1);

    let mut on_disk = vec![0u8; 8 * PAGE];
    dev.read_at(0, &mut on_disk);
    assert_eq!(on_disk, data);
}

#[test]
fn sub_page_blocks_read_shares_page_state() {
    let r = rig_with(MemDevice::manual(4, DEV_SIZE), 512, quiet_params());
    let data = pattern(PAGE, 5);
    r.dev.write_at(0, &data);

    let mut lb = r.cache.lookup(&r.target, 0, PAGE, BufFlags::empty()).unwrap();
    assert!(lb.flags().contains(BufFlags::PARTIAL));
    r.cache.clear_stats();

    lb.start_io(BufFlags::READ).unwrap();
    assert_eq!(r.cache.stats().descriptors, 8);
    assert_eq!(r.dev.stats().reads, 8);
    assert!(!lb.flags().contains(BufFlags::PARTIAL));
    assert_eq!(lb.error(), 0);
    assert_eq!(lb.mapped().unwrap(), &data[..]);

    let page = r.pages.find_page(0).unwrap();
    assert!(!page.is_locked());
    assert!(page.is_uptodate());
}

#[test]
fn sub_page_read_fetches_only_covered_blocks() {
    let r = rig_with(MemDevice::manual(5, DEV_SIZE), 512, quiet_params());
    let data = pattern(PAGE, 21);
    r.dev.write_at(0, &data);

    let a = r.cache.get(&r.target, 1024, 512, BufFlags::READ).unwrap();
    assert_eq!(r.dev.stats().reads, 1);
    assert_eq!(a.mapped().unwrap(), &data[1024..1536]);

    let b = r.cache.get(&r.target, 2048, 1024, BufFlags::READ).unwrap();
    assert_eq!(r.dev.stats().reads, 3);
    assert_eq!(b.mapped().unwrap(), &data[2048..3072]);
    assert!(!r.pages.find_page(0).unwrap().is_uptodate());
}

#[test]
fn overlapping_sub_page_buffers_share_block_state() {
    let r = rig_with(MemDevice::manual(6, DEV_SIZE), 512, quiet_params());
    r.dev.write_at(0, &[0xaa; PAGE]);

    let mut a = r.cache.get(&r.target, 1024, 512, BufFlags::READ).unwrap();
    assert_eq!(r.dev.stats().reads, 1);
    a.move_bytes(0, IoMove::Write(&[0x55; 512]));
    let a = a.delwri();

    // The whole-page buffer reads only the seven blocks the first one
    // does not already hold.
    let b = r.cache.get(&r.target, 0, PAGE, BufFlags::READ).unwrap();
    assert_eq!(r.dev.stats().reads, 8);
    let seen = b.mapped().unwrap();
    assert!(seen[..1024].iter().all(|&x| x == 0xaa));
    assert!(seen[1024..1536].iter().all(|&x| x == 0x55));
    assert!(seen[1536..].iter().all(|&x| x == 0xaa));
    assert!(r.pages.find_page(0).unwrap().is_uptodate());
    drop(b);

    assert_eq!(r.cache.flush_target(&r.target, true), 0);
    assert_eq!(r.dev.stats().writes, 1);
    let mut disk = vec![0u8; PAGE];
    r.dev.read_at(0, &mut disk);
    assert!(disk[1024..1536].iter().all(|&x| x == 0x55));
    assert!(disk[1536..].iter().all(|&x| x == 0xaa));
    drop(a);
}

#[test]
fn queued_write_marks_its_blocks_valid() {
    let r = rig_with(MemDevice::manual(7, DEV_SIZE), 512, quiet_params());
    r.dev.write_at(0, &[0xaa; PAGE]);

    // Never read: the caller supplies every byte.
    let mut a = r.cache.get(&r.target, 2048, 1024, BufFlags::empty()).unwrap();
    assert!(a.flags().contains(BufFlags::PARTIAL));
    a.move_bytes(0, IoMove::Write(&[0x33; 1024]));
    let a = a.delwri();
    assert!(!a.flags().contains(BufFlags::PARTIAL));
    assert_eq!(r.dev.stats().reads, 0);

    let b = r.cache.get(&r.target, 0, PAGE, BufFlags::READ).unwrap();
    assert_eq!(r.dev.stats().reads, 6);
    assert!(b.mapped().unwrap()[2048..3072].iter().all(|&x| x == 0x33));
    drop(b);

    assert_eq!(r.cache.flush_all(true), 0);
    let mut disk = vec![0u8; 1024];
    r.dev.read_at(2048, &mut disk);
    assert!(disk.iter().all(|&x| x == 0x33));
    drop(a);
}

#[test]
fn flush_leaves_caller_locked_buffer_queued() {
    let r = manual_rig();
    let mut lb = r.cache.get(&r.target, 0, PAGE, BufFlags::empty()).unwrap();
    lb.move_bytes(0, IoMove::Write(&[0x11; PAGE]));
    lb.delwri_queue();

    assert_eq!(r.cache.flush_target(&r.target, false), 0);
    assert_eq!(r.cache.flush_all(true), 0);
    assert_eq!(r.cache.delwri_count(), 1);
    assert_eq!(r.dev.stats().writes, 0);
    assert!(lb.flags().contains(BufFlags::DELWRI_Q));

    let b = lb.unlock();
    assert_eq!(r.cache.flush_target(&r.target, true), 0);
    assert_eq!(r.cache.delwri_count(), 0);
    assert_eq!(r.dev.stats().writes, 1);
    assert!(!b.flags().contains(BufFlags::DELWRI));
}

#[test]
fn close_skips_caller_locked_delayed_write() {
    let Rig {
        cache, dev, target, ..
    } = manual_rig();
    let lb = cache.get(&target, 0, PAGE, BufFlags::empty()).unwrap();
    lb.delwri_queue();

    let (tx, rx) = mpsc::channel();
    let closer = thread::spawn(move || {
        cache.close();
        let _ = tx.send(());
    });
    assert!(rx.recv_timeout(Duration::from_secs(3)).is_ok());
    assert_eq!(dev.stats().writes, 0);
    drop(lb);
    closer.join().unwrap();
}

#[test]
fn hit_applies_requested_completion_class() {
    let r = rig();
    let held = r
        .cache
        .get(&r.target, 0, PAGE, BufFlags::empty())
        .unwrap()
        .unlock();
    assert!(!held.flags().contains(BufFlags::DEFER_IODONE));

    let lb = r
        .cache
        .get(&r.target, 0, PAGE, BufFlags::DEFER_IODONE | BufFlags::DATA_IO)
        .unwrap();
    assert!(lb.ptr_eq(&held));
    assert!(lb.flags().contains(BufFlags::DEFER_IODONE | BufFlags::DATA_IO));
    drop(held);

    let (tx, rx) = mpsc::channel();
    lb.set_iodone(Arc::new(move |_lb: LockedBuf| {
        let name = thread::current().name().map(str::to_owned);
        tx.send(name).unwrap();
    }));
    lb.start_io_async(BufFlags::WRITE);
    let name = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(name.unwrap().starts_with("pb-data-"));
}

#[test]
fn read_error_is_returned_and_cleared_later() {
    let r = manual_rig();
    r.dev.fail_sector(17);
    let err = r
        .cache
        .get(&r.target, 2 * PAGE as u64, PAGE, BufFlags::READ)
        .unwrap_err();
    assert_eq!(err, PbError::Io(libc::EIO));
    assert_eq!(r.cache.buffer_count(), 0);
    assert!(!r.pages.find_page(2).unwrap().is_locked());

    r.dev.clear_faults();
    let lb = r
        .cache
        .get(&r.target, 2 * PAGE as u64, PAGE, BufFlags::READ)
        .unwrap();
    assert_eq!(lb.error(), 0);
}

#[test]
fn failed_write_stays_dirty() {
    let r = manual_rig();
    r.dev.fail_sector(0);
    let mut lb = r.cache.get(&r.target, 0, PAGE, BufFlags::empty()).unwrap();
    assert_eq!(lb.start_io(BufFlags::WRITE), Err(PbError::Io(libc::EIO)));
    assert!(lb.flags().contains(BufFlags::DELWRI));
    lb.delwri_dequeue();
}

#[test]
fn try_get_reports_busy() {
    let r = rig();
    let held = r.cache.get(&r.target, 0, PAGE, BufFlags::empty()).unwrap();
    thread::scope(|s| {
        s.spawn(|| {
            assert!(r
                .cache
                .try_get(&r.target, 0, PAGE, BufFlags::empty())
                .unwrap()
                .is_none());
            assert!(r.cache.find(&r.target, 0, PAGE, BufFlags::TRYLOCK).is_none());
        });
    });
    assert_eq!(held.lock_value(), 0);
    assert!(r.cache.stats().busy >= 2);
    drop(held);
    assert!(r
        .cache
        .try_get(&r.target, 0, PAGE, BufFlags::empty())
        .unwrap()
        .is_some());
}

#[test]
fn deferred_completion_runs_on_worker() {
    let r = rig();
    let (tx, rx) = mpsc::channel();
    let lb = r
        .cache
        .get(&r.target, 0, PAGE, BufFlags::DEFER_IODONE | BufFlags::DATA_IO)
        .unwrap();
    lb.set_iodone(Arc::new(move |lb: LockedBuf| {
        let name = thread::current().name().map(str::to_owned);
        tx.send((lb.offset(), lb.error(), name)).unwrap();
    }));
    lb.start_io_async(BufFlags::WRITE);

    let (off, err, name) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!((off, err), (0, 0));
    assert!(name.unwrap().starts_with("pb-data-"));
    assert_eq!(r.cache.stats().deferred, 1);
    assert!(wait_until(Duration::from_secs(1), || r.cache.buffer_count() == 0));
}

#[test]
fn readahead_fills_page_cache() {
    let r = rig();
    let data = pattern(PAGE, 11);
    r.dev.write_at(3 * PAGE, &data);

    r.cache.readahead(&r.target, 3 * PAGE as u64, PAGE);
    assert!(wait_until(Duration::from_secs(2), || r.cache.buffer_count() == 0));
    assert_eq!(r.dev.stats().reads, 1);

    let lb = r
        .cache
        .get(&r.target, 3 * PAGE as u64, PAGE, BufFlags::READ)
        .unwrap();
    assert_eq!(r.dev.stats().reads, 1);
    assert_eq!(lb.mapped().unwrap(), &data[..]);
}

#[test]
fn private_and_caller_memory() {
    let r = rig();
    let data = pattern(PAGE, 13);

    let mut lb = r.cache.get_no_daddr(&r.target, PAGE).unwrap();
    assert!(lb.flags().contains(BufFlags::MEM_PRIVATE | BufFlags::MAPPED));
    assert!(!lb.is_hashed());
    lb.mapped_mut().unwrap().copy_from_slice(&data);
    lb.set_disk_offset(2 * PAGE as u64);
    lb.start_io(BufFlags::WRITE).unwrap();
    drop(lb);

    let mut lb = r
        .cache
        .get_with_memory(&r.target, 2 * PAGE as u64, Box::new(vec![0u8; PAGE]))
        .unwrap();
    assert!(lb.flags().contains(BufFlags::MEM_EXTERNAL));
    lb.start_io(BufFlags::READ).unwrap();
    assert_eq!(lb.mapped().unwrap(), &data[..]);
    assert_eq!(r.cache.buffer_count(), 0);

    let empty = r.cache.get_empty(&r.target, PAGE).unwrap();
    assert!(empty.flags().contains(BufFlags::NONE));
}

#[test]
fn daemon_writes_expired_buffers() {
    let params = quiet_params()
        .flush_interval(Duration::from_millis(20))
        .age_buffer(Duration::from_millis(10));
    let r = rig_with(MemDevice::threaded(6, DEV_SIZE), PAGE, params);
    let mut lb = r.cache.get(&r.target, 0, PAGE, BufFlags::empty()).unwrap();
    lb.mapped_mut().unwrap().fill(0x42);
    drop(lb.delwri());

    assert!(wait_until(Duration::from_secs(2), || r.cache.delwri_count() == 0
        && r.dev.stats().writes == 1));
    assert!(wait_until(Duration::from_secs(1), || r.cache.buffer_count() == 0));
    let mut b = [0u8; 16];
    r.dev.read_at(0, &mut b);
    assert_eq!(b, [0x42; 16]);
}

#[test]
fn stale_buffer_is_reset_when_found() {
    let r = rig();
    let lb = r.cache.get(&r.target, 0, PAGE, BufFlags::FS_MANAGED).unwrap();
    lb.delwri_queue();
    lb.mark_stale();
    assert_eq!(r.cache.delwri_count(), 0);
    drop(lb);

    let lb = r.cache.get(&r.target, 0, PAGE, BufFlags::empty()).unwrap();
    let f = lb.flags();
    assert!(!f.intersects(BufFlags::STALE | BufFlags::FS_MANAGED | BufFlags::DELWRI));
    assert!(f.contains(BufFlags::MAPPED));
}

#[test]
fn page_allocation_gives_up_after_retry_limit() {
    let params = quiet_params()
        .alloc_retry_limit(3)
        .alloc_retry_delay(Duration::from_millis(1));
    let r = rig_with(MemDevice::threaded(7, DEV_SIZE), PAGE, params);
    r.pages.fail_next_allocs(100);
    let err = r.cache.get(&r.target, 0, PAGE, BufFlags::empty()).unwrap_err();
    assert_eq!(err, PbError::NoMemory);
    assert_eq!(r.cache.buffer_count(), 0);

    r.pages.fail_next_allocs(1);
    let err = r
        .cache
        .try_get(&r.target, 0, PAGE, BufFlags::DONT_BLOCK)
        .unwrap_err();
    assert_eq!(err, PbError::NoMemory);

    r.pages.fail_next_allocs(0);
    assert!(r.cache.get(&r.target, 0, PAGE, BufFlags::empty()).is_ok());
}
