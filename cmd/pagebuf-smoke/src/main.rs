//! pagebuf End-to-End Smoke Test
//!
//! Drives the buffer cache over the reference collaborators:
//!   Part A: Lookup: create, hit, try-lock, hold and release
//!   Part B: I/O: page reads and writes, sub-page blocks, device errors
//!   Part C: Write-back: delayed writes, pinning, the flush daemon
//!   Part D: Reserve: descriptor allocation failures
//!   Part E: io_uring device (feature `io-uring`)
//!
//! Run: ./target/release/pagebuf-smoke
//! Logging: PB_LOG_LEVEL=debug ./target/release/pagebuf-smoke

use pagebuf::{BufFlags, BufferCache, Geometry, IoMove, PageCache, PagebufParams, PbError, Target};
use pagebuf_backend::{FaultyDescriptors, MemDevice, MemPageCache};
use pagebuf_core::klog;

use std::sync::Arc;
use std::time::{Duration, Instant};

const PAGE: usize = 4096;
const DEV_SIZE: usize = 4 << 20;

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
}

/// Poll `cond` every 2ms for up to `limit`.
fn wait_for(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn make_target(t: &mut TestRunner, block: usize, dev: Arc<MemDevice>) -> Option<(Arc<MemPageCache>, Arc<Target>)> {
    let pages = match MemPageCache::with_page_size(256, PAGE) {
        Ok(p) => p,
        Err(e) => {
            t.fail("page cache", &e.to_string());
            return None;
        }
    };
    let geo = match Geometry::new(512, block) {
        Ok(g) => g,
        Err(e) => {
            t.fail("geometry", &e.to_string());
            return None;
        }
    };
    match Target::new(geo, pages.clone(), dev) {
        Ok(tgt) => Some((pages, tgt)),
        Err(e) => {
            t.fail("target", &e.to_string());
            None
        }
    }
}

// ════════════════════════════════════════════════════════════
// Part A: Lookup
// ════════════════════════════════════════════════════════════

fn test_lookup(t: &mut TestRunner, cache: &BufferCache) {
    t.section("Part A: Lookup");
    let dev = MemDevice::threaded(1, DEV_SIZE);
    let Some((_pages, tgt)) = make_target(t, PAGE, dev) else { return };

    let a = match cache.get(&tgt, 0, PAGE, BufFlags::empty()) {
        Ok(lb) => { t.pass("get creates"); lb.unlock() }
        Err(e) => { t.fail("get creates", &e.to_string()); return; }
    };

    match cache.get(&tgt, 0, PAGE, BufFlags::empty()) {
        Ok(lb) => {
            t.check("get hits same buffer", lb.ptr_eq(&a), "different buffer");
            t.check("hold count 2", lb.hold_count() == 2, &format!("{}", lb.hold_count()));
            let busy = std::thread::scope(|s| {
                s.spawn(|| cache.try_get(&tgt, 0, PAGE, BufFlags::empty()))
                    .join()
                    .ok()
            });
            t.check("try_get on locked buffer -> None",
                matches!(busy, Some(Ok(None))), "got a buffer");
        }
        Err(e) => t.fail("get hits same buffer", &e.to_string()),
    }

    drop(a);
    t.check("last release frees", cache.buffer_count() == 0,
        &format!("{} cached", cache.buffer_count()));
    t.check("find after free -> None",
        cache.find(&tgt, 0, PAGE, BufFlags::empty()).is_none(), "still found");

    match cache.get(&tgt, PAGE as u64, PAGE, BufFlags::FS_MANAGED) {
        Ok(lb) => drop(lb),
        Err(e) => t.fail("fs-managed get", &e.to_string()),
    }
    t.check("fs-managed stays cached",
        cache.find(&tgt, PAGE as u64, PAGE, BufFlags::empty()).is_some(), "freed");
}

// ════════════════════════════════════════════════════════════
// Part B: I/O
// ════════════════════════════════════════════════════════════

fn test_io(t: &mut TestRunner, cache: &BufferCache) {
    t.section("Part B: I/O");
    let dev = MemDevice::threaded(2, DEV_SIZE);
    let Some((pages, tgt)) = make_target(t, PAGE, dev.clone()) else { return };
    let data = pattern(4 * PAGE, 5);

    let wrote = cache
        .get(&tgt, 8 * PAGE as u64, 4 * PAGE, BufFlags::MAPPABLE)
        .and_then(|mut lb| {
            if let Some(m) = lb.mapped_mut() {
                m.copy_from_slice(&data);
            }
            lb.start_io(BufFlags::WRITE)
        });
    t.check("write 16 KiB mapped buffer", wrote.is_ok(), &format!("{:?}", wrote));
    let reclaimed = pages.shrink();
    t.check("pages reclaimed after release", reclaimed >= 4, &format!("{}", reclaimed));

    match cache.get(&tgt, 8 * PAGE as u64, 4 * PAGE, BufFlags::READ) {
        Ok(mut lb) => {
            let mut out = vec![0u8; 4 * PAGE];
            lb.move_bytes(0, IoMove::Read(&mut out));
            t.check("read back unmapped buffer", out == data, "content mismatch");
        }
        Err(e) => t.fail("read back unmapped buffer", &e.to_string()),
    }

    // 512-byte blocks in 4 KiB pages.
    let sdev = MemDevice::manual(3, DEV_SIZE);
    let Some((spages, stgt)) = make_target(t, 512, sdev.clone()) else { return };
    sdev.write_at(0, &data[..PAGE]);
    match cache.get(&stgt, 0, PAGE, BufFlags::READ) {
        Ok(lb) => {
            t.check("sub-page read: 8 block reads", sdev.stats().reads == 8,
                &format!("{}", sdev.stats().reads));
            t.check("sub-page read: content", lb.mapped() == Some(&data[..PAGE]), "mismatch");
        }
        Err(e) => t.fail("sub-page read", &e.to_string()),
    }
    let uptodate = spages.find_page(0).map(|p| p.is_uptodate()).unwrap_or(false);
    t.check("sub-page read: page uptodate", uptodate, "not uptodate");

    sdev.fail_sector(33);
    let err = cache.get(&stgt, 32 * 512, 1024, BufFlags::READ).err();
    t.check("device error -> EIO", err == Some(PbError::Io(libc::EIO)), &format!("{:?}", err));
    sdev.clear_faults();
}

// ════════════════════════════════════════════════════════════
// Part C: Write-back
// ════════════════════════════════════════════════════════════

fn test_writeback(t: &mut TestRunner, cache: &BufferCache) {
    t.section("Part C: Write-back");
    let dev = MemDevice::threaded(4, DEV_SIZE);
    let Some((_pages, tgt)) = make_target(t, PAGE, dev.clone()) else { return };

    for i in 0..8u64 {
        match cache.get(&tgt, i * PAGE as u64, PAGE, BufFlags::empty()) {
            Ok(mut lb) => {
                if let Some(m) = lb.mapped_mut() {
                    m.fill(i as u8 + 1);
                }
                drop(lb.delwri());
            }
            Err(e) => {
                t.fail("queue delayed writes", &e.to_string());
                return;
            }
        }
    }
    t.check("8 delayed writes queued", cache.delwri_count() >= 8,
        &format!("{}", cache.delwri_count()));

    let pinned = match cache.get(&tgt, 8 * PAGE as u64, PAGE, BufFlags::empty()) {
        Ok(lb) => {
            lb.pin();
            lb.delwri()
        }
        Err(e) => {
            t.fail("pin", &e.to_string());
            return;
        }
    };
    let left = cache.flush_target(&tgt, true);
    t.check("flush leaves pinned buffer", left == 1, &format!("{}", left));
    t.check("device saw 8 writes", dev.stats().writes == 8, &format!("{}", dev.stats().writes));

    pinned.unpin();
    drop(pinned);
    cache.wake_daemon(true);
    let flushed = wait_for(Duration::from_secs(2), || cache.delwri_count() == 0);
    t.check("daemon writes unpinned buffer", flushed, &format!("{} queued", cache.delwri_count()));

    let mut b = [0u8; 4];
    dev.read_at(3 * PAGE, &mut b);
    t.check("on-disk content", b == [4; 4], &format!("{:?}", b));
}

// ════════════════════════════════════════════════════════════
// Part D: Reserve
// ════════════════════════════════════════════════════════════

fn test_reserve(t: &mut TestRunner) {
    t.section("Part D: Reserved descriptors");
    let alloc = Arc::new(FaultyDescriptors::new(true));
    let cache = match BufferCache::builder()
        .params(PagebufParams::from_env().reserve_size(2).stats(true))
        .allocator(alloc.clone())
        .open()
    {
        Ok(c) => c,
        Err(e) => {
            t.fail("open with faulty allocator", &e.to_string());
            return;
        }
    };
    let dev = MemDevice::threaded(5, DEV_SIZE);
    let Some((_pages, tgt)) = make_target(t, PAGE, dev.clone()) else { return };

    let data = pattern(16 * PAGE, 9);
    let res = cache.get(&tgt, 0, 16 * PAGE, BufFlags::empty()).and_then(|mut lb| {
        lb.move_bytes(0, IoMove::Write(&data));
        lb.start_io(BufFlags::WRITE)
    });
    t.check("write with allocator failing", res.is_ok(), &format!("{:?}", res));
    let st = cache.stats();
    t.check("reserve used", st.reserve_uses > 0, "no reserve use");
    t.check("reserve refilled", cache.reserve_available() == 2,
        &format!("{}", cache.reserve_available()));

    let mut out = vec![0u8; 16 * PAGE];
    dev.read_at(0, &mut out);
    t.check("on-disk content", out == data, "mismatch");
    cache.close();
}

// ════════════════════════════════════════════════════════════
// Part E: io_uring
// ════════════════════════════════════════════════════════════

#[cfg(all(feature = "io-uring", target_os = "linux"))]
fn test_uring(t: &mut TestRunner, cache: &BufferCache) {
    use pagebuf_backend::UringDevice;
    t.section("Part E: io_uring device");

    let path = std::env::temp_dir().join(format!("pagebuf_smoke_{}", std::process::id()));
    let dev = match UringDevice::open(6, &path, DEV_SIZE as u64) {
        Ok(d) => { t.pass("open io_uring device"); d }
        Err(e) => {
            t.fail("open io_uring device", &e.to_string());
            return;
        }
    };
    let pages = match MemPageCache::with_page_size(64, PAGE) {
        Ok(p) => p,
        Err(e) => { t.fail("page cache", &e.to_string()); return; }
    };
    let tgt = match Geometry::new(512, PAGE).and_then(|g| Target::new(g, pages.clone(), dev.clone())) {
        Ok(tgt) => tgt,
        Err(e) => { t.fail("target", &e.to_string()); return; }
    };

    let data = pattern(2 * PAGE, 77);
    let res = cache.get(&tgt, 0, 2 * PAGE, BufFlags::MAPPABLE).and_then(|mut lb| {
        if let Some(m) = lb.mapped_mut() {
            m.copy_from_slice(&data);
        }
        lb.start_io(BufFlags::WRITE)
    });
    t.check("uring write", res.is_ok(), &format!("{:?}", res));
    pages.shrink();

    let on_disk = std::fs::read(&path).unwrap_or_default();
    t.check("file content", on_disk.get(..2 * PAGE) == Some(&data[..]), "mismatch");

    match cache.get(&tgt, 0, 2 * PAGE, BufFlags::READ | BufFlags::MAPPABLE) {
        Ok(lb) => t.check("uring read", lb.mapped() == Some(&data[..]), "mismatch"),
        Err(e) => t.fail("uring read", &e.to_string()),
    }
    t.check("completions reaped", dev.completed() >= 2, &format!("{}", dev.completed()));
    let _ = std::fs::remove_file(&path);
}

// ════════════════════════════════════════════════════════════

fn main() {
    klog::init();
    println!("=== pagebuf End-to-End Smoke Test ===");

    let params = PagebufParams::from_env()
        .flush_interval(Duration::from_millis(50))
        .stats(true);
    params.print();

    let mut t = TestRunner::new();
    let cache = match BufferCache::open(params) {
        Ok(c) => c,
        Err(e) => {
            println!("\nFATAL: BufferCache::open failed: {}", e);
            t.summary();
            std::process::exit(1);
        }
    };

    test_lookup(&mut t, &cache);
    test_io(&mut t, &cache);
    test_writeback(&mut t, &cache);
    test_reserve(&mut t);
    #[cfg(all(feature = "io-uring", target_os = "linux"))]
    test_uring(&mut t, &cache);

    let st = cache.stats();
    println!(
        "\n  stats: gets={} hits={} creates={} reads={} writes={} delwri={}/{}",
        st.gets, st.hits, st.creates, st.reads, st.writes, st.delwri_queued, st.delwri_flushed
    );
    cache.close();

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
