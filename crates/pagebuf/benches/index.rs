use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pagebuf::{BufFlags, BufferCache, Geometry, PagebufParams, Target};
use pagebuf_backend::{MemDevice, MemPageCache};
use std::sync::Arc;
use std::time::Duration;

const PAGE: usize = 4096;
const PAGES: usize = 256;

fn make_cache(hash_bits: u32) -> (BufferCache, Arc<Target>) {
    let pages = MemPageCache::with_page_size(PAGES, PAGE).expect("page cache");
    let dev = MemDevice::manual(1, PAGES * PAGE);
    let target = Target::new(Geometry::new(512, PAGE).expect("geometry"), pages, dev).expect("target");
    let params = PagebufParams::new()
        .hash_bits(hash_bits)
        .flush_interval(Duration::from_secs(60));
    (BufferCache::open(params).expect("cache"), target)
}

/// Keep `n` buffers cached by holding them unlocked.
fn warm(cache: &BufferCache, target: &Arc<Target>, n: usize) -> Vec<pagebuf::Buf> {
    (0..n)
        .map(|i| {
            cache
                .get(target, (i * PAGE) as u64, PAGE, BufFlags::READ)
                .expect("warmup")
                .unlock()
        })
        .collect()
}

fn bench_get_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_hit");
    for bits in [4u32, 8, 12] {
        let (cache, target) = make_cache(bits);
        let _held = warm(&cache, &target, PAGES);
        let mut i = 0usize;
        group.bench_with_input(BenchmarkId::from_parameter(bits), &bits, |b, _| {
            b.iter(|| {
                i = (i + 97) % PAGES;
                let lb = cache
                    .get(&target, black_box((i * PAGE) as u64), PAGE, BufFlags::empty())
                    .expect("hit");
                black_box(lb.flags());
            });
        });
    }
    group.finish();
}

fn bench_find_miss(c: &mut Criterion) {
    let (cache, target) = make_cache(8);
    let _held = warm(&cache, &target, 64);
    c.bench_function("find_miss", |b| {
        b.iter(|| {
            black_box(cache.find(&target, black_box((200 * PAGE) as u64), PAGE, BufFlags::empty()));
        });
    });
}

fn bench_create_release(c: &mut Criterion) {
    let (cache, target) = make_cache(8);
    c.bench_function("create_release_4k", |b| {
        b.iter(|| {
            let lb = cache
                .get(&target, black_box(0), PAGE, BufFlags::empty())
                .expect("create");
            drop(lb);
        });
    });
}

criterion_group!(benches, bench_get_hit, bench_find_miss, bench_create_release);
criterion_main!(benches);
