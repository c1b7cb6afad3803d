use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

const OPS_PER_THREAD: u64 = 10_000;
const SIZE: usize = 64;

/// Every thread hammers the one shared arena.
fn locked_storm(threads: usize) {
  std::thread::scope(|s| {
    for _ in 0..threads {
      s.spawn(|| {
        for _ in 0..OPS_PER_THREAD {
          unsafe {
            let ptr = ouros::alloc_locked(SIZE);
            black_box(ptr);
            ouros::free_locked(ptr);
          }
        }
      });
    }
  });
}

/// Every thread stays on its own arena; only growth is shared.
fn nolock_storm(threads: usize) {
  std::thread::scope(|s| {
    for _ in 0..threads {
      s.spawn(|| {
        for _ in 0..OPS_PER_THREAD {
          unsafe {
            let ptr = ouros::alloc_nolock(SIZE);
            black_box(ptr);
            ouros::free_nolock(ptr);
          }
        }
      });
    }
  });
}

fn bench_contention(c: &mut Criterion) {
  let mut group = c.benchmark_group("contention");

  for threads in [1usize, 2, 4, 8] {
    group.throughput(Throughput::Elements(OPS_PER_THREAD * threads as u64));

    group.bench_with_input(BenchmarkId::new("locked", threads), &threads, |b, &t| {
      b.iter(|| locked_storm(t))
    });

    group.bench_with_input(BenchmarkId::new("nolock", threads), &threads, |b, &t| {
      b.iter(|| nolock_storm(t))
    });
  }

  group.finish();
}

criterion_group!(benches, bench_contention);
criterion_main!(benches);
