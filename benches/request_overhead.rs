//! Benchmarks for request submission and wait overhead

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use veda_request::prelude::*;

fn runtime(threads: usize) -> Runtime {
    Runtime::new(Config::builder().num_threads(threads).build().unwrap()).unwrap()
}

fn bench_submit_wait(c: &mut Criterion) {
    let rt = runtime(4);

    c.bench_function("submit_wait", |b| {
        b.iter(|| {
            let req = rt.request_fn(|| Ok(black_box(1u64)));
            req.submit();
            req.wait().unwrap()
        });
    });

    // Lazy requests run inline on the waiting thread.
    c.bench_function("inline_wait", |b| {
        b.iter(|| {
            let req = rt.request_fn(|| Ok(black_box(1u64)));
            req.wait().unwrap()
        });
    });

    rt.shutdown();
}

fn bench_inline_chain(c: &mut Criterion) {
    fn chain(rt: Runtime, depth: u32) -> Request<u64> {
        let rt2 = rt.clone();
        rt.request(move || async move {
            if depth == 0 {
                return Ok(0);
            }
            Ok(chain(rt2, depth - 1).wait_async().await? + 1)
        })
    }

    let rt = runtime(2);
    let mut group = c.benchmark_group("inline_chain");

    for depth in [1u32, 8, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| chain(rt.clone(), depth).wait().unwrap());
        });
    }

    group.finish();
    rt.shutdown();
}

fn bench_pool_throughput(c: &mut Criterion) {
    let rt = runtime(num_cpus::get().max(2));
    let mut group = c.benchmark_group("pool_throughput");

    for max_active in [1usize, 4, 16] {
        group.bench_with_input(
            BenchmarkId::from_parameter(max_active),
            &max_active,
            |b, &max_active| {
                b.iter(|| {
                    let pool = RequestPool::with_max_active(&rt, max_active);
                    for i in 0..1000u64 {
                        pool.spawn(move || async move { Ok(black_box(i * i)) })
                            .unwrap();
                    }
                    pool.wait().unwrap();
                });
            },
        );
    }

    group.finish();
    rt.shutdown();
}

fn bench_lock_uncontended(c: &mut Criterion) {
    let rt = runtime(1);
    let lock = rt.new_lock();

    c.bench_function("lock_uncontended", |b| {
        b.iter(|| {
            let guard = lock.lock().unwrap();
            black_box(&guard);
        });
    });

    rt.shutdown();
}

criterion_group!(
    benches,
    bench_submit_wait,
    bench_inline_chain,
    bench_pool_throughput,
    bench_lock_uncontended
);
criterion_main!(benches);
