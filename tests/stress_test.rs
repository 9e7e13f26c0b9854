//! Stress tests for the request scheduler

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use veda_request::prelude::*;

fn runtime(threads: usize) -> Runtime {
    Runtime::new(Config::builder().num_threads(threads).build().unwrap()).unwrap()
}

#[test]
#[ignore] // Run with --ignored flag
fn stress_test_many_small_requests() {
    let rt = runtime(8);
    let counter = Arc::new(AtomicUsize::new(0));
    let pool = RequestPool::with_max_active(&rt, 64);

    for _ in 0..20_000 {
        let counter = counter.clone();
        pool.spawn(move || async move {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();
    }

    pool.wait().unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 20_000);
}

#[test]
#[ignore]
fn stress_test_fan_in_tree() {
    // Each node waits on two children it creates; leaves return 1.
    fn node(rt: Runtime, depth: u32) -> Request<u64> {
        let rt2 = rt.clone();
        rt.request(move || async move {
            if depth == 0 {
                return Ok(1);
            }
            let left = node(rt2.clone(), depth - 1);
            let right = node(rt2, depth - 1);
            right.submit();
            let l = left.wait_async().await?;
            let r = right.wait_async().await?;
            Ok(l + r)
        })
    }

    let rt = runtime(4);
    let root = node(rt.clone(), 12);
    root.submit();
    assert_eq!(root.wait().unwrap(), 1 << 12);
}

#[test]
#[ignore]
fn stress_test_shared_dependency() {
    let rt = runtime(8);
    let runs = Arc::new(AtomicUsize::new(0));

    let shared = {
        let runs = runs.clone();
        rt.request_fn(move || {
            runs.fetch_add(1, Ordering::SeqCst);
            thread::sleep(std::time::Duration::from_millis(20));
            Ok(5u64)
        })
    };

    let pool = RequestPool::with_max_active(&rt, 32);
    for _ in 0..500 {
        let shared = shared.clone();
        pool.spawn(move || async move { Ok(shared.wait_async().await? * 2) })
            .unwrap();
    }

    pool.wait().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
#[ignore]
fn stress_test_lock_contention() {
    let rt = runtime(8);
    let lock = Arc::new(rt.new_lock());
    let value = Arc::new(Mutex::new(0u64));
    let pool = RequestPool::with_max_active(&rt, 64);

    for _ in 0..256 {
        let lock = lock.clone();
        let value = value.clone();
        pool.spawn(move || async move {
            for _ in 0..100 {
                let _guard = lock.lock_async().await?;
                let mut v = value.try_lock().expect("RequestLock let two holders in");
                *v += 1;
            }
            Ok(())
        })
        .unwrap();
    }

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let lock = lock.clone();
            let value = value.clone();
            thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = lock.lock().unwrap();
                    let mut v = value.try_lock().expect("RequestLock let two holders in");
                    *v += 1;
                }
            })
        })
        .collect();

    pool.wait().unwrap();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(*value.lock(), 256 * 100 + 4 * 1000);
}

#[test]
#[ignore]
fn stress_test_repeated_runtimes() {
    for _ in 0..50 {
        let rt = runtime(4);
        let pool = rt.pool();
        for i in 0..100u64 {
            pool.spawn(move || async move { Ok(i) }).unwrap();
        }
        pool.wait().unwrap();
        rt.shutdown();
    }
}
