//! Request chain example
//!
//! Builds a small dependency graph of lazy requests, runs part of it through a
//! bounded pool and cancels a long-running branch.
//!
//! Run with `RUST_LOG=veda_request=debug` to see scheduler activity.

use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use veda_request::prelude::*;

fn load(rt: &Runtime, name: &'static str, millis: u64) -> Request<String> {
    rt.request_fn(move || {
        std::thread::sleep(Duration::from_millis(millis));
        Ok(format!("<{}>", name))
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Request Chain Example ===\n");

    let rt = Runtime::new(Config::builder().num_threads(4).build()?)?;
    println!("Runtime started with {} workers", rt.num_workers());

    // Example 1: a lazy chain, nothing runs until someone waits
    println!("\n1. Lazy dependency chain:");
    let header = load(&rt, "header", 20);
    let body = load(&rt, "body", 40);
    let page = {
        let (header, body) = (header.clone(), body.clone());
        rt.request(move || async move {
            body.submit();
            let h = header.wait_async().await?;
            let b = body.wait_async().await?;
            Ok(format!("{}{}", h, b))
        })
    };
    println!("   started before wait: {}", page.is_started());
    let start = Instant::now();
    println!("   page = {} in {:?}", page.wait()?, start.elapsed());

    // Example 2: priorities and a bounded pool
    println!("\n2. Bounded pool:");
    let pool = RequestPool::with_max_active(&rt, 2);
    for i in 0..6u64 {
        pool.spawn(move || async move {
            std::thread::sleep(Duration::from_millis(10));
            Ok(i * i)
        })?;
    }
    let start = Instant::now();
    pool.wait()?;
    println!("   6 requests, 2 at a time, took {:?}", start.elapsed());

    let urgent = rt.request_with_priority(Priority::High, || async { Ok("urgent") });
    urgent
        .notify_finished(|v| println!("   high priority request finished with {:?}", v))
        .submit();
    urgent.block()?;

    // Example 3: cancellation
    println!("\n3. Cancellation:");
    let spinner: Request<u32> = rt.request(|| async {
        let mut rounds = 0;
        loop {
            checkpoint()?;
            rounds += 1;
            std::thread::sleep(Duration::from_millis(5));
            if rounds > 1000 {
                return Ok(rounds);
            }
        }
    });
    spinner.notify_cancelled(|| println!("   spinner was cancelled"));
    spinner.submit();
    std::thread::sleep(Duration::from_millis(30));
    println!("   cancel accepted: {}", spinner.cancel());
    match spinner.wait() {
        Err(Error::InvalidRequest) => println!("   waiting on it reports InvalidRequest"),
        other => println!("   unexpected outcome: {:?}", other),
    }

    // Example 4: failures are replayed to every waiter
    println!("\n4. Failures:");
    let broken: Request<u32> = rt.request_fn(|| anyhow::bail!("disk on fire"));
    broken.notify_failed(|e| println!("   notify_failed saw: {}", e));
    for _ in 0..2 {
        if let Err(e) = broken.wait() {
            println!("   wait returned: {}", e);
        }
    }

    let stats = rt.stats();
    println!("\nExecuted {} tasks", stats.tasks_executed());

    rt.shutdown();
    println!("\n=== Example Complete ===");
    Ok(())
}
