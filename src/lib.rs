//! veda-request - cooperative request scheduling
//!
//! Runs a very large number of lazily started, interdependent units of work
//! ("requests") on a small fixed pool of worker threads. A request that waits
//! on another one suspends instead of blocking its worker, and resumes on
//! the same worker once the dependency completes.
//!
//! # Quick Start
//!
//! ```no_run
//! use veda_request::prelude::*;
//!
//! let rt = Runtime::with_default().unwrap();
//!
//! let c = rt.request(|| async { Ok(42) });
//! let b = rt.request(move || async move { Ok(c.wait_async().await?) });
//! let a = rt.request(move || async move { Ok(b.wait_async().await?) });
//!
//! assert_eq!(a.wait().unwrap(), 42);
//! ```
//!
//! # Features
//!
//! - **Lazy start**: nothing runs until it is submitted or waited on
//! - **In-line dependencies**: waiting on an unstarted request runs it on the
//!   waiter's own continuation
//! - **Worker affinity**: a suspended request always resumes on its worker
//! - **Hierarchical priorities**: children run right after their parent
//! - **Recursive cancellation**: cancelling a request cancels its children
//! - **Dual-mode sync**: [`RequestLock`] and [`SimpleRequestCondition`] work
//!   from OS threads and from requests
//! - **Bounded batches**: [`RequestPool`] caps concurrency and drops results
//!   as it goes
//! - **Debug mode**: zero workers runs everything in-line on the caller

#![warn(missing_debug_implementations)]

pub mod config;
pub mod error;
pub mod executor;
pub mod pool;
pub mod prelude;
pub mod request;
pub mod runtime;
pub mod scheduler;
pub mod sync;

pub use config::{Config, ConfigBuilder};
pub use error::{Error, Result, TaskError};
pub use executor::{Priority, RequestId, RequestKey};
pub use pool::RequestPool;
pub use request::{checkpoint, current_request_is_cancelled, in_worker, Request};
pub use runtime::{Runtime, RuntimeStats, WorkerStats};
pub use sync::{RequestLock, RequestLockGuard, SimpleRequestCondition};

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn runtime(threads: usize) -> Runtime {
        Runtime::new(Config::builder().num_threads(threads).build().unwrap()).unwrap()
    }

    #[test]
    fn test_resumes_on_same_worker_after_suspending() {
        let rt = runtime(4);
        let dep = rt.request_fn(|| {
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok(7)
        });
        dep.submit();

        let req = rt.request(move || async move {
            let before = std::thread::current().id();
            let value = dep.wait_async().await?;
            Ok((before == std::thread::current().id(), value))
        });
        req.submit();
        assert_eq!(req.wait().unwrap(), (true, 7));
    }

    #[test]
    fn test_lock_from_requests() {
        let rt = runtime(4);
        let lock = Arc::new(rt.new_lock());
        let total = Arc::new(Mutex::new(0));
        let pool = rt.pool();

        for _ in 0..50 {
            let lock = lock.clone();
            let total = total.clone();
            pool.spawn(move || async move {
                let _guard = lock.lock_async().await?;
                *total.lock() += 1;
                Ok(())
            })
            .unwrap();
        }

        pool.wait().unwrap();
        assert_eq!(*total.lock(), 50);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_checkpoint_inside_request() {
        let rt = runtime(1);
        let req = rt.request_fn(|| {
            checkpoint()?;
            Ok(in_worker())
        });
        // foreign wait runs it in-line on this thread
        assert!(!req.wait().unwrap());

        let req = rt.request_fn(|| Ok(in_worker()));
        req.submit();
        assert!(req.wait().unwrap());
    }
}
