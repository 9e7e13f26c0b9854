//! Bounded fan-out/fan-in over a batch of requests.
//!
//! Members move through `unsubmitted -> active -> finishing -> discarded`.
//! At most `max_active` run at once, and each finished member is dropped as
//! soon as it has been checked, so peak memory stays around `max_active`
//! results instead of all of them.

use crate::error::{Error, Result};
use crate::executor::continuation::block_on;
use crate::executor::task::RequestId;
use crate::request::{context, Request};
use crate::runtime::Runtime;
use futures::future::poll_fn;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::mem;
use std::sync::{Arc, Weak};
use std::task::{Poll, Waker};

struct PoolSets<T> {
    started: bool,
    cancelled: bool,
    unsubmitted: VecDeque<Request<T>>,
    active: HashMap<RequestId, Request<T>>,
    finishing: Vec<Request<T>>,
    waker: Option<Waker>,
}

impl<T> PoolSets<T> {
    fn new() -> Self {
        Self {
            started: false,
            cancelled: false,
            unsubmitted: VecDeque::new(),
            active: HashMap::new(),
            finishing: Vec::new(),
            waker: None,
        }
    }

    fn len(&self) -> usize {
        self.unsubmitted.len() + self.active.len() + self.finishing.len()
    }
}

pub struct RequestPool<T> {
    runtime: Runtime,
    max_active: usize,
    sets: Arc<Mutex<PoolSets<T>>>,
}

impl<T> RequestPool<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Concurrency defaults to the runtime's `default_max_active`, or the
    /// worker count (at least one).
    pub fn new(runtime: &Runtime) -> Self {
        let max_active = runtime
            .config()
            .default_max_active
            .unwrap_or_else(|| runtime.num_workers().max(1));
        Self::with_max_active(runtime, max_active)
    }

    pub fn with_max_active(runtime: &Runtime, max_active: usize) -> Self {
        Self {
            runtime: runtime.clone(),
            max_active: max_active.max(1),
            sets: Arc::new(Mutex::new(PoolSets::new())),
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    /// Add a request that nobody has started yet.
    pub fn add(&self, request: Request<T>) -> Result<()> {
        let mut sets = self.sets.lock();
        if sets.started {
            return Err(Error::pool("cannot add to a RequestPool that was already started"));
        }
        if request.is_started() {
            return Err(Error::pool(format!("request {} was already started", request.id())));
        }
        sets.unsubmitted.push_back(request);
        Ok(())
    }

    /// Create a request from `f` and add it.
    pub fn spawn<F, Fut>(&self, f: F) -> Result<Request<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let request = Request::new(&self.runtime, f);
        self.add(request.clone())?;
        Ok(request)
    }

    /// Members not discarded yet.
    pub fn len(&self) -> usize {
        self.sets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every member and block the calling thread until all are done.
    ///
    /// From inside a worker-bound request use [`wait_async`](Self::wait_async).
    pub fn wait(&self) -> Result<()> {
        if context::in_worker() {
            return Err(Error::WouldBlockWorker);
        }
        block_on(self.wait_async())
    }

    /// Run every member, suspending instead of blocking.
    ///
    /// Every member is driven to completion, including its callbacks, even
    /// after one fails; the first failure observed is returned at the end.
    /// A cancelled pool reports [`Error::InvalidRequest`].
    pub async fn wait_async(&self) -> Result<()> {
        {
            let mut sets = self.sets.lock();
            if sets.started {
                return Err(Error::pool("cannot re-start a RequestPool that was already started"));
            }
            sets.started = true;
            if sets.len() == 0 {
                return Ok(());
            }
        }

        let mut first_error = None;
        loop {
            while let Some(request) = self.next_to_activate() {
                self.activate(request);
            }

            let finishing = mem::take(&mut self.sets.lock().finishing);
            for request in finishing {
                // Makes sure callbacks are done, and surfaces failures here.
                if let Err(e) = request.block_async().await {
                    tracing::debug!(request = %request.id(), error = %e, "pool member did not finish");
                    first_error.get_or_insert(e);
                }
            }

            let done = {
                let sets = self.sets.lock();
                sets.active.is_empty()
                    && sets.finishing.is_empty()
                    && (sets.unsubmitted.is_empty() || sets.cancelled)
            };
            if done {
                break;
            }

            self.changed().await;
        }

        let cancelled = self.sets.lock().cancelled;
        self.clean();

        match first_error {
            Some(e) => Err(e),
            None if cancelled => Err(Error::InvalidRequest),
            None => Ok(()),
        }
    }

    fn next_to_activate(&self) -> Option<Request<T>> {
        let mut sets = self.sets.lock();
        if sets.cancelled || sets.active.len() >= self.max_active {
            return None;
        }
        let request = sets.unsubmitted.pop_front()?;
        sets.active.insert(request.id(), request.clone());
        Some(request)
    }

    fn activate(&self, request: Request<T>) {
        let id = request.id();

        let sets = Arc::downgrade(&self.sets);
        request.notify_finished(move |_| transfer(&sets, id));
        let sets = Arc::downgrade(&self.sets);
        request.notify_failed(move |_| transfer(&sets, id));
        let sets = Arc::downgrade(&self.sets);
        request.notify_cancelled(move || transfer(&sets, id));

        request.submit();
    }

    /// Resolves once a member moved to finishing, or there is room to
    /// activate more.
    async fn changed(&self) {
        poll_fn(|cx| {
            let mut sets = self.sets.lock();
            let can_activate = !sets.cancelled
                && sets.active.len() < self.max_active
                && !sets.unsubmitted.is_empty();
            let idle = sets.active.is_empty();
            if !sets.finishing.is_empty() || can_activate || idle {
                return Poll::Ready(());
            }
            sets.waker = Some(cx.waker().clone());
            Poll::Pending
        })
        .await
    }

    /// Cancel every running member and drop the ones not yet submitted.
    pub fn cancel(&self) {
        let active: Vec<Request<T>> = {
            let mut sets = self.sets.lock();
            sets.cancelled = true;
            sets.unsubmitted.clear();
            sets.active.values().cloned().collect()
        };
        for request in active {
            request.cancel();
        }
        if let Some(waker) = self.sets.lock().waker.take() {
            waker.wake();
        }
    }

    /// Release the pool's handles to its members.
    pub fn clean(&self) {
        let mut sets = self.sets.lock();
        sets.unsubmitted.clear();
        sets.active.clear();
        sets.finishing.clear();
        sets.waker = None;
    }
}

fn transfer<T>(sets: &Weak<Mutex<PoolSets<T>>>, id: RequestId) {
    let Some(sets) = sets.upgrade() else {
        return;
    };
    let waker = {
        let mut sets = sets.lock();
        if let Some(request) = sets.active.remove(&id) {
            sets.finishing.push(request);
        }
        sets.waker.take()
    };
    if let Some(waker) = waker {
        waker.wake();
    }
}

impl<T> fmt::Debug for RequestPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sets = self.sets.lock();
        f.debug_struct("RequestPool")
            .field("max_active", &self.max_active)
            .field("unsubmitted", &sets.unsubmitted.len())
            .field("active", &sets.active.len())
            .field("finishing", &sets.finishing.len())
            .field("started", &sets.started)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runtime(threads: usize) -> Runtime {
        Runtime::new(Config::builder().num_threads(threads).build().unwrap()).unwrap()
    }

    #[test]
    fn test_empty_pool_returns() {
        let rt = runtime(2);
        let pool: RequestPool<()> = RequestPool::new(&rt);
        pool.wait().unwrap();
    }

    #[test]
    fn test_restart_is_an_error() {
        let rt = runtime(2);
        let pool: RequestPool<()> = RequestPool::new(&rt);
        pool.wait().unwrap();
        assert!(matches!(pool.wait(), Err(Error::Pool(_))));
    }

    #[test]
    fn test_add_after_start_is_rejected() {
        let rt = runtime(2);
        let pool = RequestPool::new(&rt);
        pool.spawn(|| async { Ok(1) }).unwrap();
        pool.wait().unwrap();
        assert!(pool.add(Request::from_fn(&rt, || Ok(2))).is_err());
    }

    #[test]
    fn test_add_started_request_is_rejected() {
        let rt = runtime(2);
        let pool = RequestPool::new(&rt);
        let request = Request::from_fn(&rt, || Ok(()));
        request.submit();
        assert!(matches!(pool.add(request), Err(Error::Pool(_))));
    }

    #[test]
    fn test_members_discarded_after_wait() {
        let rt = runtime(3);
        let pool = RequestPool::new(&rt);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let c = count.clone();
            pool.spawn(move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(pool.len(), 20);
        pool.wait().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 20);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_synchronous_runtime_pool() {
        let rt = runtime(0);
        let pool = RequestPool::new(&rt);
        assert_eq!(pool.max_active(), 1);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = count.clone();
            pool.spawn(move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        pool.wait().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }
}
