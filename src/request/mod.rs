//! Lazily started, cancellable, result-producing units of work.
//!
//! A [`Request`] wraps an async body. Nothing runs until someone calls
//! [`submit`](Request::submit) or waits on it. Waiting from inside another
//! request with [`wait_async`](Request::wait_async) suspends only the waiting
//! request; the worker thread moves on to other ready work. If the target has
//! not started yet it runs in-line on the waiter's continuation instead.
//!
//! # Example
//!
//! ```no_run
//! use veda_request::{Request, Runtime};
//!
//! let rt = Runtime::with_default().unwrap();
//! let c = Request::new(&rt, || async { Ok(42) });
//! let b = Request::new(&rt, move || async move { Ok(c.wait_async().await?) });
//! let a = Request::new(&rt, move || async move { Ok(b.wait_async().await?) });
//! assert_eq!(a.wait().unwrap(), 42);
//! ```

pub(crate) mod context;
pub(crate) mod core;

pub use context::{checkpoint, current_request_is_cancelled, in_worker};

use self::core::{Body, Output, RequestCore};
use crate::error::{Error, Result, TaskError};
use crate::executor::task::{Priority, RequestId, RequestKey};
use crate::executor::worker::WorkerId;
use crate::runtime::Runtime;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Handle to a request producing a `T`.
///
/// Handles are cheap to clone; all clones refer to the same request.
pub struct Request<T> {
    core: Arc<RequestCore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Request<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a request with the default priority class.
    ///
    /// Created while another request of the same runtime executes, it
    /// becomes that request's child.
    pub fn new<F, Fut>(runtime: &Runtime, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::with_priority(runtime, Priority::default(), f)
    }

    pub fn with_priority<F, Fut>(runtime: &Runtime, priority: Priority, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let body: Body = Box::new(move || {
            async move {
                let value = f().await?;
                Ok(Arc::new(value) as Output)
            }
            .boxed()
        });

        Self {
            core: RequestCore::new(runtime.shared().clone(), priority, body),
            _marker: PhantomData,
        }
    }

    /// A request whose body never suspends.
    pub fn from_fn<F>(runtime: &Runtime, f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self::new(runtime, move || async move { f() })
    }

    pub fn id(&self) -> RequestId {
        self.core.id()
    }

    pub fn priority(&self) -> Priority {
        self.core.class()
    }

    pub fn key(&self) -> &RequestKey {
        self.core.key()
    }

    /// Hand the request to the scheduler. Does nothing if it already started.
    pub fn submit(&self) -> &Self {
        self.core.submit();
        self
    }

    /// Block the calling thread until the request completes and return its
    /// result. Starts it in-line if nobody has yet.
    ///
    /// Meant for threads outside the pool. From inside a worker-bound request
    /// this fails with [`Error::WouldBlockWorker`] unless the request is
    /// already complete; use [`wait_async`](Self::wait_async) there.
    pub fn wait(&self) -> Result<T> {
        self.core.wait_foreign(None)?;
        self.value()
    }

    /// Like [`wait`](Self::wait) but gives up with [`Error::Timeout`] after
    /// `timeout`; the request itself keeps running.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        self.core.wait_foreign(Some(timeout))?;
        self.value()
    }

    /// Like [`wait`](Self::wait) without reading the result, so it also works
    /// after [`clean`](Self::clean).
    pub fn block(&self) -> Result<()> {
        self.core.wait_foreign(None)
    }

    pub fn block_timeout(&self, timeout: Duration) -> Result<()> {
        self.core.wait_foreign(Some(timeout))
    }

    /// Wait without blocking a thread.
    ///
    /// Inside a request this suspends the current request (running the
    /// target in-line when it has not started). Outside of one it is an
    /// ordinary future that submits the request and resolves on completion.
    pub async fn wait_async(&self) -> Result<T> {
        self.block_async().await?;
        self.value()
    }

    pub async fn block_async(&self) -> Result<()> {
        match context::current_request() {
            Some(current) => self.core.clone().wait_cooperative(current).await,
            None => self.core.clone().wait_detached().await,
        }
    }

    /// Ask the request to stop.
    ///
    /// Refused (returns `false`) when a foreign thread is blocked on it, when
    /// its parent is still live and not cancelled, when any request waiting on
    /// it is not cancelled, or once it has finished. Children are cancelled
    /// with it.
    pub fn cancel(&self) -> bool {
        self.core.cancel()
    }

    /// Call `f` with the result once the request finishes successfully;
    /// right away if it already has.
    pub fn notify_finished<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.core.on_finished(Box::new(move |value: &Output| {
            if let Some(value) = value.downcast_ref::<T>() {
                f(value)
            }
        }));
        self
    }

    pub fn notify_failed<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&TaskError) + Send + 'static,
    {
        self.core.on_failed(Box::new(f));
        self
    }

    pub fn notify_cancelled<F>(&self, f: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.on_cancelled(Box::new(f));
        self
    }

    /// Release callbacks, child links and the result.
    pub fn clean(&self) {
        self.core.clean(true);
    }

    /// Result of a completed request.
    pub fn result(&self) -> Result<T> {
        if !self.core.is_execution_complete() {
            return Err(Error::NotReady);
        }
        self.core.status()?;
        self.value()
    }

    fn value(&self) -> Result<T> {
        let output = self.core.output()?;
        output
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| Error::internal(format!("request {} produced a foreign type", self.id())))
    }

    pub fn is_started(&self) -> bool {
        self.core.is_started()
    }

    pub fn is_finished(&self) -> bool {
        self.core.is_finished()
    }

    pub fn is_execution_complete(&self) -> bool {
        self.core.is_execution_complete()
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.is_cancelled()
    }

    pub fn is_uncancellable(&self) -> bool {
        self.core.is_uncancellable()
    }

    pub fn is_failed(&self) -> bool {
        self.core.is_failed()
    }

    /// The worker this request is bound to, once it has run there.
    pub fn assigned_worker(&self) -> Option<WorkerId> {
        self.core.assigned_worker()
    }
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.core, f)
    }
}

impl<T> fmt::Display for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = &self.core;
        write!(
            f,
            "request {} (worker={:?}, started={}, execution_complete={}, cancelled={}, failed={}, uncancellable={})",
            core.id(),
            core.assigned_worker(),
            core.is_started(),
            core.is_execution_complete(),
            core.is_cancelled(),
            core.is_failed(),
            core.is_uncancellable(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runtime(threads: usize) -> Runtime {
        Runtime::new(Config::builder().num_threads(threads).build().unwrap()).unwrap()
    }

    #[test]
    fn test_wait_runs_lazily() {
        let rt = runtime(2);
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let req = Request::from_fn(&rt, move || {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        });

        assert!(!req.is_started());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(req.wait().unwrap(), 3);
        assert_eq!(req.wait().unwrap(), 3);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(req.is_finished());
    }

    #[test]
    fn test_submit_twice_runs_once() {
        let rt = runtime(4);
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let req = Request::from_fn(&rt, move || {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        req.submit();
        req.submit();
        req.block().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_children_inherit_key_prefix() {
        let rt = runtime(1);
        let rt2 = rt.clone();
        let parent = Request::new(&rt, move || async move {
            let child = Request::from_fn(&rt2, || Ok(()));
            Ok(child.key().clone())
        });
        let child_key = parent.wait().unwrap();
        assert!(parent.key() < &child_key);
        assert_eq!(child_key.depth(), parent.key().depth() + 1);
    }

    #[test]
    fn test_callback_after_completion_fires_immediately() {
        let rt = runtime(1);
        let req = Request::from_fn(&rt, || Ok(5));
        req.wait().unwrap();

        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        req.notify_finished(move |v| *s.lock() = Some(*v));
        assert_eq!(*seen.lock(), Some(5));

        let failed = Arc::new(AtomicUsize::new(0));
        let f = failed.clone();
        req.notify_failed(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(failed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wait_timeout() {
        let rt = runtime(1);
        let req = Request::from_fn(&rt, || {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        });
        let err = req.wait_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        // the request keeps running
        req.block().unwrap();
        assert!(req.is_finished());
    }

    #[test]
    fn test_result_after_clean() {
        let rt = runtime(1);
        let req = Request::from_fn(&rt, || Ok(String::from("x")));
        assert!(matches!(req.result(), Err(Error::NotReady)));
        req.block().unwrap();
        assert_eq!(req.result().unwrap(), "x");
        req.clean();
        assert!(matches!(req.result(), Err(Error::Cleaned)));
        req.block().unwrap();
    }

    #[test]
    fn test_self_wait_in_callback() {
        let rt = runtime(1);
        let slot: Arc<Mutex<Option<Request<u32>>>> = Arc::new(Mutex::new(None));
        let observed = Arc::new(Mutex::new(None));

        let s = slot.clone();
        let o = observed.clone();
        let req = Request::from_fn(&rt, || Ok(9));
        *slot.lock() = Some(req.clone());
        req.notify_finished(move |_| {
            let me = s.lock().take().unwrap();
            *o.lock() = Some(futures::executor::block_on(me.block_async()).is_ok());
        });
        req.wait().unwrap();
        assert_eq!(*observed.lock(), Some(true));
    }

    #[test]
    fn test_synchronous_mode_runs_on_caller() {
        let rt = runtime(0);
        let caller = std::thread::current().id();
        let req = Request::from_fn(&rt, move || Ok(std::thread::current().id() == caller));
        req.submit();
        assert!(req.is_execution_complete());
        assert!(req.wait().unwrap());
        assert_eq!(req.assigned_worker(), None);
    }

    #[test]
    fn test_display_shows_state() {
        let rt = runtime(1);
        let req = Request::from_fn(&rt, || Ok(()));
        let text = req.to_string();
        assert!(text.contains("started=false"));
    }
}
