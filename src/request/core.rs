//! Untyped request state shared by every typed [`Request`](super::Request) handle.
//!
//! All relationship bookkeeping lives behind one per-request mutex that is
//! never held across a suspension point or while user callbacks run.

use super::context;
use crate::error::{Error, Result, TaskError};
use crate::executor::continuation::Continuation;
use crate::executor::panic_handler::PanicInfo;
use crate::executor::task::{Priority, RequestId, RequestKey};
use crate::executor::thread_pool::PoolShared;
use crate::executor::worker::WorkerId;
use futures::future::{poll_fn, BoxFuture};
use futures::FutureExt;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

pub(crate) type Output = Arc<dyn Any + Send + Sync>;
pub(crate) type Body = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<Output>> + Send>;

pub(crate) type FinishedCallback = Box<dyn FnOnce(&Output) + Send>;
pub(crate) type FailedCallback = Box<dyn FnOnce(&TaskError) + Send>;
pub(crate) type CancelledCallback = Box<dyn FnOnce() + Send>;

/// Someone to tell when execution completes.
enum Waiter {
    /// A request suspended in `wait_cooperative`.
    Request(Arc<RequestCore>),
    /// A plain future awaiting outside of any request.
    Task(Waker),
}

#[derive(Default)]
struct State {
    parent: Option<Weak<RequestCore>>,
    children: HashMap<RequestId, Arc<RequestCore>>,
    /// Requests currently waiting on this one.
    pending: HashMap<RequestId, Weak<RequestCore>>,
    /// What this request is suspended on; at most one entry in practice.
    blocking: HashSet<RequestId>,
    max_child: u64,

    result: Option<Output>,
    failure: Option<TaskError>,

    on_finished: Vec<FinishedCallback>,
    on_failed: Vec<FailedCallback>,
    on_cancelled: Vec<CancelledCallback>,
    on_complete: Vec<Waiter>,
}

enum Plan {
    Ready,
    Direct,
    Suspend,
}

pub(crate) struct RequestCore {
    id: RequestId,
    key: RequestKey,
    class: Priority,
    scheduler: Arc<PoolShared>,

    started: AtomicBool,
    finished: AtomicBool,
    execution_complete: AtomicBool,
    cancelled: AtomicBool,
    uncancellable: AtomicBool,
    failed: AtomicBool,
    cleaned: AtomicBool,

    state: Mutex<State>,
    completed: Condvar,
    body: Mutex<Option<Body>>,
    binding: OnceLock<Arc<Continuation>>,
}

impl RequestCore {
    /// Create a request; if called while another request executes, it becomes
    /// that request's child and inherits its key prefix and cancelled status.
    pub(crate) fn new(scheduler: Arc<PoolShared>, class: Priority, body: Body) -> Arc<Self> {
        let parent = context::current_request();

        let key = match &parent {
            Some(parent) => {
                let mut st = parent.state.lock();
                st.max_child += 1;
                parent.key.child(class, st.max_child)
            }
            None => RequestKey::root(class),
        };

        let core = Arc::new(RequestCore {
            id: RequestId::next(),
            key,
            class,
            scheduler,
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            execution_complete: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            uncancellable: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            state: Mutex::new(State::default()),
            completed: Condvar::new(),
            body: Mutex::new(Some(body)),
            binding: OnceLock::new(),
        });

        if let Some(parent) = parent {
            core.state.lock().parent = Some(Arc::downgrade(&parent));
            let mut st = parent.state.lock();
            // A cancelled parent only produces cancelled children.
            if parent.is_cancelled() {
                core.cancelled.store(true, Ordering::Release);
            }
            st.children.insert(core.id, core.clone());
        }

        core
    }

    pub(crate) fn id(&self) -> RequestId {
        self.id
    }

    pub(crate) fn key(&self) -> &RequestKey {
        &self.key
    }

    pub(crate) fn class(&self) -> Priority {
        self.class
    }

    pub(crate) fn continuation(&self) -> Option<Arc<Continuation>> {
        self.binding.get().cloned()
    }

    /// Bind to a continuation. Happens at most once per request.
    pub(crate) fn bind(&self, continuation: Arc<Continuation>) -> Result<()> {
        self.binding
            .set(continuation)
            .map_err(|_| Error::internal(format!("request {} is already bound", self.id)))
    }

    pub(crate) fn assigned_worker(&self) -> Option<WorkerId> {
        self.continuation().and_then(|c| c.worker_id())
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn is_execution_complete(&self) -> bool {
        self.execution_complete.load(Ordering::Acquire)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn is_uncancellable(&self) -> bool {
        self.uncancellable.load(Ordering::Acquire)
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn is_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::Acquire)
    }

    /// Claim the right to execute. Exactly one caller ever wins.
    pub(crate) fn try_start(&self) -> bool {
        let won = self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.scheduler.request_started();
        }
        won
    }

    pub(crate) fn submit(self: &Arc<Self>) {
        if !self.try_start() {
            return;
        }
        if self.scheduler.is_synchronous() {
            self.run_on_current_thread();
        } else {
            self.scheduler.wake_up(self);
        }
    }

    /// Execute on a fresh continuation driven by the calling thread.
    fn run_on_current_thread(self: &Arc<Self>) {
        let continuation = Continuation::for_current_thread(self.clone());
        if let Err(e) = self.bind(continuation.clone()) {
            tracing::error!(request = %self.id, error = %e, "cannot run request in-line");
            return;
        }
        if let Err(info) = self.scheduler.panics.execute(|| continuation.drive()) {
            tracing::error!(request = %self.id, panic = %info.message, "in-line continuation faulted");
            continuation.abandon(&format!("could not run request {}: {}", self.id, info.message));
        }
    }

    /// The future that runs the body and then signals the outcome.
    pub(crate) fn execute(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            let body = self.body.lock().take();
            if let (false, Some(body)) = (self.is_cancelled(), body) {
                match self.scheduler.panics.execute_async(async move { body().await }).await {
                    Ok(Ok(value)) => self.state.lock().result = Some(value),
                    Ok(Err(err)) => match TaskError::capture(err) {
                        Some(failure) => self.record_failure(failure),
                        // The body ended itself with `Error::Cancelled`.
                        None => self.cancelled.store(true, Ordering::Release),
                    },
                    Err(panic) => self.record_failure(panic.into_task_error()),
                }
            }
            self.post_execute();
        }
        .boxed()
    }

    fn record_failure(&self, failure: TaskError) {
        self.state.lock().failure = Some(failure);
        self.failed.store(true, Ordering::Release);
    }

    /// Run every callback, even after one of them panics. Returns the first
    /// panic.
    fn fire<C>(&self, callbacks: Vec<C>, mut call: impl FnMut(C)) -> std::result::Result<(), PanicInfo> {
        let mut first = Ok(());
        for callback in callbacks {
            if let Err(panic) = self.scheduler.panics.execute(|| call(callback)) {
                if first.is_ok() {
                    first = Err(panic);
                } else {
                    tracing::error!(request = %self.id, panic = %panic.message, "callback panicked");
                }
            }
        }
        first
    }

    /// Fire exactly one outcome signal, then release every waiter.
    fn post_execute(self: &Arc<Self>) {
        let (failure, result) = {
            let st = self.state.lock();
            self.finished.store(true, Ordering::Release);
            (st.failure.clone(), st.result.clone())
        };

        let mut had_failure_callbacks = false;
        let fired = if let Some(err) = &failure {
            let callbacks = mem::take(&mut self.state.lock().on_failed);
            had_failure_callbacks = !callbacks.is_empty();
            self.fire(callbacks, |cb| cb(err))
        } else if self.is_cancelled() {
            let callbacks = mem::take(&mut self.state.lock().on_cancelled);
            self.fire(callbacks, |cb| cb())
        } else {
            let callbacks = mem::take(&mut self.state.lock().on_finished);
            match &result {
                Some(value) => self.fire(callbacks, |cb| cb(value)),
                None => Ok(()),
            }
        };

        match fired {
            Ok(()) => {
                if let Some(err) = &failure {
                    if !had_failure_callbacks && !self.is_observed() {
                        self.scheduler.report_unhandled(self, err);
                    }
                }
            }
            Err(panic) => {
                // A failing handler replaces the outcome; failure handlers run
                // once, never again for their own failure.
                let during_failure = failure.is_some();
                let secondary = panic.into_task_error();
                self.record_failure(secondary.clone());

                let callbacks = if during_failure {
                    Vec::new()
                } else {
                    mem::take(&mut self.state.lock().on_failed)
                };
                let listened = !callbacks.is_empty();
                if let Err(panic) = self.fire(callbacks, |cb| cb(&secondary)) {
                    tracing::error!(request = %self.id, panic = %panic.message, "failure callback panicked");
                }

                if during_failure || (!listened && !self.is_observed()) {
                    self.scheduler.report_unhandled(self, &secondary);
                }
            }
        }

        // Drops unfired callbacks, children and the parent link whatever the
        // outcome was.
        self.clean(false);
        self.mark_execution_complete();
    }

    /// Someone will see the failure: a suspended request, an awaiting
    /// future, or a foreign thread blocked on it.
    fn is_observed(&self) -> bool {
        let st = self.state.lock();
        !st.pending.is_empty() || !st.on_complete.is_empty() || self.is_uncancellable()
    }

    fn mark_execution_complete(self: &Arc<Self>) {
        let waiters = {
            let mut st = self.state.lock();
            if self.execution_complete.swap(true, Ordering::AcqRel) {
                return;
            }
            mem::take(&mut st.on_complete)
        };
        self.completed.notify_all();

        for waiter in waiters {
            match waiter {
                Waiter::Request(request) => request.handle_finished_request(self.id),
                Waiter::Task(waker) => waker.wake(),
            }
        }

        self.scheduler.request_completed();
    }

    /// The continuation running this request faulted outside of user code.
    pub(crate) fn complete_with_internal_error(self: &Arc<Self>, message: &str) {
        if self.is_execution_complete() {
            return;
        }
        self.record_failure(TaskError::new(anyhow::Error::new(Error::internal(message))));
        if self.is_finished() {
            self.mark_execution_complete();
        } else {
            self.post_execute();
        }
    }

    fn handle_finished_request(self: &Arc<Self>, dependency: RequestId) {
        let ready = {
            let mut st = self.state.lock();
            st.blocking.remove(&dependency);
            st.blocking.is_empty()
        };
        if ready {
            self.scheduler.wake_up(self);
        }
    }

    /// Returns whether the request is cancelled afterwards.
    pub(crate) fn cancel(&self) -> bool {
        let children = {
            let mut st = self.state.lock();
            if self.is_uncancellable() || self.is_finished() {
                return self.is_cancelled();
            }

            let parent_cancelled = st
                .parent
                .as_ref()
                .and_then(Weak::upgrade)
                .map_or(true, |p| p.is_cancelled());
            let waiters_cancelled = st
                .pending
                .values()
                .all(|w| w.upgrade().map_or(true, |w| w.is_cancelled()));
            if !parent_cancelled || !waiters_cancelled {
                return false;
            }

            self.cancelled.store(true, Ordering::Release);
            mem::take(&mut st.children)
        };

        for child in children.into_values() {
            child.cancel();
        }
        true
    }

    /// Drop callbacks and child links; a full clean also releases the result.
    pub(crate) fn clean(&self, full: bool) {
        let (children, parent) = {
            let mut st = self.state.lock();
            st.on_finished.clear();
            st.on_failed.clear();
            st.on_cancelled.clear();
            if full {
                self.cleaned.store(true, Ordering::Release);
                st.result = None;
            }
            (mem::take(&mut st.children), st.parent.take())
        };

        if full {
            self.body.lock().take();
        }
        for child in children.values() {
            child.state.lock().parent = None;
        }
        if let Some(parent) = parent.and_then(|p| p.upgrade()) {
            parent.state.lock().children.remove(&self.id);
        }
    }

    pub(crate) fn on_finished(&self, callback: FinishedCallback) {
        let mut st = self.state.lock();
        if !self.is_finished() {
            st.on_finished.push(callback);
            return;
        }
        let value = st
            .result
            .clone()
            .filter(|_| st.failure.is_none() && !self.is_cancelled());
        drop(st);
        if let Some(value) = value {
            callback(&value);
        }
    }

    pub(crate) fn on_failed(&self, callback: FailedCallback) {
        let mut st = self.state.lock();
        if !self.is_finished() {
            st.on_failed.push(callback);
            return;
        }
        let failure = st.failure.clone();
        drop(st);
        if let Some(err) = failure {
            callback(&err);
        }
    }

    pub(crate) fn on_cancelled(&self, callback: CancelledCallback) {
        let mut st = self.state.lock();
        if !self.is_finished() {
            st.on_cancelled.push(callback);
            return;
        }
        let cancelled = self.is_cancelled() && st.failure.is_none();
        drop(st);
        if cancelled {
            callback();
        }
    }

    /// Outcome of a completed request, without its value.
    pub(crate) fn status(&self) -> Result<()> {
        let st = self.state.lock();
        if let Some(err) = &st.failure {
            return Err(replay(err));
        }
        if self.is_cancelled() {
            return Err(Error::InvalidRequest);
        }
        Ok(())
    }

    pub(crate) fn output(&self) -> Result<Output> {
        self.status()?;
        if self.is_cleaned() {
            return Err(Error::Cleaned);
        }
        self.state
            .lock()
            .result
            .clone()
            .ok_or_else(|| Error::internal(format!("request {} has no result", self.id)))
    }

    /// Wait from inside `current`, suspending its continuation rather than
    /// the thread.
    pub(crate) async fn wait_cooperative(self: Arc<Self>, current: Arc<RequestCore>) -> Result<()> {
        if current.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if Arc::ptr_eq(&current, &self) {
            // Only legal from our own completion callbacks.
            return if self.is_finished() {
                self.status()
            } else {
                Err(Error::CircularWait)
            };
        }

        current.state.lock().blocking.insert(self.id);

        let plan = {
            let mut st = self.state.lock();
            if self.is_cancelled() {
                Err(Error::InvalidRequest)
            } else if let Some(err) = &st.failure {
                Err(replay(err))
            } else if self.is_execution_complete() {
                Ok(Plan::Ready)
            } else {
                st.pending.insert(current.id, Arc::downgrade(&current));
                if self.try_start() {
                    Ok(Plan::Direct)
                } else {
                    st.on_complete.push(Waiter::Request(current.clone()));
                    Ok(Plan::Suspend)
                }
            }
        };

        let ran = match plan {
            Ok(Plan::Ready) => Ok(()),
            Ok(Plan::Direct) => self.clone().run_inline(&current).await,
            Ok(Plan::Suspend) => {
                let dependency = self.id;
                poll_fn(|_| {
                    if current.state.lock().blocking.contains(&dependency) {
                        Poll::Pending
                    } else {
                        Poll::Ready(())
                    }
                })
                .await;
                Ok(())
            }
            Err(e) => Err(e),
        };

        self.state.lock().pending.remove(&current.id);
        current.state.lock().blocking.remove(&self.id);
        ran?;

        if current.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.status()
    }

    /// Run a not-yet-started dependency on the waiter's own continuation.
    async fn run_inline(self: Arc<Self>, current: &Arc<RequestCore>) -> Result<()> {
        let continuation = current
            .continuation()
            .ok_or_else(|| Error::internal(format!("current request {} is not bound", current.id)))?;
        self.bind(continuation.clone())?;

        continuation.push_owner(self.clone());
        self.clone().execute().await;
        continuation.pop_owner();
        Ok(())
    }

    /// Wait from a plain future outside of any request.
    pub(crate) async fn wait_detached(self: Arc<Self>) -> Result<()> {
        if self.is_cancelled() && !self.is_execution_complete() {
            return Err(Error::InvalidRequest);
        }
        self.submit();

        poll_fn(|cx| {
            if self.is_execution_complete() {
                return Poll::Ready(());
            }
            let mut st = self.state.lock();
            if self.is_execution_complete() {
                return Poll::Ready(());
            }
            let registered = st
                .on_complete
                .iter()
                .any(|w| matches!(w, Waiter::Task(w) if w.will_wake(cx.waker())));
            if !registered {
                st.on_complete.push(Waiter::Task(cx.waker().clone()));
            }
            Poll::Pending
        })
        .await;

        self.status()
    }

    /// Block the calling OS thread until execution completes.
    pub(crate) fn wait_foreign(self: &Arc<Self>, timeout: Option<Duration>) -> Result<()> {
        if self.is_execution_complete() {
            return self.status();
        }

        if let Some(current) = context::current_request() {
            if Arc::ptr_eq(&current, self) {
                return if self.is_finished() {
                    self.status()
                } else {
                    Err(Error::CircularWait)
                };
            }
        }
        if context::in_worker() {
            return Err(Error::WouldBlockWorker);
        }

        {
            let _st = self.state.lock();
            if self.is_cancelled() {
                return Err(Error::InvalidRequest);
            }
            self.uncancellable.store(true, Ordering::Release);
        }

        if timeout.is_none() && self.try_start() {
            self.run_on_current_thread();
        } else {
            self.submit();
        }

        let deadline = timeout.map(|t| (Instant::now() + t, t));
        let mut st = self.state.lock();
        while !self.is_execution_complete() {
            match deadline {
                Some((at, timeout)) => {
                    if self.completed.wait_until(&mut st, at).timed_out()
                        && !self.is_execution_complete()
                    {
                        return Err(Error::Timeout(timeout));
                    }
                }
                None => self.completed.wait(&mut st),
            }
        }
        drop(st);

        self.status()
    }
}

fn replay(err: &TaskError) -> Error {
    match err.downcast_ref::<Error>() {
        Some(scheduler_error) => scheduler_error.clone(),
        None => Error::Failed(err.clone()),
    }
}

impl fmt::Debug for RequestCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("assigned_worker", &self.assigned_worker())
            .field("started", &self.is_started())
            .field("execution_complete", &self.is_execution_complete())
            .field("cancelled", &self.is_cancelled())
            .field("failed", &self.is_failed())
            .field("uncancellable", &self.is_uncancellable())
            .finish()
    }
}
