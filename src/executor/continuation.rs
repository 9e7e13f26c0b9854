//! Suspendable execution contexts.
//!
//! A continuation owns the future of one root request plus every request
//! executed in-line on top of it. It is bound either to one pool worker (all
//! resumptions are routed to that worker's private queue) or to the OS thread
//! that is driving it directly (a foreign waiter, or the synchronous debug
//! mode).

use super::thread_pool::PoolShared;
use super::worker::WorkerId;
use crate::request::context;
use crate::request::core::RequestCore;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};

pub(crate) enum Resumer {
    Worker { id: WorkerId, pool: Weak<PoolShared> },
    Thread(Arc<ThreadNotify>),
}

pub(crate) struct Continuation {
    resumer: Resumer,
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    /// Requests running on this continuation; the last one is executing.
    owners: Mutex<Vec<Arc<RequestCore>>>,
    waker: Waker,
}

impl Continuation {
    pub(crate) fn for_worker(id: WorkerId, pool: Weak<PoolShared>, root: Arc<RequestCore>) -> Arc<Self> {
        Self::new(Resumer::Worker { id, pool }, root)
    }

    /// Bound to the calling thread, which must drive it with [`drive`](Self::drive).
    pub(crate) fn for_current_thread(root: Arc<RequestCore>) -> Arc<Self> {
        Self::new(Resumer::Thread(ThreadNotify::current()), root)
    }

    fn new(resumer: Resumer, root: Arc<RequestCore>) -> Arc<Self> {
        let future = root.clone().execute();
        Arc::new_cyclic(|weak: &Weak<Continuation>| {
            let waker = match &resumer {
                Resumer::Worker { .. } => Waker::from(Arc::new(ContinuationWaker(weak.clone()))),
                Resumer::Thread(notify) => Waker::from(notify.clone()),
            };
            Continuation {
                resumer,
                future: Mutex::new(Some(future)),
                owners: Mutex::new(vec![root]),
                waker,
            }
        })
    }

    pub(crate) fn worker_id(&self) -> Option<WorkerId> {
        match self.resumer {
            Resumer::Worker { id, .. } => Some(id),
            Resumer::Thread(_) => None,
        }
    }

    pub(crate) fn is_worker_bound(&self) -> bool {
        matches!(self.resumer, Resumer::Worker { .. })
    }

    pub(crate) fn current_owner(&self) -> Option<Arc<RequestCore>> {
        self.owners.lock().last().cloned()
    }

    pub(crate) fn push_owner(&self, core: Arc<RequestCore>) {
        self.owners.lock().push(core);
    }

    pub(crate) fn pop_owner(&self) -> Option<Arc<RequestCore>> {
        self.owners.lock().pop()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.future.lock().is_none()
    }

    /// Schedule another poll on whatever this continuation is bound to.
    pub(crate) fn wake(&self) {
        match &self.resumer {
            Resumer::Worker { id, pool } => {
                let Some(pool) = pool.upgrade() else {
                    tracing::debug!(worker = id, "wake after runtime shutdown dropped");
                    return;
                };
                if let Some(owner) = self.current_owner() {
                    pool.enqueue_private(*id, owner);
                }
            }
            Resumer::Thread(notify) => notify.notify(),
        }
    }

    /// Poll the continuation once. Must run on the worker or thread it is bound to.
    pub(crate) fn resume(self: &Arc<Self>) -> Poll<()> {
        let Some(mut future) = self.future.lock().take() else {
            return Poll::Ready(());
        };

        let _enter = context::enter(self.clone());
        let mut cx = Context::from_waker(&self.waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                self.owners.lock().clear();
                Poll::Ready(())
            }
            Poll::Pending => {
                *self.future.lock() = Some(future);
                Poll::Pending
            }
        }
    }

    /// Run a thread-bound continuation to completion on the calling thread.
    pub(crate) fn drive(self: &Arc<Self>) {
        let Resumer::Thread(notify) = &self.resumer else {
            tracing::error!("drive() called on a worker-bound continuation");
            return;
        };
        loop {
            if self.resume().is_ready() {
                break;
            }
            notify.park();
        }
        notify.leave();
    }

    /// The machinery itself failed while polling; every request still on the
    /// stack is completed with an internal error so its waiters are released.
    pub(crate) fn abandon(&self, message: &str) {
        self.future.lock().take();
        let owners: Vec<_> = self.owners.lock().drain(..).rev().collect();
        for owner in owners {
            owner.complete_with_internal_error(message);
        }
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("worker", &self.worker_id())
            .field("depth", &self.owners.lock().len())
            .field("done", &self.is_done())
            .finish()
    }
}

struct ContinuationWaker(Weak<Continuation>);

impl Wake for ContinuationWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Some(continuation) = self.0.upgrade() {
            continuation.wake();
        }
    }
}

/// Per-thread wake flag used by every blocking poll loop on that thread.
pub(crate) struct ThreadNotify {
    thread: Thread,
    notified: AtomicBool,
}

thread_local! {
    static THREAD_NOTIFY: RefCell<Option<Arc<ThreadNotify>>> = const { RefCell::new(None) };
}

impl ThreadNotify {
    pub(crate) fn current() -> Arc<Self> {
        THREAD_NOTIFY.with(|cell| {
            cell.borrow_mut()
                .get_or_insert_with(|| {
                    Arc::new(ThreadNotify {
                        thread: thread::current(),
                        notified: AtomicBool::new(false),
                    })
                })
                .clone()
        })
    }

    fn notify(&self) {
        self.notified.store(true, Ordering::Release);
        self.thread.unpark();
    }

    fn park(&self) {
        while !self.notified.swap(false, Ordering::Acquire) {
            thread::park();
        }
    }

    /// A nested loop may have consumed a wakeup meant for an enclosing one,
    /// so leaving always forces the enclosing loop to poll again.
    fn leave(&self) {
        self.notified.store(true, Ordering::Release);
    }
}

impl Wake for ThreadNotify {
    fn wake(self: Arc<Self>) {
        self.notify()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.notify()
    }
}

/// Poll a future to completion on the calling thread, parking between polls.
pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    let notify = ThreadNotify::current();
    let waker = Waker::from(notify.clone());
    let mut cx = Context::from_waker(&waker);
    let mut future = pin!(future);
    let output = loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            break output;
        }
        notify.park();
    };
    notify.leave();
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_block_on_ready() {
        assert_eq!(block_on(async { 7 }), 7);
    }

    #[test]
    fn test_block_on_woken_from_other_thread() {
        let (tx, rx) = futures::channel::oneshot::channel();
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx.send(5).unwrap();
        });
        assert_eq!(block_on(rx).unwrap(), 5);
        sender.join().unwrap();
    }

    #[test]
    fn test_nested_block_on_does_not_lose_wakeups() {
        let (tx, rx) = futures::channel::oneshot::channel::<u32>();
        let value = block_on(async move {
            let inner = block_on(async { 1 });
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                tx.send(41).unwrap();
            });
            inner + rx.await.unwrap()
        });
        assert_eq!(value, 42);
    }
}
