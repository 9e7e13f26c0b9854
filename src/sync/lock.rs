use crate::error::{Error, Result};
use crate::executor::task::RequestKey;
use crate::request::context;
use crate::scheduler::priority::Prioritized;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rand::Rng;
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Ownership handed to one suspended waiter.
struct Grant {
    granted: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl Grant {
    fn new(waker: Waker) -> Self {
        Self {
            granted: AtomicBool::new(false),
            waker: Mutex::new(Some(waker)),
        }
    }

    /// Must be called with the lock state held, so a dropping `Acquire`
    /// sees either a queued or a granted waiter, never neither.
    fn mark_granted(&self) {
        self.granted.store(true, Ordering::SeqCst);
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }

    fn is_granted(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }
}

type Entry = Prioritized<RequestKey, Arc<Grant>>;

/// Two heaps: push into one, pop from the other, swap when the popping side
/// runs dry. A waiter that gives the lock back and queues again lands behind
/// everyone already queued instead of straight at the front.
#[derive(Default)]
struct RequestLockQueue {
    pushing: BinaryHeap<Entry>,
    popping: BinaryHeap<Entry>,
    seq: u64,
}

impl RequestLockQueue {
    fn push(&mut self, key: RequestKey, grant: Arc<Grant>) {
        self.seq += 1;
        self.pushing.push(Prioritized {
            key,
            seq: self.seq,
            item: grant,
        });
    }

    fn pop(&mut self) -> Option<Arc<Grant>> {
        if self.popping.is_empty() {
            std::mem::swap(&mut self.pushing, &mut self.popping);
        }
        self.popping.pop().map(|entry| entry.item)
    }

    fn remove(&mut self, grant: &Arc<Grant>) {
        self.pushing.retain(|e| !Arc::ptr_eq(&e.item, grant));
        self.popping.retain(|e| !Arc::ptr_eq(&e.item, grant));
    }

    fn len(&self) -> usize {
        self.pushing.len() + self.popping.len()
    }
}

struct LockState {
    locked: bool,
    waiting_requests: RequestLockQueue,
    waiting_threads: usize,
}

/// Mutual exclusion usable from OS threads and from suspendable requests.
///
/// Threads block on a condition variable; requests (and any other future)
/// suspend in [`acquire_async`](Self::acquire_async). A contended release
/// hands ownership straight to the best suspended request without unlocking,
/// so nobody can barge in between.
pub struct RequestLock {
    state: Mutex<LockState>,
    thread_wakeup: Condvar,
    thread_bias: f64,
}

impl RequestLock {
    pub fn new() -> Self {
        Self::with_thread_bias(0.5)
    }

    /// `bias` is the chance that a release with both kinds of waiters lets a
    /// blocked thread in rather than a suspended request.
    pub fn with_thread_bias(bias: f64) -> Self {
        Self {
            state: Mutex::new(LockState {
                locked: false,
                waiting_requests: RequestLockQueue::default(),
                waiting_threads: 0,
            }),
            thread_wakeup: Condvar::new(),
            thread_bias: bias.clamp(0.0, 1.0),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    pub(crate) fn queued_requests(&self) -> usize {
        self.state.lock().waiting_requests.len()
    }

    /// Acquire from a thread.
    ///
    /// With `blocking == false` this never waits and reports whether the lock
    /// was taken. Blocking inside a worker-bound request on a held lock fails
    /// with [`Error::WouldBlockWorker`]; use [`acquire_async`](Self::acquire_async).
    pub fn acquire(&self, blocking: bool) -> Result<bool> {
        context::checkpoint()?;

        let mut st = self.state.lock();
        if !st.locked {
            st.locked = true;
            return Ok(true);
        }
        if !blocking {
            return Ok(false);
        }
        if context::in_worker() {
            return Err(Error::WouldBlockWorker);
        }

        st.waiting_threads += 1;
        while st.locked {
            self.thread_wakeup.wait(&mut st);
        }
        st.locked = true;
        st.waiting_threads -= 1;
        Ok(true)
    }

    /// Acquire without blocking the thread.
    ///
    /// Waiters are ordered by the key of the request they run in; futures
    /// outside any request queue last. Resolves to `Err(Error::Cancelled)` if
    /// the current request is cancelled before or while it waits; the lock is
    /// not held in that case.
    pub fn acquire_async(&self) -> Acquire<'_> {
        Acquire {
            lock: self,
            grant: None,
        }
    }

    pub fn release(&self) -> Result<()> {
        let st = self.state.lock();
        if !st.locked {
            return Err(Error::sync("release of a RequestLock that is not held"));
        }
        self.release_locked(st);
        Ok(())
    }

    /// Release if held; returns whether anything was released.
    pub(crate) fn release_if_locked(&self) -> bool {
        let st = self.state.lock();
        if !st.locked {
            return false;
        }
        self.release_locked(st);
        true
    }

    fn release_locked(&self, mut st: MutexGuard<'_, LockState>) {
        let has_requests = st.waiting_requests.len() > 0;
        let has_threads = st.waiting_threads > 0;

        let favour_threads = match (has_requests, has_threads) {
            (false, _) => true,
            (true, false) => false,
            (true, true) => rand::thread_rng().gen_bool(self.thread_bias),
        };

        if favour_threads {
            st.locked = false;
            drop(st);
            if has_threads {
                self.thread_wakeup.notify_one();
            }
            return;
        }

        // Hand-off: the lock stays locked and now belongs to the waiter.
        match st.waiting_requests.pop() {
            Some(grant) => {
                grant.mark_granted();
                drop(st);
                grant.wake();
            }
            None => {
                tracing::error!("request waiter vanished during hand-off");
                st.locked = false;
            }
        }
    }

    /// Blocking scoped acquisition; see [`acquire`](Self::acquire).
    pub fn lock(&self) -> Result<RequestLockGuard<'_>> {
        self.acquire(true)?;
        Ok(RequestLockGuard::new(self))
    }

    pub async fn lock_async(&self) -> Result<RequestLockGuard<'_>> {
        self.acquire_async().await?;
        Ok(RequestLockGuard::new(self))
    }

    pub fn try_lock(&self) -> Option<RequestLockGuard<'_>> {
        let mut st = self.state.lock();
        if st.locked {
            return None;
        }
        st.locked = true;
        drop(st);
        Some(RequestLockGuard::new(self))
    }

    /// Take the lock only if it is free, ignoring cancellation.
    pub(crate) fn try_acquire_raw(&self) -> bool {
        let mut st = self.state.lock();
        !std::mem::replace(&mut st.locked, true)
    }
}

impl Default for RequestLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RequestLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queued = self.queued_requests();
        let st = self.state.lock();
        f.debug_struct("RequestLock")
            .field("locked", &st.locked)
            .field("waiting_requests", &queued)
            .field("waiting_threads", &st.waiting_threads)
            .finish()
    }
}

/// Future returned by [`RequestLock::acquire_async`].
#[must_use = "futures do nothing unless awaited"]
pub struct Acquire<'a> {
    lock: &'a RequestLock,
    grant: Option<Arc<Grant>>,
}

impl Future for Acquire<'_> {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let lock = self.lock;

        let Some(grant) = self.grant.clone() else {
            if context::current_request_is_cancelled() {
                return Poll::Ready(Err(Error::Cancelled));
            }

            let mut st = lock.state.lock();
            if !st.locked {
                st.locked = true;
                return Poll::Ready(Ok(()));
            }

            let key = context::current_request()
                .map(|r| r.key().clone())
                .unwrap_or_else(RequestKey::lowest);
            let grant = Arc::new(Grant::new(cx.waker().clone()));
            st.waiting_requests.push(key, grant.clone());
            self.grant = Some(grant);
            return Poll::Pending;
        };

        if !grant.is_granted() {
            *grant.waker.lock() = Some(cx.waker().clone());
            if !grant.is_granted() {
                return Poll::Pending;
            }
        }

        // We own the lock now.
        self.grant = None;
        if context::current_request_is_cancelled() {
            lock.release_if_locked();
            return Poll::Ready(Err(Error::Cancelled));
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        let Some(grant) = self.grant.take() else {
            return;
        };
        let mut st = self.lock.state.lock();
        if grant.is_granted() {
            // Handed to us after we stopped caring; pass it on.
            drop(st);
            self.lock.release_if_locked();
        } else {
            st.waiting_requests.remove(&grant);
        }
    }
}

impl fmt::Debug for Acquire<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acquire")
            .field("queued", &self.grant.is_some())
            .finish()
    }
}

/// Releases the lock when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RequestLockGuard<'a> {
    pub(crate) lock: &'a RequestLock,
    pub(crate) held: bool,
}

impl<'a> RequestLockGuard<'a> {
    fn new(lock: &'a RequestLock) -> Self {
        Self { lock, held: true }
    }

    pub fn unlock(mut self) -> Result<()> {
        self.held = false;
        self.lock.release()
    }
}

impl Drop for RequestLockGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            if let Err(e) = self.lock.release() {
                tracing::error!(error = %e, "lock guard released an unlocked lock");
            }
        }
    }
}

impl fmt::Debug for RequestLockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLockGuard").field("held", &self.held).finish()
    }
}
