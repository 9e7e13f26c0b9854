use super::lock::{RequestLock, RequestLockGuard};
use crate::error::{Error, Result};
use std::fmt;

/// A condition variable for one waiter at a time, usable from threads and
/// requests alike.
///
/// Built from two [`RequestLock`]s: the ownership lock callers hold around
/// `wait`/`notify`, and a single-slot waiter lock that `wait` parks on until
/// `notify` releases it. There is no `notify_all` and no timeout.
///
/// ```no_run
/// # use veda_request::SimpleRequestCondition;
/// # async fn consumer(cond: &SimpleRequestCondition, ready: impl Fn() -> bool) -> veda_request::Result<()> {
/// let mut guard = cond.lock_async().await?;
/// while !ready() {
///     cond.wait_async(&mut guard).await?;
/// }
/// # Ok(())
/// # }
/// ```
pub struct SimpleRequestCondition {
    ownership: RequestLock,
    waiter: RequestLock,
}

impl SimpleRequestCondition {
    pub fn new() -> Self {
        Self {
            ownership: RequestLock::new(),
            waiter: RequestLock::new(),
        }
    }

    pub fn with_thread_bias(bias: f64) -> Self {
        Self {
            ownership: RequestLock::with_thread_bias(bias),
            waiter: RequestLock::with_thread_bias(bias),
        }
    }

    /// Take ownership from a thread.
    pub fn lock(&self) -> Result<RequestLockGuard<'_>> {
        self.ownership.lock().map_err(|e| self.on_lock_error(e))
    }

    /// Take ownership without blocking the thread.
    pub async fn lock_async(&self) -> Result<RequestLockGuard<'_>> {
        self.ownership.lock_async().await.map_err(|e| self.on_lock_error(e))
    }

    fn on_lock_error(&self, err: Error) -> Error {
        // A waiter may be counting on us; do not strand it.
        if err.is_cancelled() {
            self.notify_unchecked();
        }
        err
    }

    /// Release ownership until [`notify`](Self::notify) is called, then take
    /// it back. Blocks the calling thread.
    pub fn wait(&self, guard: &mut RequestLockGuard<'_>) -> Result<()> {
        self.begin_wait(guard)?;

        if let Err(e) = self.waiter.acquire(true) {
            self.waiter.release_if_locked();
            return Err(e);
        }
        if let Err(e) = self.ownership.acquire(true) {
            self.waiter.release_if_locked();
            return Err(e);
        }
        guard.held = true;

        // notify() may already have released it.
        self.waiter.release_if_locked();
        Ok(())
    }

    /// Like [`wait`](Self::wait) but suspends instead of blocking.
    pub async fn wait_async(&self, guard: &mut RequestLockGuard<'_>) -> Result<()> {
        self.begin_wait(guard)?;

        if let Err(e) = self.waiter.acquire_async().await {
            self.waiter.release_if_locked();
            return Err(e);
        }
        if let Err(e) = self.ownership.acquire_async().await {
            self.waiter.release_if_locked();
            return Err(e);
        }
        guard.held = true;

        self.waiter.release_if_locked();
        Ok(())
    }

    fn begin_wait(&self, guard: &mut RequestLockGuard<'_>) -> Result<()> {
        if !std::ptr::eq(guard.lock, &self.ownership) || !guard.held {
            return Err(Error::sync("wait() requires holding this condition"));
        }
        if !self.waiter.try_acquire_raw() {
            return Err(Error::sync("SimpleRequestCondition supports one waiter at a time"));
        }
        guard.held = false;
        self.ownership.release()
    }

    /// Wake the waiter, if any. The caller must hold the condition.
    pub fn notify(&self) -> Result<()> {
        if !self.ownership.is_locked() {
            return Err(Error::sync("notify() requires holding the condition"));
        }
        self.notify_unchecked();
        Ok(())
    }

    fn notify_unchecked(&self) {
        self.waiter.release_if_locked();
    }
}

impl Default for SimpleRequestCondition {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimpleRequestCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleRequestCondition")
            .field("owned", &self.ownership.is_locked())
            .field("waiting", &self.waiter.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_requires_ownership() {
        let cond = SimpleRequestCondition::new();
        let other = RequestLock::new();
        let mut guard = other.lock().unwrap();
        assert!(matches!(cond.wait(&mut guard), Err(Error::Sync(_))));
    }

    #[test]
    fn test_notify_without_waiter_is_noop() {
        let cond = SimpleRequestCondition::new();
        let _guard = cond.lock().unwrap();
        cond.notify().unwrap();
        cond.notify().unwrap();
        assert!(!cond.waiter.is_locked());
    }

    #[test]
    fn test_cancelled_lock_attempt_wakes_waiter() {
        let rt = crate::Runtime::new(crate::Config::builder().num_threads(2).build().unwrap()).unwrap();
        let cond = Arc::new(SimpleRequestCondition::new());

        let c = cond.clone();
        let consumer = thread::spawn(move || {
            let mut guard = c.lock().unwrap();
            c.wait(&mut guard)
        });
        while !cond.waiter.is_locked() || cond.ownership.is_locked() {
            thread::sleep(Duration::from_millis(1));
        }

        let owner = cond.lock().unwrap();
        let producer = {
            let cond = cond.clone();
            rt.request(move || async move {
                let _guard = cond.lock_async().await?;
                Ok(())
            })
        };
        producer.submit();
        while cond.ownership.queued_requests() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(producer.cancel());

        // The hand-off reaches a cancelled request, which must not strand the
        // consumer even though nobody called notify().
        drop(owner);
        consumer.join().unwrap().unwrap();
        assert!(producer.is_cancelled());
        assert!(!cond.waiter.is_locked());
    }

    #[test]
    fn test_thread_producer_consumer() {
        let cond = Arc::new(SimpleRequestCondition::new());
        let queue = Arc::new(Mutex::new(Vec::new()));

        let c = cond.clone();
        let q = queue.clone();
        let producer = thread::spawn(move || {
            for i in 0..5 {
                thread::sleep(Duration::from_millis(5));
                let _guard = c.lock().unwrap();
                q.lock().push(i);
                c.notify().unwrap();
            }
        });

        let mut seen = Vec::new();
        let mut guard = cond.lock().unwrap();
        while seen.len() < 5 {
            seen.extend(queue.lock().drain(..));
            if seen.len() < 5 {
                cond.wait(&mut guard).unwrap();
            }
        }
        drop(guard);
        producer.join().unwrap();

        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(!cond.ownership.is_locked());
    }
}
