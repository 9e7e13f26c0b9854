use crate::config::Config;
use crate::error::Result;
use crate::executor::task::Priority;
use crate::executor::thread_pool::{PoolShared, ThreadPool};
use crate::executor::worker::{WorkerId, WorkerStatus};
use crate::pool::RequestPool;
use crate::request::Request;
use crate::sync::{RequestLock, SimpleRequestCondition};
use std::fmt;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// The scheduler: a worker pool plus the configuration it was started with.
///
/// Cheap to clone; every clone drives the same workers. Configuration is
/// fixed at construction, build a new `Runtime` to change it. Workers stop
/// when the last clone is dropped or on [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    pool: ThreadPool,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let pool = ThreadPool::start(config)?;
        Ok(Self {
            inner: Arc::new(RuntimeInner { pool }),
        })
    }

    pub fn with_default() -> Result<Self> {
        Self::new(Config::default())
    }

    /// Defaults plus `VEDA_REQUEST_THREADS`.
    pub fn from_env() -> Result<Self> {
        Self::new(Config::from_env()?)
    }

    pub fn config(&self) -> &Config {
        &self.shared().config
    }

    pub fn num_workers(&self) -> usize {
        self.inner.pool.num_threads()
    }

    /// Zero workers: requests run in-line on whichever thread submits or
    /// waits on them.
    pub fn is_synchronous(&self) -> bool {
        self.shared().is_synchronous()
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        self.inner.pool.shared()
    }

    pub fn request<T, F, Fut>(&self, f: F) -> Request<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Request::new(self, f)
    }

    pub fn request_with_priority<T, F, Fut>(&self, priority: Priority, f: F) -> Request<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Request::with_priority(self, priority, f)
    }

    pub fn request_fn<T, F>(&self, f: F) -> Request<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Request::from_fn(self, f)
    }

    pub fn pool<T>(&self) -> RequestPool<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        RequestPool::new(self)
    }

    /// A lock using the configured thread bias.
    pub fn new_lock(&self) -> RequestLock {
        RequestLock::with_thread_bias(self.config().lock_thread_bias)
    }

    pub fn new_condition(&self) -> SimpleRequestCondition {
        SimpleRequestCondition::with_thread_bias(self.config().lock_thread_bias)
    }

    pub fn stats(&self) -> RuntimeStats {
        let shared = self.shared();
        let workers = shared
            .slots
            .iter()
            .enumerate()
            .map(|(id, slot)| WorkerStats {
                id,
                status: slot.state.status(),
                tasks_executed: slot.state.tasks_executed.load(Ordering::Relaxed),
                tasks_claimed: slot.state.tasks_claimed.load(Ordering::Relaxed),
                idle_time: Duration::from_nanos(slot.state.idle_time_ns.load(Ordering::Relaxed)),
                queued: slot.queue.len(),
            })
            .collect();

        RuntimeStats {
            active_requests: shared.active_requests(),
            shared_queue: shared.shared_queue.len(),
            panics: shared.panics.panic_count(),
            workers,
        }
    }

    /// Stop and join the workers. Requests that have not run are dropped and
    /// their waiters are never released.
    pub fn shutdown(&self) {
        self.inner.pool.stop();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.num_workers())
            .field("active_requests", &self.shared().active_requests())
            .finish()
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone)]
pub struct RuntimeStats {
    /// Started but not yet complete.
    pub active_requests: usize,
    pub shared_queue: usize,
    pub panics: usize,
    pub workers: Vec<WorkerStats>,
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub tasks_executed: u64,
    pub tasks_claimed: u64,
    pub idle_time: Duration,
    pub queued: usize,
}

impl RuntimeStats {
    pub fn tasks_executed(&self) -> u64 {
        self.workers.iter().map(|w| w.tasks_executed).sum()
    }
}
