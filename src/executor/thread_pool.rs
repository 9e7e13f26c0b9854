use super::continuation::Continuation;
use super::panic_handler::PanicHandler;
use super::task::RequestKey;
use super::worker::{Worker, WorkerId, WorkerSignal, WorkerState};
use crate::config::Config;
use crate::error::{Error, Result, TaskError};
use crate::request::core::RequestCore;
use crate::scheduler::priority::PriorityQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub(crate) type ReadyQueue = PriorityQueue<RequestKey, Arc<RequestCore>>;

/// Per-worker state reachable from any thread.
pub(crate) struct WorkerSlot {
    pub(crate) queue: ReadyQueue,
    pub(crate) signal: WorkerSignal,
    pub(crate) state: Arc<WorkerState>,
}

/// Everything the workers and the requests share.
pub(crate) struct PoolShared {
    pub(crate) config: Config,
    pub(crate) shared_queue: ReadyQueue,
    pub(crate) slots: Vec<WorkerSlot>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) active_requests: AtomicUsize,
    pub(crate) panics: PanicHandler,
}

impl PoolShared {
    fn new(config: Config) -> Self {
        let num_threads = config.worker_threads();
        let slots = (0..num_threads)
            .map(|_| WorkerSlot {
                queue: ReadyQueue::new(),
                signal: WorkerSignal::new(),
                state: Arc::new(WorkerState::new()),
            })
            .collect();

        Self {
            config,
            shared_queue: ReadyQueue::new(),
            slots,
            shutdown: AtomicBool::new(false),
            active_requests: AtomicUsize::new(0),
            panics: PanicHandler::new(),
        }
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_synchronous(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Route a ready request: to its bound continuation if it has one,
    /// otherwise to the shared queue for whichever worker wakes first.
    pub(crate) fn wake_up(&self, core: &Arc<RequestCore>) {
        if let Some(continuation) = core.continuation() {
            continuation.wake();
            return;
        }

        if self.is_shutdown() {
            tracing::debug!(request = %core.id(), "submit after shutdown dropped");
            return;
        }

        self.shared_queue.push(core.key().clone(), core.clone());
        // Any idle worker may claim it.
        for slot in &self.slots {
            slot.signal.notify();
        }
    }

    pub(crate) fn enqueue_private(&self, worker: WorkerId, core: Arc<RequestCore>) {
        let Some(slot) = self.slots.get(worker) else {
            tracing::error!(worker, request = %core.id(), "wake for unknown worker");
            return;
        };
        slot.queue.push(core.key().clone(), core);
        slot.signal.notify();
    }

    pub(crate) fn report_unhandled(&self, request: &RequestCore, err: &TaskError) {
        match &self.config.unhandled_failure_hook {
            Some(hook) => hook(err),
            None => tracing::error!(
                request = %request.id(),
                error = %err,
                "request failed and nobody observed the failure"
            ),
        }
    }

    pub(crate) fn request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_completed(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }
}

/// Fixed set of worker threads draining the shared and private ready queues.
pub(crate) struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<WorkerHandle>>,
}

struct WorkerHandle {
    id: WorkerId,
    thread: Option<JoinHandle<()>>,
}

impl ThreadPool {
    pub(crate) fn start(config: Config) -> Result<Self> {
        let shared = Arc::new(PoolShared::new(config));
        let num_threads = shared.num_workers();
        let mut handles = Vec::with_capacity(num_threads);

        for id in 0..num_threads {
            let worker = Worker::new(id, shared.clone());
            let name = format!("{}-{}", shared.config.thread_name_prefix, id);

            let mut builder = thread::Builder::new().name(name);
            if let Some(stack_size) = shared.config.stack_size {
                builder = builder.stack_size(stack_size);
            }

            let thread = match builder.spawn(move || worker.run()) {
                Ok(thread) => thread,
                Err(e) => {
                    let pool = Self {
                        shared,
                        workers: Mutex::new(handles),
                    };
                    pool.stop();
                    return Err(Error::executor(format!("spawn failed: {}", e)));
                }
            };

            handles.push(WorkerHandle {
                id,
                thread: Some(thread),
            });
        }

        tracing::debug!(workers = num_threads, "request thread pool started");

        Ok(Self {
            shared,
            workers: Mutex::new(handles),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.shared.num_workers()
    }

    /// Stop and join every worker. Requests still queued are dropped.
    pub(crate) fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::Release);

        // wake everyone up to check shutdown flag
        for slot in &self.shared.slots {
            slot.signal.notify();
        }

        let mut workers = self.workers.lock();
        for worker in workers.iter_mut() {
            if let Some(thread) = worker.thread.take() {
                if thread.thread().id() == thread::current().id() {
                    // Stopped from inside one of our own requests; it exits on its own.
                    continue;
                }
                if thread.join().is_err() {
                    tracing::error!(worker = worker.id, "worker thread panicked");
                }
            }
        }

        self.shared.shared_queue.clear();
        for slot in &self.shared.slots {
            slot.queue.clear();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind a request claimed from the shared queue to `worker`.
pub(crate) fn claim(
    worker: WorkerId,
    shared: &Arc<PoolShared>,
    core: &Arc<RequestCore>,
) -> Option<Arc<Continuation>> {
    if let Some(existing) = core.continuation() {
        // Queued twice before binding; the first claim won.
        return (existing.worker_id() == Some(worker)).then_some(existing);
    }
    let continuation = Continuation::for_worker(worker, Arc::downgrade(shared), core.clone());
    core.bind(continuation.clone()).ok()?;
    Some(continuation)
}
