// worker thread stuff
use super::thread_pool::{claim, PoolShared};
use crate::request::core::RequestCore;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub type WorkerId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerStatus {
    Initialized = 0,
    Waiting = 1,
    Running = 2,
    Freeing = 3,
    Stopped = 4,
}

impl WorkerStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerStatus::Initialized,
            1 => WorkerStatus::Waiting,
            2 => WorkerStatus::Running,
            3 => WorkerStatus::Freeing,
            _ => WorkerStatus::Stopped,
        }
    }
}

// stats for each worker
#[derive(Debug)]
pub struct WorkerState {
    pub tasks_executed: AtomicU64,
    pub tasks_claimed: AtomicU64,
    pub idle_time_ns: AtomicU64,
    status: AtomicU8,
}

impl WorkerState {
    pub(crate) fn new() -> Self {
        Self {
            tasks_executed: AtomicU64::new(0),
            tasks_claimed: AtomicU64::new(0),
            idle_time_ns: AtomicU64::new(0),
            status: AtomicU8::new(WorkerStatus::Initialized as u8),
        }
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    fn set_status(&self, status: WorkerStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
    }
}

/// Sticky wake-up flag; a notify that lands before the wait is not lost.
pub(crate) struct WorkerSignal {
    notified: Mutex<bool>,
    cond: Condvar,
}

impl WorkerSignal {
    pub(crate) fn new() -> Self {
        Self {
            notified: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        *self.notified.lock() = true;
        self.cond.notify_one();
    }

    fn wait(&self, shared: &PoolShared) {
        let mut notified = self.notified.lock();
        while !*notified && !shared.is_shutdown() {
            self.cond.wait(&mut notified);
        }
        *notified = false;
    }
}

pub(crate) struct Worker {
    pub id: WorkerId,
    shared: Arc<PoolShared>,
}

impl Worker {
    pub(crate) fn new(id: WorkerId, shared: Arc<PoolShared>) -> Self {
        Self { id, shared }
    }

    fn state(&self) -> &WorkerState {
        &self.shared.slots[self.id].state
    }

    // main loop
    pub(crate) fn run(self) {
        tracing::debug!(worker = self.id, "worker started");
        let slot = &self.shared.slots[self.id];

        loop {
            if self.shared.is_shutdown() {
                break;
            }

            // own queue first, then the shared one
            if let Some(core) = self.find_task() {
                self.state().set_status(WorkerStatus::Running);
                self.execute(core);
                self.state().set_status(WorkerStatus::Freeing);
            } else {
                self.state().set_status(WorkerStatus::Waiting);
                let start = Instant::now();
                slot.signal.wait(&self.shared);
                self.state()
                    .idle_time_ns
                    .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
            }
        }

        self.state().set_status(WorkerStatus::Stopped);
        tracing::debug!(worker = self.id, "worker stopped");
    }

    fn find_task(&self) -> Option<Arc<RequestCore>> {
        if let Some(core) = self.shared.slots[self.id].queue.pop() {
            return Some(core);
        }

        while let Some(core) = self.shared.shared_queue.pop() {
            if claim(self.id, &self.shared, &core).is_some() {
                self.state().tasks_claimed.fetch_add(1, Ordering::Relaxed);
                return Some(core);
            }
        }

        None
    }

    fn execute(&self, core: Arc<RequestCore>) {
        let Some(continuation) = core.continuation() else {
            tracing::error!(worker = self.id, request = %core.id(), "ready request has no continuation");
            return;
        };

        if continuation.worker_id() != Some(self.id) {
            tracing::error!(
                worker = self.id,
                bound_to = ?continuation.worker_id(),
                request = %core.id(),
                "request resumed on the wrong worker"
            );
            return;
        }

        let result = self.shared.panics.execute(|| continuation.resume());
        if let Err(info) = result {
            tracing::error!(
                worker = self.id,
                request = %core.id(),
                panic = %info.message,
                "request continuation faulted"
            );
            continuation.abandon(&format!("could not resume request {}: {}", core.id(), info.message));
        }

        self.state().tasks_executed.fetch_add(1, Ordering::Relaxed);
    }
}
