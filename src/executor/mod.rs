//! Request execution infrastructure.
//!
//! Worker threads, the continuations they resume, and the queues that route
//! ready requests to them.

pub(crate) mod continuation;
pub mod panic_handler;
pub mod task;
pub(crate) mod thread_pool;
pub mod worker;

pub use panic_handler::{PanicHandler, PanicInfo};
pub use task::{Priority, RequestId, RequestKey};
pub use worker::{WorkerId, WorkerState, WorkerStatus};
