//! Which request is running on this thread right now.

use super::core::RequestCore;
use crate::error::{Error, Result};
use crate::executor::continuation::Continuation;
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Continuation>>> = const { RefCell::new(None) };
}

pub(crate) struct EnterGuard {
    previous: Option<Arc<Continuation>>,
}

/// Make `continuation` current until the guard drops. Nests.
pub(crate) fn enter(continuation: Arc<Continuation>) -> EnterGuard {
    let previous = CURRENT.with(|cell| cell.borrow_mut().replace(continuation));
    EnterGuard { previous }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|cell| *cell.borrow_mut() = previous);
    }
}

pub(crate) fn current_continuation() -> Option<Arc<Continuation>> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// The innermost request executing on this thread, if any.
pub(crate) fn current_request() -> Option<Arc<RequestCore>> {
    current_continuation().and_then(|c| c.current_owner())
}

/// True when called from a request bound to a pool worker.
pub fn in_worker() -> bool {
    current_continuation().map_or(false, |c| c.is_worker_bound())
}

/// Whether the request this code runs inside has been cancelled.
///
/// Always false outside of a request.
pub fn current_request_is_cancelled() -> bool {
    current_request().map_or(false, |r| r.is_cancelled())
}

/// Return `Error::Cancelled` if the current request was cancelled.
///
/// Long-running bodies call this between steps; returning the error with `?`
/// ends the body as a cooperative cancellation rather than a failure.
pub fn checkpoint() -> Result<()> {
    if current_request_is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}
