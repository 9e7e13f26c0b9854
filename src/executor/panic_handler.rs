use crate::error::TaskError;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Catches panics escaping request bodies, completion callbacks and the
/// worker loop, and counts them.
#[derive(Debug, Default)]
pub struct PanicHandler {
    caught: AtomicUsize,
}

impl PanicHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execute<F, R>(&self, f: F) -> Result<R, PanicInfo>
    where
        F: FnOnce() -> R,
    {
        catch_unwind(AssertUnwindSafe(f)).map_err(|payload| self.record(payload))
    }

    /// Like [`execute`](Self::execute), for a future polled to completion.
    pub async fn execute_async<F>(&self, fut: F) -> Result<F::Output, PanicInfo>
    where
        F: Future,
    {
        AssertUnwindSafe(fut)
            .catch_unwind()
            .await
            .map_err(|payload| self.record(payload))
    }

    fn record(&self, payload: Box<dyn Any + Send>) -> PanicInfo {
        self.caught.fetch_add(1, Ordering::Relaxed);
        PanicInfo::from_payload(payload.as_ref())
    }

    /// Panics caught since the handler was created.
    pub fn panic_count(&self) -> usize {
        self.caught.load(Ordering::Relaxed)
    }
}

/// The message carried by a caught panic.
#[derive(Debug, Clone)]
pub struct PanicInfo {
    pub message: String,
}

impl PanicInfo {
    fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = match payload.downcast_ref::<&'static str>() {
            Some(s) => (*s).to_owned(),
            None => payload
                .downcast_ref::<String>()
                .cloned()
                .unwrap_or_else(|| "non-string panic payload".to_owned()),
        };
        Self { message }
    }

    pub fn into_task_error(self) -> TaskError {
        TaskError::msg(self)
    }
}

impl fmt::Display for PanicInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panicked: {}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_str_and_string_payloads() {
        let handler = PanicHandler::new();

        let info = handler.execute(|| panic!("static message")).unwrap_err();
        assert_eq!(info.message, "static message");

        let n = 3;
        let info = handler.execute(|| panic!("formatted {}", n)).unwrap_err();
        assert_eq!(info.message, "formatted 3");

        assert_eq!(handler.panic_count(), 2);
    }

    #[test]
    fn test_opaque_payload() {
        let handler = PanicHandler::new();
        let info = handler
            .execute(|| std::panic::panic_any(17u32))
            .unwrap_err();
        assert_eq!(info.message, "non-string panic payload");
    }

    #[test]
    fn test_no_panic_leaves_count_alone() {
        let handler = PanicHandler::new();
        assert_eq!(handler.execute(|| "fine").unwrap(), "fine");
        assert_eq!(handler.panic_count(), 0);
    }

    #[test]
    fn test_async_panic_becomes_task_error() {
        let handler = PanicHandler::new();
        let result = futures::executor::block_on(handler.execute_async(async {
            panic!("in future");
        }));

        let err = result.unwrap_err().into_task_error();
        assert_eq!(err.to_string(), "panicked: in future");
        assert_eq!(handler.panic_count(), 1);
    }
}
