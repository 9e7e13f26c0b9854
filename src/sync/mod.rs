//! Locks that work the same from OS threads and from suspended requests.

pub mod condition;
pub mod lock;

pub use condition::SimpleRequestCondition;
pub use lock::{Acquire, RequestLock, RequestLockGuard};
