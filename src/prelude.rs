pub use crate::config::{Config, ConfigBuilder};
pub use crate::error::{Error, Result, TaskError};
pub use crate::executor::Priority;
pub use crate::pool::RequestPool;
pub use crate::request::{checkpoint, current_request_is_cancelled, Request};
pub use crate::runtime::Runtime;
pub use crate::sync::{RequestLock, RequestLockGuard, SimpleRequestCondition};
