use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The current request was cancelled. Raised inside the cancelled request
    /// itself and absorbed when it escapes the request body.
    #[error("request cancelled")]
    Cancelled,

    /// Waited on a request that had already been cancelled elsewhere.
    #[error("waited on a request that was already cancelled")]
    InvalidRequest,

    #[error("request waited on itself before finishing")]
    CircularWait,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("internal scheduler error: {0}")]
    Internal(String),

    #[error(transparent)]
    Failed(TaskError),

    /// A blocking (OS-level) wait was attempted from inside a worker-bound
    /// request on something that has not finished yet.
    #[error("blocking wait from inside a worker; use the async variant")]
    WouldBlockWorker,

    #[error("result already released by clean()")]
    Cleaned,

    #[error("request has not completed yet")]
    NotReady,

    /// Misuse of a `RequestLock` or `SimpleRequestCondition`.
    #[error("synchronization error: {0}")]
    Sync(String),

    #[error("request pool error: {0}")]
    Pool(String),

    #[error("executor error: {0}")]
    Executor(String),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub fn executor<S: Into<String>>(msg: S) -> Self {
        Error::Executor(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn pool<S: Into<String>>(msg: S) -> Self {
        Error::Pool(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    pub fn sync<S: Into<String>>(msg: S) -> Self {
        Error::Sync(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// The captured user failure, if this is one.
    pub fn task_error(&self) -> Option<&TaskError> {
        match self {
            Error::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// A failure captured from a request body or callback.
///
/// Cloning shares the underlying error, so the same failure (with its whole
/// cause chain) can be replayed to every waiter and every failure callback.
#[derive(Clone)]
pub struct TaskError {
    inner: Arc<anyhow::Error>,
}

impl TaskError {
    pub fn new(err: anyhow::Error) -> Self {
        Self {
            inner: Arc::new(err),
        }
    }

    pub fn msg<M>(msg: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::new(anyhow::Error::msg(msg))
    }

    /// Classify an error that escaped a request body.
    ///
    /// `None` means cooperative cancellation, which is not a failure.
    pub(crate) fn capture(err: anyhow::Error) -> Option<Self> {
        match err.downcast_ref::<Error>() {
            Some(Error::Cancelled) => None,
            Some(Error::Failed(replayed)) => Some(replayed.clone()),
            _ => Some(Self::new(err)),
        }
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.inner.downcast_ref::<E>()
    }

    pub fn chain(&self) -> anyhow::Chain<'_> {
        self.inner.chain()
    }

    pub fn root_cause(&self) -> &(dyn std::error::Error + 'static) {
        self.inner.root_cause()
    }

    pub fn ptr_eq(&self, other: &TaskError) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.inner, f)
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<TaskError> for Error {
    fn from(err: TaskError) -> Self {
        Error::Failed(err)
    }
}
