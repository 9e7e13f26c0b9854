use crate::error::{Error, Result, TaskError};
use std::fmt;
use std::sync::Arc;

/// Environment variable consulted by [`Config::from_env`].
pub const THREADS_ENV_VAR: &str = "VEDA_REQUEST_THREADS";

/// More workers than this rarely helps the request workloads.
const DEFAULT_MAX_THREADS: usize = 8;

/// Called with a failure that nobody observed: no failure callback, no
/// suspended waiter and no blocked foreign thread.
pub type UnhandledFailureHook = Arc<dyn Fn(&TaskError) + Send + Sync>;

#[derive(Clone)]
pub struct Config {
    /// `Some(0)` selects the synchronous debug mode.
    pub num_threads: Option<usize>,
    pub stack_size: Option<usize>,
    pub thread_name_prefix: String,

    /// Chance that a contended `RequestLock` release favours a blocked OS
    /// thread over a suspended request.
    pub lock_thread_bias: f64,

    /// `RequestPool` concurrency when none is given; defaults to the worker count.
    pub default_max_active: Option<usize>,

    pub unhandled_failure_hook: Option<UnhandledFailureHook>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_threads: None,
            stack_size: Some(2 * 1024 * 1024),
            thread_name_prefix: "veda-request".to_string(),
            lock_thread_bias: 0.5,
            default_max_active: None,
            unhandled_failure_hook: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("num_threads", &self.num_threads)
            .field("stack_size", &self.stack_size)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("lock_thread_bias", &self.lock_thread_bias)
            .field("default_max_active", &self.default_max_active)
            .field("unhandled_failure_hook", &self.unhandled_failure_hook.is_some())
            .finish()
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Defaults overridden by `VEDA_REQUEST_THREADS`, if set.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        if let Ok(raw) = std::env::var(THREADS_ENV_VAR) {
            let n = raw.trim().parse::<usize>().map_err(|e| {
                Error::config(format!("{}={:?} is not a thread count: {}", THREADS_ENV_VAR, raw, e))
            })?;
            config.num_threads = Some(n);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(n) = self.num_threads {
            if n > 1024 {
                return Err(Error::config("num_threads too large (max 1024)"));
            }
        }

        if !(0.0..=1.0).contains(&self.lock_thread_bias) {
            return Err(Error::config("lock_thread_bias must be in [0, 1]"));
        }

        if self.default_max_active == Some(0) {
            return Err(Error::config("default_max_active must be > 0"));
        }

        Ok(())
    }

    pub fn worker_threads(&self) -> usize {
        self.num_threads
            .unwrap_or_else(|| num_cpus::get().min(DEFAULT_MAX_THREADS))
    }

    pub fn is_synchronous(&self) -> bool {
        self.worker_threads() == 0
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.config.num_threads = Some(n);
        self
    }

    /// Zero workers: every request runs in-line on the thread that submits or
    /// waits on it.
    pub fn synchronous(self) -> Self {
        self.num_threads(0)
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn lock_thread_bias(mut self, bias: f64) -> Self {
        self.config.lock_thread_bias = bias;
        self
    }

    pub fn default_max_active(mut self, n: usize) -> Self {
        self.config.default_max_active = Some(n);
        self
    }

    pub fn on_unhandled_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TaskError) + Send + Sync + 'static,
    {
        self.config.unhandled_failure_hook = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.worker_threads() >= 1);
        assert!(config.worker_threads() <= DEFAULT_MAX_THREADS);
    }

    #[test]
    fn test_zero_threads_is_synchronous() {
        let config = Config::builder().synchronous().build().unwrap();
        assert_eq!(config.worker_threads(), 0);
        assert!(config.is_synchronous());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::builder().num_threads(2000).build().is_err());
        assert!(Config::builder().lock_thread_bias(1.5).build().is_err());
        assert!(Config::builder().default_max_active(0).build().is_err());
    }

    #[test]
    fn test_from_env() {
        // Only this test touches the variable.
        std::env::set_var(THREADS_ENV_VAR, " 3 ");
        assert_eq!(Config::from_env().unwrap().num_threads, Some(3));

        std::env::set_var(THREADS_ENV_VAR, "0");
        assert!(Config::from_env().unwrap().is_synchronous());

        std::env::set_var(THREADS_ENV_VAR, "lots");
        assert!(matches!(Config::from_env(), Err(Error::Config(_))));

        std::env::set_var(THREADS_ENV_VAR, "5000");
        assert!(Config::from_env().is_err());

        std::env::remove_var(THREADS_ENV_VAR);
        assert_eq!(Config::from_env().unwrap().num_threads, None);
    }

    #[test]
    fn test_debug_hides_hook() {
        let config = Config::builder()
            .on_unhandled_failure(|_| {})
            .build()
            .unwrap();
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("unhandled_failure_hook: true"));
    }
}
