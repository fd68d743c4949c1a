use crate::error::{Error, Result};
use crate::executor::PanicStrategy;
use std::time::Duration;

/// How long terminal tasks are kept in the registry.
///
/// Only Success, Failure and Cancelled tasks are ever evicted. `None`
/// disables the corresponding bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed_ttl: Option<Duration>,
    pub max_retained: Option<usize>,
}

impl RetentionPolicy {
    pub fn unbounded() -> Self {
        Self {
            completed_ttl: None,
            max_retained: None,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_ttl: Some(Duration::from_secs(3600)),
            max_retained: Some(10_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Dedicated priority-queue workers.
    pub num_workers: Option<usize>,
    /// Threads in the scatter/gather pool used by `parallel_map`.
    pub max_workers: Option<usize>,
    /// Threads in the chunked compute pool (`use_processes = true`).
    pub max_processes: Option<usize>,
    /// 0 means unbounded.
    pub queue_capacity: usize,

    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub error_pause: Duration,

    pub retention: RetentionPolicy,
    pub panic_strategy: PanicStrategy,

    pub pin_workers: bool,
    pub stack_size: Option<usize>,
    pub thread_name_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_workers: None,
            max_workers: None,
            max_processes: None,
            queue_capacity: 1000,

            poll_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            error_pause: Duration::from_secs(1),

            retention: RetentionPolicy::default(),
            panic_strategy: PanicStrategy::default(),

            pin_workers: false,
            stack_size: Some(2 * 1024 * 1024),
            thread_name_prefix: "taskweave".to_string(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("num_workers", self.num_workers),
            ("max_workers", self.max_workers),
            ("max_processes", self.max_processes),
        ] {
            if let Some(n) = value {
                if n == 0 {
                    return Err(Error::config(format!("{} must be > 0", name)));
                }
                if n > 1024 {
                    return Err(Error::config(format!("{} too large (max 1024)", name)));
                }
            }
        }

        if self.poll_interval.is_zero() {
            return Err(Error::config("poll_interval must be > 0"));
        }

        if self.retention.max_retained == Some(0) {
            return Err(Error::config("retention.max_retained must be > 0"));
        }

        if self.thread_name_prefix.is_empty() {
            return Err(Error::config("thread_name_prefix must not be empty"));
        }

        Ok(())
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
            .unwrap_or_else(|| (num_cpus::get() + 4).min(32))
    }

    pub fn max_processes(&self) -> usize {
        self.max_processes.unwrap_or_else(num_cpus::get)
    }

    pub fn worker_threads(&self) -> usize {
        self.num_workers
            .unwrap_or_else(|| self.max_workers().min(4))
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

    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.num_workers = Some(n);
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.max_workers = Some(n);
        self
    }

    pub fn max_processes(mut self, n: usize) -> Self {
        self.config.max_processes = Some(n);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn error_pause(mut self, pause: Duration) -> Self {
        self.config.error_pause = pause;
        self
    }

    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.config.retention = retention;
        self
    }

    pub fn panic_strategy(mut self, strategy: PanicStrategy) -> Self {
        self.config.panic_strategy = strategy;
        self
    }

    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.config.pin_workers = pin;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
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
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.worker_threads() >= 1);
        assert!(config.worker_threads() <= 4);
        assert!(config.max_workers() <= 32);
        assert_eq!(config.queue_capacity, 1000);
    }

    #[test]
    fn test_builder_rejects_zero_workers() {
        assert!(Config::builder().num_workers(0).build().is_err());
        assert!(Config::builder().max_workers(0).build().is_err());
        assert!(Config::builder().max_processes(2000).build().is_err());
    }

    #[test]
    fn test_builder_overrides() {
        let config = Config::builder()
            .num_workers(2)
            .max_workers(8)
            .max_processes(3)
            .queue_capacity(10)
            .poll_interval(Duration::from_millis(50))
            .thread_name_prefix("test")
            .build()
            .unwrap();

        assert_eq!(config.worker_threads(), 2);
        assert_eq!(config.max_workers(), 8);
        assert_eq!(config.max_processes(), 3);
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.thread_name_prefix, "test");
    }

    #[test]
    fn test_worker_threads_capped_by_max_workers() {
        let config = Config::builder().max_workers(2).build().unwrap();
        assert_eq!(config.worker_threads(), 2);
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let result = Config::builder().poll_interval(Duration::ZERO).build();
        assert!(result.is_err());
    }
}
