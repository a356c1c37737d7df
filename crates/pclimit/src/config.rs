//! Queue and limiter configuration
//!
//! Both configs follow the same shape: `Default`, builder-style `with_*`
//! setters, `validate()`, serde support (durations as milliseconds) and
//! `from_env()`.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::QueueError;

/// Number of worker loops
pub const ENV_CONCURRENCY: &str = "PCLIMIT_CONCURRENCY";
/// Channel capacity (unset = unbounded)
pub const ENV_CAPACITY: &str = "PCLIMIT_CAPACITY";
/// Drain deadline in milliseconds (unset = wait forever)
pub const ENV_DRAIN_TIMEOUT_MS: &str = "PCLIMIT_DRAIN_TIMEOUT_MS";
/// Report failed items when draining ("true" or "1")
pub const ENV_FAIL_ON_WORKER_ERRORS: &str = "PCLIMIT_FAIL_ON_WORKER_ERRORS";

/// Default concurrency when none is configured
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Configuration for a [`BoundedQueue`](crate::queue::BoundedQueue)
///
/// # Example
///
/// ```
/// use pclimit::QueueConfig;
/// use std::time::Duration;
///
/// let config = QueueConfig::new(4)
///     .with_capacity(128)
///     .with_drain_timeout(Duration::from_secs(30));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of items executing at the same time
    pub concurrency: usize,

    /// Channel capacity; `None` means unbounded
    #[serde(default)]
    pub capacity: Option<usize>,

    /// How long `drain_and_stop` waits before aborting the workers
    #[serde(default, with = "option_duration_millis")]
    pub drain_timeout: Option<Duration>,

    /// Prefix for worker names in logs (`{prefix}-{index}`)
    #[serde(default = "default_worker_prefix")]
    pub worker_prefix: String,
}

fn default_worker_prefix() -> String {
    "worker".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            capacity: None,
            drain_timeout: None,
            worker_prefix: default_worker_prefix(),
        }
    }
}

impl QueueConfig {
    /// Create a configuration with the given concurrency
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Bound the channel; `submit` reports `Full` and `submit_wait` suspends when it is full
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Abort workers still running after this long into a drain
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    /// Set the worker name prefix
    pub fn with_worker_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_prefix = prefix.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.concurrency == 0 {
            return Err(QueueError::InvalidConfiguration(
                "concurrency must be positive".into(),
            ));
        }
        if self.capacity == Some(0) {
            return Err(QueueError::InvalidConfiguration(
                "capacity must be positive when set".into(),
            ));
        }
        Ok(())
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `PCLIMIT_CONCURRENCY`: worker count (default: 2)
    /// - `PCLIMIT_CAPACITY`: channel capacity (default: unbounded)
    /// - `PCLIMIT_DRAIN_TIMEOUT_MS`: drain deadline (default: none)
    pub fn from_env() -> Result<Self, QueueError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, QueueError> {
        let config = Self {
            concurrency: parse_var(&lookup, ENV_CONCURRENCY)?.unwrap_or(DEFAULT_CONCURRENCY),
            capacity: parse_var(&lookup, ENV_CAPACITY)?,
            drain_timeout: parse_var::<u64>(&lookup, ENV_DRAIN_TIMEOUT_MS)?
                .map(Duration::from_millis),
            worker_prefix: default_worker_prefix(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Configuration for a [`ConcurrencyLimiter`](crate::limiter::ConcurrencyLimiter)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimiterConfig {
    /// Underlying queue settings
    #[serde(flatten)]
    pub queue: QueueConfig,

    /// Return an error from `drain_and_stop` when any item failed
    #[serde(default)]
    pub fail_on_worker_errors: bool,
}

impl LimiterConfig {
    /// Create a configuration with the given concurrency
    pub fn new(concurrency: usize) -> Self {
        Self {
            queue: QueueConfig::new(concurrency),
            fail_on_worker_errors: false,
        }
    }

    /// Bound the underlying channel
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.queue = self.queue.with_capacity(capacity);
        self
    }

    /// Set the drain deadline
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.queue = self.queue.with_drain_timeout(timeout);
        self
    }

    /// Report item failures when draining
    pub fn with_fail_on_worker_errors(mut self, enabled: bool) -> Self {
        self.fail_on_worker_errors = enabled;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), QueueError> {
        self.queue.validate()
    }

    /// Create configuration from environment variables
    ///
    /// Reads everything [`QueueConfig::from_env`] reads, plus
    /// `PCLIMIT_FAIL_ON_WORKER_ERRORS`.
    pub fn from_env() -> Result<Self, QueueError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, QueueError> {
        let fail_on_worker_errors = lookup(ENV_FAIL_ON_WORKER_ERRORS)
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            queue: QueueConfig::from_lookup(lookup)?,
            fail_on_worker_errors,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, QueueError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse().map(Some).map_err(|e| {
            QueueError::InvalidConfiguration(format!("{key}={raw:?} is not valid: {e}"))
        }),
        _ => Ok(None),
    }
}

/// Serde support for Option<Duration> as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
