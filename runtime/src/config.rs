//! Projection runner configuration.
//!
//! Every runner started by a host shares one [`RunnerConfig`]. Values come
//! from the builder or from `PROJECTOR_*` environment variables:
//!
//! | variable | default |
//! |---|---|
//! | `PROJECTOR_BATCH_SIZE` | 200 |
//! | `PROJECTOR_POLL_INTERVAL_MS` | 1000 |
//! | `PROJECTOR_LOCK_TTL_SECS` | 30 |
//! | `PROJECTOR_WORKER_ID` | random |
//! | `PROJECTOR_RETRY_INITIAL_MS` | 100 |
//! | `PROJECTOR_RETRY_MAX_MS` | 30000 |

use crate::retry::RetryPolicy;
use rand::Rng;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
    },

    /// The configuration is inconsistent.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Runner settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    /// Maximum number of events fetched per instance and pass.
    pub batch_size: usize,
    /// Pause between passes when there is nothing to do.
    pub poll_interval: Duration,
    /// Lifetime of the writer lease; renewed every pass.
    pub lock_ttl: Duration,
    /// Identity written into the lease row.
    pub worker_id: String,
    /// Backoff after deferred events and transient failures.
    pub retry: RetryPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            poll_interval: Duration::from_secs(1),
            lock_ttl: Duration::from_secs(30),
            worker_id: random_worker_id(),
            retry: RetryPolicy::builder()
                .initial_delay(Duration::from_millis(100))
                .max_delay(Duration::from_secs(30))
                .multiplier(2.0)
                .jitter(true)
                .build(),
        }
    }
}

impl RunnerConfig {
    /// Start from the defaults.
    #[must_use]
    pub fn builder() -> RunnerConfigBuilder {
        RunnerConfigBuilder {
            config: Self::default(),
        }
    }

    /// Load the configuration from `PROJECTOR_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable cannot be parsed or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Load the configuration through a variable lookup function.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable cannot be parsed or the result is invalid.
    pub fn from_env_with<F>(get_env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(batch_size) = parse(&get_env, "PROJECTOR_BATCH_SIZE")? {
            config.batch_size = batch_size;
        }
        if let Some(ms) = parse(&get_env, "PROJECTOR_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse(&get_env, "PROJECTOR_LOCK_TTL_SECS")? {
            config.lock_ttl = Duration::from_secs(secs);
        }
        if let Some(worker_id) = get_env("PROJECTOR_WORKER_ID").filter(|id| !id.is_empty()) {
            config.worker_id = worker_id;
        }
        if let Some(ms) = parse(&get_env, "PROJECTOR_RETRY_INITIAL_MS")? {
            config.retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&get_env, "PROJECTOR_RETRY_MAX_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the values for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "batch_size must be > 0".to_string(),
            ));
        }
        if self.lock_ttl.is_zero() {
            return Err(ConfigError::ValidationError(
                "lock_ttl must be > 0".to_string(),
            ));
        }
        if self.worker_id.is_empty() {
            return Err(ConfigError::ValidationError(
                "worker_id must not be empty".to_string(),
            ));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(ConfigError::ValidationError(
                "retry initial delay exceeds max delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`RunnerConfig`].
#[derive(Debug, Clone)]
pub struct RunnerConfigBuilder {
    config: RunnerConfig,
}

impl RunnerConfigBuilder {
    /// Set the batch size.
    #[must_use]
    pub const fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Set the idle poll interval.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the lease lifetime.
    #[must_use]
    pub const fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.config.lock_ttl = ttl;
        self
    }

    /// Set the worker identity.
    #[must_use]
    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.config.worker_id = worker_id.into();
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the values are inconsistent.
    pub fn build(self) -> Result<RunnerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn parse<T, F>(get_env: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    get_env(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue { name, value })
        })
        .transpose()
}

fn random_worker_id() -> String {
    format!("projector-{:016x}", rand::thread_rng().r#gen::<u64>())
}
