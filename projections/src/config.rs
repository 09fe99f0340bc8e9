//! Service configuration of the `projector` binary.
//!
//! | variable | required | meaning |
//! |---|---|---|
//! | `DATABASE_URL` | yes | projection database |
//! | `EVENTSTORE_DATABASE_URL` | no | event store database, defaults to `DATABASE_URL` |
//! | `PROJECTOR_METRICS_ADDR` | no | Prometheus listen address, metrics off when unset |
//! | `PROJECTOR_*` | no | runner settings, see [`RunnerConfig`] |

use projector_runtime::{ConfigError, RunnerConfig};
use std::net::SocketAddr;

/// Everything the binary needs to start.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Projection database.
    pub database_url: String,
    /// Event store database.
    pub eventstore_database_url: String,
    /// Prometheus listen address.
    pub metrics_addr: Option<SocketAddr>,
    /// Runner settings shared by every projection.
    pub runner: RunnerConfig,
}

impl ServiceConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Load through a variable lookup function.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or a value is invalid.
    pub fn from_env_with<F>(get_env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = get_env("DATABASE_URL")
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ConfigError::ValidationError("DATABASE_URL is required".to_string()))?;
        let eventstore_database_url = get_env("EVENTSTORE_DATABASE_URL")
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| database_url.clone());
        let metrics_addr = get_env("PROJECTOR_METRICS_ADDR")
            .map(|value| {
                value.parse().map_err(|_| ConfigError::InvalidValue {
                    name: "PROJECTOR_METRICS_ADDR",
                    value,
                })
            })
            .transpose()?;

        Ok(Self {
            database_url,
            eventstore_database_url,
            metrics_addr,
            runner: RunnerConfig::from_env_with(get_env)?,
        })
    }
}
