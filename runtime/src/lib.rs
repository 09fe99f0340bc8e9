//! # Projector Runtime
//!
//! Runs projections against an event store and a projection storage backend.
//!
//! ## Core Components
//!
//! - **`ProjectionRunner`**: fetch → reduce → apply + checkpoint loop for one projection
//! - **`ProjectionHost`**: provisions tables and runs every registered projection concurrently
//! - **`RunnerConfig`**: batch size, poll interval, lease lifetime, retry policy
//!
//! ## Example
//!
//! ```ignore
//! use projector_runtime::{ProjectionHost, RunnerConfig};
//!
//! let mut host = ProjectionHost::new(events, storage, RunnerConfig::from_env()?);
//! host.register(members)?;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let running = host.start(shutdown_rx).await?;
//! tokio::signal::ctrl_c().await?;
//! shutdown_tx.send(true).ok();
//! running.wait().await?;
//! ```

/// Runner configuration loaded from the builder or environment
pub mod config;

/// Registration and concurrent start of projections
pub mod host;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

/// The per-projection runner state machine
pub mod runner;

pub use config::{ConfigError, RunnerConfig};
pub use host::{HostError, ProjectionHost, RunningHost};
pub use runner::{PassOutcome, ProjectionRunner, RunnerError};
