//! `ProjectionHost`: registers projections and runs them side by side.
//!
//! The host owns the shared event store, projection storage and runner
//! configuration. [`ProjectionHost::start`] provisions every table first and
//! refuses to start anything if one definition is invalid; then it spawns one
//! tokio task per projection. All tasks observe the same shutdown channel.
//!
//! # Example
//!
//! ```ignore
//! let mut host = ProjectionHost::new(events, storage, RunnerConfig::from_env()?);
//! host.register(UserOwners::new()?)?;
//! host.register(ProjectGrantMembers::new(reader)?)?;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let running = host.start(shutdown_rx).await?;
//! // ...
//! shutdown_tx.send(true).ok();
//! running.wait().await?;
//! ```

use crate::config::RunnerConfig;
use crate::retry::retry_with_predicate;
use crate::runner::{ProjectionRunner, RunnerError};
use futures::future::join_all;
use projector_core::event_store::EventStore;
use projector_core::projection::{Projection, ProjectionError, ProjectionStorage};
use projector_core::schema::Table;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Host lifecycle errors.
#[derive(Error, Debug)]
pub enum HostError {
    /// Two projections share a name.
    #[error("Projection {0} is registered twice")]
    DuplicateProjection(&'static str),

    /// A table could not be provisioned; nothing was started.
    #[error("Cannot provision table for projection {projection}: {source}")]
    Provisioning {
        /// Projection name.
        projection: &'static str,
        /// Storage error.
        #[source]
        source: ProjectionError,
    },

    /// A runner stopped with an error.
    #[error("Projection {projection} failed: {source}")]
    Runner {
        /// Projection name.
        projection: &'static str,
        /// Runner error.
        #[source]
        source: RunnerError,
    },

    /// A runner task panicked or was cancelled.
    #[error("Projection {projection} task aborted: {reason}")]
    TaskAborted {
        /// Projection name.
        projection: &'static str,
        /// Join error message.
        reason: String,
    },
}

type RunFuture = Pin<Box<dyn Future<Output = Result<(), RunnerError>> + Send>>;

/// Type-erased view of a runner, so one host can drive projections of different types.
trait HostedRunner: Send + Sync {
    fn name(&self) -> &'static str;
    fn table(&self) -> &Table;
    fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> RunFuture;
}

impl<P> HostedRunner for ProjectionRunner<P>
where
    P: Projection,
{
    fn name(&self) -> &'static str {
        self.projection().name()
    }

    fn table(&self) -> &Table {
        self.projection().table()
    }

    fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> RunFuture {
        Box::pin(async move { ProjectionRunner::run(&self, shutdown).await })
    }
}

/// Registers projections and starts one runner per projection.
pub struct ProjectionHost {
    events: Arc<dyn EventStore>,
    storage: Arc<dyn ProjectionStorage>,
    config: RunnerConfig,
    runners: Vec<Arc<dyn HostedRunner>>,
}

impl ProjectionHost {
    /// Create a host without projections.
    #[must_use]
    pub fn new(
        events: Arc<dyn EventStore>,
        storage: Arc<dyn ProjectionStorage>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            events,
            storage,
            config,
            runners: Vec::new(),
        }
    }

    /// Register a projection.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::DuplicateProjection`] if the name is taken.
    pub fn register<P>(&mut self, projection: P) -> Result<&mut Self, HostError>
    where
        P: Projection,
    {
        let name = projection.name();
        if self.projections().contains(&name) {
            return Err(HostError::DuplicateProjection(name));
        }

        let runner = ProjectionRunner::new(
            Arc::new(projection),
            Arc::clone(&self.events),
            Arc::clone(&self.storage),
            self.config.clone(),
        );
        self.runners.push(Arc::new(runner));
        Ok(self)
    }

    /// Names of the registered projections, in registration order.
    #[must_use]
    pub fn projections(&self) -> Vec<&'static str> {
        self.runners.iter().map(|runner| runner.name()).collect()
    }

    /// Provision every table, then spawn one runner task per projection.
    ///
    /// Transient provisioning failures are retried with the configured
    /// policy; invalid definitions fail immediately.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Provisioning`] if a table cannot be provisioned.
    /// No runner is started in that case.
    pub async fn start(self, shutdown: watch::Receiver<bool>) -> Result<RunningHost, HostError> {
        for runner in &self.runners {
            let projection = runner.name();
            retry_with_predicate(
                &self.config.retry,
                || self.storage.ensure_table(runner.table()),
                ProjectionError::is_retryable,
            )
            .await
            .map_err(|source| HostError::Provisioning { projection, source })?;

            tracing::info!(projection, table = runner.table().name, "Projection table ready");
        }

        let tasks = self
            .runners
            .into_iter()
            .map(|runner| {
                let projection = runner.name();
                let handle = tokio::spawn(runner.run(shutdown.clone()));
                (projection, handle)
            })
            .collect();

        Ok(RunningHost { tasks })
    }
}

/// Handles of the spawned runner tasks.
pub struct RunningHost {
    tasks: Vec<(&'static str, JoinHandle<Result<(), RunnerError>>)>,
}

impl RunningHost {
    /// Names of the running projections.
    #[must_use]
    pub fn projections(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|(name, _)| *name).collect()
    }

    /// Wait for every runner to stop.
    ///
    /// # Errors
    ///
    /// Returns the first runner failure, after all tasks have finished.
    pub async fn wait(self) -> Result<(), HostError> {
        let (names, handles): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        let results = join_all(handles).await;

        let mut first_error = None;
        for (projection, result) in names.into_iter().zip(results) {
            let error = match result {
                Ok(Ok(())) => continue,
                Ok(Err(source)) => HostError::Runner { projection, source },
                Err(join_error) => HostError::TaskAborted {
                    projection,
                    reason: join_error.to_string(),
                },
            };
            tracing::error!(projection, error = %error, "Projection stopped with error");
            first_error.get_or_insert(error);
        }

        first_error.map_or(Ok(()), Err)
    }
}
