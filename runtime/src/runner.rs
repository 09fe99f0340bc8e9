//! `ProjectionRunner`: pulls events, reduces them and commits statement batches.
//!
//! # Overview
//!
//! One runner drives one projection. A pass walks every instance that has
//! events of the aggregate kinds the projection handles:
//!
//! ```text
//! Idle ─► Fetching ─► Reducing ─► Applying + Checkpointing ─► Idle
//!            ▲            │
//!            │            └─ Deferred: apply the prefix, stop this instance
//!            └──────────────── next instance
//! ```
//!
//! - Events are fetched strictly after the instance's checkpoint, in sequence
//!   order, restricted to the registered aggregate and event kinds.
//! - A deferred event (dependency not projected yet) ends the batch: earlier
//!   statements commit, the deferred event and everything after it are
//!   fetched again on a later pass.
//! - An invalid event (payload shape mismatch, unusable statement) stops the
//!   runner with [`RunnerError::InvalidEvent`].
//! - Statements and the checkpoint advance commit in one storage transaction.
//!
//! Single writer per projection is enforced twice: by the lease renewed at the
//! start of every pass, and by the compare-and-set checkpoint write.
//!
//! # Example
//!
//! ```ignore
//! let runner = ProjectionRunner::new(Arc::new(members), events, storage, config);
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     shutdown_tx.send(true).ok();
//! });
//!
//! runner.run(shutdown_rx).await?;
//! ```

use crate::config::RunnerConfig;
use crate::metrics::ProjectionMetrics;
use projector_core::event_store::{EventQuery, EventStore, EventStoreError};
use projector_core::projection::{Batch, Projection, ProjectionError, ProjectionStorage};
use projector_core::reducer::{ReduceError, Reduction};
use projector_core::statement::Statement;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

/// Errors that end a pass or the runner.
#[derive(Error, Debug)]
pub enum RunnerError {
    /// An event can never be reduced; the projection cannot move past it.
    #[error("Projection {projection} cannot reduce {event_type} at {instance_id}/{sequence}: {source}")]
    InvalidEvent {
        /// Projection name.
        projection: &'static str,
        /// Tenant of the event.
        instance_id: String,
        /// Sequence of the event.
        sequence: u64,
        /// Event kind.
        event_type: String,
        /// Reducer error.
        #[source]
        source: ReduceError,
    },

    /// Projection storage failed.
    #[error(transparent)]
    Projection(#[from] ProjectionError),

    /// Event store failed.
    #[error(transparent)]
    EventStore(#[from] EventStoreError),
}

impl RunnerError {
    /// Whether the pass may succeed when retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidEvent { .. } => false,
            Self::Projection(e) => e.is_retryable(),
            Self::EventStore(e) => e.is_retryable(),
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassOutcome {
    /// Whether this worker held the lease; nothing is done otherwise.
    pub lease_held: bool,
    /// Instances visited.
    pub instances: usize,
    /// Events committed (including ignored ones that only moved the checkpoint).
    pub applied: usize,
    /// Instances stopped by a deferred event.
    pub deferred: usize,
    /// At least one instance filled a whole batch and likely has more events.
    pub has_more: bool,
}

impl PassOutcome {
    /// Nothing was applied or deferred.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.applied == 0 && self.deferred == 0
    }
}

struct InstancePass {
    applied: usize,
    deferred: bool,
    saturated: bool,
}

/// Drives one projection.
pub struct ProjectionRunner<P>
where
    P: Projection,
{
    projection: Arc<P>,
    events: Arc<dyn EventStore>,
    storage: Arc<dyn ProjectionStorage>,
    config: RunnerConfig,
}

impl<P> ProjectionRunner<P>
where
    P: Projection,
{
    /// Create a runner.
    #[must_use]
    pub fn new(
        projection: Arc<P>,
        events: Arc<dyn EventStore>,
        storage: Arc<dyn ProjectionStorage>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            projection,
            events,
            storage,
            config,
        }
    }

    /// The projection driven by this runner.
    #[must_use]
    pub fn projection(&self) -> &P {
        &self.projection
    }

    /// Run one catch-up pass over every instance.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::InvalidEvent`] if an event can never be reduced,
    /// and storage or event store errors otherwise. A failed pass never leaves
    /// a partially applied batch behind.
    pub async fn run_once(&self) -> Result<PassOutcome, RunnerError> {
        let name = self.projection.name();

        let lease_held = self
            .storage
            .try_lock(name, &self.config.worker_id, self.config.lock_ttl)
            .await?;
        if !lease_held {
            tracing::debug!(
                projection = name,
                worker_id = %self.config.worker_id,
                "Lease held by another worker"
            );
            return Ok(PassOutcome::default());
        }

        let aggregate_types = self.projection.registry().aggregate_types();
        let instance_ids = self.events.instance_ids(&aggregate_types).await?;

        let mut outcome = PassOutcome {
            lease_held: true,
            ..PassOutcome::default()
        };
        for instance_id in &instance_ids {
            let pass = self.run_instance(instance_id).await?;
            outcome.instances += 1;
            outcome.applied += pass.applied;
            outcome.deferred += usize::from(pass.deferred);
            outcome.has_more |= pass.saturated;
        }

        Ok(outcome)
    }

    async fn run_instance(&self, instance_id: &str) -> Result<InstancePass, RunnerError> {
        let name = self.projection.name();
        let registry = self.projection.registry();
        let started = Instant::now();

        let previous = self.storage.load_checkpoint(name, instance_id).await?;
        let query = EventQuery::new(
            instance_id,
            previous.map_or(0, |checkpoint| checkpoint.sequence),
            self.config.batch_size,
        )
        .aggregate_types(registry.aggregate_types())
        .event_types(registry.event_types());
        let events = self.events.events_after(&query).await?;

        let mut batch = Batch::new(name, instance_id, previous);
        let mut deferred = false;
        let mut invalid = None;

        for event in &events {
            match self.projection.reduce(event).await {
                Reduction::Applied(statement) => batch.push(statement),
                Reduction::Ignored => batch.push(Statement::no_op(event)),
                Reduction::Deferred(error) => {
                    tracing::info!(
                        projection = name,
                        instance_id,
                        sequence = event.sequence,
                        event_type = %event.event_type,
                        error = %error,
                        "Event deferred, dependency not projected yet"
                    );
                    ProjectionMetrics::record_deferred(name);
                    deferred = true;
                    break;
                }
                Reduction::Invalid(error) => {
                    invalid = Some(RunnerError::InvalidEvent {
                        projection: name,
                        instance_id: instance_id.to_string(),
                        sequence: event.sequence,
                        event_type: event.event_type.to_string(),
                        source: error,
                    });
                    break;
                }
            }
        }

        if !batch.is_empty() {
            self.storage.apply(&batch).await?;

            if let Some(checkpoint) = batch.next_checkpoint() {
                ProjectionMetrics::record_checkpoint(name, instance_id, checkpoint.sequence);
                tracing::debug!(
                    projection = name,
                    instance_id,
                    statements = batch.len(),
                    sequence = checkpoint.sequence,
                    "Batch applied"
                );
            }
            ProjectionMetrics::record_batch(name, batch.len(), started.elapsed());
        }

        if let Some(error) = invalid {
            return Err(error);
        }

        Ok(InstancePass {
            applied: batch.len(),
            deferred,
            saturated: !deferred && events.len() >= self.config.batch_size,
        })
    }

    /// Run passes until `shutdown` turns `true` or the sender is dropped.
    ///
    /// Transient failures and deferred events are retried with the
    /// configured backoff. A batch in flight when shutdown arrives is
    /// abandoned without committing.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable [`RunnerError`].
    #[allow(clippy::cognitive_complexity)]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), RunnerError> {
        let name = self.projection.name();
        tracing::info!(
            projection = name,
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            "Starting projection runner"
        );

        let mut failures = 0_usize;
        let mut deferrals = 0_usize;

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            let pass = tokio::select! {
                pass = self.run_once() => pass,
                _ = shutdown.changed() => break Ok(()),
            };

            let delay = match pass {
                Ok(outcome) => {
                    failures = 0;
                    if outcome.has_more {
                        Duration::ZERO
                    } else if outcome.deferred > 0 {
                        deferrals += 1;
                        self.config.retry.delay_for_attempt(deferrals - 1)
                    } else {
                        deferrals = 0;
                        self.config.poll_interval
                    }
                }
                Err(error) if error.is_retryable() => {
                    failures += 1;
                    ProjectionMetrics::record_failure(name);
                    let delay = self.config.retry.delay_for_attempt(failures - 1);
                    tracing::warn!(
                        projection = name,
                        attempt = failures,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "Projection pass failed, retrying"
                    );
                    delay
                }
                Err(error) => {
                    ProjectionMetrics::record_failure(name);
                    tracing::error!(projection = name, error = %error, "Projection runner stopped");
                    break Err(error);
                }
            };

            if !delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break Ok(()),
                }
            }
        };

        if let Err(error) = self
            .storage
            .unlock(name, &self.config.worker_id)
            .await
        {
            tracing::warn!(projection = name, error = %error, "Failed to release lease");
        }
        tracing::info!(projection = name, "Projection runner stopped");
        result
    }

    /// Drop the projection's rows and checkpoints so the next pass replays
    /// the event log from the start.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::LockLost`] if another worker holds the lease,
    /// and storage errors otherwise.
    pub async fn rebuild(&self) -> Result<(), RunnerError> {
        let name = self.projection.name();
        tracing::info!(projection = name, "Rebuilding projection");

        let held = self
            .storage
            .try_lock(name, &self.config.worker_id, self.config.lock_ttl)
            .await?;
        if !held {
            return Err(ProjectionError::LockLost {
                projection: name.to_string(),
                worker_id: self.config.worker_id.clone(),
            }
            .into());
        }

        self.storage.reset(name, self.projection.table()).await?;

        tracing::info!(
            projection = name,
            "Projection reset - next pass replays from the beginning"
        );
        Ok(())
    }
}
