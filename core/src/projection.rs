//! Projections and the storage they write to.
//!
//! # Overview
//!
//! A projection turns the event log into a relational read model. It declares
//! three things and nothing else:
//!
//! - a unique **name**, used for checkpoints and the writer lease,
//! - the **table** it owns,
//! - the **reducer registry** mapping event kinds to statements.
//!
//! Everything stateful lives behind [`ProjectionStorage`]: provisioning the
//! table, reading checkpoints, applying statement batches, and the
//! single-writer lease.
//!
//! ```text
//! EventStore ──► Runner ──► ReducerRegistry ──► Statement batch
//!                  │                                  │
//!                  └──── ProjectionStorage::apply ◄───┘
//!                        (statements + checkpoint, one transaction)
//! ```
//!
//! # Checkpoints
//!
//! A checkpoint is kept per (projection, instance). [`ProjectionStorage::apply`]
//! writes it conditionally: the stored value must still equal
//! [`Batch::previous`], otherwise the whole batch is rolled back with
//! [`ProjectionError::CheckpointConflict`].
//!
//! # Dyn Compatibility
//!
//! Storage traits return `Pin<Box<dyn Future>>` so runners can hold them as
//! `Arc<dyn ProjectionStorage>`.

use crate::event::Event;
use crate::reducer::{ReducerRegistry, Reduction, RegistryError};
use crate::schema::{SchemaError, Table};
use crate::statement::{Condition, Statement, StatementError};
use crate::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Error type for projection storage operations.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Checkpoint could not be read or written
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Another writer advanced the checkpoint first
    #[error(
        "Checkpoint conflict for {projection}/{instance_id}: expected {expected:?}, found {actual:?}"
    )]
    CheckpointConflict {
        /// Projection name.
        projection: String,
        /// Tenant.
        instance_id: String,
        /// Sequence the batch was built on.
        expected: Option<u64>,
        /// Sequence found in storage.
        actual: Option<u64>,
    },

    /// The writer lease is held by another worker
    #[error("Lock for {projection} is held by another worker than {worker_id}")]
    LockLost {
        /// Projection name.
        projection: String,
        /// Worker that expected to hold the lease.
        worker_id: String,
    },

    /// Invalid table definition
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Invalid reducer registration
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Statement cannot be executed
    #[error("Statement error: {0}")]
    Statement(#[from] StatementError),
}

impl ProjectionError {
    /// Whether retrying the same batch later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::Checkpoint(_)
                | Self::CheckpointConflict { .. }
                | Self::LockLost { .. }
        )
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// Boxed future returned by the storage traits.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A read model built from events.
///
/// # Example
///
/// ```ignore
/// struct Users {
///     table: Table,
///     registry: ReducerRegistry<Self>,
/// }
///
/// impl Projection for Users {
///     fn name(&self) -> &'static str {
///         "projections.users"
///     }
///
///     fn table(&self) -> &Table {
///         &self.table
///     }
///
///     fn registry(&self) -> &ReducerRegistry<Self> {
///         &self.registry
///     }
/// }
/// ```
pub trait Projection: Send + Sync + Sized + 'static {
    /// Unique projection name (used for checkpoints and the writer lease).
    fn name(&self) -> &'static str;

    /// The table this projection owns.
    fn table(&self) -> &Table;

    /// Reducers for the events this projection consumes.
    fn registry(&self) -> &ReducerRegistry<Self>;

    /// Reduce one event through the registry.
    fn reduce<'a>(&'a self, event: &'a Event) -> impl Future<Output = Reduction> + Send + 'a {
        self.registry().reduce(self, event)
    }
}

/// Position of a projection in one instance's event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Sequence of the last applied event.
    pub sequence: u64,

    /// Creation date of the last applied event.
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a checkpoint.
    #[must_use]
    pub const fn new(sequence: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            sequence,
            timestamp,
        }
    }
}

/// Statements of one instance, committed together with the checkpoint advance.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Projection name.
    pub projection: &'static str,

    /// Tenant all statements belong to.
    pub instance_id: String,

    /// Checkpoint the batch was built on; `None` if the projection never ran for this instance.
    pub previous: Option<Checkpoint>,

    /// Statements in event order.
    pub statements: Vec<Statement>,
}

impl Batch {
    /// Start an empty batch on top of `previous`.
    #[must_use]
    pub fn new(
        projection: &'static str,
        instance_id: impl Into<String>,
        previous: Option<Checkpoint>,
    ) -> Self {
        Self {
            projection,
            instance_id: instance_id.into(),
            previous,
            statements: Vec::new(),
        }
    }

    /// Append a statement.
    pub fn push(&mut self, statement: Statement) {
        self.statements.push(statement);
    }

    /// Whether nothing was reduced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Number of statements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    /// Checkpoint stored when the batch commits.
    #[must_use]
    pub fn next_checkpoint(&self) -> Option<Checkpoint> {
        self.statements
            .last()
            .map(|last| Checkpoint::new(last.sequence, last.created_at))
    }
}

/// Storage backend for projection tables, checkpoints and leases.
pub trait ProjectionStorage: Send + Sync {
    /// Create the table and its indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Schema`] for invalid definitions and
    /// [`ProjectionError::Storage`] if provisioning fails.
    fn ensure_table<'a>(&'a self, table: &'a Table) -> StorageFuture<'a, ()>;

    /// Load the checkpoint of `projection` for one instance.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] if the read fails.
    fn load_checkpoint<'a>(
        &'a self,
        projection: &'a str,
        instance_id: &'a str,
    ) -> StorageFuture<'a, Option<Checkpoint>>;

    /// Apply every statement of the batch and advance the checkpoint, atomically.
    ///
    /// An empty batch is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::CheckpointConflict`] if the stored checkpoint
    /// differs from [`Batch::previous`], [`ProjectionError::Statement`] for
    /// unusable statements, and [`ProjectionError::Storage`] otherwise. Nothing
    /// is written when an error is returned.
    fn apply<'a>(&'a self, batch: &'a Batch) -> StorageFuture<'a, ()>;

    /// Acquire or renew the writer lease of `projection` for `ttl`.
    ///
    /// Returns `false` if another worker holds an unexpired lease.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the lease cannot be written.
    fn try_lock<'a>(
        &'a self,
        projection: &'a str,
        worker_id: &'a str,
        ttl: Duration,
    ) -> StorageFuture<'a, bool>;

    /// Release the lease if `worker_id` holds it.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the lease cannot be released.
    fn unlock<'a>(&'a self, projection: &'a str, worker_id: &'a str) -> StorageFuture<'a, ()>;

    /// Remove every row of `table` and every checkpoint of `projection`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the reset fails.
    fn reset<'a>(&'a self, projection: &'a str, table: &'a Table) -> StorageFuture<'a, ()>;
}

/// Read access to the current state of projection tables.
///
/// Reducers use it to resolve denormalized fields from other projections.
pub trait ProjectionReader: Send + Sync {
    /// Read a text column of the first row of `table` matching all conditions.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the query fails.
    fn select_text<'a>(
        &'a self,
        table: &'static str,
        column: &'static str,
        conditions: &'a [Condition],
    ) -> StorageFuture<'a, Option<String>>;

    /// Checkpoint of `projection` for one instance, to tell a lagging
    /// projection from one that already applied a removal.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] if the read fails.
    fn read_checkpoint<'a>(
        &'a self,
        projection: &'a str,
        instance_id: &'a str,
    ) -> StorageFuture<'a, Option<Checkpoint>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::ProjectEventType;

    #[test]
    fn next_checkpoint_follows_last_statement() {
        let mut batch = Batch::new("members", "instance-1", None);
        assert_eq!(batch.next_checkpoint(), None);

        for sequence in [3, 5] {
            let event = Event::builder("instance-1", ProjectEventType::GrantChanged, "p")
                .sequence(sequence)
                .build();
            batch.push(Statement::no_op(&event));
        }

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.next_checkpoint().map(|c| c.sequence), Some(5));
    }

    #[test]
    fn retryable_errors() {
        assert!(ProjectionError::Storage("down".into()).is_retryable());
        assert!(ProjectionError::LockLost {
            projection: "p".into(),
            worker_id: "w".into()
        }
        .is_retryable());
        assert!(!ProjectionError::Schema(SchemaError::NoColumns("t".into())).is_retryable());
    }
}
