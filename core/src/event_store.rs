//! Read side of the event store, as consumed by projection runners.
//!
//! Appending, durability and replication belong to the write side and are not
//! modelled here. Runners only need two queries:
//!
//! - which instances have events of the aggregate kinds a projection handles,
//! - the next events of one instance after a checkpoint, in sequence order.
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `projector-postgres`): reads `eventstore.events`
//! - `InMemoryEventStore` (in `projector-testing`): deterministic testing
//!
//! # Example
//!
//! ```no_run
//! use projector_core::aggregate::AggregateType;
//! use projector_core::event_store::{EventQuery, EventStore, EventStoreError};
//!
//! async fn example(store: &dyn EventStore) -> Result<(), EventStoreError> {
//!     let aggregates = [AggregateType::Project, AggregateType::Org];
//!     for instance_id in store.instance_ids(&aggregates).await? {
//!         let query = EventQuery::new(instance_id, 0, 100).aggregate_types(aggregates.to_vec());
//!         let events = store.events_after(&query).await?;
//!         println!("{} events", events.len());
//!     }
//!     Ok(())
//! }
//! ```

use crate::aggregate::{AggregateType, EventType};
use crate::event::Event;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur while reading the event store.
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// Database connection or query error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A stored event could not be turned into an [`Event`].
    #[error("Cannot decode event at sequence {sequence}: {reason}")]
    Decode {
        /// Sequence of the stored event.
        sequence: u64,
        /// What was wrong with it.
        reason: String,
    },
}

impl EventStoreError {
    /// Whether retrying the query later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::DatabaseError(_))
    }
}

/// Filter for one ordered pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    /// Tenant to read.
    pub instance_id: String,

    /// Only events with a strictly greater sequence are returned.
    pub after_sequence: u64,

    /// Aggregate kinds to include; empty means all.
    pub aggregate_types: Vec<AggregateType>,

    /// Event kinds to include; empty means all kinds of the selected aggregates.
    pub event_types: Vec<EventType>,

    /// Maximum number of events returned.
    pub limit: usize,
}

impl EventQuery {
    /// Read at most `limit` events of `instance_id` after `after_sequence`.
    #[must_use]
    pub fn new(instance_id: impl Into<String>, after_sequence: u64, limit: usize) -> Self {
        Self {
            instance_id: instance_id.into(),
            after_sequence,
            aggregate_types: Vec::new(),
            event_types: Vec::new(),
            limit,
        }
    }

    /// Restrict to the given aggregate kinds.
    #[must_use]
    pub fn aggregate_types(mut self, aggregate_types: Vec<AggregateType>) -> Self {
        self.aggregate_types = aggregate_types;
        self
    }

    /// Restrict to the given event kinds.
    #[must_use]
    pub fn event_types(mut self, event_types: Vec<EventType>) -> Self {
        self.event_types = event_types;
        self
    }

    /// Whether `event` passes the filter (ignores sequence and limit).
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        event.instance_id == self.instance_id
            && (self.aggregate_types.is_empty()
                || self.aggregate_types.contains(&event.aggregate_type()))
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
    }
}

/// Read access to the event log.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so runners can share one store as
/// `Arc<dyn EventStore>`.
pub trait EventStore: Send + Sync {
    /// Instances that have at least one event of the given aggregate kinds.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the query fails.
    fn instance_ids<'a>(
        &'a self,
        aggregate_types: &'a [AggregateType],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, EventStoreError>> + Send + 'a>>;

    /// Events of one instance after a sequence, ordered by sequence.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the query fails and
    /// [`EventStoreError::Decode`] if a stored event is malformed.
    fn events_after<'a>(
        &'a self,
        query: &'a EventQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Event>, EventStoreError>> + Send + 'a>>;
}
