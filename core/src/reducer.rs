//! Reducers and the reducer registry.
//!
//! A reducer turns one [`Event`] into one [`Statement`]. Projections declare
//! their reducers grouped by aggregate kind, then by event kind, and the
//! resulting [`ReducerRegistry`] is an immutable value built once when the
//! projection is constructed.
//!
//! Reducers come in two flavours:
//!
//! - [`ReduceFn::Pure`]: synchronous, derives the statement from the event alone.
//! - [`ReduceFn::Lookup`]: asynchronous, reads the current state of other
//!   projections before building the statement.
//!
//! Dispatch returns a [`Reduction`], which the runner consumes:
//!
//! ```text
//! Applied(statement)  -> queue for the batch transaction
//! Ignored             -> no reducer registered, checkpoint moves on
//! Deferred(error)     -> dependency not projected yet, stop batch and retry later
//! Invalid(error)      -> wiring bug, stop the projection
//! ```
//!
//! # Example
//!
//! ```
//! use projector_core::aggregate::{AggregateType, OrgEventType};
//! use projector_core::event::Event;
//! use projector_core::reducer::{AggregateReducer, EventReducer, ReduceResult, ReducerRegistry};
//! use projector_core::statement::{Condition, Statement};
//!
//! struct Users;
//!
//! impl Users {
//!     fn reduce_org_removed(&self, event: &Event) -> ReduceResult {
//!         Ok(Statement::delete(
//!             event,
//!             "users",
//!             vec![Condition::new("resource_owner", event.aggregate_id.as_str())],
//!         ))
//!     }
//! }
//!
//! let registry = ReducerRegistry::new(vec![AggregateReducer::new(
//!     AggregateType::Org,
//!     vec![EventReducer::pure(OrgEventType::Removed, Users::reduce_org_removed)],
//! )])
//! .unwrap();
//!
//! assert_eq!(registry.aggregate_types(), vec![AggregateType::Org]);
//! ```

use crate::aggregate::{AggregateType, EventType};
use crate::event::Event;
use crate::statement::{Statement, StatementError};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

/// Why a reducer could not produce a statement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReduceError {
    /// The payload does not have the structure the reducer expects.
    #[error("Unexpected payload for {event_type} at sequence {sequence}: {reason}")]
    ShapeMismatch {
        /// Event kind.
        event_type: EventType,
        /// Sequence of the offending event.
        sequence: u64,
        /// Decoder message.
        reason: String,
    },

    /// A value the reducer needs has not been projected by its owning projection yet.
    #[error("{dependency} {key} is not projected yet")]
    Unresolved {
        /// What was looked up (`user resource owner`, `granted org`, ...).
        dependency: &'static str,
        /// Key of the missing row.
        key: String,
    },

    /// Reading another projection failed.
    #[error("Lookup failed: {0}")]
    Lookup(String),

    /// The reducer produced an operation that cannot be executed.
    #[error("Invalid statement: {0}")]
    InvalidStatement(#[from] StatementError),
}

impl ReduceError {
    /// Whether re-running the reducer later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unresolved { .. } | Self::Lookup(_))
    }
}

/// Result of a reducer.
pub type ReduceResult = Result<Statement, ReduceError>;

type PureReducer<P> = Box<dyn Fn(&P, &Event) -> ReduceResult + Send + Sync>;

type LookupReducer<P> =
    Box<dyn for<'a> Fn(&'a P, &'a Event) -> BoxFuture<'a, ReduceResult> + Send + Sync>;

/// A registered reduction function for projection type `P`.
pub enum ReduceFn<P> {
    /// Derives the statement from the event alone.
    Pure(PureReducer<P>),
    /// Reads other projections before deriving the statement.
    Lookup(LookupReducer<P>),
}

impl<P> fmt::Debug for ReduceFn<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pure(_) => f.write_str("ReduceFn::Pure"),
            Self::Lookup(_) => f.write_str("ReduceFn::Lookup"),
        }
    }
}

/// Binds one event kind to its reducer.
#[derive(Debug)]
pub struct EventReducer<P> {
    event_type: EventType,
    reduce: ReduceFn<P>,
}

impl<P> EventReducer<P> {
    /// Register a synchronous reducer.
    #[must_use]
    pub fn pure<F>(event_type: impl Into<EventType>, reduce: F) -> Self
    where
        F: Fn(&P, &Event) -> ReduceResult + Send + Sync + 'static,
    {
        Self {
            event_type: event_type.into(),
            reduce: ReduceFn::Pure(Box::new(reduce)),
        }
    }

    /// Register a reducer that reads other projections.
    #[must_use]
    pub fn lookup<F>(event_type: impl Into<EventType>, reduce: F) -> Self
    where
        F: for<'a> Fn(&'a P, &'a Event) -> BoxFuture<'a, ReduceResult> + Send + Sync + 'static,
    {
        Self {
            event_type: event_type.into(),
            reduce: ReduceFn::Lookup(Box::new(reduce)),
        }
    }

    /// Event kind this reducer handles.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.event_type
    }
}

/// The reducers a projection registers for one aggregate kind.
#[derive(Debug)]
pub struct AggregateReducer<P> {
    aggregate_type: AggregateType,
    events: Vec<EventReducer<P>>,
}

impl<P> AggregateReducer<P> {
    /// Group `events` under `aggregate_type`.
    #[must_use]
    pub const fn new(aggregate_type: AggregateType, events: Vec<EventReducer<P>>) -> Self {
        Self {
            aggregate_type,
            events,
        }
    }
}

/// Registry construction errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The same event kind was registered twice.
    #[error("Duplicate reducer for {0}")]
    DuplicateReducer(EventType),

    /// An event kind was registered under an aggregate kind that does not emit it.
    #[error("Event {event_type} registered under aggregate {aggregate_type}")]
    AggregateMismatch {
        /// Aggregate kind used for registration.
        aggregate_type: AggregateType,
        /// Event kind registered.
        event_type: EventType,
    },

    /// No reducers at all.
    #[error("Registry has no reducers")]
    Empty,
}

/// Outcome of dispatching one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Reduction {
    /// The reducer produced a statement.
    Applied(Statement),
    /// No reducer is registered for the event kind.
    Ignored,
    /// The reducer cannot run yet; retry the same event later.
    Deferred(ReduceError),
    /// The reducer can never succeed for this event.
    Invalid(ReduceError),
}

impl From<ReduceResult> for Reduction {
    fn from(result: ReduceResult) -> Self {
        match result.and_then(|statement| {
            statement.validate()?;
            Ok(statement)
        }) {
            Ok(statement) => Self::Applied(statement),
            Err(err) if err.is_retryable() => Self::Deferred(err),
            Err(err) => Self::Invalid(err),
        }
    }
}

/// Immutable mapping from (aggregate kind, event kind) to reducer.
pub struct ReducerRegistry<P> {
    reducers: BTreeMap<AggregateType, HashMap<EventType, ReduceFn<P>>>,
}

impl<P> ReducerRegistry<P> {
    /// Build the registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if an event kind is registered twice, under the
    /// wrong aggregate kind, or if nothing is registered.
    pub fn new(aggregates: Vec<AggregateReducer<P>>) -> Result<Self, RegistryError> {
        let mut reducers: BTreeMap<AggregateType, HashMap<EventType, ReduceFn<P>>> =
            BTreeMap::new();

        for aggregate in aggregates {
            let by_event = reducers.entry(aggregate.aggregate_type).or_default();
            for event in aggregate.events {
                if event.event_type.aggregate_type() != aggregate.aggregate_type {
                    return Err(RegistryError::AggregateMismatch {
                        aggregate_type: aggregate.aggregate_type,
                        event_type: event.event_type,
                    });
                }
                if by_event.insert(event.event_type, event.reduce).is_some() {
                    return Err(RegistryError::DuplicateReducer(event.event_type));
                }
            }
        }

        reducers.retain(|_, by_event| !by_event.is_empty());
        if reducers.is_empty() {
            return Err(RegistryError::Empty);
        }

        Ok(Self { reducers })
    }

    /// Aggregate kinds with at least one reducer, in a stable order.
    #[must_use]
    pub fn aggregate_types(&self) -> Vec<AggregateType> {
        self.reducers.keys().copied().collect()
    }

    /// Every registered event kind, sorted.
    #[must_use]
    pub fn event_types(&self) -> Vec<EventType> {
        let mut event_types: Vec<EventType> = self
            .reducers
            .values()
            .flat_map(|by_event| by_event.keys().copied())
            .collect();
        event_types.sort_unstable();
        event_types
    }

    /// Whether a reducer exists for the event kind.
    #[must_use]
    pub fn handles(&self, event_type: EventType) -> bool {
        self.get(event_type).is_some()
    }

    fn get(&self, event_type: EventType) -> Option<&ReduceFn<P>> {
        self.reducers
            .get(&event_type.aggregate_type())
            .and_then(|by_event| by_event.get(&event_type))
    }

    /// Dispatch `event` to its reducer.
    pub async fn reduce(&self, projection: &P, event: &Event) -> Reduction {
        match self.get(event.event_type) {
            None => Reduction::Ignored,
            Some(ReduceFn::Pure(reduce)) => reduce(projection, event).into(),
            Some(ReduceFn::Lookup(reduce)) => reduce(projection, event).await.into(),
        }
    }
}

impl<P> fmt::Debug for ReducerRegistry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReducerRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}
