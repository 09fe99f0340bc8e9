//! The event record consumed by projections.
//!
//! Events are produced by the event store and never mutated by the engine.
//! The payload is kept as a JSON document; reducers decode it into the typed
//! structure they expect with [`Event::decode`]. A payload that does not fit
//! is a shape mismatch, which is a wiring bug rather than a transient
//! condition.
//!
//! # Example
//!
//! ```
//! use projector_core::aggregate::ProjectEventType;
//! use projector_core::event::Event;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct GrantRemoved {
//!     #[serde(rename = "grantId")]
//!     grant_id: String,
//! }
//!
//! let event = Event::builder("instance-1", ProjectEventType::GrantRemoved, "project-1")
//!     .sequence(7)
//!     .payload(serde_json::json!({ "grantId": "grant-1" }))
//!     .build();
//!
//! let payload: GrantRemoved = event.decode().unwrap();
//! assert_eq!(payload.grant_id, "grant-1");
//! ```

use crate::aggregate::{AggregateType, EventType};
use crate::reducer::ReduceError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One immutable entry of the event log.
///
/// `sequence` is assigned by the event store from a per-instance counter, so it
/// is strictly increasing for every aggregate instance and totally orders the
/// events of one instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Tenant the event belongs to.
    pub instance_id: String,

    /// Identifier of the aggregate instance that emitted the event.
    pub aggregate_id: String,

    /// Organization owning the aggregate instance.
    pub resource_owner: String,

    /// Kind of the event (and, through it, of the aggregate).
    pub event_type: EventType,

    /// Position of the event in its instance's stream.
    pub sequence: u64,

    /// When the event was committed.
    pub created_at: DateTime<Utc>,

    /// Event-kind specific payload.
    pub payload: serde_json::Value,
}

impl Event {
    /// Start building an event with the mandatory identity fields.
    ///
    /// The remaining fields default to sequence `0`, the current time, an
    /// empty resource owner and a `null` payload.
    #[must_use]
    pub fn builder(
        instance_id: impl Into<String>,
        event_type: impl Into<EventType>,
        aggregate_id: impl Into<String>,
    ) -> EventBuilder {
        EventBuilder {
            event: Self {
                instance_id: instance_id.into(),
                aggregate_id: aggregate_id.into(),
                resource_owner: String::new(),
                event_type: event_type.into(),
                sequence: 0,
                created_at: Utc::now(),
                payload: serde_json::Value::Null,
            },
        }
    }

    /// Kind of the aggregate that emitted the event.
    #[must_use]
    pub const fn aggregate_type(&self) -> AggregateType {
        self.event_type.aggregate_type()
    }

    /// Decode the payload into the structure a reducer expects.
    ///
    /// # Errors
    ///
    /// Returns [`ReduceError::ShapeMismatch`] if the payload does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ReduceError> {
        T::deserialize(&self.payload).map_err(|e| ReduceError::ShapeMismatch {
            event_type: self.event_type,
            sequence: self.sequence,
            reason: e.to_string(),
        })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} seq {} ({})",
            self.event_type,
            self.aggregate_type(),
            self.aggregate_id,
            self.sequence,
            self.instance_id
        )
    }
}

/// Builder for [`Event`], mostly used by event store adapters and tests.
#[derive(Clone, Debug)]
pub struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    /// Set the resource owner of the aggregate.
    #[must_use]
    pub fn resource_owner(mut self, owner: impl Into<String>) -> Self {
        self.event.resource_owner = owner.into();
        self
    }

    /// Set the sequence number.
    #[must_use]
    pub const fn sequence(mut self, sequence: u64) -> Self {
        self.event.sequence = sequence;
        self
    }

    /// Set the creation timestamp.
    #[must_use]
    pub const fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.event.created_at = created_at;
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.event.payload = payload;
        self
    }

    /// Finish the event.
    #[must_use]
    pub fn build(self) -> Event {
        self.event
    }
}
