//! `PostgreSQL` event store reader for the projector engine.
//!
//! Projection runners only read the log: this crate implements the
//! [`EventStore`] trait from `projector-core` over the `eventstore.events`
//! table written by the command side.
//!
//! ```sql
//! CREATE TABLE eventstore.events (
//!     instance_id     TEXT        NOT NULL,
//!     aggregate_type  TEXT        NOT NULL,
//!     aggregate_id    TEXT        NOT NULL,
//!     resource_owner  TEXT        NOT NULL,
//!     event_type      TEXT        NOT NULL,
//!     event_sequence  BIGINT      NOT NULL,
//!     creation_date   TIMESTAMPTZ NOT NULL,
//!     event_data      JSONB,
//!     PRIMARY KEY (instance_id, event_sequence)
//! );
//! ```
//!
//! # Example
//!
//! ```ignore
//! use projector_postgres::PostgresEventStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let events = PostgresEventStore::new("postgres://localhost/eventstore").await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use projector_core::aggregate::{AggregateType, EventType};
use projector_core::event::Event;
use projector_core::event_store::{EventQuery, EventStore, EventStoreError};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::pin::Pin;

/// `PostgreSQL`-backed, read-only event store.
#[derive(Clone, Debug)]
pub struct PostgresEventStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct EventRow {
    instance_id: String,
    aggregate_id: String,
    resource_owner: String,
    event_type: String,
    event_sequence: i64,
    creation_date: DateTime<Utc>,
    event_data: Option<serde_json::Value>,
}

impl EventRow {
    fn into_event(self) -> Result<Event, EventStoreError> {
        let sequence =
            u64::try_from(self.event_sequence).map_err(|_| EventStoreError::Decode {
                sequence: 0,
                reason: format!("negative sequence {}", self.event_sequence),
            })?;
        let event_type = self
            .event_type
            .parse::<EventType>()
            .map_err(|e| EventStoreError::Decode {
                sequence,
                reason: e.to_string(),
            })?;

        Ok(Event {
            instance_id: self.instance_id,
            aggregate_id: self.aggregate_id,
            resource_owner: self.resource_owner,
            event_type,
            sequence,
            created_at: self.creation_date,
            payload: self.event_data.unwrap_or(serde_json::Value::Null),
        })
    }
}

impl PostgresEventStore {
    /// Connect to the event store database.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Failed to connect: {e}")))?;

        tracing::info!("Connected to event store");
        Ok(Self::from_pool(pool))
    }

    /// Use an existing connection pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn names<T: Copy + Into<String>>(kinds: &[T]) -> Vec<String> {
    kinds.iter().map(|&kind| kind.into()).collect()
}

impl EventStore for PostgresEventStore {
    fn instance_ids<'a>(
        &'a self,
        aggregate_types: &'a [AggregateType],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, EventStoreError>> + Send + 'a>> {
        Box::pin(async move {
            let rows: Vec<(String,)> = sqlx::query_as(
                "SELECT DISTINCT instance_id
                 FROM eventstore.events
                 WHERE cardinality($1::text[]) = 0 OR aggregate_type = ANY($1)
                 ORDER BY instance_id",
            )
            .bind(names(aggregate_types))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Failed to list instances: {e}")))?;

            Ok(rows.into_iter().map(|(id,)| id).collect())
        })
    }

    fn events_after<'a>(
        &'a self,
        query: &'a EventQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Event>, EventStoreError>> + Send + 'a>> {
        Box::pin(async move {
            let after = i64::try_from(query.after_sequence).unwrap_or(i64::MAX);
            let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);

            let rows: Vec<EventRow> = sqlx::query_as(
                "SELECT instance_id, aggregate_id, resource_owner, event_type,
                        event_sequence, creation_date, event_data
                 FROM eventstore.events
                 WHERE instance_id = $1
                   AND event_sequence > $2
                   AND (cardinality($3::text[]) = 0 OR aggregate_type = ANY($3))
                   AND (cardinality($4::text[]) = 0 OR event_type = ANY($4))
                 ORDER BY event_sequence
                 LIMIT $5",
            )
            .bind(&query.instance_id)
            .bind(after)
            .bind(names(&query.aggregate_types))
            .bind(names(&query.event_types))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Failed to load events: {e}")))?;

            tracing::trace!(
                instance_id = %query.instance_id,
                after_sequence = query.after_sequence,
                count = rows.len(),
                "Loaded events"
            );

            rows.into_iter().map(EventRow::into_event).collect()
        })
    }
}
