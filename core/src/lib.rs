//! # Projector Core
//!
//! Core traits and types for building relational read models from an
//! append-only, multi-tenant event log.
//!
//! ## Core Concepts
//!
//! - **Event**: immutable record of something that happened to one aggregate
//! - **Reducer**: function `Event → Statement`, registered per event kind
//! - **Statement**: storage mutations derived from one event, committed atomically
//! - **Table**: declarative shape of a projection table
//! - **Projection**: name + table + reducer registry
//! - **Checkpoint**: per (projection, instance) position in the event stream
//!
//! ## Architecture Principles
//!
//! - Reducers describe mutations, storage backends execute them
//! - Cascading removals are single conditional statements on denormalized columns
//! - Checkpoints advance in the same transaction as the statements they cover
//!
//! ## Example
//!
//! ```
//! use projector_core::aggregate::ProjectEventType;
//! use projector_core::event::Event;
//! use projector_core::statement::{Condition, Statement};
//!
//! let event = Event::builder("instance-1", ProjectEventType::GrantRemoved, "project-1")
//!     .sequence(42)
//!     .build();
//!
//! let statement = Statement::delete(
//!     &event,
//!     "projections.project_grant_members3",
//!     vec![
//!         Condition::new("instance_id", event.instance_id.as_str()),
//!         Condition::new("project_id", event.aggregate_id.as_str()),
//!         Condition::new("grant_id", "grant-1"),
//!     ],
//! );
//!
//! assert_eq!(statement.sequence, 42);
//! assert!(statement.validate().is_ok());
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod aggregate;
pub mod event;
pub mod event_store;
pub mod projection;
pub mod reducer;
pub mod schema;
pub mod statement;
