//! # Projector Testing
//!
//! Testing utilities for projections and runners.
//!
//! This crate provides:
//! - [`InMemoryEventStore`]: event log with per-instance sequences and failure injection
//! - [`InMemoryProjectionStorage`]: storage that executes statements against in-memory rows
//! - [`fixtures`]: builders for membership events
//! - [`properties`]: proptest strategies
//!
//! ## Example
//!
//! ```ignore
//! use projector_testing::{fixtures, InMemoryEventStore, InMemoryProjectionStorage};
//!
//! #[tokio::test]
//! async fn member_is_projected() {
//!     let events = InMemoryEventStore::new();
//!     let storage = InMemoryProjectionStorage::new();
//!     events.append(fixtures::human_added("i", "org-a", "u"));
//!     // run the projections, then assert on storage.rows(...)
//! }
//! ```

/// In-memory event store
pub mod event_store;

/// Event builders for membership scenarios
pub mod fixtures;

/// Property-based testing utilities
pub mod properties;

/// In-memory projection storage and reader
pub mod storage;

pub use event_store::InMemoryEventStore;
pub use fixtures::test_time;
pub use storage::{InMemoryProjectionStorage, Row};
