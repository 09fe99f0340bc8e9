//! In-memory event store for fast, deterministic runner tests.

use projector_core::aggregate::AggregateType;
use projector_core::event::Event;
use projector_core::event_store::{EventQuery, EventStore, EventStoreError};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct Log {
    events: Vec<Event>,
    sequences: HashMap<String, u64>,
    failures: usize,
}

/// In-memory event log.
///
/// [`InMemoryEventStore::append`] assigns sequences from one counter per
/// instance, like the production store.
///
/// # Example
///
/// ```
/// use projector_core::aggregate::OrgEventType;
/// use projector_core::event::Event;
/// use projector_testing::InMemoryEventStore;
///
/// let store = InMemoryEventStore::new();
/// let first = store.append(Event::builder("instance-1", OrgEventType::Removed, "org-1").build());
/// let second = store.append(Event::builder("instance-1", OrgEventType::Removed, "org-2").build());
/// assert_eq!((first.sequence, second.sequence), (1, 2));
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<Log>>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, assigning the next sequence of its instance.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[allow(clippy::unwrap_used)]
    pub fn append(&self, mut event: Event) -> Event {
        let mut log = self.log.write().unwrap();
        let sequence = log
            .sequences
            .entry(event.instance_id.clone())
            .or_insert(0);
        *sequence += 1;
        event.sequence = *sequence;
        log.events.push(event.clone());
        event
    }

    /// Append several events in order.
    pub fn append_all(&self, events: impl IntoIterator<Item = Event>) -> Vec<Event> {
        events.into_iter().map(|event| self.append(event)).collect()
    }

    /// Make the next `count` reads fail with a database error.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[allow(clippy::unwrap_used)]
    pub fn fail_next_reads(&self, count: usize) {
        self.log.write().unwrap().failures = count;
    }

    /// Number of stored events.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn len(&self) -> usize {
        self.log.read().unwrap().events.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read<T>(&self, read: impl FnOnce(&Log) -> T) -> Result<T, EventStoreError> {
        let mut log = self
            .log
            .write()
            .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
        if log.failures > 0 {
            log.failures -= 1;
            return Err(EventStoreError::DatabaseError(
                "injected read failure".to_string(),
            ));
        }
        Ok(read(&log))
    }
}

impl EventStore for InMemoryEventStore {
    fn instance_ids<'a>(
        &'a self,
        aggregate_types: &'a [AggregateType],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, EventStoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.read(|log| {
                log.events
                    .iter()
                    .filter(|event| {
                        aggregate_types.is_empty()
                            || aggregate_types.contains(&event.aggregate_type())
                    })
                    .map(|event| event.instance_id.clone())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
        })
    }

    fn events_after<'a>(
        &'a self,
        query: &'a EventQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Event>, EventStoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.read(|log| {
                let mut events: Vec<Event> = log
                    .events
                    .iter()
                    .filter(|event| event.sequence > query.after_sequence && query.matches(event))
                    .cloned()
                    .collect();
                events.sort_by_key(|event| event.sequence);
                events.truncate(query.limit);
                events
            })
        })
    }
}
