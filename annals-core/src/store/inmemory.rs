//! In-memory event store for tests and examples.
//!
//! Payloads go through the same [`Registry`] encoding as a durable store, so
//! codec mistakes surface here too. There are no projections.
//!
//! ```
//! # use annals_core::event::DomainEvent;
//! # use serde::{Deserialize, Serialize};
//! # #[derive(Serialize, Deserialize)]
//! # pub struct Opened {}
//! # impl DomainEvent for Opened { const KIND: &'static str = "Opened"; }
//! # annals_core::events! { pub enum AccountEvent { Opened } }
//! use annals_core::store::inmemory;
//!
//! let store = inmemory::Store::<AccountEvent>::new()?;
//! # Ok::<(), annals_core::codec::CodecError>(())
//! ```

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    codec::{CodecError, Registry},
    concurrency::ConcurrencyConflict,
    event::{EventDescriptor, EventSet, NO_EVENTS},
    store::{EventStore, EventStream, NonEmpty},
};

struct StoredEvent {
    sequence: i64,
    timestamp: DateTime<Utc>,
    event_type: &'static str,
    payload: String,
}

/// Thread-safe in-memory event log keyed by aggregate id.
pub struct Store<E> {
    registry: Registry<E>,
    streams: Arc<RwLock<HashMap<Uuid, Vec<StoredEvent>>>>,
}

impl<E> Clone for Store<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            streams: Arc::clone(&self.streams),
        }
    }
}

/// Error type for the in-memory store.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryError {
    /// Another writer appended to the stream first.
    #[error(transparent)]
    Conflict(#[from] ConcurrencyConflict),
    /// A payload could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The batch does not continue the expected sequence without gaps.
    #[error("event batch is not contiguous: expected sequence {expected}, found {found}")]
    InvalidSequence {
        /// Sequence the next event should carry.
        expected: i64,
        /// Sequence it actually carries.
        found: i64,
    },
    /// The batch holds an event recorded against another aggregate.
    #[error("event {sequence} belongs to aggregate {found}, not {expected}")]
    ForeignEvent {
        /// Sequence of the offending event.
        sequence: i64,
        /// Aggregate the batch was saved for.
        expected: Uuid,
        /// Aggregate the event names.
        found: Uuid,
    },
}

impl<E: EventSet> Store<E> {
    /// An empty store decoding every variant of `E`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::DuplicateEventType`] if two variants share a
    /// name.
    pub fn new() -> Result<Self, CodecError> {
        Ok(Self {
            registry: Registry::new()?,
            streams: Arc::default(),
        })
    }

    /// Number of events across all aggregates.
    #[must_use]
    pub fn len(&self) -> usize {
        let streams = self.streams.read().expect("in-memory store lock poisoned");
        streams.values().map(Vec::len).sum()
    }

    /// Whether no aggregate has any events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn decode(&self, aggregate_id: Uuid, stored: &StoredEvent) -> Result<EventDescriptor<E>, InMemoryError> {
        let event = self.registry.deserialize(stored.event_type, &stored.payload)?;
        Ok(EventDescriptor::new(
            aggregate_id,
            stored.sequence,
            stored.timestamp,
            event,
        ))
    }
}

impl<E: EventSet> EventStore for Store<E> {
    type Error = InMemoryError;
    type Event = E;

    fn stream_version(
        &self,
        aggregate_id: Uuid,
    ) -> impl Future<Output = Result<Option<i64>, Self::Error>> + Send + '_ {
        let version = {
            let streams = self.streams.read().expect("in-memory store lock poisoned");
            streams
                .get(&aggregate_id)
                .and_then(|stream| stream.last())
                .map(|stored| stored.sequence)
        };
        std::future::ready(Ok(version))
    }

    fn save<'a>(
        &'a self,
        aggregate_id: Uuid,
        expected_sequence: i64,
        events: NonEmpty<&'a EventDescriptor<E>>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        std::future::ready(self.append(aggregate_id, expected_sequence, &events))
    }

    fn load(&self, aggregate_id: Uuid) -> EventStream<'_, E, Self::Error> {
        let decoded: Vec<_> = {
            let streams = self.streams.read().expect("in-memory store lock poisoned");
            streams
                .get(&aggregate_id)
                .map(|stream| {
                    stream
                        .iter()
                        .map(|stored| self.decode(aggregate_id, stored))
                        .collect()
                })
                .unwrap_or_default()
        };
        Box::pin(tokio_stream::iter(decoded))
    }
}

impl<E: EventSet> Store<E> {
    fn append(
        &self,
        aggregate_id: Uuid,
        expected_sequence: i64,
        events: &NonEmpty<&EventDescriptor<E>>,
    ) -> Result<(), InMemoryError> {
        let mut prepared = Vec::with_capacity(events.len());
        for (next, descriptor) in (expected_sequence + 1..).zip(events.iter()) {
            if descriptor.aggregate_id != aggregate_id {
                return Err(InMemoryError::ForeignEvent {
                    sequence: descriptor.sequence,
                    expected: aggregate_id,
                    found: descriptor.aggregate_id,
                });
            }
            if descriptor.sequence != next {
                return Err(InMemoryError::InvalidSequence {
                    expected: next,
                    found: descriptor.sequence,
                });
            }
            prepared.push(StoredEvent {
                sequence: descriptor.sequence,
                timestamp: descriptor.timestamp,
                event_type: descriptor.event_type(),
                payload: self.registry.serialize(&descriptor.event)?,
            });
        }

        let mut streams = self.streams.write().expect("in-memory store lock poisoned");
        let current = streams
            .get(&aggregate_id)
            .and_then(|stream| stream.last())
            .map_or(NO_EVENTS, |stored| stored.sequence);
        if current != expected_sequence {
            return Err(ConcurrencyConflict {
                aggregate_id,
                expected: expected_sequence,
                actual: current,
            }
            .into());
        }
        streams.entry(aggregate_id).or_default().extend(prepared);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tokio_stream::StreamExt as _;

    use super::*;
    use crate::{
        aggregate::{AggregateState, tests::Account},
        event::tests::{AccountEvent, Deposited, Opened},
        store::{LoadError, load_aggregate, save_aggregate},
    };

    fn store() -> Store<AccountEvent> {
        Store::new().unwrap()
    }

    #[tokio::test]
    async fn saved_aggregate_loads_back() {
        let store = store();
        let id = Uuid::new_v4();
        let mut account = AggregateState::<Account>::new(id).unwrap();
        account
            .apply(Opened {
                owner: "ada".to_owned(),
            })
            .unwrap();
        account.apply(Deposited { amount: 5 }).unwrap();

        assert_eq!(save_aggregate(&store, &mut account).await.unwrap(), 2);
        let loaded: AggregateState<Account> = load_aggregate(&store, id).await.unwrap();

        assert_eq!(loaded.sequence(), 1);
        assert_eq!(loaded.state(), account.state());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn loading_nothing_is_not_found() {
        let store = store();

        let result = load_aggregate::<_, Account>(&store, Uuid::new_v4()).await;

        assert!(matches!(result, Err(LoadError::NotFound(_))));
    }

    #[tokio::test]
    async fn stale_save_conflicts_and_keeps_pending() {
        let store = store();
        let id = Uuid::new_v4();
        let mut first = AggregateState::<Account>::new(id).unwrap();
        let mut stale = AggregateState::<Account>::new(id).unwrap();
        first.apply(Deposited { amount: 1 }).unwrap();
        stale.apply(Deposited { amount: 2 }).unwrap();

        save_aggregate(&store, &mut first).await.unwrap();
        let error = save_aggregate(&store, &mut stale).await.unwrap_err();

        assert!(matches!(error, InMemoryError::Conflict(_)));
        assert_eq!(stale.pending().len(), 1);
        assert_eq!(store.stream_version(id).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn gapped_batch_is_rejected() {
        let store = store();
        let id = Uuid::new_v4();
        let event = EventDescriptor::new(id, 3, Utc::now(), Deposited { amount: 1 }.into());

        let error = store
            .save(id, NO_EVENTS, NonEmpty::new(&event))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            InMemoryError::InvalidSequence {
                expected: 0,
                found: 3
            }
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn batch_for_another_aggregate_is_foreign() {
        let store = store();
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let event = EventDescriptor::new(other, 0, Utc::now(), Deposited { amount: 1 }.into());

        let error = store
            .save(id, NO_EVENTS, NonEmpty::new(&event))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            InMemoryError::ForeignEvent { sequence: 0, expected, found }
                if expected == id && found == other
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn rejected_save_leaves_no_stream_behind() {
        let store = store();
        let id = Uuid::new_v4();
        let event = EventDescriptor::new(id, 5, Utc::now(), Deposited { amount: 1 }.into());

        let error = store.save(id, 4, NonEmpty::new(&event)).await.unwrap_err();

        assert!(matches!(error, InMemoryError::Conflict(_)));
        assert!(!store.streams.read().unwrap().contains_key(&id));
        assert_eq!(store.stream_version(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn dropping_a_load_early_is_harmless() {
        let store = store();
        let id = Uuid::new_v4();
        let mut account = AggregateState::<Account>::new(id).unwrap();
        for amount in 1..=3 {
            account.apply(Deposited { amount }).unwrap();
        }
        save_aggregate(&store, &mut account).await.unwrap();

        let first = store.load(id).next().await.unwrap().unwrap();

        assert_eq!(first.sequence, 0);
        assert_eq!(store.len(), 3);
    }
}
