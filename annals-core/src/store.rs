//! Event log abstraction.
//!
//! [`EventStore`] is the narrow persistence surface the engine relies on:
//! an append-only, per-aggregate ordered log with optimistic concurrency, and
//! a pull-based cursor over an aggregate's history. [`load_aggregate`] and
//! [`save_aggregate`] drive an [`AggregateState`] through it.

pub mod inmemory;

use std::{future::Future, pin::Pin};

use futures_core::Stream;
pub use nonempty::NonEmpty;
use thiserror::Error;
use tokio_stream::StreamExt as _;
use uuid::Uuid;

use crate::{
    aggregate::{Aggregate, AggregateError, AggregateState},
    event::{EventDescriptor, EventSet},
};

/// Pull cursor over stored events, in ascending order.
///
/// Dropping the stream before it is exhausted releases the underlying cursor.
pub type EventStream<'a, E, Err> =
    Pin<Box<dyn Stream<Item = Result<EventDescriptor<E>, Err>> + Send + 'a>>;

/// Durable, append-only event log.
pub trait EventStore: Send + Sync {
    /// Tagged union of the events this store can decode.
    type Event: EventSet;

    /// Store-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Sequence of the latest persisted event for an aggregate, `None` if it
    /// has no events.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the lookup fails.
    fn stream_version(
        &self,
        aggregate_id: Uuid,
    ) -> impl Future<Output = Result<Option<i64>, Self::Error>> + Send + '_;

    /// Append a batch of events for one aggregate.
    ///
    /// The batch is rejected with a concurrency conflict if the latest
    /// persisted sequence is not `expected_sequence`. Events and every
    /// registered projection are written in one transaction: either all of it
    /// commits or none of it does.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error on conflict, encoding, projection or
    /// storage failure.
    fn save<'a>(
        &'a self,
        aggregate_id: Uuid,
        expected_sequence: i64,
        events: NonEmpty<&'a EventDescriptor<Self::Event>>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// Stream an aggregate's history in ascending sequence order.
    ///
    /// An empty stream means the aggregate does not exist.
    fn load(&self, aggregate_id: Uuid) -> EventStream<'_, Self::Event, Self::Error>;
}

/// Errors that can occur when loading an aggregate.
#[derive(Debug, Error)]
pub enum LoadError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    #[error("aggregate {0} does not exist")]
    NotFound(Uuid),
    #[error("failed to load events: {0}")]
    Store(#[source] StoreError),
    #[error("failed to replay events: {0}")]
    Aggregate(#[source] AggregateError),
}

/// Load an aggregate by replaying its full history.
///
/// # Errors
///
/// Returns [`LoadError::NotFound`] if the log holds no events for `id`,
/// [`LoadError::Store`] if reading or decoding fails and
/// [`LoadError::Aggregate`] if an event cannot be replayed.
#[tracing::instrument(skip(store), fields(aggregate_id = %id))]
pub async fn load_aggregate<S, A>(store: &S, id: Uuid) -> Result<AggregateState<A>, LoadError<S::Error>>
where
    S: EventStore<Event = A::Event>,
    A: Aggregate,
{
    let mut aggregate = AggregateState::new(id).map_err(LoadError::Aggregate)?;
    let mut events = store.load(id);

    let mut count = 0usize;
    while let Some(descriptor) = events.next().await {
        let descriptor = descriptor.map_err(LoadError::Store)?;
        aggregate.replay(&descriptor).map_err(LoadError::Aggregate)?;
        count += 1;
    }

    tracing::debug!(event_count = count, sequence = aggregate.sequence(), "aggregate loaded");
    if count == 0 {
        return Err(LoadError::NotFound(id));
    }
    Ok(aggregate)
}

/// Persist an aggregate's pending events.
///
/// Does nothing when there is nothing pending. On success the aggregate's
/// sequence advances and its pending list is cleared; on failure both are left
/// as they were so the caller can inspect them.
///
/// Returns the number of events written.
///
/// # Errors
///
/// Propagates the store's error, including concurrency conflicts.
#[tracing::instrument(skip_all, fields(aggregate_id = %aggregate.id()))]
pub async fn save_aggregate<S, A>(store: &S, aggregate: &mut AggregateState<A>) -> Result<usize, S::Error>
where
    S: EventStore<Event = A::Event>,
    A: Aggregate,
{
    let Some(batch) = NonEmpty::from_vec(aggregate.pending().iter().collect()) else {
        return Ok(0);
    };
    store.save(aggregate.id(), aggregate.sequence(), batch).await?;

    let written = aggregate.drain_pending().len();
    tracing::debug!(events = written, sequence = aggregate.sequence(), "aggregate saved");
    Ok(written)
}
