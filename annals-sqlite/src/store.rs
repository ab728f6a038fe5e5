mod read;
mod rebuild;
mod views;
mod write;

use annals_core::{
    aggregate::{Aggregate, AggregateState},
    codec::Registry,
    concurrency::ConcurrencyConflict,
    event::{EventDescriptor, EventSet},
    projection::{Projection, Projectionist},
    store::{self as core_store, EventStore, EventStream, NonEmpty},
};
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{Config, Error};

/// A SQLite-backed [`EventStore`] with co-transacted projections.
///
/// Schema:
/// - `events`: one row per event, unique over `(aggregate_id, sequence)`,
///   ordered globally by `event_id`.
/// - one table per registered [`SqlProjection`](crate::SqlProjection).
///
/// Saves and rebuilds run one at a time; view lookups and history loads go
/// through a separate read pool and only ever observe committed state.
pub struct Store<E: EventSet> {
    writer: SqlitePool,
    reader: SqlitePool,
    registry: Registry<E>,
    projections: Mutex<Projectionist<E, SqliteConnection>>,
    batch_size: u32,
}

impl<E: EventSet> Store<E> {
    /// Construct a store over existing pools. `reader` may be the same pool
    /// as `writer`.
    #[must_use]
    pub fn new(writer: SqlitePool, reader: SqlitePool, registry: Registry<E>) -> Self {
        Self {
            writer,
            reader,
            registry,
            projections: Mutex::new(Projectionist::new()),
            batch_size: Config::default().rebuild_batch_size,
        }
    }

    /// Connect according to `config`, build the registry for `E` and apply
    /// the schema.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, connection or migration failure, or
    /// when two events in `E` share a name.
    #[tracing::instrument(skip(config), fields(url = %config.url))]
    pub async fn open(config: &Config) -> Result<Self, Error> {
        let (writer, reader) = config.connect().await?;
        let mut store = Self::new(writer, reader, Registry::new()?);
        store.batch_size = config.rebuild_batch_size;
        store.migrate().await?;
        tracing::debug!("event store opened");
        Ok(store)
    }

    /// Apply the schema (idempotent).
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if any of the schema creation queries fail.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS events (
                event_id     INTEGER PRIMARY KEY AUTOINCREMENT,
                aggregate_id TEXT NOT NULL,
                sequence     INTEGER NOT NULL,
                timestamp    TEXT NOT NULL,
                event_type   TEXT NOT NULL,
                event_data   TEXT NOT NULL,
                CONSTRAINT aggregate_sequence UNIQUE (aggregate_id, sequence)
            )
            ",
        )
        .execute(&self.writer)
        .await?;

        sqlx::query(r"CREATE INDEX IF NOT EXISTS events_by_type ON events(event_type)")
            .execute(&self.writer)
            .await?;

        Ok(())
    }

    /// The decoders used to read the log.
    #[must_use]
    pub const fn registry(&self) -> &Registry<E> {
        &self.registry
    }

    /// Register a projection under a unique name. It takes part in every
    /// subsequent save.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registration`] if the name is taken.
    pub async fn register_projection<P>(&self, name: impl Into<String>, projection: P) -> Result<(), Error>
    where
        P: Projection<E, SqliteConnection> + 'static,
    {
        self.projections
            .lock()
            .await
            .register(name, projection)
            .map_err(Error::from)
    }

    /// Registered projection names, in registration order.
    pub async fn projections(&self) -> Vec<String> {
        self.projections
            .lock()
            .await
            .names()
            .map(str::to_owned)
            .collect()
    }

    /// Replay an aggregate's full history.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the log has no events for `id`.
    pub async fn load_aggregate<A>(&self, id: Uuid) -> Result<AggregateState<A>, Error>
    where
        A: Aggregate<Event = E>,
    {
        Ok(core_store::load_aggregate(self, id).await?)
    }

    /// Persist an aggregate's pending events; a no-op when nothing is
    /// pending. Returns the number of events written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if another writer got there first; the
    /// aggregate is left untouched.
    pub async fn save_aggregate<A>(&self, aggregate: &mut AggregateState<A>) -> Result<usize, Error>
    where
        A: Aggregate<Event = E>,
    {
        core_store::save_aggregate(self, aggregate).await
    }
}

impl<E: EventSet> EventStore for Store<E> {
    type Error = Error;
    type Event = E;

    #[tracing::instrument(skip(self), fields(aggregate_id = %aggregate_id))]
    async fn stream_version(&self, aggregate_id: Uuid) -> Result<Option<i64>, Self::Error> {
        let mut conn = self.reader.acquire().await?;
        Ok(Self::current_sequence(&mut conn, aggregate_id).await?)
    }

    #[tracing::instrument(
        skip(self, events),
        fields(
            aggregate_id = %aggregate_id,
            expected_sequence,
            events_len = events.len()
        )
    )]
    async fn save<'a>(
        &'a self,
        aggregate_id: Uuid,
        expected_sequence: i64,
        events: NonEmpty<&'a EventDescriptor<E>>,
    ) -> Result<(), Self::Error> {
        let prepared = Self::prepare(aggregate_id, expected_sequence, &events)?;

        let mut projections = self.projections.lock().await;
        let mut tx = self.begin_write().await?;

        let current = Self::current_sequence(&mut tx, aggregate_id)
            .await?
            .unwrap_or(annals_core::event::NO_EVENTS);
        if current != expected_sequence {
            tracing::warn!(current, "stale sequence, save rejected");
            return Err(ConcurrencyConflict {
                aggregate_id,
                expected: expected_sequence,
                actual: current,
            }
            .into());
        }

        projections.load(&mut tx).await?;
        for (descriptor, row) in events.iter().zip(&prepared) {
            Self::append(&mut tx, row).await?;
            projections.project(&mut tx, descriptor).await?;
        }
        projections.save(&mut tx).await?;

        tx.commit().await?;
        tracing::debug!(
            sequence = events.last().sequence,
            projections = projections.len(),
            "events committed"
        );
        Ok(())
    }

    fn load(&self, aggregate_id: Uuid) -> EventStream<'_, E, Self::Error> {
        self.load_stream(aggregate_id)
    }
}
