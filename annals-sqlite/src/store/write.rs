use annals_core::{
    codec::CodecError,
    concurrency::ConcurrencyConflict,
    event::{EventDescriptor, EventSet, NO_EVENTS},
    store::NonEmpty,
};
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use uuid::Uuid;

use super::Store;
use crate::Error;

/// An event encoded and checked, ready to insert.
pub(in crate::store) struct PreparedEvent {
    aggregate_id: Uuid,
    sequence: i64,
    timestamp: DateTime<Utc>,
    event_type: &'static str,
    event_data: String,
}

impl<E: EventSet> Store<E> {
    /// Check that the batch belongs to `aggregate_id` and continues
    /// `expected_sequence` without gaps, then encode every payload.
    ///
    /// Runs before the transaction opens so a bad batch never takes the
    /// writer.
    pub(in crate::store) fn prepare(
        aggregate_id: Uuid,
        expected_sequence: i64,
        events: &NonEmpty<&EventDescriptor<E>>,
    ) -> Result<Vec<PreparedEvent>, Error> {
        let mut prepared = Vec::with_capacity(events.len());
        let mut next = expected_sequence + 1;

        for descriptor in events {
            if descriptor.aggregate_id != aggregate_id {
                return Err(Error::ForeignEvent {
                    sequence: descriptor.sequence,
                    expected: aggregate_id,
                    found: descriptor.aggregate_id,
                });
            }
            if descriptor.sequence != next {
                return Err(Error::InvalidSequence {
                    expected: next,
                    found: descriptor.sequence,
                });
            }

            let event_data = descriptor
                .encoded()
                .map_err(|source| CodecError::Encode {
                    kind: descriptor.event_type(),
                    source,
                })?
                .to_owned();
            prepared.push(PreparedEvent {
                aggregate_id,
                sequence: descriptor.sequence,
                timestamp: descriptor.timestamp,
                event_type: descriptor.event_type(),
                event_data,
            });
            next += 1;
        }

        Ok(prepared)
    }

    /// Open a transaction on the writer that holds the database write lock
    /// from its first statement.
    ///
    /// A deferred transaction asks for the lock only at its first write; a
    /// second connection that has already read fails then with
    /// `SQLITE_BUSY` instead of waiting out `busy_timeout`. Taking the lock
    /// up front makes racing writers queue, so the loser sees the new
    /// sequence on its recheck.
    pub(in crate::store) async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.writer.begin_with("BEGIN IMMEDIATE").await
    }

    /// Latest persisted sequence for an aggregate.
    pub(in crate::store) async fn current_sequence(
        conn: &mut SqliteConnection,
        aggregate_id: Uuid,
    ) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, Option<i64>>(
            r"SELECT MAX(sequence) FROM events WHERE aggregate_id = ?",
        )
        .bind(aggregate_id.hyphenated())
        .fetch_one(conn)
        .await
    }

    /// Insert one event row.
    ///
    /// A clash on `(aggregate_id, sequence)` means another connection
    /// appended first and is reported as a conflict.
    pub(in crate::store) async fn append(
        conn: &mut SqliteConnection,
        event: &PreparedEvent,
    ) -> Result<(), Error> {
        let inserted = sqlx::query(
            r"
            INSERT INTO events (aggregate_id, sequence, timestamp, event_type, event_data)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(event.aggregate_id.hyphenated())
        .bind(event.sequence)
        .bind(event.timestamp)
        .bind(event.event_type)
        .bind(event.event_data.as_str())
        .execute(&mut *conn)
        .await;

        match inserted {
            Ok(_) => {
                tracing::trace!(
                    sequence = event.sequence,
                    event_type = event.event_type,
                    "event appended"
                );
                Ok(())
            }
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                let actual = Self::current_sequence(conn, event.aggregate_id)
                    .await?
                    .unwrap_or(NO_EVENTS);
                tracing::warn!(sequence = event.sequence, actual, "sequence already taken");
                Err(ConcurrencyConflict {
                    aggregate_id: event.aggregate_id,
                    expected: event.sequence - 1,
                    actual,
                }
                .into())
            }
            Err(error) => Err(error.into()),
        }
    }
}
