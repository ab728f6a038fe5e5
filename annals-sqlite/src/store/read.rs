use annals_core::{
    event::{EventDescriptor, EventSet},
    store::EventStream,
};
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tokio_stream::StreamExt as _;
use uuid::{Uuid, fmt::Hyphenated};

use super::Store;
use crate::Error;

#[derive(sqlx::FromRow)]
pub(in crate::store) struct EventRow {
    event_id: i64,
    aggregate_id: Hyphenated,
    sequence: i64,
    timestamp: DateTime<Utc>,
    event_type: String,
    event_data: String,
}

impl<E: EventSet> Store<E> {
    /// Turn a stored row back into a descriptor through the registry.
    pub(in crate::store) fn decode_row(&self, row: EventRow) -> Result<EventDescriptor<E>, Error> {
        let event = self.registry.deserialize(&row.event_type, &row.event_data)?;
        Ok(EventDescriptor::new(
            row.aggregate_id.into_uuid(),
            row.sequence,
            row.timestamp,
            event,
        ))
    }

    pub(in crate::store) fn load_stream(&self, aggregate_id: Uuid) -> EventStream<'_, E, Error> {
        let rows = sqlx::query_as::<_, EventRow>(
            r"
            SELECT event_id, aggregate_id, sequence, timestamp, event_type, event_data
            FROM events
            WHERE aggregate_id = ?
            ORDER BY sequence ASC
            ",
        )
        .bind(aggregate_id.hyphenated())
        .fetch(&self.reader);

        Box::pin(rows.map(move |row| self.decode_row(row?)))
    }

    /// Stream the whole log in commit order.
    ///
    /// Reads through the read pool, so only committed events are seen. On an
    /// in-memory database that pool is the writer's single connection: finish
    /// or drop the stream before saving, or the save waits for it.
    #[must_use]
    pub fn all_events(&self) -> EventStream<'_, E, Error> {
        let rows = sqlx::query_as::<_, EventRow>(
            r"
            SELECT event_id, aggregate_id, sequence, timestamp, event_type, event_data
            FROM events
            ORDER BY event_id ASC
            ",
        )
        .fetch(&self.reader);

        Box::pin(rows.map(move |row| self.decode_row(row?)))
    }

    /// Number of events in the log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if the count fails.
    pub async fn event_count(&self) -> Result<i64, Error> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.reader)
            .await?;
        Ok(count)
    }

    /// Up to `limit` events with `event_id` greater than `after`, decoded,
    /// paired with their `event_id`.
    ///
    /// Fully buffered so the connection is free for projection writes in the
    /// same transaction.
    pub(in crate::store) async fn page_after(
        &self,
        conn: &mut SqliteConnection,
        after: i64,
        limit: u32,
    ) -> Result<Vec<(i64, EventDescriptor<E>)>, Error> {
        let rows = sqlx::query_as::<_, EventRow>(
            r"
            SELECT event_id, aggregate_id, sequence, timestamp, event_type, event_data
            FROM events
            WHERE event_id > ?
            ORDER BY event_id ASC
            LIMIT ?
            ",
        )
        .bind(after)
        .bind(i64::from(limit))
        .fetch_all(conn)
        .await?;

        rows.into_iter()
            .map(|row| {
                let event_id = row.event_id;
                Ok((event_id, self.decode_row(row)?))
            })
            .collect()
    }
}
