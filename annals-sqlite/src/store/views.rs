use annals_core::event::EventSet;
use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use super::Store;
use crate::{Error, projection::validate_table_name};

/// Normalise a property path to a `json_extract` path: `title` and
/// `$.title` both address the `title` field.
fn json_path(path: &str) -> String {
    if path.starts_with('$') {
        path.to_owned()
    } else {
        format!("$.{path}")
    }
}

fn decode<V: DeserializeOwned>(bytes: Option<Vec<u8>>) -> Result<Option<V>, Error> {
    bytes
        .map(|bytes| serde_json::from_slice(&bytes).map_err(Error::View))
        .transpose()
}

/// Read-side lookups. All of these go through the read pool and see only
/// committed views. Querying a projection that has never run fails with a
/// database error, since its table does not exist yet.
impl<E: EventSet> Store<E> {
    /// Serialized view of `aggregate_id` in `table`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTableName`] or [`Error::Database`].
    #[tracing::instrument(skip(self), fields(aggregate_id = %aggregate_id))]
    pub async fn view_bytes_by_id(&self, table: &str, aggregate_id: Uuid) -> Result<Option<Vec<u8>>, Error> {
        validate_table_name(table)?;
        let view: Option<String> =
            sqlx::query_scalar(&format!("SELECT view FROM {table} WHERE aggregate_id = ?"))
                .bind(aggregate_id.hyphenated())
                .fetch_optional(&self.reader)
                .await?;
        Ok(view.map(String::into_bytes))
    }

    /// Decoded view of `aggregate_id` in `table`, if any.
    ///
    /// # Errors
    ///
    /// As [`view_bytes_by_id`](Self::view_bytes_by_id), plus [`Error::View`]
    /// if the stored view does not decode as `V`.
    pub async fn view_by_id<V: DeserializeOwned>(&self, table: &str, aggregate_id: Uuid) -> Result<Option<V>, Error> {
        decode(self.view_bytes_by_id(table, aggregate_id).await?)
    }

    /// Serialized first view in `table` whose property at `path` equals
    /// `value`.
    ///
    /// `path` is a dotted property path (`owner.name`) or a full JSON path
    /// (`$.books[0].isbn`). Ties are broken by aggregate id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTableName`], [`Error::View`] if `value` cannot
    /// be encoded, or [`Error::Database`].
    #[tracing::instrument(skip(self, value))]
    pub async fn view_bytes_by_property<T>(&self, table: &str, path: &str, value: &T) -> Result<Option<Vec<u8>>, Error>
    where
        T: Serialize + ?Sized + Sync,
    {
        validate_table_name(table)?;
        let value = serde_json::to_string(value).map_err(Error::View)?;
        let view: Option<String> = sqlx::query_scalar(&format!(
            "SELECT view FROM {table} WHERE json_extract(view, ?) = json_extract(?, '$') ORDER \
             BY aggregate_id LIMIT 1"
        ))
        .bind(json_path(path))
        .bind(value)
        .fetch_optional(&self.reader)
        .await?;
        Ok(view.map(String::into_bytes))
    }

    /// Decoded first view in `table` whose property at `path` equals
    /// `value`.
    ///
    /// # Errors
    ///
    /// As [`view_bytes_by_property`](Self::view_bytes_by_property), plus
    /// [`Error::View`] if the stored view does not decode as `V`.
    pub async fn view_by_property<V, T>(&self, table: &str, path: &str, value: &T) -> Result<Option<V>, Error>
    where
        V: DeserializeOwned,
        T: Serialize + ?Sized + Sync,
    {
        decode(self.view_bytes_by_property(table, path, value).await?)
    }

    /// Sequence of the last event folded into a view, for projections
    /// created [`with_sequence`](crate::SqlProjection::with_sequence).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTableName`] or [`Error::Database`], including
    /// when `table` has no sequence column.
    pub async fn view_sequence(&self, table: &str, aggregate_id: Uuid) -> Result<Option<i64>, Error> {
        validate_table_name(table)?;
        let sequence =
            sqlx::query_scalar(&format!("SELECT sequence FROM {table} WHERE aggregate_id = ?"))
                .bind(aggregate_id.hyphenated())
                .fetch_optional(&self.reader)
                .await?;
        Ok(sequence)
    }
}
