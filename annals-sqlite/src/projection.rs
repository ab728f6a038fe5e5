//! Table-per-view projections.
//!
//! A [`SqlProjection`] keeps one row per aggregate in its own table:
//!
//! ```sql
//! CREATE TABLE <name> (aggregate_id TEXT PRIMARY KEY, view TEXT NOT NULL)
//! ```
//!
//! or, with [`SqlProjection::with_sequence`], an extra `sequence` column
//! holding the last event folded into the view. Views are serialized with
//! `serde_json`.

use std::{
    collections::{BTreeMap, HashMap, HashSet, btree_map::Entry},
    fmt,
};

use annals_core::{
    event::{DomainEvent, EventDescriptor, EventMeta, EventSet, NO_EVENTS, Variant},
    projection::{BoxError, Projection, ProjectionError},
};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::Error;

type Handler<V, E> = Box<dyn Fn(&mut V, &E, EventMeta) -> Result<(), BoxError> + Send + Sync>;

/// Check that `name` can be spliced into SQL as a view table name.
pub(crate) fn validate_table_name(name: &str) -> Result<(), Error> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid = valid_start
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.eq_ignore_ascii_case("events")
        && !name.to_ascii_lowercase().starts_with("sqlite_");
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidTableName(name.to_owned()))
    }
}

struct Statements {
    create: String,
    select: String,
    upsert: String,
    wipe: String,
}

impl Statements {
    fn new(table: &str, track_sequence: bool) -> Self {
        if track_sequence {
            Self {
                create: format!(
                    "CREATE TABLE IF NOT EXISTS {table} (aggregate_id TEXT PRIMARY KEY, sequence \
                     INTEGER NOT NULL, view TEXT NOT NULL)"
                ),
                select: format!("SELECT view, sequence FROM {table} WHERE aggregate_id = ?"),
                upsert: format!(
                    "INSERT INTO {table} (aggregate_id, view, sequence) VALUES (?, ?, ?) ON \
                     CONFLICT(aggregate_id) DO UPDATE SET view = excluded.view, sequence = \
                     excluded.sequence"
                ),
                wipe: format!("DELETE FROM {table}"),
            }
        } else {
            Self {
                create: format!(
                    "CREATE TABLE IF NOT EXISTS {table} (aggregate_id TEXT PRIMARY KEY, view TEXT \
                     NOT NULL)"
                ),
                select: format!("SELECT view, {NO_EVENTS} FROM {table} WHERE aggregate_id = ?"),
                upsert: format!(
                    "INSERT INTO {table} (aggregate_id, view) VALUES (?, ?) ON \
                     CONFLICT(aggregate_id) DO UPDATE SET view = excluded.view"
                ),
                wipe: format!("DELETE FROM {table}"),
            }
        }
    }
}

struct CachedView<V> {
    view: V,
    sequence: i64,
}

/// Views touched during one run, keyed by aggregate id.
///
/// Created by `load`, filled on first touch, drained by `save`. Ordered so
/// views flush in the same order on every run.
struct ViewScope<V> {
    views: BTreeMap<Uuid, CachedView<V>>,
}

impl<V> Default for ViewScope<V> {
    fn default() -> Self {
        Self {
            views: BTreeMap::new(),
        }
    }
}

/// A projection persisting one serialized view per aggregate.
///
/// Every event type reaching the projection must be accounted for, either
/// with a handler ([`on`](Self::on)) or explicitly skipped
/// ([`ignore`](Self::ignore)); anything else fails the run.
///
/// ```
/// # use annals_core::event::DomainEvent;
/// # use annals_sqlite::SqlProjection;
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Serialize, Deserialize)]
/// # pub struct BookAdded { title: String }
/// # impl DomainEvent for BookAdded { const KIND: &'static str = "BookAdded"; }
/// # #[derive(Serialize, Deserialize)]
/// # pub struct BookStarted {}
/// # impl DomainEvent for BookStarted { const KIND: &'static str = "BookStarted"; }
/// # annals_core::events! { pub enum LibraryEvent { BookAdded, BookStarted } }
/// #[derive(Default, Serialize, Deserialize)]
/// struct Shelf {
///     titles: Vec<String>,
/// }
///
/// let projection = SqlProjection::<Shelf, LibraryEvent>::new("shelf")?
///     .on(|shelf: &mut Shelf, event: &BookAdded, _meta| {
///         shelf.titles.push(event.title.clone());
///     })?
///     .ignore::<BookStarted>()?;
/// # Ok::<(), annals_sqlite::Error>(())
/// ```
pub struct SqlProjection<V, E> {
    table: String,
    track_sequence: bool,
    statements: Statements,
    handlers: HashMap<&'static str, Handler<V, E>>,
    ignored: HashSet<&'static str>,
    scope: Option<ViewScope<V>>,
}

impl<V, E> SqlProjection<V, E>
where
    V: Serialize + DeserializeOwned + Default + Send + 'static,
    E: EventSet,
{
    /// A projection stored in `table`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTableName`] unless `table` is a plain SQL
    /// identifier other than `events`.
    pub fn new(table: impl Into<String>) -> Result<Self, Error> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self {
            statements: Statements::new(&table, false),
            table,
            track_sequence: false,
            handlers: HashMap::new(),
            ignored: HashSet::new(),
            scope: None,
        })
    }

    /// Also store the sequence of the last event folded into each view.
    ///
    /// Events at or below the stored sequence are skipped, so replaying
    /// history the view already reflects leaves it unchanged.
    #[must_use]
    pub fn with_sequence(mut self) -> Self {
        self.track_sequence = true;
        self.statements = Statements::new(&self.table, true);
        self
    }

    /// Name of the table holding the views.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Whether each view records the last sequence applied to it.
    #[must_use]
    pub const fn tracks_sequence(&self) -> bool {
        self.track_sequence
    }

    /// Fold events of type `T` into the view.
    ///
    /// # Errors
    ///
    /// Fails if `T` already has a handler or was ignored.
    pub fn on<T, F>(self, handler: F) -> Result<Self, Error>
    where
        T: DomainEvent,
        E: Variant<T>,
        F: Fn(&mut V, &T, EventMeta) + Send + Sync + 'static,
    {
        self.try_on(move |view: &mut V, event: &T, meta| {
            handler(view, event, meta);
            Ok::<(), BoxError>(())
        })
    }

    /// Like [`on`](Self::on), for handlers that can fail. A failing handler
    /// aborts the transaction it runs in.
    ///
    /// # Errors
    ///
    /// Fails if `T` already has a handler or was ignored.
    pub fn try_on<T, F, Err>(mut self, handler: F) -> Result<Self, Error>
    where
        T: DomainEvent,
        E: Variant<T>,
        F: Fn(&mut V, &T, EventMeta) -> Result<(), Err> + Send + Sync + 'static,
        Err: Into<BoxError>,
    {
        self.claim(T::KIND)?;
        self.handlers.insert(
            T::KIND,
            Box::new(move |view: &mut V, event: &E, meta| {
                let event = <E as Variant<T>>::as_variant(event)
                    .ok_or_else(|| -> BoxError { Box::new(VariantMismatch(T::KIND)) })?;
                handler(view, event, meta).map_err(Into::into)
            }),
        );
        Ok(self)
    }

    /// Accept events of type `T` without touching any view.
    ///
    /// # Errors
    ///
    /// Fails if `T` already has a handler or was ignored.
    pub fn ignore<T>(mut self) -> Result<Self, Error>
    where
        T: DomainEvent,
        E: Variant<T>,
    {
        self.claim(T::KIND)?;
        self.ignored.insert(T::KIND);
        Ok(self)
    }

    fn claim(&self, kind: &'static str) -> Result<(), Error> {
        if self.handlers.contains_key(kind) || self.ignored.contains(kind) {
            return Err(Error::Registration(ProjectionError::DuplicateHandler(kind)));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct VariantMismatch(&'static str);

impl fmt::Display for VariantMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event does not hold a `{}`", self.0)
    }
}

impl std::error::Error for VariantMismatch {}

fn storage(error: sqlx::Error) -> ProjectionError {
    ProjectionError::Storage(Box::new(error))
}

async fn fetch_view<V>(
    conn: &mut SqliteConnection,
    select: &str,
    aggregate_id: Uuid,
) -> Result<CachedView<V>, ProjectionError>
where
    V: DeserializeOwned + Default,
{
    let row: Option<(String, i64)> = sqlx::query_as(select)
        .bind(aggregate_id.hyphenated())
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage)?;

    match row {
        Some((json, sequence)) => Ok(CachedView {
            view: serde_json::from_str(&json).map_err(ProjectionError::View)?,
            sequence,
        }),
        None => Ok(CachedView {
            view: V::default(),
            sequence: NO_EVENTS,
        }),
    }
}

#[async_trait]
impl<V, E> Projection<E, SqliteConnection> for SqlProjection<V, E>
where
    V: Serialize + DeserializeOwned + Default + Send + 'static,
    E: EventSet,
{
    async fn load(&mut self, tx: &mut SqliteConnection) -> Result<(), ProjectionError> {
        sqlx::query(&self.statements.create)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        self.scope = Some(ViewScope::default());
        Ok(())
    }

    async fn project(
        &mut self,
        tx: &mut SqliteConnection,
        event: &EventDescriptor<E>,
    ) -> Result<(), ProjectionError> {
        let kind = event.event_type();
        let scope = self.scope.as_mut().ok_or(ProjectionError::NotLoaded)?;
        if self.ignored.contains(kind) {
            return Ok(());
        }
        let handler = self
            .handlers
            .get(kind)
            .ok_or(ProjectionError::UnhandledEventType(kind))?;

        let cached = match scope.views.entry(event.aggregate_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let fetched = fetch_view(tx, &self.statements.select, event.aggregate_id).await?;
                entry.insert(fetched)
            }
        };

        if self.track_sequence && event.sequence <= cached.sequence {
            tracing::trace!(
                table = %self.table,
                aggregate_id = %event.aggregate_id,
                sequence = event.sequence,
                "event already reflected in view"
            );
            return Ok(());
        }

        handler(&mut cached.view, &event.event, event.meta()).map_err(ProjectionError::Handler)?;
        cached.sequence = event.sequence;
        Ok(())
    }

    async fn save(&mut self, tx: &mut SqliteConnection) -> Result<(), ProjectionError> {
        let scope = self.scope.take().ok_or(ProjectionError::NotLoaded)?;
        let count = scope.views.len();

        for (aggregate_id, cached) in scope.views {
            let json = serde_json::to_string(&cached.view).map_err(ProjectionError::View)?;
            let query = sqlx::query(&self.statements.upsert)
                .bind(aggregate_id.hyphenated())
                .bind(json);
            let query = if self.track_sequence {
                query.bind(cached.sequence)
            } else {
                query
            };
            query.execute(&mut *tx).await.map_err(storage)?;
        }

        tracing::trace!(table = %self.table, views = count, "views flushed");
        Ok(())
    }

    async fn wipe(&mut self, tx: &mut SqliteConnection) -> Result<(), ProjectionError> {
        sqlx::query(&self.statements.create)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        let wiped = sqlx::query(&self.statements.wipe)
            .execute(&mut *tx)
            .await
            .map_err(storage)?
            .rows_affected();
        if let Some(scope) = self.scope.as_mut() {
            scope.views.clear();
        }
        tracing::debug!(table = %self.table, rows = wiped, "views wiped");
        Ok(())
    }
}
