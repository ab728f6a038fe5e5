//! Connection settings for the `SQLite` store.

use std::{str::FromStr, time::Duration};

use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::Error;

/// Store configuration.
///
/// Deserializable so it can be embedded in an application's own config file:
///
/// ```toml
/// [events]
/// url = "sqlite://library.db"
/// max_connections = 1
/// read_connections = 4
/// ```
///
/// An in-memory database (the default) shares one connection between reads
/// and writes, because every `SQLite` memory connection is its own database.
/// A [`Store::load`](crate::Store) or [`Store::all_events`](crate::Store::all_events)
/// stream holds that connection until it is finished or dropped; a save
/// started while such a stream is still alive waits for it, and fails once
/// the pool's acquire timeout (30 seconds) runs out. Drain or drop streams
/// before writing, or use a file database.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// `sqlite://path/to/file.db` or `sqlite::memory:`.
    pub url: String,
    /// Size of the writer pool.
    pub max_connections: u32,
    /// Size of the read-only pool used for view lookups and history loads.
    pub read_connections: u32,
    /// How long a connection waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
    /// Rows fetched per page while rebuilding a projection.
    pub rebuild_batch_size: u32,
    /// Create the database file if it does not exist.
    pub create_if_missing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_owned(),
            max_connections: 1,
            read_connections: 4,
            busy_timeout_ms: 5_000,
            rebuild_batch_size: 500,
            create_if_missing: true,
        }
    }
}

impl Config {
    /// Defaults pointed at `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Set [`Config::max_connections`].
    #[must_use]
    pub const fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set [`Config::read_connections`].
    #[must_use]
    pub const fn read_connections(mut self, read_connections: u32) -> Self {
        self.read_connections = read_connections;
        self
    }

    /// Set [`Config::busy_timeout_ms`], saturating at `u64::MAX` ms.
    #[must_use]
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set [`Config::rebuild_batch_size`].
    #[must_use]
    pub const fn rebuild_batch_size(mut self, rebuild_batch_size: u32) -> Self {
        self.rebuild_batch_size = rebuild_batch_size;
        self
    }

    /// Set [`Config::create_if_missing`].
    #[must_use]
    pub const fn create_if_missing(mut self, create_if_missing: bool) -> Self {
        self.create_if_missing = create_if_missing;
        self
    }

    /// Whether the URL points at a private in-memory database.
    #[must_use]
    pub fn is_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }

    fn validate(&self) -> Result<(), Error> {
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".to_owned()));
        }
        if self.read_connections == 0 && !self.is_memory() {
            return Err(Error::Config("read_connections must be at least 1".to_owned()));
        }
        if self.rebuild_batch_size == 0 {
            return Err(Error::Config("rebuild_batch_size must be at least 1".to_owned()));
        }
        Ok(())
    }

    fn connect_options(&self) -> Result<SqliteConnectOptions, Error> {
        let options = SqliteConnectOptions::from_str(&self.url)?
            .create_if_missing(self.create_if_missing)
            .busy_timeout(Duration::from_millis(self.busy_timeout_ms))
            .foreign_keys(true);
        if self.is_memory() {
            Ok(options)
        } else {
            Ok(options.journal_mode(SqliteJournalMode::Wal))
        }
    }

    /// Open the writer and reader pools.
    ///
    /// For an in-memory database both are the same single-connection pool,
    /// kept open for the life of the store.
    pub(crate) async fn connect(&self) -> Result<(SqlitePool, SqlitePool), Error> {
        self.validate()?;
        let options = self.connect_options()?;

        if self.is_memory() {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?;
            return Ok((pool.clone(), pool));
        }

        let writer = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .connect_with(options.clone())
            .await?;
        let reader = SqlitePoolOptions::new()
            .max_connections(self.read_connections)
            .connect_with(options.read_only(true))
            .await?;
        Ok((writer, reader))
    }
}
