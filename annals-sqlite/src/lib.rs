//! SQLite-backed event log and projections.
//!
//! - [`Store`]: an implementation of [`annals_core::store::EventStore`] that
//!   writes events and every registered projection in one transaction, and
//!   rebuilds projections from the log.
//! - [`SqlProjection`]: a table-per-view projection keyed by aggregate id.
//! - [`Config`]: connection settings, deserializable from an application's
//!   own configuration.
//!
//! ```no_run
//! # use annals_core::event::DomainEvent;
//! # use serde::{Deserialize, Serialize};
//! # #[derive(Serialize, Deserialize)]
//! # pub struct BookAdded { title: String }
//! # impl DomainEvent for BookAdded { const KIND: &'static str = "BookAdded"; }
//! # annals_core::events! { pub enum LibraryEvent { BookAdded } }
//! use annals_sqlite::{Config, Store};
//!
//! # async fn run() -> Result<(), annals_sqlite::Error> {
//! let store: Store<LibraryEvent> = Store::open(&Config::new("sqlite://library.db")).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod projection;
mod store;

pub use config::Config;
pub use error::Error;
pub use projection::SqlProjection;
pub use store::Store;
