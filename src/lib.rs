#![doc = include_str!("../README.md")]

pub use annals_core::{
    aggregate,
    aggregate::{Aggregate, AggregateError, AggregateState, Handlers},
    codec,
    codec::{CodecError, Registry},
    concurrency,
    concurrency::ConcurrencyConflict,
    event,
    event::{DomainEvent, EventDescriptor, EventKind, EventMeta, EventSet, NO_EVENTS, Variant},
    events,
    projection,
    projection::{Projection, ProjectionError, ProjectionFailure, Projectionist, StatelessProjection},
};

/// Event log trait, load/save helpers and the bundled stores.
pub mod store {
    pub use annals_core::store::{
        EventStore, EventStream, LoadError, NonEmpty, load_aggregate, save_aggregate,
    };

    pub use annals_core::store::inmemory;

    #[cfg(feature = "sqlite")]
    #[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
    /// The `SQLite` event log with co-transacted projections.
    pub mod sqlite {
        pub use annals_sqlite::{Config, Error, SqlProjection, Store};
    }
}
