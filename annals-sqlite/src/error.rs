use annals_core::{
    aggregate::AggregateError,
    codec::CodecError,
    concurrency::ConcurrencyConflict,
    projection::{ProjectionError, ProjectionFailure},
    store::LoadError,
};
use uuid::Uuid;

/// Errors raised by the `SQLite` store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The database rejected a query or could not be reached.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Another writer appended to the aggregate first; reload and retry.
    #[error(transparent)]
    Conflict(#[from] ConcurrencyConflict),
    /// A stored payload could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// A projection failed during a save or rebuild.
    #[error(transparent)]
    Projection(#[from] ProjectionFailure),
    /// A projection name is taken or unknown.
    #[error(transparent)]
    Registration(#[from] ProjectionError),
    /// Replaying history into an aggregate failed.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    /// The log holds no events for the aggregate.
    #[error("aggregate {0} does not exist")]
    NotFound(Uuid),
    /// A batch contained an event recorded against another aggregate.
    #[error("event {sequence} in the batch belongs to aggregate {found}, expected {expected}")]
    ForeignEvent {
        /// Sequence of the offending event.
        sequence: i64,
        /// Aggregate the batch was saved for.
        expected: Uuid,
        /// Aggregate the event names.
        found: Uuid,
    },
    /// A batch does not continue the expected sequence without gaps.
    #[error("event batch is not contiguous: expected sequence {expected}, found {found}")]
    InvalidSequence {
        /// Sequence the next event should carry.
        expected: i64,
        /// Sequence it actually carries.
        found: i64,
    },
    /// A view row could not be decoded into the requested type.
    #[error("failed to encode or decode view: {0}")]
    View(#[source] serde_json::Error),
    /// A projection table name is unsafe to interpolate into SQL.
    #[error("`{0}` is not a valid view table name")]
    InvalidTableName(String),
    /// The store configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// `true` for a stale-sequence rejection; the caller should reload and
    /// retry.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// `true` when the requested aggregate has no events.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<LoadError<Self>> for Error {
    fn from(error: LoadError<Self>) -> Self {
        match error {
            LoadError::NotFound(id) => Self::NotFound(id),
            LoadError::Store(error) => error,
            LoadError::Aggregate(error) => Self::Aggregate(error),
        }
    }
}
