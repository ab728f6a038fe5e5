//! Optimistic concurrency conflict reporting.
//!
//! The event log accepts at most one append per `(aggregate, sequence)`. A
//! writer whose in-memory sequence is stale is rejected with a
//! [`ConcurrencyConflict`]; the caller is expected to reload the aggregate and
//! retry. Nothing inside the engine retries on its own.

use thiserror::Error;
use uuid::Uuid;

use crate::event::NO_EVENTS;

/// Error indicating another writer appended to the aggregate first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", format_conflict(.aggregate_id, *.expected, *.actual))]
pub struct ConcurrencyConflict {
    /// Aggregate both writers targeted.
    pub aggregate_id: Uuid,
    /// The sequence the writer believed was the latest (`-1` for a new
    /// aggregate).
    pub expected: i64,
    /// The latest sequence actually persisted.
    pub actual: i64,
}

/// Build a human-readable message for a [`ConcurrencyConflict`], including an
/// actionable hint for the caller.
fn format_conflict(aggregate_id: &Uuid, expected: i64, actual: i64) -> String {
    if expected == NO_EVENTS {
        format!(
            "concurrency conflict on {aggregate_id}: expected new aggregate, found sequence \
             {actual} (hint: another process created this aggregate; reload and retry)"
        )
    } else {
        format!(
            "concurrency conflict on {aggregate_id}: expected sequence {expected}, found \
             {actual} (hint: aggregate was modified; reload and retry)"
        )
    }
}
