//! Read-side primitives.
//!
//! A [`Projection`] derives a queryable view from the event stream. Every run
//! (a save or a rebuild) drives it through the same cycle inside one storage
//! transaction:
//!
//! ```text
//! Idle --load--> Loaded --project*--> Projecting --save--> Idle
//! ```
//!
//! [`Projectionist`] fans that cycle out over every registered projection, so
//! a failing projection aborts the whole transaction, event writes included.
//!
//! The trait is generic over the backend's transaction handle `Tx`; backends
//! pass their open transaction through so view writes commit (or roll back)
//! together with the events that caused them.

use async_trait::async_trait;
use thiserror::Error;

use crate::event::{EventDescriptor, EventSet};

/// Boxed error for handler and storage failures raised inside a projection.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by a single projection.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// `project` or `save` was called without a preceding `load`.
    #[error("projection used outside a load/save run")]
    NotLoaded,
    /// The projection received an event type it does not account for.
    #[error("no handler registered for event type `{0}`")]
    UnhandledEventType(&'static str),
    /// A second handler was registered for the same event type.
    #[error("a handler for event type `{0}` is already registered")]
    DuplicateHandler(&'static str),
    /// A handler was dispatched an event of another type.
    #[error("handler for `{expected}` was dispatched a `{found}` event")]
    VariantMismatch {
        /// Kind the handler was registered for.
        expected: &'static str,
        /// Kind of the event it received.
        found: &'static str,
    },
    /// A persisted view could not be encoded or decoded.
    #[error("failed to encode or decode view: {0}")]
    View(#[source] serde_json::Error),
    /// Reading or writing the view's storage failed.
    #[error("view storage failed: {0}")]
    Storage(#[source] BoxError),
    /// A fallible handler returned an error.
    #[error("projection handler failed: {0}")]
    Handler(#[source] BoxError),
    /// The name is already taken in the registry.
    #[error("a projection named `{0}` is already registered")]
    DuplicateProjection(String),
    /// No projection is registered under the name.
    #[error("no projection named `{0}` is registered")]
    UnknownProjection(String),
}

/// A projection error tagged with the name it was registered under.
#[derive(Debug, Error)]
#[error("projection `{name}` failed: {source}")]
pub struct ProjectionFailure {
    /// Registered name of the failing projection.
    pub name: String,
    /// What went wrong.
    #[source]
    pub source: ProjectionError,
}

impl ProjectionFailure {
    /// Tag `source` with the projection's name.
    pub fn new(name: impl Into<String>, source: ProjectionError) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }
}

/// A derived view maintained inside the event log's transactions.
#[async_trait]
pub trait Projection<E: EventSet, Tx: Send>: Send {
    /// Prepare for a run: ensure storage exists and start with an empty
    /// per-run cache.
    async fn load(&mut self, tx: &mut Tx) -> Result<(), ProjectionError>;

    /// Fold one event into the view of the aggregate it belongs to.
    async fn project(
        &mut self,
        tx: &mut Tx,
        event: &EventDescriptor<E>,
    ) -> Result<(), ProjectionError>;

    /// Persist every view touched during the run and discard the cache.
    async fn save(&mut self, tx: &mut Tx) -> Result<(), ProjectionError>;

    /// Delete every persisted view, ahead of a rebuild.
    async fn wipe(&mut self, tx: &mut Tx) -> Result<(), ProjectionError>;
}

/// A projection with no storage that reacts to each event as it is saved.
///
/// Failing the action aborts the save.
pub struct StatelessProjection<F> {
    action: F,
}

impl<F> StatelessProjection<F> {
    /// Wrap `action`, called once per projected event.
    pub const fn new(action: F) -> Self {
        Self { action }
    }
}

#[async_trait]
impl<E, Tx, F> Projection<E, Tx> for StatelessProjection<F>
where
    E: EventSet,
    Tx: Send,
    F: FnMut(&EventDescriptor<E>) -> Result<(), ProjectionError> + Send,
{
    async fn load(&mut self, _tx: &mut Tx) -> Result<(), ProjectionError> {
        Ok(())
    }

    async fn project(
        &mut self,
        _tx: &mut Tx,
        event: &EventDescriptor<E>,
    ) -> Result<(), ProjectionError> {
        (self.action)(event)
    }

    async fn save(&mut self, _tx: &mut Tx) -> Result<(), ProjectionError> {
        Ok(())
    }

    async fn wipe(&mut self, _tx: &mut Tx) -> Result<(), ProjectionError> {
        Ok(())
    }
}

struct Registered<E, Tx> {
    name: String,
    projection: Box<dyn Projection<E, Tx>>,
}

/// Fan-out coordinator running every registered projection in lockstep.
///
/// Projections run in registration order.
pub struct Projectionist<E, Tx> {
    projections: Vec<Registered<E, Tx>>,
}

impl<E: EventSet, Tx: Send> Default for Projectionist<E, Tx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EventSet, Tx: Send> Projectionist<E, Tx> {
    /// An empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            projections: Vec::new(),
        }
    }

    /// Register a projection under a unique name.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::DuplicateProjection`] if `name` is taken.
    pub fn register<P>(&mut self, name: impl Into<String>, projection: P) -> Result<(), ProjectionError>
    where
        P: Projection<E, Tx> + 'static,
    {
        let name = name.into();
        if self.contains(&name) {
            return Err(ProjectionError::DuplicateProjection(name));
        }
        tracing::debug!(projection = %name, "projection registered");
        self.projections.push(Registered {
            name,
            projection: Box::new(projection),
        });
        Ok(())
    }

    /// Whether a projection is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.projections.iter().any(|entry| entry.name == name)
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.projections.iter().map(|entry| entry.name.as_str())
    }

    /// Number of registered projections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.projections.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.projections.is_empty()
    }

    /// The projection registered under `name`.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut (dyn Projection<E, Tx> + 'static)> {
        self.projections
            .iter_mut()
            .find(|entry| entry.name == name)
            .map(|entry| entry.projection.as_mut())
    }

    /// Start a run on every projection.
    ///
    /// # Errors
    ///
    /// Stops at the first failing projection.
    pub async fn load(&mut self, tx: &mut Tx) -> Result<(), ProjectionFailure> {
        for entry in &mut self.projections {
            entry
                .projection
                .load(tx)
                .await
                .map_err(|source| ProjectionFailure::new(&entry.name, source))?;
        }
        Ok(())
    }

    /// Feed one event to every projection.
    ///
    /// # Errors
    ///
    /// Stops at the first failing projection.
    pub async fn project(
        &mut self,
        tx: &mut Tx,
        event: &EventDescriptor<E>,
    ) -> Result<(), ProjectionFailure> {
        for entry in &mut self.projections {
            tracing::trace!(
                projection = %entry.name,
                aggregate_id = %event.aggregate_id,
                sequence = event.sequence,
                "projecting event"
            );
            entry
                .projection
                .project(tx, event)
                .await
                .map_err(|source| ProjectionFailure::new(&entry.name, source))?;
        }
        Ok(())
    }

    /// Flush every projection's touched views.
    ///
    /// # Errors
    ///
    /// Stops at the first failing projection.
    pub async fn save(&mut self, tx: &mut Tx) -> Result<(), ProjectionFailure> {
        for entry in &mut self.projections {
            entry
                .projection
                .save(tx)
                .await
                .map_err(|source| ProjectionFailure::new(&entry.name, source))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::event::tests::{AccountEvent, Deposited, Opened};

    /// Stand-in for a storage transaction: records every call in order.
    #[derive(Default)]
    struct Journal(Vec<String>);

    struct Recording {
        label: &'static str,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl Projection<AccountEvent, Journal> for Recording {
        async fn load(&mut self, tx: &mut Journal) -> Result<(), ProjectionError> {
            tx.0.push(format!("{}:load", self.label));
            Ok(())
        }

        async fn project(
            &mut self,
            tx: &mut Journal,
            event: &EventDescriptor<AccountEvent>,
        ) -> Result<(), ProjectionError> {
            if self.fail_on == Some(event.event_type()) {
                return Err(ProjectionError::UnhandledEventType(event.event_type()));
            }
            tx.0.push(format!("{}:{}", self.label, event.event_type()));
            Ok(())
        }

        async fn save(&mut self, tx: &mut Journal) -> Result<(), ProjectionError> {
            tx.0.push(format!("{}:save", self.label));
            Ok(())
        }

        async fn wipe(&mut self, tx: &mut Journal) -> Result<(), ProjectionError> {
            tx.0.push(format!("{}:wipe", self.label));
            Ok(())
        }
    }

    fn recording(label: &'static str) -> Recording {
        Recording {
            label,
            fail_on: None,
        }
    }

    fn descriptor(sequence: i64, event: impl Into<AccountEvent>) -> EventDescriptor<AccountEvent> {
        EventDescriptor::new(Uuid::nil(), sequence, Utc::now(), event.into())
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut projectionist = Projectionist::<AccountEvent, Journal>::new();
        projectionist.register("balances", recording("a")).unwrap();

        let error = projectionist
            .register("balances", recording("b"))
            .unwrap_err();

        assert!(matches!(error, ProjectionError::DuplicateProjection(name) if name == "balances"));
        assert_eq!(projectionist.len(), 1);
    }

    #[tokio::test]
    async fn runs_every_projection_in_registration_order() {
        let mut projectionist = Projectionist::new();
        projectionist.register("first", recording("a")).unwrap();
        projectionist.register("second", recording("b")).unwrap();
        let mut tx = Journal::default();

        projectionist.load(&mut tx).await.unwrap();
        projectionist
            .project(
                &mut tx,
                &descriptor(
                    0,
                    Opened {
                        owner: "ada".to_owned(),
                    },
                ),
            )
            .await
            .unwrap();
        projectionist.save(&mut tx).await.unwrap();

        assert_eq!(
            tx.0,
            vec![
                "a:load", "b:load", "a:Opened", "b:Opened", "a:save", "b:save"
            ]
        );
        assert_eq!(projectionist.names().collect::<Vec<_>>(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn failure_names_the_projection_and_stops_fan_out() {
        let mut projectionist = Projectionist::new();
        projectionist
            .register(
                "strict",
                Recording {
                    label: "a",
                    fail_on: Some("Deposited"),
                },
            )
            .unwrap();
        projectionist.register("lenient", recording("b")).unwrap();
        let mut tx = Journal::default();

        let failure = projectionist
            .project(&mut tx, &descriptor(1, Deposited { amount: 3 }))
            .await
            .unwrap_err();

        assert_eq!(failure.name, "strict");
        assert!(matches!(
            failure.source,
            ProjectionError::UnhandledEventType("Deposited")
        ));
        assert!(tx.0.is_empty());
    }

    #[tokio::test]
    async fn get_mut_reaches_a_single_projection() {
        let mut projectionist = Projectionist::new();
        projectionist.register("first", recording("a")).unwrap();
        projectionist.register("second", recording("b")).unwrap();
        let mut tx = Journal::default();

        let projection = projectionist.get_mut("second").unwrap();
        projection.wipe(&mut tx).await.unwrap();

        assert_eq!(tx.0, vec!["b:wipe"]);
        assert!(projectionist.get_mut("third").is_none());
    }

    #[tokio::test]
    async fn stateless_projection_sees_every_event() {
        let mut seen = Vec::new();
        {
            let mut projection = StatelessProjection::new(|event: &EventDescriptor<AccountEvent>| {
                seen.push(event.sequence);
                Ok(())
            });
            let mut tx = Journal::default();

            for sequence in 0..3 {
                Projection::<AccountEvent, Journal>::project(
                    &mut projection,
                    &mut tx,
                    &descriptor(sequence, Deposited { amount: 1 }),
                )
                .await
                .unwrap();
            }
        }

        assert_eq!(seen, vec![0, 1, 2]);
    }
}
