//! Command-side domain primitives.
//!
//! An [`AggregateState`] owns the domain value, its identity, the sequence of
//! the last persisted event and the events applied since then. Handlers are
//! bound per event name in a [`Handlers`] table the domain fills in once via
//! [`Aggregate::register`].
//!
//! `apply` trusts its caller: business rules are checked by the domain's
//! command methods before an event is applied, and handlers cannot fail.

use std::{
    collections::{HashMap, hash_map::Entry},
    fmt,
};

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::event::{DomainEvent, EventDescriptor, EventSet, NO_EVENTS, Variant};

/// Domain state rebuilt from its own event history.
///
/// ```ignore
/// #[derive(Default)]
/// struct Library {
///     known_isbns: HashSet<String>,
/// }
///
/// impl Aggregate for Library {
///     type Event = LibraryEvent;
///
///     fn register(handlers: &mut Handlers<Self>) -> Result<(), AggregateError> {
///         handlers
///             .on(|library: &mut Self, event: &BookImported| {
///                 library.known_isbns.extend(event.isbns.iter().cloned());
///             })?
///             .on(|_: &mut Self, _: &BookStarted| {})?;
///         Ok(())
///     }
/// }
/// ```
pub trait Aggregate: Default + Send + Sync + 'static {
    /// The tagged union of events this aggregate is built from.
    type Event: EventSet;

    /// Bind one handler per event name this aggregate understands.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::DuplicateHandler`] if a name is bound twice.
    fn register(handlers: &mut Handlers<Self>) -> Result<(), AggregateError>;
}

/// Errors raised while registering handlers or applying events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    /// An event arrived for which no handler is bound.
    #[error("no handler registered for event type `{0}`")]
    UnregisteredEventType(&'static str),
    /// A second handler was bound to the same event name.
    #[error("a handler for event type `{0}` is already registered")]
    DuplicateHandler(&'static str),
    /// A handler was dispatched an event of another type.
    #[error("handler for `{expected}` was dispatched a `{found}` event")]
    VariantMismatch {
        /// Kind the handler was bound to.
        expected: &'static str,
        /// Kind of the event it received.
        found: &'static str,
    },
    /// A replayed event does not directly follow the current sequence.
    #[error("event with sequence {found} replayed out of order, expected {expected}")]
    OutOfOrder {
        /// The sequence that would have been accepted.
        expected: i64,
        /// The sequence the descriptor carries.
        found: i64,
    },
}

type Handler<A> =
    Box<dyn Fn(&mut A, &<A as Aggregate>::Event) -> Result<(), AggregateError> + Send + Sync>;

/// Handler table keyed by event name.
pub struct Handlers<A: Aggregate> {
    table: HashMap<&'static str, Handler<A>>,
}

impl<A: Aggregate> Handlers<A> {
    fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Bind `handler` to the event type `T`.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::DuplicateHandler`] if `T` is already bound.
    pub fn on<T, F>(&mut self, handler: F) -> Result<&mut Self, AggregateError>
    where
        T: DomainEvent + 'static,
        A::Event: Variant<T>,
        F: Fn(&mut A, &T) + Send + Sync + 'static,
    {
        match self.table.entry(T::KIND) {
            Entry::Occupied(_) => Err(AggregateError::DuplicateHandler(T::KIND)),
            Entry::Vacant(slot) => {
                slot.insert(Box::new(move |target: &mut A, event: &A::Event| {
                    let payload = <A::Event as Variant<T>>::as_variant(event)
                        .ok_or(AggregateError::VariantMismatch {
                            expected: T::KIND,
                            found: event.kind(),
                        })?;
                    handler(target, payload);
                    Ok(())
                }));
                Ok(self)
            }
        }
    }

    /// Whether a handler is bound to `kind`.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.table.contains_key(kind)
    }

    /// Number of bound handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether no handler is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn dispatch(&self, target: &mut A, event: &A::Event) -> Result<(), AggregateError> {
        let kind = event.kind();
        let handler = self
            .table
            .get(kind)
            .ok_or(AggregateError::UnregisteredEventType(kind))?;
        handler(target, event)
    }
}

impl<A: Aggregate> fmt::Debug for Handlers<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.table.keys().collect();
        kinds.sort_unstable();
        f.debug_struct("Handlers").field("kinds", &kinds).finish()
    }
}

/// In-memory state of one aggregate instance.
pub struct AggregateState<A: Aggregate> {
    id: Uuid,
    sequence: i64,
    handlers: Handlers<A>,
    pending: Vec<EventDescriptor<A::Event>>,
    state: A,
}

impl<A: Aggregate> AggregateState<A> {
    /// A blank aggregate with its handlers registered and no events.
    ///
    /// # Errors
    ///
    /// Propagates registration errors from [`Aggregate::register`].
    pub fn new(id: Uuid) -> Result<Self, AggregateError> {
        let mut handlers = Handlers::new();
        A::register(&mut handlers)?;
        Ok(Self {
            id,
            sequence: NO_EVENTS,
            handlers,
            pending: Vec::new(),
            state: A::default(),
        })
    }

    /// Bind an additional handler after construction.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::DuplicateHandler`] if `T` is already bound.
    pub fn register<T, F>(&mut self, handler: F) -> Result<&mut Self, AggregateError>
    where
        T: DomainEvent + 'static,
        A::Event: Variant<T>,
        F: Fn(&mut A, &T) + Send + Sync + 'static,
    {
        self.handlers.on(handler)?;
        Ok(self)
    }

    /// Identity of the aggregate.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Re-key the aggregate, e.g. before its first save.
    pub const fn set_id(&mut self, id: Uuid) {
        self.id = id;
    }

    /// Sequence of the last persisted (or replayed) event, `-1` if none.
    #[must_use]
    pub const fn sequence(&self) -> i64 {
        self.sequence
    }

    /// `true` until the first event has been persisted or replayed.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        self.sequence == NO_EVENTS
    }

    /// The domain value folded from every event so far.
    #[must_use]
    pub const fn state(&self) -> &A {
        &self.state
    }

    /// The handler table built from [`Aggregate::register`].
    #[must_use]
    pub const fn handlers(&self) -> &Handlers<A> {
        &self.handlers
    }

    /// Events applied in-process and not yet persisted, in apply order.
    #[must_use]
    pub fn pending(&self) -> &[EventDescriptor<A::Event>] {
        &self.pending
    }

    fn next_sequence(&self) -> i64 {
        self.pending
            .last()
            .map_or(self.sequence, |descriptor| descriptor.sequence)
            + 1
    }

    /// Apply a new event: run its handler and queue it for persistence.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::UnregisteredEventType`] if no handler is
    /// bound for the event's name. The state and pending list are untouched
    /// in that case.
    pub fn apply(
        &mut self,
        event: impl Into<A::Event>,
    ) -> Result<&EventDescriptor<A::Event>, AggregateError> {
        let event = event.into();
        self.handlers.dispatch(&mut self.state, &event)?;

        let descriptor = EventDescriptor::new(self.id, self.next_sequence(), Utc::now(), event);
        tracing::trace!(
            aggregate_id = %self.id,
            sequence = descriptor.sequence,
            event_type = descriptor.event_type(),
            "event applied"
        );
        self.pending.push(descriptor);
        Ok(&self.pending[self.pending.len() - 1])
    }

    /// Replay a stored event while loading history.
    ///
    /// Runs the handler and advances the persisted sequence. The pending list
    /// is not touched.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::UnregisteredEventType`] for an unbound name
    /// and [`AggregateError::OutOfOrder`] if the descriptor does not directly
    /// follow the current sequence.
    pub fn replay(&mut self, descriptor: &EventDescriptor<A::Event>) -> Result<(), AggregateError> {
        let expected = self.sequence + 1;
        if descriptor.sequence != expected {
            return Err(AggregateError::OutOfOrder {
                expected,
                found: descriptor.sequence,
            });
        }
        self.handlers.dispatch(&mut self.state, &descriptor.event)?;
        self.sequence = descriptor.sequence;
        Ok(())
    }

    /// Take the pending events for persistence.
    ///
    /// Advances the persisted sequence to the last drained event and clears
    /// the buffer. Call after the events have been durably written.
    pub fn drain_pending(&mut self) -> Vec<EventDescriptor<A::Event>> {
        let drained = std::mem::take(&mut self.pending);
        if let Some(last) = drained.last() {
            self.sequence = last.sequence;
        }
        drained
    }
}

impl<A> fmt::Debug for AggregateState<A>
where
    A: Aggregate + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateState")
            .field("id", &self.id)
            .field("sequence", &self.sequence)
            .field("pending", &self.pending.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
