//! Domain events and the envelope recorded for each applied event.
//!
//! `DomainEvent` is the lightweight trait every concrete event struct
//! implements. Events belonging to one aggregate are grouped into a tagged
//! union (an [`EventSet`]), normally generated with the [`events!`] macro, so
//! that handlers dispatch on an explicit tag rather than on runtime type
//! information.
//!
//! [`events!`]: crate::events

use std::{fmt, sync::OnceLock};

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::codec::Registration;

/// Marker trait for events that can be persisted in the event log.
///
/// Each event carries a unique [`Self::KIND`] identifier so the store can
/// route stored payloads back to the correct type when replaying. By
/// convention the kind is the struct name, without a namespace.
///
/// ```
/// use annals_core::event::DomainEvent;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct BookStarted {
///     isbn: String,
/// }
///
/// impl DomainEvent for BookStarted {
///     const KIND: &'static str = "BookStarted";
/// }
/// ```
pub trait DomainEvent: Serialize + DeserializeOwned {
    /// Stable name the event is stored and registered under.
    const KIND: &'static str;
}

/// Extension trait for getting the event kind from an event instance.
///
/// Blanket-implemented for every [`DomainEvent`].
pub trait EventKind {
    /// The event's [`DomainEvent::KIND`].
    fn kind(&self) -> &'static str;
}

impl<T: DomainEvent> EventKind for T {
    fn kind(&self) -> &'static str {
        T::KIND
    }
}

/// A tagged union over the events of one domain.
///
/// Implemented by the enums generated with [`events!`](crate::events). The
/// set of kinds is fixed at compile time, and [`EventSet::registrations`]
/// enumerates the `(name, decoder)` pairs used to build a
/// [`Registry`](crate::codec::Registry).
pub trait EventSet: Sized + Send + Sync + 'static {
    /// Every kind this union can hold, in declaration order.
    const KINDS: &'static [&'static str];

    /// Stable name of the variant held by this value.
    fn kind(&self) -> &'static str;

    /// Encode the payload of the held variant.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the payload cannot be encoded.
    fn encode(&self) -> Result<String, serde_json::Error>;

    /// The `(name, decoder)` pairs for every variant.
    fn registrations() -> Vec<Registration<Self>>;
}

/// Access to one concrete variant of an [`EventSet`].
pub trait Variant<T>: EventSet {
    /// The held payload if it is a `T`.
    fn as_variant(&self) -> Option<&T>;
}

/// Declare the tagged union of a domain's events.
///
/// Every listed type must implement [`DomainEvent`] and is held by a variant
/// of the same name. The macro generates `From` conversions, [`Variant`]
/// accessors and the [`EventSet`] implementation.
///
/// ```
/// use annals_core::event::{DomainEvent, EventSet};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// pub struct ShelfCreated {
///     pub name: String,
/// }
///
/// impl DomainEvent for ShelfCreated {
///     const KIND: &'static str = "ShelfCreated";
/// }
///
/// #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// pub struct ShelfRenamed {
///     pub name: String,
/// }
///
/// impl DomainEvent for ShelfRenamed {
///     const KIND: &'static str = "ShelfRenamed";
/// }
///
/// annals_core::events! {
///     #[derive(Debug, Clone, PartialEq)]
///     pub enum ShelfEvent {
///         ShelfCreated,
///         ShelfRenamed,
///     }
/// }
///
/// let event: ShelfEvent = ShelfRenamed { name: "to-read".into() }.into();
/// assert_eq!(event.kind(), "ShelfRenamed");
/// assert_eq!(ShelfEvent::KINDS, &["ShelfCreated", "ShelfRenamed"]);
/// ```
#[macro_export]
macro_rules! events {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $(
                #[doc = ::core::concat!("A [`", ::core::stringify!($variant), "`] event.")]
                $variant($variant),
            )+
        }

        $(
            impl ::core::convert::From<$variant> for $name {
                fn from(event: $variant) -> Self {
                    Self::$variant(event)
                }
            }

            impl $crate::event::Variant<$variant> for $name {
                #[allow(unreachable_patterns)]
                fn as_variant(&self) -> ::core::option::Option<&$variant> {
                    match self {
                        Self::$variant(event) => ::core::option::Option::Some(event),
                        _ => ::core::option::Option::None,
                    }
                }
            }
        )+

        impl $crate::event::EventSet for $name {
            const KINDS: &'static [&'static str] =
                &[$(<$variant as $crate::event::DomainEvent>::KIND),+];

            fn kind(&self) -> &'static str {
                match self {
                    $(Self::$variant(_) => <$variant as $crate::event::DomainEvent>::KIND,)+
                }
            }

            fn encode(
                &self,
            ) -> ::core::result::Result<
                ::std::string::String,
                $crate::__private::serde_json::Error,
            > {
                match self {
                    $(Self::$variant(event) => $crate::__private::serde_json::to_string(event),)+
                }
            }

            fn registrations() -> ::std::vec::Vec<$crate::codec::Registration<Self>> {
                ::std::vec![$($crate::codec::Registration::of::<$variant>()),+]
            }
        }
    };
}

/// Sequence value of an aggregate that has no events.
pub const NO_EVENTS: i64 = -1;

/// Envelope context handed to projection handlers alongside the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventMeta {
    /// Aggregate the event belongs to.
    pub aggregate_id: Uuid,
    /// Position of the event within the aggregate.
    pub sequence: i64,
    /// Capture time (UTC).
    pub timestamp: DateTime<Utc>,
}

/// An event together with its position in the aggregate's history.
///
/// The encoded payload is memoized, so a descriptor written to the log and
/// then inspected again is only serialized once.
pub struct EventDescriptor<E> {
    /// Aggregate the event belongs to.
    pub aggregate_id: Uuid,
    /// Position within the aggregate, gapless and strictly ascending from 0.
    pub sequence: i64,
    /// Capture time (UTC).
    pub timestamp: DateTime<Utc>,
    /// Decoded payload.
    pub event: E,
    encoded: OnceLock<String>,
}

impl<E> EventDescriptor<E> {
    /// Wrap `event` at `sequence` of `aggregate_id`.
    #[must_use]
    pub const fn new(aggregate_id: Uuid, sequence: i64, timestamp: DateTime<Utc>, event: E) -> Self {
        Self {
            aggregate_id,
            sequence,
            timestamp,
            event,
            encoded: OnceLock::new(),
        }
    }

    /// Envelope fields without the payload.
    #[must_use]
    pub const fn meta(&self) -> EventMeta {
        EventMeta {
            aggregate_id: self.aggregate_id,
            sequence: self.sequence,
            timestamp: self.timestamp,
        }
    }
}

impl<E: EventSet> EventDescriptor<E> {
    /// Stable type name of the payload.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        self.event.kind()
    }

    /// Encoded payload, computed on first use.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the payload cannot be encoded. A failed
    /// encoding is not cached.
    pub fn encoded(&self) -> Result<&str, serde_json::Error> {
        if let Some(encoded) = self.encoded.get() {
            return Ok(encoded);
        }
        let encoded = self.event.encode()?;
        Ok(self.encoded.get_or_init(|| encoded))
    }
}

impl<E: Clone> Clone for EventDescriptor<E> {
    fn clone(&self) -> Self {
        Self {
            aggregate_id: self.aggregate_id,
            sequence: self.sequence,
            timestamp: self.timestamp,
            event: self.event.clone(),
            encoded: self.encoded.clone(),
        }
    }
}

impl<E: PartialEq> PartialEq for EventDescriptor<E> {
    fn eq(&self, other: &Self) -> bool {
        self.aggregate_id == other.aggregate_id
            && self.sequence == other.sequence
            && self.timestamp == other.timestamp
            && self.event == other.event
    }
}

impl<E: fmt::Debug> fmt::Debug for EventDescriptor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDescriptor")
            .field("aggregate_id", &self.aggregate_id)
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Opened {
        pub owner: String,
    }

    impl DomainEvent for Opened {
        const KIND: &'static str = "Opened";
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Deposited {
        pub amount: i64,
    }

    impl DomainEvent for Deposited {
        const KIND: &'static str = "Deposited";
    }

    crate::events! {
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum AccountEvent {
            Opened,
            Deposited,
        }
    }

    #[test]
    fn generated_union_reports_kinds_in_declaration_order() {
        assert_eq!(AccountEvent::KINDS, &["Opened", "Deposited"]);

        let event = AccountEvent::from(Deposited { amount: 5 });
        assert_eq!(event.kind(), "Deposited");
        assert_eq!(Deposited { amount: 5 }.kind(), "Deposited");
    }

    #[test]
    fn variant_accessor_only_matches_held_variant() {
        let event = AccountEvent::from(Opened {
            owner: "ada".to_owned(),
        });

        let opened: Option<&Opened> = event.as_variant();
        let deposited: Option<&Deposited> = event.as_variant();

        assert_eq!(opened.map(|e| e.owner.as_str()), Some("ada"));
        assert!(deposited.is_none());
    }

    #[test]
    fn encoding_is_memoized_on_the_descriptor() {
        let descriptor = EventDescriptor::new(
            Uuid::new_v4(),
            0,
            Utc::now(),
            AccountEvent::from(Deposited { amount: 12 }),
        );

        let first = descriptor.encoded().unwrap().as_ptr();
        let second = descriptor.encoded().unwrap().as_ptr();

        assert_eq!(first, second);
        assert_eq!(descriptor.encoded().unwrap(), r#"{"amount":12}"#);
        assert_eq!(descriptor.event_type(), "Deposited");
    }

    #[test]
    fn descriptor_equality_ignores_encoding_cache() {
        let descriptor = EventDescriptor::new(
            Uuid::new_v4(),
            3,
            Utc::now(),
            AccountEvent::from(Deposited { amount: 1 }),
        );
        let copy = descriptor.clone();
        descriptor.encoded().unwrap();

        assert_eq!(descriptor, copy);
        assert_eq!(copy.meta().sequence, 3);
    }
}
