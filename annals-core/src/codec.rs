//! Mapping between stable event names and concrete event values.
//!
//! A [`Registry`] is built once at startup from the `(name, decoder)` pairs a
//! domain enumerates through [`EventSet::registrations`]. The store owns it
//! and uses it to turn stored payloads back into the domain's tagged union.
//! Payloads are encoded as JSON.

use std::{collections::HashMap, fmt};

use thiserror::Error;

use crate::event::{DomainEvent, EventSet};

/// Decoder from a stored payload into the tagged union `E`.
pub type Decoder<E> = fn(&str) -> Result<E, serde_json::Error>;

/// Error returned when encoding or decoding a stored event fails.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No decoder is registered under the stored name.
    #[error("unknown event type `{kind}`, expected one of {expected:?}")]
    UnknownEventType {
        /// The unrecognized event type name.
        kind: String,
        /// Every name the registry can decode.
        expected: Vec<&'static str>,
    },
    /// Two registrations share one name.
    #[error("event type `{kind}` is registered more than once")]
    DuplicateEventType {
        /// The colliding name.
        kind: &'static str,
    },
    /// The stored payload does not match the registered event's shape.
    #[error("failed to decode `{kind}` payload: {source}")]
    Decode {
        /// Name the payload was stored under.
        kind: String,
        /// The deserializer's complaint.
        #[source]
        source: serde_json::Error,
    },
    /// The event could not be encoded.
    #[error("failed to encode `{kind}` payload: {source}")]
    Encode {
        /// Kind of the event being encoded.
        kind: &'static str,
        /// The serializer's complaint.
        #[source]
        source: serde_json::Error,
    },
}

/// One `(name, decoder)` pair.
pub struct Registration<E> {
    kind: &'static str,
    decode: Decoder<E>,
}

impl<E> Registration<E> {
    /// Registration for the concrete event `T`, decoded into `E`.
    #[must_use]
    pub fn of<T>() -> Self
    where
        T: DomainEvent + Into<E>,
    {
        Self {
            kind: T::KIND,
            decode: decode_as::<T, E>,
        }
    }

    /// Name the decoder is registered under.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        self.kind
    }
}

impl<E> Clone for Registration<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for Registration<E> {}

impl<E> fmt::Debug for Registration<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

fn decode_as<T, E>(payload: &str) -> Result<E, serde_json::Error>
where
    T: DomainEvent + Into<E>,
{
    serde_json::from_str::<T>(payload).map(Into::into)
}

/// Explicit table of the event types a store can decode.
pub struct Registry<E> {
    decoders: HashMap<&'static str, Decoder<E>>,
}

impl<E: EventSet> Registry<E> {
    /// Build the registry for every variant of `E`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::DuplicateEventType`] if two variants of `E`
    /// share a name.
    pub fn new() -> Result<Self, CodecError> {
        Self::from_registrations(E::registrations())
    }

    /// Build a registry from an explicit list of registrations.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::DuplicateEventType`] on a name collision.
    pub fn from_registrations(
        registrations: impl IntoIterator<Item = Registration<E>>,
    ) -> Result<Self, CodecError> {
        let mut decoders = HashMap::new();
        for registration in registrations {
            if decoders
                .insert(registration.kind, registration.decode)
                .is_some()
            {
                return Err(CodecError::DuplicateEventType {
                    kind: registration.kind,
                });
            }
        }
        Ok(Self { decoders })
    }

    /// Whether `kind` can be decoded.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.decoders.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Encode an event's payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    pub fn serialize(&self, event: &E) -> Result<String, CodecError> {
        event.encode().map_err(|source| CodecError::Encode {
            kind: event.kind(),
            source,
        })
    }

    /// Decode a stored payload registered under `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownEventType`] if `kind` is not registered
    /// and [`CodecError::Decode`] if the payload does not match its shape.
    pub fn deserialize(&self, kind: &str, payload: &str) -> Result<E, CodecError> {
        let decode = self
            .decoders
            .get(kind)
            .ok_or_else(|| CodecError::UnknownEventType {
                kind: kind.to_owned(),
                expected: self.kinds(),
            })?;
        decode(payload).map_err(|source| CodecError::Decode {
            kind: kind.to_owned(),
            source,
        })
    }
}

impl<E> Clone for Registry<E> {
    fn clone(&self) -> Self {
        Self {
            decoders: self.decoders.clone(),
        }
    }
}

impl<E> fmt::Debug for Registry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.decoders.keys().collect();
        kinds.sort_unstable();
        f.debug_struct("Registry").field("kinds", &kinds).finish()
    }
}
