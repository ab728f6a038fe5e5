//! Core traits and types for the annals event-sourcing engine.
//!
//! This crate provides the backend-agnostic building blocks:
//!
//! - [`event`] - Event markers (`DomainEvent`, `EventSet`), the [`events!`]
//!   macro and the `EventDescriptor` envelope
//! - [`codec`] - Explicit `(name, decoder)` registry used to rebuild events
//!   from stored payloads
//! - [`aggregate`] - In-memory aggregate state with handler table, pending
//!   events and sequence cursor
//! - [`concurrency`] - Optimistic concurrency conflict reporting
//! - [`store`] - Event log abstraction (`EventStore`) plus load/save helpers
//! - [`projection`] - Read-side primitives (`Projection`, `Projectionist`)
//!
//! Most users should depend on the [`annals`](https://docs.rs/annals) crate,
//! which re-exports these types alongside the `SQLite` backend.

pub mod aggregate;
pub mod codec;
pub mod concurrency;
pub mod event;
pub mod projection;
pub mod store;

#[doc(hidden)]
pub mod __private {
    pub use serde_json;
}
