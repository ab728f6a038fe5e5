//! Shared test domain: a personal library.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashSet};

use annals::{
    Aggregate, AggregateError, AggregateState, DomainEvent, EventMeta, Handlers,
    store::sqlite::{Config, SqlProjection, Store},
};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const LIBRARY_VIEW: &str = "library_view";

// ============================================================================
// Events
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryCreated {
    pub id: Uuid,
}

impl DomainEvent for LibraryCreated {
    const KIND: &'static str = "LibraryCreated";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookImported {
    pub isbns: Vec<String>,
    pub title: String,
    pub author: String,
    pub publish_year: i32,
    pub rating: u8,
    pub read_count: u32,
    pub tags: Vec<String>,
    pub date_added: DateTime<Utc>,
    pub date_read: Option<DateTime<Utc>>,
}

impl DomainEvent for BookImported {
    const KIND: &'static str = "BookImported";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookAdded {
    pub isbns: Vec<String>,
    pub tags: Vec<String>,
    pub date_added: DateTime<Utc>,
}

impl DomainEvent for BookAdded {
    const KIND: &'static str = "BookAdded";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookStarted {
    pub isbn: String,
    pub when: DateTime<Utc>,
}

impl DomainEvent for BookStarted {
    const KIND: &'static str = "BookStarted";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookFinished {
    pub isbn: String,
    pub when: DateTime<Utc>,
}

impl DomainEvent for BookFinished {
    const KIND: &'static str = "BookFinished";
}

annals::events! {
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum LibraryEvent {
        LibraryCreated,
        BookImported,
        BookAdded,
        BookStarted,
        BookFinished,
    }
}

// ============================================================================
// Aggregate
// ============================================================================

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Library {
    pub known_isbns: HashSet<String>,
    pub reading: BTreeSet<String>,
    pub finished: u32,
}

impl Aggregate for Library {
    type Event = LibraryEvent;

    fn register(handlers: &mut Handlers<Self>) -> Result<(), AggregateError> {
        handlers
            .on(|_: &mut Self, _: &LibraryCreated| {})?
            .on(|library: &mut Self, event: &BookImported| {
                library.known_isbns.extend(event.isbns.iter().cloned());
            })?
            .on(|library: &mut Self, event: &BookAdded| {
                library.known_isbns.extend(event.isbns.iter().cloned());
            })?
            .on(|library: &mut Self, event: &BookStarted| {
                library.reading.insert(event.isbn.clone());
            })?
            .on(|library: &mut Self, event: &BookFinished| {
                library.reading.remove(&event.isbn);
                library.finished += 1;
            })?;
        Ok(())
    }
}

/// Command methods. Each checks the library's rules before applying.
pub trait LibraryCommands {
    fn import_book(&mut self, book: BookImported) -> Result<bool, AggregateError>;
    fn add_book(&mut self, isbns: &[&str], tags: &[&str]) -> Result<bool, AggregateError>;
    fn start_reading(&mut self, isbn: &str) -> Result<(), AggregateError>;
    fn finish_reading(&mut self, isbn: &str) -> Result<(), AggregateError>;
}

impl LibraryCommands for AggregateState<Library> {
    fn import_book(&mut self, book: BookImported) -> Result<bool, AggregateError> {
        if book.isbns.iter().any(|isbn| self.state().known_isbns.contains(isbn)) {
            return Ok(false);
        }
        self.apply(book)?;
        Ok(true)
    }

    fn add_book(&mut self, isbns: &[&str], tags: &[&str]) -> Result<bool, AggregateError> {
        if isbns.iter().any(|isbn| self.state().known_isbns.contains(*isbn)) {
            return Ok(false);
        }
        self.apply(BookAdded {
            isbns: isbns.iter().map(ToString::to_string).collect(),
            tags: tags.iter().map(ToString::to_string).collect(),
            date_added: fixed_time(1),
        })?;
        Ok(true)
    }

    fn start_reading(&mut self, isbn: &str) -> Result<(), AggregateError> {
        self.apply(BookStarted {
            isbn: isbn.to_owned(),
            when: fixed_time(2),
        })?;
        Ok(())
    }

    fn finish_reading(&mut self, isbn: &str) -> Result<(), AggregateError> {
        self.apply(BookFinished {
            isbn: isbn.to_owned(),
            when: fixed_time(3),
        })?;
        Ok(())
    }
}

/// A blank library with its creation event pending.
pub fn new_library(id: Uuid) -> AggregateState<Library> {
    let mut library = AggregateState::new(id).unwrap();
    library.apply(LibraryCreated { id }).unwrap();
    library
}

pub fn fixed_time(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap()
}

pub fn imported(isbn: &str, title: &str, tags: &[&str]) -> BookImported {
    BookImported {
        isbns: vec![isbn.to_owned()],
        title: title.to_owned(),
        author: "Anonymous".to_owned(),
        publish_year: 1900,
        rating: 4,
        read_count: 1,
        tags: tags.iter().map(ToString::to_string).collect(),
        date_added: fixed_time(1),
        date_read: None,
    }
}

// ============================================================================
// Projection
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryView {
    pub name: String,
    pub tags: BTreeSet<String>,
    pub books: Vec<LibraryEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub isbns: Vec<String>,
    pub title: String,
    pub added: DateTime<Utc>,
    pub tags: Vec<String>,
    pub state: String,
}

impl LibraryView {
    fn entry_mut(&mut self, isbn: &str) -> Option<&mut LibraryEntry> {
        self.books
            .iter_mut()
            .find(|entry| entry.isbns.iter().any(|known| known == isbn))
    }
}

pub fn library_view() -> SqlProjection<LibraryView, LibraryEvent> {
    SqlProjection::new(LIBRARY_VIEW)
        .unwrap()
        .on(|view: &mut LibraryView, event: &LibraryCreated, _: EventMeta| {
            view.name = format!("library-{}", event.id.simple());
        })
        .unwrap()
        .on(|view: &mut LibraryView, event: &BookImported, _: EventMeta| {
            view.tags.extend(event.tags.iter().cloned());
            view.books.push(LibraryEntry {
                isbns: event.isbns.clone(),
                title: event.title.clone(),
                added: event.date_added,
                tags: event.tags.clone(),
                state: if event.date_read.is_some() { "read" } else { "unread" }.to_owned(),
            });
        })
        .unwrap()
        .on(|view: &mut LibraryView, event: &BookAdded, _: EventMeta| {
            view.tags.extend(event.tags.iter().cloned());
            view.books.push(LibraryEntry {
                isbns: event.isbns.clone(),
                title: String::new(),
                added: event.date_added,
                tags: event.tags.clone(),
                state: "unread".to_owned(),
            });
        })
        .unwrap()
        .on(|view: &mut LibraryView, event: &BookStarted, _: EventMeta| {
            if let Some(entry) = view.entry_mut(&event.isbn) {
                entry.state = "reading".to_owned();
            }
        })
        .unwrap()
        .on(|view: &mut LibraryView, event: &BookFinished, _: EventMeta| {
            if let Some(entry) = view.entry_mut(&event.isbn) {
                entry.state = "read".to_owned();
            }
        })
        .unwrap()
}

// ============================================================================
// Store helpers
// ============================================================================

pub async fn memory_store() -> Store<LibraryEvent> {
    Store::open(&Config::default()).await.unwrap()
}

pub async fn store_with_view() -> Store<LibraryEvent> {
    let store = memory_store().await;
    store
        .register_projection(LIBRARY_VIEW, library_view())
        .await
        .unwrap();
    store
}
