//! A personal library, event sourced into SQLite.
//!
//! Imports a few books, reads one of them, then shows the optimistic
//! concurrency check rejecting a stale writer and rebuilds the view from the
//! log.
//!
//! Run with: `cargo run --example library`
//!
//! Set `RUST_LOG=annals_sqlite=debug` to watch the store's spans.

use std::collections::{BTreeSet, HashSet};

use annals::{
    Aggregate, AggregateError, AggregateState, DomainEvent, Handlers,
    store::sqlite::{Config, Error, SqlProjection, Store},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// =============================================================================
// Domain Events
// =============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LibraryCreated {
    pub name: String,
}

impl DomainEvent for LibraryCreated {
    const KIND: &'static str = "LibraryCreated";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BookImported {
    pub isbn: String,
    pub title: String,
    pub tags: Vec<String>,
}

impl DomainEvent for BookImported {
    const KIND: &'static str = "BookImported";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BookStarted {
    pub isbn: String,
    pub when: DateTime<Utc>,
}

impl DomainEvent for BookStarted {
    const KIND: &'static str = "BookStarted";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BookFinished {
    pub isbn: String,
    pub when: DateTime<Utc>,
}

impl DomainEvent for BookFinished {
    const KIND: &'static str = "BookFinished";
}

annals::events! {
    #[derive(Clone, Debug)]
    pub enum LibraryEvent {
        LibraryCreated,
        BookImported,
        BookStarted,
        BookFinished,
    }
}

// =============================================================================
// Aggregate
// =============================================================================

#[derive(Default)]
pub struct Library {
    known_isbns: HashSet<String>,
}

impl Aggregate for Library {
    type Event = LibraryEvent;

    fn register(handlers: &mut Handlers<Self>) -> Result<(), AggregateError> {
        handlers
            .on(|_: &mut Self, _: &LibraryCreated| {})?
            .on(|library: &mut Self, event: &BookImported| {
                library.known_isbns.insert(event.isbn.clone());
            })?
            .on(|_: &mut Self, _: &BookStarted| {})?
            .on(|_: &mut Self, _: &BookFinished| {})?;
        Ok(())
    }
}

/// Import a book unless the library already holds it.
fn import(
    library: &mut AggregateState<Library>,
    isbn: &str,
    title: &str,
    tags: &[&str],
) -> Result<(), AggregateError> {
    if library.state().known_isbns.contains(isbn) {
        return Ok(());
    }
    library.apply(BookImported {
        isbn: isbn.to_owned(),
        title: title.to_owned(),
        tags: tags.iter().map(ToString::to_string).collect(),
    })?;
    Ok(())
}

// =============================================================================
// Projection
// =============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LibraryView {
    name: String,
    tags: BTreeSet<String>,
    books: Vec<Shelved>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Shelved {
    isbn: String,
    title: String,
    state: String,
}

fn library_view() -> Result<SqlProjection<LibraryView, LibraryEvent>, Error> {
    let set_state = |view: &mut LibraryView, isbn: &str, state: &str| {
        if let Some(book) = view.books.iter_mut().find(|book| book.isbn == isbn) {
            book.state = state.to_owned();
        }
    };

    SqlProjection::new("library_view")?
        .on(|view: &mut LibraryView, event: &LibraryCreated, _| {
            view.name.clone_from(&event.name);
        })?
        .on(|view: &mut LibraryView, event: &BookImported, _| {
            view.tags.extend(event.tags.iter().cloned());
            view.books.push(Shelved {
                isbn: event.isbn.clone(),
                title: event.title.clone(),
                state: "unread".to_owned(),
            });
        })?
        .on(move |view: &mut LibraryView, event: &BookStarted, _| {
            set_state(view, &event.isbn, "reading");
        })?
        .on(move |view: &mut LibraryView, event: &BookFinished, _| {
            set_state(view, &event.isbn, "read");
        })
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let store: Store<LibraryEvent> = Store::open(&Config::default()).await?;
    store.register_projection("library_view", library_view()?).await?;

    let id = Uuid::new_v4();
    let mut library = AggregateState::<Library>::new(id)?;
    library.apply(LibraryCreated {
        name: "Home".to_owned(),
    })?;
    import(&mut library, "9780441013593", "Dune", &["sf"])?;
    import(&mut library, "9780141439518", "Emma", &["classics"])?;
    import(&mut library, "9780441013593", "Dune", &["sf"])?;
    let written = store.save_aggregate(&mut library).await?;
    println!("saved {written} events, library at sequence {}", library.sequence());

    let mut reader = store.load_aggregate::<Library>(id).await?;
    reader.apply(BookStarted {
        isbn: "9780441013593".to_owned(),
        when: Utc::now(),
    })?;
    reader.apply(BookFinished {
        isbn: "9780441013593".to_owned(),
        when: Utc::now(),
    })?;
    store.save_aggregate(&mut reader).await?;

    // `library` still believes it is at the sequence it saved earlier.
    import(&mut library, "9780199535569", "Ulysses", &["modernist"])?;
    match store.save_aggregate(&mut library).await {
        Err(error) if error.is_conflict() => println!("stale writer rejected: {error}"),
        other => println!("unexpected outcome: {other:?}"),
    }

    let view: Option<LibraryView> = store.view_by_id("library_view", id).await?;
    println!("view: {view:#?}");

    let replayed = store.rebuild("library_view").await?;
    println!("rebuilt library_view from {replayed} events");

    let found: Option<LibraryView> = store
        .view_by_property("library_view", "$.books[0].state", "read")
        .await?;
    println!("library with a finished first book: {:?}", found.map(|view| view.name));

    Ok(())
}
