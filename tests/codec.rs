//! Event codec: every library event survives a trip through the registry.

mod common;

use annals::{CodecError, EventSet, Registry};
use common::{
    BookAdded, BookFinished, BookStarted, LibraryCreated, LibraryEvent, fixed_time, imported,
};
use uuid::Uuid;

fn every_event() -> Vec<LibraryEvent> {
    vec![
        LibraryCreated { id: Uuid::new_v4() }.into(),
        imported("9780441013593", "Dune", &["sf", "classics"]).into(),
        common::BookImported {
            date_read: Some(fixed_time(9)),
            ..imported("9780141439518", "Emma", &[])
        }
        .into(),
        BookAdded {
            isbns: vec!["9780199535569".to_owned()],
            tags: vec![],
            date_added: fixed_time(4),
        }
        .into(),
        BookStarted {
            isbn: "9780441013593".to_owned(),
            when: fixed_time(5),
        }
        .into(),
        BookFinished {
            isbn: "9780441013593".to_owned(),
            when: fixed_time(6),
        }
        .into(),
    ]
}

#[test]
fn every_registered_event_round_trips() {
    let registry = Registry::<LibraryEvent>::new().unwrap();

    for event in every_event() {
        let payload = registry.serialize(&event).unwrap();
        let decoded = registry.deserialize(event.kind(), &payload).unwrap();
        assert_eq!(decoded, event);
    }
}

#[test]
fn registry_knows_every_library_event() {
    let registry = Registry::<LibraryEvent>::new().unwrap();

    assert_eq!(
        registry.kinds(),
        vec![
            "BookAdded",
            "BookFinished",
            "BookImported",
            "BookStarted",
            "LibraryCreated"
        ]
    );
}

#[test]
fn encoding_is_deterministic() {
    let registry = Registry::<LibraryEvent>::new().unwrap();
    let event: LibraryEvent = imported("1", "Emma", &["a", "b"]).into();

    assert_eq!(
        registry.serialize(&event).unwrap(),
        registry.serialize(&event.clone()).unwrap()
    );
}

#[test]
fn unknown_type_name_is_rejected() {
    let registry = Registry::<LibraryEvent>::new().unwrap();

    let error = registry.deserialize("BookLost", "{}").unwrap_err();

    assert!(matches!(error, CodecError::UnknownEventType { kind, .. } if kind == "BookLost"));
}

#[test]
fn payload_of_the_wrong_shape_is_a_decode_error() {
    let registry = Registry::<LibraryEvent>::new().unwrap();

    let error = registry
        .deserialize("BookStarted", r#"{"isbn": 42}"#)
        .unwrap_err();

    assert!(matches!(error, CodecError::Decode { .. }));
}

#[test]
fn colliding_names_are_rejected() {
    let twice = LibraryEvent::registrations()
        .into_iter()
        .chain(LibraryEvent::registrations());

    let error = Registry::<LibraryEvent>::from_registrations(twice).unwrap_err();

    assert!(matches!(error, CodecError::DuplicateEventType { .. }));
}
