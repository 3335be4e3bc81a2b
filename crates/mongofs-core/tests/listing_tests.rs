//! Directory listing, filters, and views.

mod common;

use common::*;
use mongofs_core::{DocumentStore, FsError, NodeKind, doc};
use std::time::Duration;

#[test]
fn test_every_directory_lists_dot_entries_first() {
    let (t, _) = people_fixture(Duration::ZERO);
    t.fs.mkdir("/test_db/people/by_age").unwrap();
    for dir in ["/", "/test_db", "/test_db/people", "/test_db/people/by_age", "/test_db/people/by_age/25"] {
        let entries = t.fs.readdir(dir).unwrap();
        assert_eq!(entries[0].name, ".", "{dir}");
        assert_eq!(entries[1].name, "..", "{dir}");
        assert!(entries[..2].iter().all(|e| e.kind == NodeKind::Directory));
    }
}

#[test]
fn test_collection_lists_every_document() {
    let (t, ids) = people_fixture(Duration::ZERO);
    let mut listed = t.ls("/test_db/people");
    listed.sort();
    let mut expected: Vec<String> = ids.iter().map(|id| format!("{id}.json")).collect();
    expected.sort();
    assert_eq!(listed, expected);
}

#[test]
fn test_query_filters_collection_listing() {
    let (t, ids) = people_fixture(Duration::ZERO);
    t.fs
        .write("/test_db/people/query.json", br#"{"age": {"$lte": 25}}"#, 0)
        .unwrap();

    let listed = t.ls("/test_db/people");
    assert!(listed.contains(&format!("{}.json", ids[0])));
    assert!(listed.contains(&format!("{}.json", ids[1])));
    assert!(!listed.contains(&format!("{}.json", ids[2])));
    assert!(listed.contains(&"query.json".to_string()));
    assert_eq!(listed.len(), 3);

    assert_eq!(t.cat("/test_db/people/query.json"), r#"{"age": {"$lte": 25}}"#);
}

#[test]
fn test_unlinking_query_restores_full_listing() {
    let (t, _) = people_fixture(Duration::ZERO);
    t.fs
        .write("/test_db/people/query.json", br#"{"age": 27}"#, 0)
        .unwrap();
    assert_eq!(t.ls("/test_db/people").len(), 2);

    t.fs.unlink("/test_db/people/query.json").unwrap();
    assert_eq!(t.ls("/test_db/people").len(), 3);
    assert!(matches!(
        t.fs.getattr("/test_db/people/query.json"),
        Err(FsError::NotFound(_))
    ));
}

#[test]
fn test_malformed_query_lists_everything() {
    let (t, _) = people_fixture(Duration::ZERO);
    t.fs
        .write("/test_db/people/query.json", b"{\"age\": ", 0)
        .unwrap();
    let listed = t.ls("/test_db/people");
    assert_eq!(listed.len(), 4);
    assert_eq!(t.cat("/test_db/people/query.json"), "{\"age\": ");
}

#[test]
fn test_by_field_view_lists_values_then_documents() {
    let (t, ids) = people_fixture(Duration::ZERO);
    t.fs.mkdir("/test_db/people/by_age").unwrap();

    assert_eq!(t.cat("/test_db/people/by_age/query.json"), r#"{"age": $1}"#);

    let mut values = t.ls("/test_db/people/by_age");
    values.retain(|n| n != "query.json");
    assert_eq!(values, vec!["0", "25", "27"]);

    assert!(t.fs.getattr("/test_db/people/by_age/25").unwrap().is_dir());
    let listed = t.ls("/test_db/people/by_age/25");
    assert_eq!(listed, vec![format!("{}.json", ids[0]), "query.json".to_string()]);
    assert_eq!(t.cat("/test_db/people/by_age/25/query.json"), r#"{"age": 25}"#);
}

#[test]
fn test_string_placeholder_under_view() {
    let t = TestFs::new();
    let bar = t.insert("db", "c", doc! { "foo" => "bar" });
    t.insert("db", "c", doc! { "foo" => "baz" });
    t.fs.write("/db/c/query.json", br#"{"foo":"$1"}"#, 0).unwrap();

    assert_eq!(t.cat("/db/c/bar/query.json"), r#"{"foo":"bar"}"#);
    assert_eq!(
        t.ls("/db/c/bar"),
        vec![format!("{bar}.json"), "query.json".to_string()]
    );
}

#[test]
fn test_custom_view_query_and_rmdir() {
    let (t, ids) = people_fixture(Duration::ZERO);
    t.fs.mkdir("/test_db/people/adults").unwrap();
    // An unfiltered view lists the whole collection.
    assert_eq!(t.ls("/test_db/people/adults").len(), 3);

    t.fs
        .write("/test_db/people/adults/query.json", br#"{"age": {"$gte": 18}}"#, 0)
        .unwrap();
    let listed = t.ls("/test_db/people/adults");
    assert_eq!(listed.len(), 3);
    assert!(!listed.contains(&format!("{}.json", ids[1])));

    assert!(t.ls("/test_db/people").contains(&"adults".to_string()));
    t.fs.rmdir("/test_db/people/adults").unwrap();
    assert!(!t.ls("/test_db/people").contains(&"adults".to_string()));
    assert!(matches!(
        t.fs.getattr("/test_db/people/adults"),
        Err(FsError::NotFound(_))
    ));
}

#[test]
fn test_mkdir_collection_and_view_errors() {
    let (t, _) = people_fixture(Duration::ZERO);
    assert!(matches!(t.fs.mkdir("/test_db/people"), Err(FsError::AlreadyExists(_))));
    assert!(matches!(
        t.fs.mkdir("/missing_db/people/view"),
        Err(FsError::NotFound(_))
    ));
    t.fs.mkdir("/test_db/pets").unwrap();
    assert!(t.ls("/test_db").contains(&"pets".to_string()));
    assert!(t.ls("/test_db/pets").is_empty());
    assert!(matches!(t.fs.rmdir("/test_db/pets"), Err(FsError::Unsupported { .. })));
}

#[test]
fn test_unknown_names_are_absent() {
    let (t, _) = people_fixture(Duration::ZERO);
    for p in ["/test_db/people/notes.txt", "/test_db/people/.DS_Store", "/test_db/people/view"] {
        assert!(matches!(t.fs.getattr(p), Err(FsError::NotFound(_))), "{p}");
    }
    assert!(matches!(t.fs.getattr("/nope"), Err(FsError::NotFound(_))));
    assert!(matches!(t.fs.getattr("/test_db/nope"), Err(FsError::NotFound(_))));
}

#[test]
fn test_nested_view_inherits_filter() {
    let (t, ids) = people_fixture(Duration::ZERO);
    t.fs.mkdir("/test_db/people/by_age").unwrap();
    t.fs.mkdir("/test_db/people/by_age/27/named").unwrap();
    t.fs
        .write("/test_db/people/by_age/27/named/query.json", br#"{"age": 27, "name": "$1"}"#, 0)
        .unwrap();

    let listed = t.ls("/test_db/people/by_age/27/named/Aleksey");
    assert_eq!(listed, vec![format!("{}.json", ids[2]), "query.json".to_string()]);
    assert!(t.ls("/test_db/people/by_age/27/named/Nobody").ends_with(&["query.json".to_string()]));
}

#[test]
fn test_inherited_query_cannot_be_unlinked() {
    let (t, _) = people_fixture(Duration::ZERO);
    t.fs.mkdir("/test_db/people/by_age").unwrap();
    let inherited = "/test_db/people/by_age/25/query.json";

    let err = t.fs.unlink(inherited).unwrap_err();
    assert!(matches!(err, FsError::Unsupported { .. }));
    assert_eq!(err.to_errno(), libc::ENOTSUP);
    // Still visible, still served from the parent view.
    assert!(t.fs.getattr(inherited).is_ok());
    assert_eq!(t.cat(inherited), r#"{"age": 25}"#);

    // The owning view's own query.json can be removed.
    t.fs.unlink("/test_db/people/by_age/query.json").unwrap();
    assert!(matches!(
        t.fs.unlink("/test_db/people/by_age/query.json"),
        Err(FsError::NotFound(_))
    ));
}

#[test]
fn test_files_require_existing_parents() {
    let (t, ids) = people_fixture(Duration::ZERO);
    let doc_name = format!("{}.json", ids[0]);

    // An unregistered view hides everything below it.
    assert!(matches!(t.fs.getattr("/test_db/people/nowhere"), Err(FsError::NotFound(_))));
    for p in [
        format!("/test_db/people/nowhere/{doc_name}"),
        "/test_db/people/nowhere/new.json".to_string(),
    ] {
        assert!(matches!(t.fs.getattr(&p), Err(FsError::NotFound(_))), "{p}");
        assert!(matches!(t.fs.read(&p, 0, 10), Err(FsError::NotFound(_))), "{p}");
        assert!(matches!(t.fs.open(&p, false), Err(FsError::NotFound(_))), "{p}");
    }
    assert!(matches!(
        t.fs.write("/test_db/people/nowhere/new.json", b"{}", 0),
        Err(FsError::NotFound(_))
    ));

    // So does a missing database or collection.
    assert!(matches!(t.fs.getattr("/nodb/nocoll/new.json"), Err(FsError::NotFound(_))));
    assert!(matches!(t.fs.getattr("/test_db/nocoll/query.json"), Err(FsError::NotFound(_))));
    assert!(matches!(t.fs.create("/nodb/nocoll/new.json"), Err(FsError::NotFound(_))));
    assert!(matches!(
        t.fs.write("/nodb/nocoll/new.json", b"{}", 0),
        Err(FsError::NotFound(_))
    ));
    assert!(t.store.list_databases().unwrap().iter().all(|d| d != "nodb"));
}

#[test]
fn test_view_only_shows_matching_documents() {
    let (t, ids) = people_fixture(Duration::ZERO);
    t.fs.mkdir("/test_db/people/by_age").unwrap();
    let svetlana = format!("{}.json", ids[0]);

    assert!(t.fs.getattr(&format!("/test_db/people/by_age/25/{svetlana}")).is_ok());
    assert!(t.fs.read(&format!("/test_db/people/by_age/25/{svetlana}"), 0, 10).is_ok());

    // Svetlana is 25, not 99 and not 27.
    for dir in ["/test_db/people/by_age/99", "/test_db/people/by_age/27"] {
        let p = format!("{dir}/{svetlana}");
        assert!(matches!(t.fs.getattr(&p), Err(FsError::NotFound(_))), "{p}");
        assert!(matches!(t.fs.unlink(&p), Err(FsError::NotFound(_))), "{p}");
    }
    // A view still waiting for its value lists folders only.
    assert!(matches!(
        t.fs.getattr(&format!("/test_db/people/by_age/{svetlana}")),
        Err(FsError::NotFound(_))
    ));
    assert_eq!(t.store.count("test_db", "people"), 3);
}
