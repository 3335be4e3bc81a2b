//! Reads, writes, and document lifecycle.

mod common;

use common::*;
use mongofs_core::codec;
use mongofs_core::document::object_id_of;
use mongofs_core::{DocumentStore, FsError, ObjectId, Value, doc};
use std::time::Duration;

#[test]
fn test_new_json_creates_exactly_one_document() {
    let t = TestFs::new();
    t.fs.mkdir("/db").unwrap();
    t.fs.mkdir("/db/c").unwrap();
    t.fs.write("/db/c/new.json", br#"{"foo":"bar"}"#, 0).unwrap();

    assert_eq!(t.store.count("db", "c"), 1);
    let docs = t.store.find("db", "c", &doc! {}).unwrap();
    assert_eq!(docs[0].get("foo"), Some(&Value::from("bar")));
    let id = object_id_of(&docs[0]).unwrap();
    assert_eq!(t.ls("/db/c"), vec![format!("{id}.json")]);
}

#[test]
fn test_new_json_reads_empty() {
    let t = TestFs::new();
    t.store.create_collection("db", "c").unwrap();
    assert_eq!(t.fs.getattr("/db/c/new.json").unwrap().size, 0);
    assert!(t.fs.read("/db/c/new.json", 0, 100).unwrap().is_empty());
}

#[test]
fn test_new_json_honors_object_id() {
    let t = TestFs::new();
    t.store.create_collection("db", "c").unwrap();
    let id = ObjectId::parse_str("507f1f77bcf86cd799439011").unwrap();
    let body = format!(r#"{{"_id": {{"$oid": "{id}"}}, "a": 1}}"#);
    t.fs.write("/db/c/new.json", body.as_bytes(), 0).unwrap();
    assert!(t.store.find_one("db", "c", &id).unwrap().is_some());
}

#[test]
fn test_malformed_document_is_rejected() {
    let t = TestFs::new();
    t.store.create_collection("db", "c").unwrap();
    let err = t.fs.write("/db/c/new.json", b"{\"foo\": ", 0).unwrap_err();
    assert!(matches!(err, FsError::Malformed { .. }));
    assert_eq!(err.to_errno(), libc::EINVAL);
    assert_eq!(t.store.count("db", "c"), 0);

    let err = t.fs.write("/db/c/new.json", b"[1, 2]", 0).unwrap_err();
    assert_eq!(err.to_errno(), libc::EINVAL);
}

#[test]
fn test_unlink_removes_one_document() {
    let (t, ids) = people_fixture(Duration::ZERO);
    t.fs.unlink(&doc_path("test_db", "people", &ids[1])).unwrap();

    let listed = t.ls("/test_db/people");
    assert_eq!(listed.len(), 2);
    assert!(!listed.contains(&format!("{}.json", ids[1])));
    assert!(t.fs.getattr(&doc_path("test_db", "people", &ids[0])).is_ok());
    assert!(matches!(
        t.fs.unlink(&doc_path("test_db", "people", &ids[1])),
        Err(FsError::NotFound(_))
    ));
    assert!(matches!(
        t.fs.unlink("/test_db/people/new.json"),
        Err(FsError::Unsupported { .. })
    ));
}

#[test]
fn test_read_offsets() {
    let t = TestFs::new();
    let id = t.insert("db", "c", doc! { "name" => "Aleksey" });
    let path = doc_path("db", "c", &id);
    let full = t.cat(&path).into_bytes();
    let len = full.len() as u64;

    assert_eq!(t.fs.read(&path, 0, 5).unwrap(), &full[..5]);
    assert_eq!(t.fs.read(&path, 5, 10).unwrap(), &full[5..15]);
    assert_eq!(t.fs.read(&path, len - 3, 100).unwrap(), &full[full.len() - 3..]);
    assert!(t.fs.read(&path, len, 10).unwrap().is_empty());
    assert!(t.fs.read(&path, len + 1000, 10).unwrap().is_empty());
}

#[test]
fn test_document_content_is_canonical() {
    let t = TestFs::new();
    let id = t.insert("db", "c", doc! { "b" => 2i64, "a" => 1i64 });
    let text = t.cat(&doc_path("db", "c", &id));
    let expected = format!(
        "{{\n    \"_id\": {{\n        \"$oid\": \"{id}\"\n    }},\n    \"a\": 1,\n    \"b\": 2\n}}\n"
    );
    assert_eq!(text, expected);
    assert_eq!(codec::decode(&text).unwrap(), t.store.find_one("db", "c", &id).unwrap().unwrap());
}

#[test]
fn test_write_document_replaces_content() {
    let t = TestFs::new();
    let id = t.insert("db", "c", doc! { "v" => 1i64 });
    let path = doc_path("db", "c", &id);

    // `_id` may be omitted; the file name supplies it.
    t.fs.write(&path, br#"{"v": 2}"#, 0).unwrap();
    let stored = t.store.find_one("db", "c", &id).unwrap().unwrap();
    assert_eq!(stored.get("v"), Some(&Value::Int(2)));
    assert_eq!(object_id_of(&stored), Some(id));
}

#[test]
fn test_chunked_write_through_handle() {
    let t = TestFs::new();
    let id = t.insert("db", "c", doc! { "v" => 1i64 });
    let path = doc_path("db", "c", &id);

    let body = br#"{"message": "written in three pieces"}"#;
    let fh = t.fs.open(&path, true).unwrap();
    t.fs.write_handle(fh, 0, &body[..10]).unwrap();
    t.fs.write_handle(fh, 10, &body[10..20]).unwrap();
    // Nothing reaches the store before flush.
    assert_eq!(t.store.find_one("db", "c", &id).unwrap().unwrap().get("v"), Some(&Value::Int(1)));
    t.fs.write_handle(fh, 20, &body[20..]).unwrap();
    assert_eq!(t.fs.read_handle(fh, 0, 1000).unwrap(), body);
    t.fs.release(fh).unwrap();

    let stored = t.store.find_one("db", "c", &id).unwrap().unwrap();
    assert_eq!(stored.get("message"), Some(&Value::from("written in three pieces")));
    assert_eq!(stored.get("v"), None);
    assert_eq!(t.fs.open_handles(), 0);
}

#[test]
fn test_new_json_handle_flushes_into_one_document() {
    let t = TestFs::new();
    t.store.create_collection("db", "c").unwrap();
    let fh = t.fs.open("/db/c/new.json", false).unwrap();
    t.fs.write_handle(fh, 0, br#"{"n": 1}"#).unwrap();
    t.fs.flush(fh).unwrap();
    t.fs.write_handle(fh, 0, br#"{"n": 2}"#).unwrap();
    t.fs.release(fh).unwrap();

    assert_eq!(t.store.count("db", "c"), 1);
    let docs = t.store.find("db", "c", &doc! {}).unwrap();
    assert_eq!(docs[0].get("n"), Some(&Value::Int(2)));
}

#[test]
fn test_partial_overwrite_keeps_existing_tail() {
    let t = TestFs::new();
    t.store.create_collection("db", "c").unwrap();
    t.fs.write("/db/c/query.json", br#"{"age": 20}"#, 0).unwrap();
    let fh = t.fs.open("/db/c/query.json", false).unwrap();
    t.fs.write_handle(fh, 8, b"30").unwrap();
    t.fs.release(fh).unwrap();
    assert_eq!(t.cat("/db/c/query.json"), r#"{"age": 30}"#);
}

#[test]
fn test_failed_flush_keeps_buffer_and_reports() {
    init_tracing();
    let t = TestFs::new();
    let id = t.insert("db", "c", doc! {});
    let fh = t.fs.open(&doc_path("db", "c", &id), true).unwrap();
    t.fs.write_handle(fh, 0, b"not json").unwrap();
    assert_eq!(t.fs.flush(fh).unwrap_err().to_errno(), libc::EINVAL);
    t.fs.truncate("", Some(fh), 0).unwrap();
    t.fs.write_handle(fh, 0, br#"{"ok": true}"#).unwrap();
    t.fs.release(fh).unwrap();
    let stored = t.store.find_one("db", "c", &id).unwrap().unwrap();
    assert_eq!(stored.get("ok"), Some(&Value::Bool(true)));
}

#[test]
fn test_invalid_handle() {
    let t = TestFs::new();
    assert_eq!(t.fs.flush(42).unwrap_err().to_errno(), libc::EBADF);
    assert_eq!(t.fs.read_handle(42, 0, 1).unwrap_err().to_errno(), libc::EBADF);
}

#[test]
fn test_truncate_without_handle() {
    let t = TestFs::new();
    let id = t.insert("db", "c", doc! {});
    let path = doc_path("db", "c", &id);
    assert!(t.fs.truncate(&path, None, 0).is_ok());
    assert!(matches!(t.fs.truncate(&path, None, 3), Err(FsError::Unsupported { .. })));
    assert!(matches!(t.fs.truncate("/db/c", None, 0), Err(FsError::IsADirectory(_))));
}

#[test]
fn test_create_then_write_document_file() {
    let t = TestFs::with_ttl(Duration::from_secs(60));
    t.store.create_collection("db", "c").unwrap();
    let id = ObjectId::new();
    let path = doc_path("db", "c", &id);
    assert_eq!(t.fs.create(&path).unwrap().size, 0);
    assert_eq!(t.fs.getattr(&path).unwrap().size, 0);

    t.fs.write(&path, br#"{"fresh": true}"#, 0).unwrap();
    assert!(t.store.find_one("db", "c", &id).unwrap().is_some());
}

#[test]
fn test_create_query_file_is_empty_placeholder() {
    let (t, _) = people_fixture(Duration::ZERO);
    let attr = t.fs.create("/test_db/people/query.json").unwrap();
    assert_eq!(attr.size, 0);
    assert_eq!(t.cat("/test_db/people/query.json"), "");
    assert_eq!(t.ls("/test_db/people").len(), 4);
}

#[test]
fn test_oversized_writes_fail_with_efbig() {
    let t = TestFs::new();
    let id = t.insert("db", "c", doc! { "v" => 1i64 });
    let path = doc_path("db", "c", &id);

    let fh = t.fs.open(&path, true).unwrap();
    let err = t.fs.write_handle(fh, u64::MAX - 1, b"x").unwrap_err();
    assert!(matches!(err, FsError::TooLarge { .. }));
    assert_eq!(err.to_errno(), libc::EFBIG);
    assert_eq!(t.fs.truncate("", Some(fh), 1 << 40).unwrap_err().to_errno(), libc::EFBIG);

    // The handle survives and still commits ordinary writes.
    t.fs.write_handle(fh, 0, br#"{"v": 2}"#).unwrap();
    t.fs.release(fh).unwrap();
    let stored = t.store.find_one("db", "c", &id).unwrap().unwrap();
    assert_eq!(stored.get("v"), Some(&Value::Int(2)));
}
