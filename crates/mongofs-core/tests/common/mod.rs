//! Common test infrastructure for filesystem integration tests.
//!
//! Provides the `TestFs` harness over an in-memory store, and `FlakyStore`,
//! a store wrapper that fails on demand.

#![allow(dead_code)]

use mongofs_core::document::Document;
use mongofs_core::store::StoreResult;
use mongofs_core::{DirEntry, DocumentStore, FsConfig, MemoryStore, MongoFs, ObjectId, StoreError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Routes `tracing` output to the test writer. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A mounted-in-process filesystem plus direct access to its store.
pub struct TestFs {
    pub store: Arc<MemoryStore>,
    pub fs: MongoFs,
}

impl TestFs {
    /// Empty store, caching disabled.
    pub fn new() -> Self {
        Self::with_ttl(Duration::ZERO)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self::from_store(Arc::new(MemoryStore::new()), ttl)
    }

    pub fn from_store(store: Arc<MemoryStore>, ttl: Duration) -> Self {
        let fs = MongoFs::new(store.clone(), FsConfig::default().attr_ttl(ttl));
        Self { store, fs }
    }

    /// Inserts a document directly into the store.
    pub fn insert(&self, db: &str, coll: &str, doc: Document) -> ObjectId {
        self.store.insert(db, coll, doc).expect("insert failed")
    }

    /// Listing names without `.` and `..`.
    pub fn ls(&self, path: &str) -> Vec<String> {
        self.fs
            .readdir(path)
            .expect("readdir failed")
            .into_iter()
            .map(|e: DirEntry| e.name)
            .filter(|n| n != "." && n != "..")
            .collect()
    }

    /// Whole content of a file as a string.
    pub fn cat(&self, path: &str) -> String {
        let bytes = self.fs.read(path, 0, 1 << 20).expect("read failed");
        String::from_utf8(bytes).expect("content is not UTF-8")
    }
}

/// Standard people fixture: ages 25, 0, 27 in `test_db.people`.
pub fn people_fixture(ttl: Duration) -> (TestFs, Vec<ObjectId>) {
    let t = TestFs::with_ttl(ttl);
    let ids = [("Svetlana", 25i64), ("Baby", 0), ("Aleksey", 27)]
        .into_iter()
        .map(|(name, age)| t.insert("test_db", "people", mongofs_core::doc! { "name" => name, "age" => age }))
        .collect();
    (t, ids)
}

pub fn doc_path(db: &str, coll: &str, id: &ObjectId) -> String {
    format!("/{db}/{coll}/{id}.json")
}

/// Store wrapper whose calls fail while `failing` is set.
pub struct FlakyStore {
    pub inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

impl DocumentStore for FlakyStore {
    fn list_databases(&self) -> StoreResult<Vec<String>> {
        self.check()?;
        self.inner.list_databases()
    }

    fn list_collections(&self, db: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        self.inner.list_collections(db)
    }

    fn find(&self, db: &str, coll: &str, filter: &Document) -> StoreResult<Vec<Document>> {
        self.check()?;
        self.inner.find(db, coll, filter)
    }

    fn find_one(&self, db: &str, coll: &str, id: &ObjectId) -> StoreResult<Option<Document>> {
        self.check()?;
        self.inner.find_one(db, coll, id)
    }

    fn insert(&self, db: &str, coll: &str, doc: Document) -> StoreResult<ObjectId> {
        self.check()?;
        self.inner.insert(db, coll, doc)
    }

    fn upsert(&self, db: &str, coll: &str, id: &ObjectId, doc: Document) -> StoreResult<()> {
        self.check()?;
        self.inner.upsert(db, coll, id, doc)
    }

    fn delete(&self, db: &str, coll: &str, id: &ObjectId) -> StoreResult<bool> {
        self.check()?;
        self.inner.delete(db, coll, id)
    }

    fn create_collection(&self, db: &str, coll: &str) -> StoreResult<()> {
        self.check()?;
        self.inner.create_collection(db, coll)
    }
}
