//! In-process document store.
//!
//! Holds databases, collections, and documents behind a single
//! `parking_lot::RwLock`. Used by the tests and by `mongomount` when no
//! external store is configured.

use super::matcher::matches;
use super::{DocumentStore, SeedError, StoreError, StoreResult, validate_name};
use crate::codec;
use crate::document::{Document, ID_FIELD, Value, object_id_of};
use crate::oid::ObjectId;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, trace};

type Collection = BTreeMap<ObjectId, Document>;
type Database = BTreeMap<String, Collection>;

/// Thread-safe in-memory [`DocumentStore`].
///
/// A database exists for as long as it holds at least one collection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    databases: RwLock<BTreeMap<String, Database>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from seed text of the form
    /// `{ "<db>": { "<coll>": [ {doc}, ... ] } }`.
    ///
    /// Documents go through the codec, so `{"$oid": ...}` identifiers are
    /// honored; documents without `_id` get a fresh one.
    pub fn from_json(text: &str) -> Result<Self, SeedError> {
        let store = Self::new();
        let seed = codec::decode(text)?;
        for (db, colls) in seed {
            let Value::Document(colls) = colls else {
                return Err(SeedError::Shape("an object of collections for each database"));
            };
            for (coll, docs) in colls {
                let Value::Array(docs) = docs else {
                    return Err(SeedError::Shape("an array of documents for each collection"));
                };
                let seed_err = |source| SeedError::Store {
                    db: db.clone(),
                    coll: coll.clone(),
                    source,
                };
                store.create_collection(&db, &coll).map_err(seed_err)?;
                for doc in docs {
                    let Value::Document(doc) = doc else {
                        return Err(SeedError::Shape("every collection entry to be an object"));
                    };
                    store.insert(&db, &coll, doc).map_err(seed_err)?;
                }
            }
        }
        debug!(databases = store.databases.read().len(), "Seeded memory store");
        Ok(store)
    }

    /// Drops a whole database. Returns whether it existed.
    pub fn drop_database(&self, db: &str) -> bool {
        self.databases.write().remove(db).is_some()
    }

    /// Drops one collection. Returns whether it existed.
    pub fn drop_collection(&self, db: &str, coll: &str) -> bool {
        let mut dbs = self.databases.write();
        let Some(database) = dbs.get_mut(db) else {
            return false;
        };
        let existed = database.remove(coll).is_some();
        if database.is_empty() {
            dbs.remove(db);
        }
        existed
    }

    /// Number of documents in a collection.
    pub fn count(&self, db: &str, coll: &str) -> usize {
        self.databases
            .read()
            .get(db)
            .and_then(|d| d.get(coll))
            .map_or(0, BTreeMap::len)
    }
}

impl DocumentStore for MemoryStore {
    fn list_databases(&self) -> StoreResult<Vec<String>> {
        Ok(self.databases.read().keys().cloned().collect())
    }

    fn list_collections(&self, db: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .databases
            .read()
            .get(db)
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn find(&self, db: &str, coll: &str, filter: &Document) -> StoreResult<Vec<Document>> {
        trace!(%db, %coll, "find");
        let dbs = self.databases.read();
        let Some(collection) = dbs.get(db).and_then(|d| d.get(coll)) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for doc in collection.values() {
            if matches(doc, filter)? {
                out.push(doc.clone());
            }
        }
        Ok(out)
    }

    fn find_one(&self, db: &str, coll: &str, id: &ObjectId) -> StoreResult<Option<Document>> {
        Ok(self
            .databases
            .read()
            .get(db)
            .and_then(|d| d.get(coll))
            .and_then(|c| c.get(id))
            .cloned())
    }

    fn insert(&self, db: &str, coll: &str, mut doc: Document) -> StoreResult<ObjectId> {
        validate_name(db)?;
        validate_name(coll)?;
        let id = object_id_of(&doc).unwrap_or_else(|| {
            let id = ObjectId::new();
            doc.insert(ID_FIELD.to_string(), Value::ObjectId(id));
            id
        });
        let mut dbs = self.databases.write();
        let collection = dbs
            .entry(db.to_string())
            .or_default()
            .entry(coll.to_string())
            .or_default();
        if collection.contains_key(&id) {
            return Err(StoreError::DuplicateId);
        }
        collection.insert(id, doc);
        trace!(%db, %coll, %id, "insert");
        Ok(id)
    }

    fn upsert(&self, db: &str, coll: &str, id: &ObjectId, mut doc: Document) -> StoreResult<()> {
        validate_name(db)?;
        validate_name(coll)?;
        doc.insert(ID_FIELD.to_string(), Value::ObjectId(*id));
        self.databases
            .write()
            .entry(db.to_string())
            .or_default()
            .entry(coll.to_string())
            .or_default()
            .insert(*id, doc);
        trace!(%db, %coll, %id, "upsert");
        Ok(())
    }

    fn delete(&self, db: &str, coll: &str, id: &ObjectId) -> StoreResult<bool> {
        Ok(self
            .databases
            .write()
            .get_mut(db)
            .and_then(|d| d.get_mut(coll))
            .and_then(|c| c.remove(id))
            .is_some())
    }

    fn create_collection(&self, db: &str, coll: &str) -> StoreResult<()> {
        validate_name(db)?;
        validate_name(coll)?;
        self.databases
            .write()
            .entry(db.to_string())
            .or_default()
            .entry(coll.to_string())
            .or_default();
        Ok(())
    }
}
