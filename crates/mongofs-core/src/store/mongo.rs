//! [`DocumentStore`] over a MongoDB deployment, through the driver's
//! blocking API.
//!
//! Documents convert value by value. Integers that fit 32 bits are written
//! as `int32`, larger ones as `int64`; both read back as [`Value::Int`].
//! BSON types with no [`Value`] counterpart (dates, decimals, binary) read
//! back in relaxed extended JSON form.

use super::{DocumentStore, StoreError, StoreResult, validate_name};
use crate::codec;
use crate::document::{Document, ID_FIELD, Value, object_id_of};
use crate::oid::ObjectId;
use mongodb::bson::{self, Bson, doc, oid};
use mongodb::error::{Error as DriverError, ErrorKind, WriteFailure};
use mongodb::sync::{Client, Collection};
use tracing::{debug, trace};

/// Server error codes the store distinguishes.
const DUPLICATE_KEY: i32 = 11000;
const NAMESPACE_EXISTS: i32 = 48;
const BAD_VALUE: i32 = 2;

/// A [`DocumentStore`] backed by a MongoDB client.
pub struct MongoStore {
    client: Client,
}

impl MongoStore {
    /// Connects to `uri` and pings the deployment so a bad address fails
    /// here rather than on the first filesystem call.
    pub fn connect(uri: &str) -> StoreResult<Self> {
        let client = Client::with_uri_str(uri).map_err(store_error)?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .run()
            .map_err(store_error)?;
        debug!("Connected to document store");
        Ok(Self { client })
    }

    fn collection(&self, db: &str, coll: &str) -> Collection<bson::Document> {
        self.client.database(db).collection(coll)
    }
}

fn store_error(err: DriverError) -> StoreError {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == DUPLICATE_KEY => StoreError::DuplicateId,
        ErrorKind::Command(e) if e.code == BAD_VALUE => StoreError::BadFilter(e.message.clone()),
        _ => StoreError::Unavailable(err.to_string()),
    }
}

fn by_id(id: &ObjectId) -> bson::Document {
    doc! { "_id": oid::ObjectId::from_bytes(id.bytes()) }
}

fn to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Int(i) => i32::try_from(*i).map_or(Bson::Int64(*i), Bson::Int32),
        Value::Double(d) => Bson::Double(*d),
        Value::String(s) => Bson::String(s.clone()),
        Value::ObjectId(id) => Bson::ObjectId(oid::ObjectId::from_bytes(id.bytes())),
        Value::Array(items) => Bson::Array(items.iter().map(to_bson).collect()),
        Value::Document(doc) => Bson::Document(to_bson_document(doc)),
    }
}

fn to_bson_document(doc: &Document) -> bson::Document {
    doc.iter().map(|(k, v)| (k.clone(), to_bson(v))).collect()
}

fn from_bson(value: Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Int32(i) => Value::Int(i64::from(i)),
        Bson::Int64(i) => Value::Int(i),
        Bson::Double(d) => Value::Double(d),
        Bson::String(s) | Bson::Symbol(s) => Value::String(s),
        Bson::ObjectId(id) => Value::ObjectId(ObjectId::from_bytes(id.bytes())),
        Bson::Array(items) => Value::Array(items.into_iter().map(from_bson).collect()),
        Bson::Document(doc) => Value::Document(from_bson_document(doc)),
        other => codec::value_from_json(other.into_relaxed_extjson()),
    }
}

fn from_bson_document(doc: bson::Document) -> Document {
    doc.into_iter().map(|(k, v)| (k, from_bson(v))).collect()
}

impl DocumentStore for MongoStore {
    fn list_databases(&self) -> StoreResult<Vec<String>> {
        let mut names = self.client.list_database_names().run().map_err(store_error)?;
        names.sort();
        Ok(names)
    }

    fn list_collections(&self, db: &str) -> StoreResult<Vec<String>> {
        let mut names = self
            .client
            .database(db)
            .list_collection_names()
            .run()
            .map_err(store_error)?;
        names.sort();
        Ok(names)
    }

    fn find(&self, db: &str, coll: &str, filter: &Document) -> StoreResult<Vec<Document>> {
        trace!(%db, %coll, "find");
        let cursor = self
            .collection(db, coll)
            .find(to_bson_document(filter))
            .run()
            .map_err(store_error)?;
        cursor
            .map(|doc| doc.map(from_bson_document).map_err(store_error))
            .collect()
    }

    fn find_one(&self, db: &str, coll: &str, id: &ObjectId) -> StoreResult<Option<Document>> {
        let found = self
            .collection(db, coll)
            .find_one(by_id(id))
            .run()
            .map_err(store_error)?;
        Ok(found.map(from_bson_document))
    }

    fn insert(&self, db: &str, coll: &str, mut doc: Document) -> StoreResult<ObjectId> {
        validate_name(db)?;
        validate_name(coll)?;
        let id = object_id_of(&doc).unwrap_or_else(|| {
            let id = ObjectId::new();
            doc.insert(ID_FIELD.to_string(), Value::ObjectId(id));
            id
        });
        self.collection(db, coll)
            .insert_one(to_bson_document(&doc))
            .run()
            .map_err(store_error)?;
        trace!(%db, %coll, %id, "insert");
        Ok(id)
    }

    fn upsert(&self, db: &str, coll: &str, id: &ObjectId, mut doc: Document) -> StoreResult<()> {
        validate_name(db)?;
        validate_name(coll)?;
        doc.insert(ID_FIELD.to_string(), Value::ObjectId(*id));
        self.collection(db, coll)
            .replace_one(by_id(id), to_bson_document(&doc))
            .upsert(true)
            .run()
            .map_err(store_error)?;
        trace!(%db, %coll, %id, "upsert");
        Ok(())
    }

    fn delete(&self, db: &str, coll: &str, id: &ObjectId) -> StoreResult<bool> {
        let result = self
            .collection(db, coll)
            .delete_one(by_id(id))
            .run()
            .map_err(store_error)?;
        Ok(result.deleted_count > 0)
    }

    fn create_collection(&self, db: &str, coll: &str) -> StoreResult<()> {
        validate_name(db)?;
        validate_name(coll)?;
        match self.client.database(db).create_collection(coll).run() {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind.as_ref(), ErrorKind::Command(c) if c.code == NAMESPACE_EXISTS) => Ok(()),
            Err(e) => Err(store_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_convert_both_ways() {
        let id = ObjectId::new();
        let doc = crate::doc! {
            "_id" => id,
            "small" => 25i64,
            "large" => 1i64 << 40,
            "ratio" => 0.1,
            "tags" => vec![Value::from("a"), Value::Null, Value::Bool(true)],
            "nested" => crate::doc! { "name" => "Aleksey" },
        };
        let bson = to_bson_document(&doc);
        assert_eq!(bson.get("small"), Some(&Bson::Int32(25)));
        assert_eq!(bson.get("large"), Some(&Bson::Int64(1 << 40)));
        assert_eq!(bson.get_object_id(ID_FIELD).unwrap().bytes(), id.bytes());
        assert_eq!(from_bson_document(bson), doc);
    }

    #[test]
    fn test_foreign_types_read_as_extended_json() {
        let date = bson::DateTime::from_millis(0);
        let value = from_bson(Bson::DateTime(date));
        let Value::Document(inner) = value else {
            panic!("expected a document, got {value:?}");
        };
        assert!(inner.contains_key("$date"));
    }

    #[test]
    fn test_connect_reports_bad_uri() {
        assert!(matches!(
            MongoStore::connect("not-a-uri"),
            Err(StoreError::Unavailable(_))
        ));
    }
}
