//! Document store client interface.
//!
//! The filesystem bridge talks to the store only through [`DocumentStore`].
//! Calls are synchronous; each one is a single round trip and is atomic only
//! at the granularity the store guarantees for one document.

pub mod matcher;
mod memory;
#[cfg(feature = "mongodb")]
mod mongo;

pub use memory::MemoryStore;
#[cfg(feature = "mongodb")]
pub use mongo::MongoStore;

use crate::codec::CodecError;
use crate::document::Document;
use crate::oid::ObjectId;
use thiserror::Error;

/// Errors reported by a document store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached or refused the call.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A database or collection name the store does not accept.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// A filter the store cannot evaluate.
    #[error("bad filter: {0}")]
    BadFilter(String),

    /// An insert collided with an existing identifier.
    #[error("duplicate document id")]
    DuplicateId,
}

/// Errors raised while seeding a store from JSON text.
#[derive(Debug, Error)]
pub enum SeedError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A database, collection, or document entry of the wrong JSON type.
    #[error("seed expects {0}")]
    Shape(&'static str),

    /// The store refused a seed entry.
    #[error("cannot seed {db}.{coll}: {source}")]
    Store {
        db: String,
        coll: String,
        #[source]
        source: StoreError,
    },
}

/// Result type for store calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// Rejects database and collection names no store accepts.
pub(crate) fn validate_name(name: &str) -> StoreResult<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') || name.starts_with('$') {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Operations consumed from the document store.
pub trait DocumentStore: Send + Sync {
    /// Names of all databases.
    fn list_databases(&self) -> StoreResult<Vec<String>>;

    /// Names of the collections in `db`. Empty when `db` does not exist.
    fn list_collections(&self, db: &str) -> StoreResult<Vec<String>>;

    /// Documents of `db.coll` matching `filter` (an empty filter matches all).
    fn find(&self, db: &str, coll: &str, filter: &Document) -> StoreResult<Vec<Document>>;

    /// The document with the given identifier.
    fn find_one(&self, db: &str, coll: &str, id: &ObjectId) -> StoreResult<Option<Document>>;

    /// Inserts a document, assigning `_id` when missing. Returns its identifier.
    fn insert(&self, db: &str, coll: &str, doc: Document) -> StoreResult<ObjectId>;

    /// Replaces or creates the document with identifier `id`.
    fn upsert(&self, db: &str, coll: &str, id: &ObjectId, doc: Document) -> StoreResult<()>;

    /// Deletes a document. Returns whether it existed.
    fn delete(&self, db: &str, coll: &str, id: &ObjectId) -> StoreResult<bool>;

    /// Creates an empty collection, creating the database along with it.
    fn create_collection(&self, db: &str, coll: &str) -> StoreResult<()>;
}
