//! Document store as a filesystem.
//!
//! Databases and collections appear as directories, documents as
//! `<24-hex-id>.json` files holding canonical JSON. A `query.json` file
//! narrows a collection listing, and view folders below a collection carry
//! named, parameterized filters (`by_age/25`).
//!
//! The crate is path-based and kernel-agnostic: [`MongoFs`] takes paths and
//! returns attributes, listings, and bytes. An adapter (see `mongofs-fuse`)
//! maps kernel requests onto it.
//!
//! # Example
//!
//! ```
//! use mongofs_core::{FsConfig, MemoryStore, MongoFs};
//! use std::sync::Arc;
//!
//! let fs = MongoFs::new(Arc::new(MemoryStore::new()), FsConfig::with_expire_secs(0));
//! fs.mkdir("/test_db").unwrap();
//! fs.mkdir("/test_db/people").unwrap();
//! fs.write("/test_db/people/new.json", br#"{"name": "Aleksey"}"#, 0).unwrap();
//!
//! let names: Vec<_> = fs
//!     .readdir("/test_db/people")
//!     .unwrap()
//!     .into_iter()
//!     .map(|e| e.name)
//!     .collect();
//! assert_eq!(names.len(), 3);
//! ```

pub mod attr;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod document;
pub mod error;
pub mod handles;
pub mod oid;
pub mod path;
pub mod query;
pub mod store;

pub use attr::{AttrCache, NodeAttr, NodeKind};
pub use bridge::{DirEntry, MARKER_COLLECTION, MongoFs};
pub use config::FsConfig;
pub use document::{Document, Value};
pub use error::{FsError, FsResult};
pub use oid::ObjectId;
pub use path::{VirtualNode, resolve, split_path};
pub use query::{QueryEngine, QueryKey, ResolvedFilter, StoredQuery};
pub use store::{DocumentStore, MemoryStore, SeedError, StoreError};
#[cfg(feature = "mongodb")]
pub use store::MongoStore;
