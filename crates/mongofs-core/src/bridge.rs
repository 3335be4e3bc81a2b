//! Path-based filesystem operations over a document store.
//!
//! [`MongoFs`] is the operation table: every call resolves its path to a
//! [`VirtualNode`] and dispatches on it. Metadata goes through the attribute
//! cache; listings prime the cache for the children they return. Mutations
//! refresh or drop only the entry of the path they touched, and a failed
//! operation leaves the cache and the query table as they were.

use crate::attr::{AttrCache, NodeAttr, NodeKind};
use crate::codec;
use crate::config::FsConfig;
use crate::doc;
use crate::document::{Document, ID_FIELD, Value, lookup_path, object_id_of};
use crate::error::{FsError, FsResult};
use crate::handles::{HandleTable, OpenFile, check_size, slice_at};
use crate::oid::ObjectId;
use crate::path::{self, QUERY_FILE, VirtualNode, document_file_name, is_view_segment, resolve};
use crate::query::{QueryEngine, QueryKey, QueryText, ResolvedFilter, StoredQuery};
use crate::store::DocumentStore;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, error, info, trace, warn};

/// Collection created by `mkdir` on a database, since a database only exists
/// while it holds a collection. Also holds the database's filters and views,
/// one document per [`StoredQuery`]. Hidden from listings.
pub const MARKER_COLLECTION: &str = "__mongofs__";

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

impl DirEntry {
    fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Directory,
        }
    }

    fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::File,
        }
    }
}

/// A document store presented as a filesystem.
pub struct MongoFs {
    store: Arc<dyn DocumentStore>,
    attrs: AttrCache,
    queries: QueryEngine,
    handles: HandleTable<OpenFile>,
    /// When each database's records were last loaded from the store.
    synced: DashMap<String, Instant>,
    /// Serializes record loads against record mutations.
    query_lock: Mutex<()>,
    config: FsConfig,
    mounted_at: SystemTime,
}

fn log_failure<T>(op: &'static str, path: &str, result: FsResult<T>) -> FsResult<T> {
    match &result {
        Err(FsError::Store(e)) => error!(op, %path, error = %e, "Store call failed"),
        Err(e) => trace!(op, %path, error = %e, "Operation failed"),
        Ok(_) => {}
    }
    result
}

fn decode_document(path: &str, data: &[u8]) -> FsResult<Document> {
    let text = std::str::from_utf8(data).map_err(|e| FsError::malformed(path, e))?;
    codec::decode(text).map_err(|e| FsError::malformed(path, e))
}

fn encoded_len(doc: &Document) -> u64 {
    codec::encode(doc).len() as u64
}

/// Folder names for the values a field takes in one document.
fn value_segments(value: &Value) -> Vec<String> {
    let items = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    items
        .into_iter()
        .filter_map(Value::to_segment)
        .filter(|s| is_view_segment(s))
        .collect()
}

impl MongoFs {
    pub fn new(store: Arc<dyn DocumentStore>, config: FsConfig) -> Self {
        info!(
            attr_ttl_ms = config.attr_ttl.as_millis(),
            read_only = config.read_only,
            "Creating document filesystem"
        );
        Self {
            store,
            attrs: AttrCache::new(config.attr_ttl),
            queries: QueryEngine::new(),
            handles: HandleTable::new(),
            synced: DashMap::new(),
            query_lock: Mutex::new(()),
            config,
            mounted_at: SystemTime::now(),
        }
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn attr_cache(&self) -> &AttrCache {
        &self.attrs
    }

    /// Number of open file handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    // ---- metadata ----

    /// Attributes of a path.
    pub fn getattr(&self, path: &str) -> FsResult<NodeAttr> {
        trace!(%path, "getattr");
        let node = resolve(path);
        log_failure("getattr", path, self.attr_of(&node))
    }

    /// Attributes of a path as seen through an open handle: a loaded buffer
    /// overrides the size, and a file created but not yet committed still
    /// has attributes.
    pub fn getattr_with_handle(&self, path: &str, fh: Option<u64>) -> FsResult<NodeAttr> {
        let attr = self.getattr(path);
        let Some(len) = fh.and_then(|fh| self.handles.get(fh).and_then(|f| f.len())) else {
            return attr;
        };
        match attr {
            Ok(attr) => Ok(NodeAttr { size: len, ..attr }),
            Err(FsError::NotFound(_)) => Ok(NodeAttr::file(len, SystemTime::now())),
            Err(e) => Err(e),
        }
    }

    fn attr_of(&self, node: &VirtualNode) -> FsResult<NodeAttr> {
        match node {
            VirtualNode::Root => Ok(self.dir_attr()),
            VirtualNode::Unknown { path } => Err(FsError::NotFound(path.clone())),
            _ => self
                .attrs
                .get_or_compute(&node.path(), || self.compute_attr(node)),
        }
    }

    fn compute_attr(&self, node: &VirtualNode) -> FsResult<NodeAttr> {
        let missing = || FsError::NotFound(node.path());
        self.sync_queries(node)?;
        match node {
            VirtualNode::Root => Ok(self.dir_attr()),
            VirtualNode::Database { db } => {
                if self.database_exists(db)? {
                    Ok(self.dir_attr())
                } else {
                    Err(missing())
                }
            }
            VirtualNode::Collection { db, coll } => {
                if self.collection_exists(db, coll)? {
                    Ok(self.dir_attr())
                } else {
                    Err(missing())
                }
            }
            VirtualNode::CustomView { db, coll, views } => {
                if self.views_exist(db, coll, views) && self.collection_exists(db, coll)? {
                    Ok(self.dir_attr())
                } else {
                    Err(missing())
                }
            }
            VirtualNode::QueryFile { db, coll } => {
                self.check_parent(db, coll, &[], &node.path())?;
                self.query_text(db, coll, &[])
                    .map(|q| NodeAttr::file(q.text.len() as u64, q.modified))
                    .ok_or_else(missing)
            }
            VirtualNode::ViewQueryFile { db, coll, views } => {
                self.check_parent(db, coll, views, &node.path())?;
                self.query_text(db, coll, views)
                    .map(|q| NodeAttr::file(q.text.len() as u64, q.modified))
                    .ok_or_else(missing)
            }
            VirtualNode::NewDocumentFile { db, coll, views } => {
                self.check_parent(db, coll, views, &node.path())?;
                Ok(NodeAttr::file(0, self.mounted_at))
            }
            VirtualNode::DocumentFile { db, coll, views, id } => {
                self.check_parent(db, coll, views, &node.path())?;
                match self.find_listed(db, coll, views, id)? {
                    Some(doc) => Ok(NodeAttr::file(encoded_len(&doc), id.timestamp())),
                    None => Err(missing()),
                }
            }
            VirtualNode::Unknown { path } => Err(FsError::NotFound(path.clone())),
        }
    }

    fn dir_attr(&self) -> NodeAttr {
        NodeAttr::directory(self.mounted_at)
    }

    fn database_exists(&self, db: &str) -> FsResult<bool> {
        Ok(self.store.list_databases()?.iter().any(|d| d == db))
    }

    fn collection_exists(&self, db: &str, coll: &str) -> FsResult<bool> {
        if coll == MARKER_COLLECTION {
            return Ok(false);
        }
        Ok(self.store.list_collections(db)?.iter().any(|c| c == coll))
    }

    /// The collection must exist and every view of the chain must be known.
    fn check_parent(&self, db: &str, coll: &str, views: &[String], path: &str) -> FsResult<()> {
        if self.collection_exists(db, coll)? && self.views_exist(db, coll, views) {
            Ok(())
        } else {
            Err(FsError::NotFound(path.to_string()))
        }
    }

    /// Parent check for a file node. A view's `query.json` may be written
    /// before its directory is registered, so only the chain above counts.
    fn check_file_parent(&self, node: &VirtualNode) -> FsResult<()> {
        self.sync_queries(node)?;
        match node {
            VirtualNode::QueryFile { db, coll } => self.check_parent(db, coll, &[], &node.path()),
            VirtualNode::ViewQueryFile { db, coll, views } => {
                self.check_parent(db, coll, &views[..views.len() - 1], &node.path())
            }
            VirtualNode::NewDocumentFile { db, coll, views } | VirtualNode::DocumentFile { db, coll, views, .. } => {
                self.check_parent(db, coll, views, &node.path())
            }
            _ => Ok(()),
        }
    }

    /// The document as the directory of `views` lists it. Below a view only
    /// documents matching the resolved filter are present; a view still
    /// waiting for a parameter holds no documents.
    fn find_listed(&self, db: &str, coll: &str, views: &[String], id: &ObjectId) -> FsResult<Option<Document>> {
        if views.is_empty() {
            return Ok(self.store.find_one(db, coll, id)?);
        }
        let filter = match self.queries.filter_matches(db, coll, views) {
            ResolvedFilter::Absent | ResolvedFilter::Malformed(_) => {
                return Ok(self.store.find_one(db, coll, id)?);
            }
            ResolvedFilter::Pending { .. } => return Ok(None),
            ResolvedFilter::Ready(filter) => filter,
        };
        let scoped = doc! {
            "$and" => vec![Value::Document(filter), Value::Document(doc! { ID_FIELD => *id })]
        };
        Ok(self.store.find(db, coll, &scoped)?.into_iter().next())
    }

    /// Every prefix of the chain must name a view.
    fn views_exist(&self, db: &str, coll: &str, views: &[String]) -> bool {
        (1..=views.len()).all(|n| self.queries.view_exists(db, coll, &views[..n]))
    }

    fn query_text(&self, db: &str, coll: &str, views: &[String]) -> Option<QueryText> {
        if !self.views_exist(db, coll, views) {
            return None;
        }
        self.queries.query_text(db, coll, views)
    }

    // ---- listing ----

    /// Lists a directory. `.` and `..` come first.
    pub fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        trace!(%path, "readdir");
        let node = resolve(path);
        log_failure("readdir", path, self.readdir_node(&node))
    }

    fn readdir_node(&self, node: &VirtualNode) -> FsResult<Vec<DirEntry>> {
        if !node.is_directory() {
            return Err(match node {
                VirtualNode::Unknown { path } => FsError::NotFound(path.clone()),
                _ => FsError::NotADirectory(node.path()),
            });
        }
        self.attr_of(node)?;
        self.sync_queries(node)?;

        let dir_path = node.path();
        let mut entries = vec![DirEntry::dir("."), DirEntry::dir("..")];
        match node {
            VirtualNode::Root => {
                for db in self.store.list_databases()? {
                    self.attrs.insert(&path::join(&dir_path, &db), self.dir_attr());
                    entries.push(DirEntry::dir(db));
                }
            }
            VirtualNode::Database { db } => {
                for coll in self.store.list_collections(db)? {
                    if coll == MARKER_COLLECTION {
                        continue;
                    }
                    self.attrs.insert(&path::join(&dir_path, &coll), self.dir_attr());
                    entries.push(DirEntry::dir(coll));
                }
            }
            VirtualNode::Collection { db, coll } => {
                self.list_collection(db, coll, &[], &dir_path, &mut entries)?;
            }
            VirtualNode::CustomView { db, coll, views } => {
                self.list_collection(db, coll, views, &dir_path, &mut entries)?;
            }
            _ => {}
        }
        Ok(entries)
    }

    fn list_collection(
        &self,
        db: &str,
        coll: &str,
        views: &[String],
        dir_path: &str,
        entries: &mut Vec<DirEntry>,
    ) -> FsResult<()> {
        let mut folders = BTreeSet::new();
        match self.queries.filter_matches(db, coll, views) {
            ResolvedFilter::Absent | ResolvedFilter::Malformed(_) => {
                self.list_documents(db, coll, &Document::new(), dir_path, entries)?;
            }
            ResolvedFilter::Ready(filter) => {
                self.list_documents(db, coll, &filter, dir_path, entries)?;
            }
            ResolvedFilter::Pending { partial, field } => {
                if let Some(field) = field {
                    for doc in self.store.find(db, coll, &partial)? {
                        if let Some(value) = lookup_path(&doc, &field) {
                            folders.extend(value_segments(value));
                        }
                    }
                }
            }
        }
        folders.extend(self.queries.child_views(db, coll, views));
        for name in folders {
            self.attrs.insert(&path::join(dir_path, &name), self.dir_attr());
            entries.push(DirEntry::dir(name));
        }

        if let Some(q) = self.queries.query_text(db, coll, views) {
            let attr = NodeAttr::file(q.text.len() as u64, q.modified);
            self.attrs.insert(&path::join(dir_path, QUERY_FILE), attr);
            entries.push(DirEntry::file(QUERY_FILE));
        }
        Ok(())
    }

    fn list_documents(
        &self,
        db: &str,
        coll: &str,
        filter: &Document,
        dir_path: &str,
        entries: &mut Vec<DirEntry>,
    ) -> FsResult<()> {
        for doc in self.store.find(db, coll, filter)? {
            let Some(id) = object_id_of(&doc) else {
                debug!(%db, %coll, "Skipping document without an ObjectId _id");
                continue;
            };
            let name = document_file_name(&id);
            let attr = NodeAttr::file(encoded_len(&doc), id.timestamp());
            self.attrs.insert(&path::join(dir_path, &name), attr);
            entries.push(DirEntry::file(name));
        }
        Ok(())
    }

    // ---- content ----

    /// Reads `size` bytes at `offset`. Empty when `offset` is past the end.
    pub fn read(&self, path: &str, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        trace!(%path, offset, size, "read");
        let node = resolve(path);
        let result = self
            .content(&node)
            .map(|content| slice_at(&content, offset, size).to_vec());
        log_failure("read", path, result)
    }

    fn content(&self, node: &VirtualNode) -> FsResult<Vec<u8>> {
        let missing = || FsError::NotFound(node.path());
        self.sync_queries(node)?;
        match node {
            VirtualNode::QueryFile { db, coll } => {
                self.check_parent(db, coll, &[], &node.path())?;
                self.query_text(db, coll, &[])
                    .map(|q| q.text.into_bytes())
                    .ok_or_else(missing)
            }
            VirtualNode::ViewQueryFile { db, coll, views } => {
                self.check_parent(db, coll, views, &node.path())?;
                self.query_text(db, coll, views)
                    .map(|q| q.text.into_bytes())
                    .ok_or_else(missing)
            }
            VirtualNode::NewDocumentFile { db, coll, views } => {
                self.check_parent(db, coll, views, &node.path())?;
                Ok(Vec::new())
            }
            VirtualNode::DocumentFile { db, coll, views, id } => {
                self.check_parent(db, coll, views, &node.path())?;
                self.find_listed(db, coll, views, id)?
                    .map(|doc| codec::encode(&doc).into_bytes())
                    .ok_or_else(missing)
            }
            VirtualNode::Unknown { path } => Err(FsError::NotFound(path.clone())),
            _ => Err(FsError::IsADirectory(node.path())),
        }
    }

    /// Current content for a read-modify-write buffer. A file that does not
    /// exist yet starts empty.
    fn live_content(&self, path: &str) -> FsResult<Vec<u8>> {
        match self.content(&resolve(path)) {
            Err(FsError::NotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    /// Writes the complete content of a file and commits it immediately.
    /// `data` replaces the content; `offset` is accepted for interface
    /// compatibility and must describe a whole-buffer write.
    pub fn write(&self, path: &str, data: &[u8], offset: u64) -> FsResult<usize> {
        trace!(%path, offset, len = data.len(), "write");
        self.check_writable(path)?;
        check_size(path, data.len() as u64)?;
        let node = resolve(path);
        let result = self.commit(&node, data, None).map(|_| data.len());
        log_failure("write", path, result)
    }

    /// Parses and stores `data` for a file node. For `new.json` returns the
    /// identifier of the document written.
    fn commit(
        &self,
        node: &VirtualNode,
        data: &[u8],
        created: Option<ObjectId>,
    ) -> FsResult<Option<ObjectId>> {
        let path = node.path();
        self.check_file_parent(node)?;
        match node {
            VirtualNode::QueryFile { db, coll } => {
                self.commit_query(db, coll, &[], &path, data)?;
                Ok(None)
            }
            VirtualNode::ViewQueryFile { db, coll, views } => {
                self.commit_query(db, coll, views, &path, data)?;
                Ok(None)
            }
            VirtualNode::NewDocumentFile { db, coll, views } => {
                let id = self.commit_new(db, coll, views, &path, data, created)?;
                Ok(Some(id))
            }
            VirtualNode::DocumentFile { db, coll, id, .. } => {
                self.commit_document(db, coll, id, &path, data)?;
                Ok(None)
            }
            VirtualNode::Unknown { .. } => Err(FsError::NotFound(path)),
            _ => Err(FsError::IsADirectory(path)),
        }
    }

    fn commit_query(&self, db: &str, coll: &str, views: &[String], path: &str, data: &[u8]) -> FsResult<()> {
        let text = std::str::from_utf8(data).map_err(|e| FsError::malformed(path, e))?;
        let record = StoredQuery::new(QueryKey::new(db, coll, views), Some(text.to_string()));
        let attr = NodeAttr::file(text.len() as u64, record.modified);
        let _guard = self.query_lock.lock();
        self.save_record(record)?;
        self.attrs.insert(path, attr);
        Ok(())
    }

    fn commit_new(
        &self,
        db: &str,
        coll: &str,
        views: &[String],
        path: &str,
        data: &[u8],
        created: Option<ObjectId>,
    ) -> FsResult<ObjectId> {
        let mut doc = decode_document(path, data)?;
        let id = match created {
            Some(id) => {
                doc.insert(ID_FIELD.to_string(), Value::ObjectId(id));
                self.store.upsert(db, coll, &id, doc.clone())?;
                id
            }
            None => {
                let id = object_id_of(&doc).unwrap_or_else(ObjectId::new);
                doc.insert(ID_FIELD.to_string(), Value::ObjectId(id));
                self.store.insert(db, coll, doc.clone())?
            }
        };
        debug!(%path, %id, "Committed new document");

        self.attrs.insert(path, NodeAttr::file(0, self.mounted_at));
        let doc_path = VirtualNode::DocumentFile {
            db: db.to_string(),
            coll: coll.to_string(),
            views: views.to_vec(),
            id,
        }
        .path();
        self.attrs
            .insert(&doc_path, NodeAttr::file(encoded_len(&doc), id.timestamp()));
        Ok(id)
    }

    fn commit_document(&self, db: &str, coll: &str, id: &ObjectId, path: &str, data: &[u8]) -> FsResult<()> {
        let mut doc = decode_document(path, data)?;
        match doc.get(ID_FIELD) {
            None => {
                doc.insert(ID_FIELD.to_string(), Value::ObjectId(*id));
            }
            Some(Value::ObjectId(found)) if found == id => {}
            Some(_) => {
                return Err(FsError::malformed(path, "_id does not match the file name"));
            }
        }
        let size = encoded_len(&doc);
        self.store.upsert(db, coll, id, doc)?;
        self.attrs.insert(path, NodeAttr::file(size, id.timestamp()));
        debug!(%path, size, "Committed document");
        Ok(())
    }

    // ---- namespace ----

    /// Creates a file node and returns its attributes.
    pub fn create(&self, path: &str) -> FsResult<NodeAttr> {
        trace!(%path, "create");
        self.check_writable(path)?;
        let node = resolve(path);
        let result = self.create_node(&node);
        log_failure("create", path, result)
    }

    fn create_node(&self, node: &VirtualNode) -> FsResult<NodeAttr> {
        self.check_file_parent(node)?;
        let node_path = node.path();
        let attr = match node {
            VirtualNode::QueryFile { db, coll } => return self.create_query(db, coll, &[], &node_path),
            VirtualNode::ViewQueryFile { db, coll, views } => {
                return self.create_query(db, coll, views, &node_path);
            }
            VirtualNode::NewDocumentFile { .. } => NodeAttr::file(0, self.mounted_at),
            VirtualNode::DocumentFile { id, .. } => NodeAttr::file(0, id.timestamp()),
            _ => return Err(FsError::unsupported("create", node_path)),
        };
        self.attrs.insert(&node_path, attr);
        Ok(attr)
    }

    fn create_query(&self, db: &str, coll: &str, views: &[String], path: &str) -> FsResult<NodeAttr> {
        let _guard = self.query_lock.lock();
        if !self.queries.has_query(db, coll, views) {
            self.save_record(StoredQuery::new(QueryKey::new(db, coll, views), Some(String::new())))?;
        }
        let attr = self
            .queries
            .query_text(db, coll, views)
            .map_or_else(
                || NodeAttr::file(0, SystemTime::now()),
                |q| NodeAttr::file(q.text.len() as u64, q.modified),
            );
        self.attrs.insert(path, attr);
        Ok(attr)
    }

    /// Removes a document or a stored filter.
    pub fn unlink(&self, path: &str) -> FsResult<()> {
        trace!(%path, "unlink");
        self.check_writable(path)?;
        let node = resolve(path);
        let result = self.sync_queries(&node).and_then(|()| match &node {
            VirtualNode::QueryFile { db, coll } => self.unlink_query(db, coll, &[], &node.path()),
            VirtualNode::ViewQueryFile { db, coll, views } => self.unlink_query(db, coll, views, &node.path()),
            VirtualNode::DocumentFile { db, coll, views, id } => {
                self.unlink_document(db, coll, views, id, &node.path())
            }
            VirtualNode::NewDocumentFile { .. } => Err(FsError::unsupported("unlink", node.path())),
            VirtualNode::Unknown { path } => Err(FsError::NotFound(path.clone())),
            _ => Err(FsError::IsADirectory(node.path())),
        });
        log_failure("unlink", path, result)
    }

    fn unlink_document(&self, db: &str, coll: &str, views: &[String], id: &ObjectId, path: &str) -> FsResult<()> {
        self.check_parent(db, coll, views, path)?;
        if !views.is_empty() && self.find_listed(db, coll, views, id)?.is_none() {
            return Err(FsError::NotFound(path.to_string()));
        }
        if !self.store.delete(db, coll, id)? {
            return Err(FsError::NotFound(path.to_string()));
        }
        self.attrs.invalidate(path);
        debug!(%path, "Deleted document");
        Ok(())
    }

    fn unlink_query(&self, db: &str, coll: &str, views: &[String], path: &str) -> FsResult<()> {
        let _guard = self.query_lock.lock();
        if !self.queries.has_query(db, coll, views) {
            // An inherited filter shows up here but belongs to an ancestor.
            if self.query_text(db, coll, views).is_some() {
                return Err(FsError::unsupported("unlink", path));
            }
            return Err(FsError::NotFound(path.to_string()));
        }
        let key = QueryKey::new(db, coll, views);
        if views.is_empty() {
            self.delete_records(&[key])?;
        } else {
            // The view stays registered without a filter.
            self.save_record(StoredQuery::new(key, None))?;
        }
        self.attrs.invalidate(path);
        debug!(%path, "Removed query");
        Ok(())
    }

    /// Creates a database, a collection, or a view.
    pub fn mkdir(&self, path: &str) -> FsResult<NodeAttr> {
        trace!(%path, "mkdir");
        self.check_writable(path)?;
        let node = resolve(path);
        let result = self.mkdir_node(&node);
        log_failure("mkdir", path, result)
    }

    fn mkdir_node(&self, node: &VirtualNode) -> FsResult<NodeAttr> {
        let node_path = node.path();
        self.sync_queries(node)?;
        match node {
            VirtualNode::Root => return Err(FsError::AlreadyExists(node_path)),
            VirtualNode::Database { db } => {
                if self.database_exists(db)? {
                    return Err(FsError::AlreadyExists(node_path));
                }
                self.store.create_collection(db, MARKER_COLLECTION)?;
                info!(%db, "Created database");
            }
            VirtualNode::Collection { db, coll } => {
                if coll == MARKER_COLLECTION {
                    return Err(FsError::unsupported("mkdir", node_path));
                }
                if self.collection_exists(db, coll)? {
                    return Err(FsError::AlreadyExists(node_path));
                }
                self.store.create_collection(db, coll)?;
                info!(%db, %coll, "Created collection");
            }
            VirtualNode::CustomView { db, coll, views } => {
                let parent = &views[..views.len() - 1];
                let _guard = self.query_lock.lock();
                if !self.views_exist(db, coll, parent) || !self.collection_exists(db, coll)? {
                    return Err(FsError::NotFound(node_path));
                }
                if self.queries.view_exists(db, coll, views) {
                    return Err(FsError::AlreadyExists(node_path));
                }
                self.save_record(StoredQuery::view(QueryKey::new(db, coll, views)))?;
                info!(path = %node_path, "Registered view");
            }
            _ => return Err(FsError::unsupported("mkdir", node_path)),
        }
        let attr = self.dir_attr();
        self.attrs.insert(&node_path, attr);
        Ok(attr)
    }

    /// Unregisters a view. Databases and collections cannot be removed.
    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        trace!(%path, "rmdir");
        self.check_writable(path)?;
        let node = resolve(path);
        let result = self.sync_queries(&node).and_then(|()| match &node {
            VirtualNode::CustomView { db, coll, views } => self.remove_view(db, coll, views, &node.path()),
            VirtualNode::Root | VirtualNode::Database { .. } | VirtualNode::Collection { .. } => {
                Err(FsError::unsupported("rmdir", node.path()))
            }
            VirtualNode::Unknown { path } => Err(FsError::NotFound(path.clone())),
            _ => Err(FsError::NotADirectory(node.path())),
        });
        log_failure("rmdir", path, result)
    }

    fn remove_view(&self, db: &str, coll: &str, views: &[String], path: &str) -> FsResult<()> {
        let _guard = self.query_lock.lock();
        if !self.queries.is_registered(db, coll, views) {
            return Err(if self.views_exist(db, coll, views) {
                FsError::unsupported("rmdir", path)
            } else {
                FsError::NotFound(path.to_string())
            });
        }
        self.delete_records(&self.queries.keys_under(db, coll, views))?;
        self.attrs.invalidate(path);
        debug!(%path, "Removed view");
        Ok(())
    }

    // ---- stored filters and views ----

    /// Reloads the node's database records from the store once the local
    /// copy is older than the attribute TTL. Nodes that never consult a
    /// filter skip the round trip.
    fn sync_queries(&self, node: &VirtualNode) -> FsResult<()> {
        let db = match node {
            VirtualNode::Collection { db, .. }
            | VirtualNode::QueryFile { db, .. }
            | VirtualNode::CustomView { db, .. }
            | VirtualNode::ViewQueryFile { db, .. } => db,
            VirtualNode::NewDocumentFile { db, views, .. } | VirtualNode::DocumentFile { db, views, .. }
                if !views.is_empty() =>
            {
                db
            }
            _ => return Ok(()),
        };
        let fresh = |synced: &DashMap<String, Instant>| {
            synced
                .get(db)
                .is_some_and(|at| at.elapsed() < self.config.attr_ttl)
        };
        if fresh(&self.synced) {
            return Ok(());
        }
        let _guard = self.query_lock.lock();
        if fresh(&self.synced) {
            return Ok(());
        }
        let docs = self.store.find(db, MARKER_COLLECTION, &Document::new())?;
        let records: Vec<StoredQuery> = docs
            .iter()
            .filter_map(|doc| {
                let record = StoredQuery::from_document(db, doc);
                if record.is_none() {
                    warn!(%db, id = ?object_id_of(doc), "Skipping unreadable filter record");
                }
                record
            })
            .collect();
        trace!(%db, records = records.len(), "Loaded filter records");
        self.queries.replace_database(db, records);
        self.synced.insert(db.clone(), Instant::now());
        Ok(())
    }

    /// Store identifiers of the documents holding `key`.
    fn record_ids(&self, key: &QueryKey) -> FsResult<Vec<ObjectId>> {
        let filter = doc! { "key" => key.location() };
        Ok(self
            .store
            .find(&key.db, MARKER_COLLECTION, &filter)?
            .iter()
            .filter_map(object_id_of)
            .collect())
    }

    /// Writes a record to the store, then to the local table. Caller holds
    /// `query_lock`.
    fn save_record(&self, record: StoredQuery) -> FsResult<()> {
        let db = record.key.db.clone();
        let doc = record.to_document();
        let mut ids = self.record_ids(&record.key)?.into_iter();
        match ids.next() {
            Some(id) => self.store.upsert(&db, MARKER_COLLECTION, &id, doc)?,
            None => {
                self.store.insert(&db, MARKER_COLLECTION, doc)?;
            }
        }
        // Copies left by a concurrent writer elsewhere.
        for id in ids {
            self.store.delete(&db, MARKER_COLLECTION, &id)?;
        }
        self.queries.put(record);
        Ok(())
    }

    /// Deletes records from the store, then from the local table. Caller
    /// holds `query_lock`.
    fn delete_records(&self, keys: &[QueryKey]) -> FsResult<()> {
        for key in keys {
            for id in self.record_ids(key)? {
                self.store.delete(&key.db, MARKER_COLLECTION, &id)?;
            }
            self.queries.remove_key(key);
        }
        Ok(())
    }

    // ---- handles ----

    /// Opens a file node. With `truncate` the handle's buffer starts empty.
    pub fn open(&self, path: &str, truncate: bool) -> FsResult<u64> {
        trace!(%path, truncate, "open");
        let node = resolve(path);
        match &node {
            VirtualNode::Unknown { path } => return Err(FsError::NotFound(path.clone())),
            n if n.is_directory() => return Err(FsError::IsADirectory(n.path())),
            _ => {}
        }
        if truncate {
            self.check_writable(path)?;
        }
        log_failure("open", path, self.check_file_parent(&node))?;
        let file = if truncate || matches!(node, VirtualNode::NewDocumentFile { .. }) {
            OpenFile::truncated(node.path())
        } else {
            OpenFile::new(node.path())
        };
        let fh = self.handles.insert(file);
        debug!(%path, fh, "Opened file");
        Ok(fh)
    }

    /// Reads through a handle: from its buffer when loaded, else live.
    pub fn read_handle(&self, fh: u64, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        trace!(fh, offset, size, "read_handle");
        let path = {
            let file = self.handles.get(fh).ok_or(FsError::InvalidHandle(fh))?;
            if let Some(bytes) = file.read(offset, size) {
                return Ok(bytes.to_vec());
            }
            file.path().to_string()
        };
        self.read(&path, offset, size)
    }

    /// Buffers a write. Nothing reaches the store until flush or release.
    pub fn write_handle(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        trace!(fh, offset, len = data.len(), "write_handle");
        let mut file = self.handles.get_mut(fh).ok_or(FsError::InvalidHandle(fh))?;
        self.check_writable(file.path())?;
        if !file.is_loaded() {
            let live = self.live_content(file.path())?;
            file.load(live);
        }
        let written = file.write(offset, data);
        log_failure("write", file.path(), written)
    }

    /// Commits a dirty buffer. A failed commit keeps the buffer dirty.
    pub fn flush(&self, fh: u64) -> FsResult<()> {
        trace!(fh, "flush");
        let mut file = self.handles.get_mut(fh).ok_or(FsError::InvalidHandle(fh))?;
        if !file.is_dirty() {
            return Ok(());
        }
        let path = file.path().to_string();
        let node = resolve(&path);
        let created = log_failure("flush", &path, self.commit(&node, file.content(), file.created_id))?;
        if created.is_some() {
            file.created_id = created;
        }
        file.mark_clean();
        debug!(fh, %path, size = file.content().len(), "Flushed buffer");
        Ok(())
    }

    /// Flushes and frees a handle. The handle is freed even if the flush fails.
    pub fn release(&self, fh: u64) -> FsResult<()> {
        trace!(fh, "release");
        let result = self.flush(fh);
        self.handles.remove(fh);
        result
    }

    /// Sets a file's size. Through a handle this resizes the buffer; without
    /// one only truncation to zero is accepted, and it takes effect with the
    /// next write.
    pub fn truncate(&self, path: &str, fh: Option<u64>, size: u64) -> FsResult<()> {
        trace!(%path, ?fh, size, "truncate");
        self.check_writable(path)?;
        if let Some(fh) = fh {
            let mut file = self.handles.get_mut(fh).ok_or(FsError::InvalidHandle(fh))?;
            check_size(file.path(), size)?;
            if !file.is_loaded() && size > 0 {
                let live = self.live_content(file.path())?;
                file.load(live);
            }
            return file.truncate(size);
        }
        match resolve(path) {
            VirtualNode::Unknown { path } => Err(FsError::NotFound(path)),
            n if n.is_directory() => Err(FsError::IsADirectory(n.path())),
            _ if size == 0 => Ok(()),
            n => Err(FsError::unsupported("truncate", n.path())),
        }
    }

    fn check_writable(&self, path: &str) -> FsResult<()> {
        if self.config.read_only {
            return Err(FsError::ReadOnly(path.to_string()));
        }
        Ok(())
    }
}
