//! Attribute caching for metadata calls.
//!
//! Entries are keyed by the canonical path string and trusted for a fixed
//! TTL. Changes made behind the filesystem's back (another client dropping a
//! database, deleting a document) stay invisible until the entry expires:
//! the TTL is the staleness contract. A TTL of zero turns caching off.

use crate::error::FsResult;
use dashmap::DashMap;
use std::time::{Duration, Instant, SystemTime};
use tracing::trace;

/// Default time-to-live for cached attributes (1 second).
pub const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(1);

/// Whether a node is presented as a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// Metadata for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    pub kind: NodeKind,
    pub size: u64,
    pub mtime: SystemTime,
}

impl NodeAttr {
    /// Attributes of a directory modified at `mtime`.
    pub fn directory(mtime: SystemTime) -> Self {
        Self {
            kind: NodeKind::Directory,
            size: 0,
            mtime,
        }
    }

    /// Attributes of a file of `size` bytes modified at `mtime`.
    pub fn file(size: u64, mtime: SystemTime) -> Self {
        Self {
            kind: NodeKind::File,
            size,
            mtime,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

/// A cached attribute with its insertion time.
#[derive(Debug, Clone)]
pub struct CachedAttr {
    /// The cached attributes.
    pub attr: NodeAttr,
    inserted: Instant,
}

impl CachedAttr {
    fn new(attr: NodeAttr) -> Self {
        Self {
            attr,
            inserted: Instant::now(),
        }
    }

    /// Returns true once `ttl` has elapsed since insertion.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted.elapsed() >= ttl
    }
}

/// Thread-safe, TTL-bounded cache of path attributes.
///
/// `DashMap` shards give single-writer-per-key exclusion, so readers never
/// observe a half-written entry.
#[derive(Debug)]
pub struct AttrCache {
    entries: DashMap<String, CachedAttr>,
    ttl: Duration,
}

impl AttrCache {
    /// Creates a cache whose entries live for `ttl`. Zero disables caching.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Creates a cache with [`DEFAULT_ATTR_TTL`].
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_ATTR_TTL)
    }

    /// Returns true when the TTL is zero.
    pub fn is_disabled(&self) -> bool {
        self.ttl.is_zero()
    }

    /// Returns the attribute TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Gets a cached attribute if it exists and hasn't expired.
    pub fn get(&self, path: &str) -> Option<NodeAttr> {
        if self.is_disabled() {
            return None;
        }
        if let Some(entry) = self.entries.get(path) {
            if !entry.is_expired(self.ttl) {
                return Some(entry.attr);
            }
            drop(entry);
            self.entries.remove(path);
        }
        None
    }

    /// Returns the cached attribute for `path`, or runs `compute` and caches
    /// its result. A failed `compute` leaves the cache untouched.
    pub fn get_or_compute<F>(&self, path: &str, compute: F) -> FsResult<NodeAttr>
    where
        F: FnOnce() -> FsResult<NodeAttr>,
    {
        if let Some(attr) = self.get(path) {
            trace!(%path, "attr cache hit");
            return Ok(attr);
        }
        let attr = compute()?;
        self.insert(path, attr);
        Ok(attr)
    }

    /// Inserts or refreshes an entry.
    pub fn insert(&self, path: &str, attr: NodeAttr) {
        if self.is_disabled() {
            return;
        }
        self.entries.insert(path.to_string(), CachedAttr::new(attr));
    }

    /// Removes the entry for exactly `path`.
    pub fn invalidate(&self, path: &str) {
        self.entries.remove(path);
    }

    /// Drops every expired entry.
    pub fn purge_expired(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, v| !v.is_expired(ttl));
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for AttrCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}
