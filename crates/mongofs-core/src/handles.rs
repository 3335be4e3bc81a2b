//! Open-file handles and their write buffers.
//!
//! Documents are stored whole, so a file cannot be patched in place. Writes
//! through a handle land in a per-handle buffer (read-modify-write) and the
//! complete buffer is committed on flush or release.

use crate::error::{FsError, FsResult};
use crate::oid::ObjectId;
use dashmap::DashMap;
use dashmap::mapref::one::{Ref, RefMut};
use std::sync::atomic::{AtomicU64, Ordering};

/// Largest file content accepted, the store's document size limit.
pub const MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Rejects a size past [`MAX_FILE_SIZE`].
pub fn check_size(path: &str, size: u64) -> FsResult<()> {
    if size > MAX_FILE_SIZE {
        return Err(FsError::TooLarge {
            path: path.to_string(),
            size,
        });
    }
    Ok(())
}

/// Returns `content[offset .. offset + size]`, clamped to the content.
/// Empty when `offset` is at or past the end.
pub fn slice_at(content: &[u8], offset: u64, size: usize) -> &[u8] {
    let Ok(offset) = usize::try_from(offset) else {
        return &[];
    };
    if offset >= content.len() {
        return &[];
    }
    let end = offset.saturating_add(size).min(content.len());
    &content[offset..end]
}

/// State of one open file.
///
/// The buffer starts unloaded; it is filled with the live content on the
/// first write or truncate, or starts empty when opened with truncation.
#[derive(Debug)]
pub struct OpenFile {
    path: String,
    buffer: Option<Vec<u8>>,
    dirty: bool,
    /// Identifier inserted by the first commit through a `new.json` handle.
    pub created_id: Option<ObjectId>,
}

impl OpenFile {
    /// A handle whose buffer is loaded lazily.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            buffer: None,
            dirty: false,
            created_id: None,
        }
    }

    /// A handle whose buffer starts empty.
    pub fn truncated(path: impl Into<String>) -> Self {
        Self {
            buffer: Some(Vec::new()),
            ..Self::new(path)
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.buffer.is_some()
    }

    /// Seeds the buffer with the current content. No-op once loaded.
    pub fn load(&mut self, content: Vec<u8>) {
        if self.buffer.is_none() {
            self.buffer = Some(content);
        }
    }

    /// Writes `data` at `offset`, zero-filling any gap. Returns the byte count.
    /// Nothing is written if the result would exceed [`MAX_FILE_SIZE`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn write(&mut self, offset: u64, data: &[u8]) -> FsResult<usize> {
        let end = offset.saturating_add(data.len() as u64);
        check_size(&self.path, end)?;
        // Both fit in usize once bounded by MAX_FILE_SIZE.
        let (offset, end) = (offset as usize, end as usize);
        let buf = self.buffer.get_or_insert_with(Vec::new);
        if end > buf.len() {
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(data);
        self.dirty = true;
        Ok(data.len())
    }

    /// Buffered bytes at `offset`, or `None` if the buffer is not loaded.
    pub fn read(&self, offset: u64, size: usize) -> Option<&[u8]> {
        self.buffer.as_deref().map(|buf| slice_at(buf, offset, size))
    }

    /// Resizes the buffer, zero-extending when growing.
    #[allow(clippy::cast_possible_truncation)]
    pub fn truncate(&mut self, size: u64) -> FsResult<()> {
        check_size(&self.path, size)?;
        let size = size as usize;
        let buf = self.buffer.get_or_insert_with(Vec::new);
        if size != buf.len() {
            buf.resize(size, 0);
            self.dirty = true;
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Buffered content; empty when not loaded.
    pub fn content(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or_default()
    }

    /// Size of the buffered content, if loaded.
    pub fn len(&self) -> Option<u64> {
        self.buffer.as_ref().map(|b| b.len() as u64)
    }
}

/// Handle table with auto-incrementing ids. Id 0 is never issued.
#[derive(Debug)]
pub struct HandleTable<V> {
    handles: DashMap<u64, V>,
    next_id: AtomicU64,
}

impl<V> HandleTable<V> {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Inserts a value under a fresh id and returns the id.
    pub fn insert(&self, value: V) -> u64 {
        let mut id = self.next_id.fetch_add(1, Ordering::Relaxed);
        while id == 0 || self.handles.contains_key(&id) {
            id = self.next_id.fetch_add(1, Ordering::Relaxed);
        }
        self.handles.insert(id, value);
        id
    }

    pub fn get(&self, id: u64) -> Option<Ref<'_, u64, V>> {
        self.handles.get(&id)
    }

    pub fn get_mut(&self, id: u64) -> Option<RefMut<'_, u64, V>> {
        self.handles.get_mut(&id)
    }

    pub fn remove(&self, id: u64) -> Option<V> {
        self.handles.remove(&id).map(|(_, v)| v)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.handles.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<V> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}
