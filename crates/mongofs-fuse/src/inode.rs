//! Inode management for the FUSE adapter.
//!
//! The kernel addresses nodes by inode number while the core is path-based.
//! This table maps between the two and tracks lookup counts so that
//! `forget()` can evict entries the kernel no longer references.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// An entry in the inode table.
#[derive(Debug)]
pub struct InodeEntry {
    /// Canonical path of the node.
    pub path: String,
    /// Lookup count for `forget()` handling.
    nlookup: AtomicU64,
}

impl InodeEntry {
    fn new(path: String, nlookup: u64) -> Self {
        Self {
            path,
            nlookup: AtomicU64::new(nlookup),
        }
    }

    /// Increments the lookup count and returns the new value.
    pub fn inc_nlookup(&self) -> u64 {
        self.nlookup.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements the lookup count, saturating at zero, and returns the new
    /// value.
    pub fn dec_nlookup(&self, count: u64) -> u64 {
        let mut current = self.nlookup.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(count);
            match self
                .nlookup
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::SeqCst)
    }
}

/// Thread-safe bidirectional map between inode numbers and paths.
#[derive(Debug)]
pub struct InodeTable {
    path_to_inode: DashMap<String, u64>,
    inode_to_entry: DashMap<u64, InodeEntry>,
    next_inode: AtomicU64,
}

impl InodeTable {
    /// Creates a table with the root inode pre-allocated.
    pub fn new() -> Self {
        let table = Self {
            path_to_inode: DashMap::new(),
            inode_to_entry: DashMap::new(),
            // 1 is reserved for root
            next_inode: AtomicU64::new(ROOT_INODE + 1),
        };
        table.path_to_inode.insert("/".to_string(), ROOT_INODE);
        table
            .inode_to_entry
            .insert(ROOT_INODE, InodeEntry::new("/".to_string(), 1));
        table
    }

    /// Returns the inode for `path`, allocating one if needed, and counts a
    /// kernel lookup against it.
    pub fn lookup(&self, path: &str) -> u64 {
        self.insert_with(path, 1)
    }

    /// Returns the inode for `path` without counting a lookup. Used for
    /// directory listings, which the kernel does not balance with `forget()`.
    pub fn peek_or_insert(&self, path: &str) -> u64 {
        self.insert_with(path, 0)
    }

    fn insert_with(&self, path: &str, count: u64) -> u64 {
        match self.path_to_inode.entry(path.to_string()) {
            Entry::Occupied(e) => {
                let ino = *e.get();
                drop(e);
                if count > 0
                    && let Some(entry) = self.inode_to_entry.get(&ino)
                {
                    entry.inc_nlookup();
                }
                ino
            }
            Entry::Vacant(e) => {
                let ino = self.next_inode.fetch_add(1, Ordering::SeqCst);
                self.inode_to_entry
                    .insert(ino, InodeEntry::new(path.to_string(), count));
                e.insert(ino);
                ino
            }
        }
    }

    /// Path of an inode.
    pub fn path(&self, inode: u64) -> Option<String> {
        self.inode_to_entry.get(&inode).map(|e| e.path.clone())
    }

    /// Inode currently mapped to `path`.
    pub fn get_inode(&self, path: &str) -> Option<u64> {
        self.path_to_inode.get(path).map(|r| *r)
    }

    /// Lookup count of an inode.
    pub fn nlookup(&self, inode: u64) -> Option<u64> {
        self.inode_to_entry.get(&inode).map(|e| e.nlookup())
    }

    /// Drops `nlookup` references. Returns true if the inode was evicted.
    pub fn forget(&self, inode: u64, nlookup: u64) -> bool {
        if inode == ROOT_INODE {
            return false;
        }
        let remaining = match self.inode_to_entry.get(&inode) {
            Some(entry) => entry.dec_nlookup(nlookup),
            None => return false,
        };
        if remaining > 0 {
            return false;
        }
        match self.inode_to_entry.remove(&inode) {
            Some((_, entry)) => {
                self.path_to_inode.remove_if(&entry.path, |_, ino| *ino == inode);
                true
            }
            None => false,
        }
    }

    /// Evicts every non-root inode the kernel holds no lookup on. Listings
    /// allocate such inodes without a matching `forget()`. Returns the number
    /// evicted.
    pub fn sweep_unreferenced(&self) -> usize {
        let stale: Vec<u64> = self
            .inode_to_entry
            .iter()
            .filter(|e| *e.key() != ROOT_INODE && e.nlookup() == 0)
            .map(|e| *e.key())
            .collect();
        let mut evicted = 0;
        for ino in stale {
            // A lookup may have raced in since the scan.
            if let Some((_, entry)) = self
                .inode_to_entry
                .remove_if(&ino, |_, e| e.nlookup() == 0)
            {
                self.path_to_inode.remove_if(&entry.path, |_, i| *i == ino);
                evicted += 1;
            }
        }
        evicted
    }

    /// Unmaps a path after it was removed. The inode entry lives until
    /// `forget()`.
    pub fn invalidate_path(&self, path: &str) {
        self.path_to_inode.remove(path);
    }

    pub fn len(&self) -> usize {
        self.inode_to_entry.len()
    }

    /// True when only the root inode is present.
    pub fn is_empty(&self) -> bool {
        self.inode_to_entry.len() <= 1
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_inode_exists() {
        let table = InodeTable::new();
        assert_eq!(table.path(ROOT_INODE).as_deref(), Some("/"));
        assert_eq!(table.get_inode("/"), Some(ROOT_INODE));
        assert!(table.is_empty());
    }

    #[test]
    fn test_lookup_allocates_once() {
        let table = InodeTable::new();
        let ino = table.lookup("/db");
        assert!(ino > ROOT_INODE);
        assert_eq!(table.lookup("/db"), ino);
        assert_eq!(table.nlookup(ino), Some(2));
        assert_eq!(table.path(ino).as_deref(), Some("/db"));
    }

    #[test]
    fn test_peek_does_not_count() {
        let table = InodeTable::new();
        let ino = table.peek_or_insert("/db/c");
        assert_eq!(table.nlookup(ino), Some(0));
        assert_eq!(table.lookup("/db/c"), ino);
        assert_eq!(table.nlookup(ino), Some(1));
    }

    #[test]
    fn test_forget_evicts() {
        let table = InodeTable::new();
        let ino = table.lookup("/db");
        table.lookup("/db");
        assert!(!table.forget(ino, 1));
        assert!(table.forget(ino, 1));
        assert!(table.path(ino).is_none());
        assert!(table.get_inode("/db").is_none());
    }

    #[test]
    fn test_forget_root_is_noop() {
        let table = InodeTable::new();
        assert!(!table.forget(ROOT_INODE, 100));
        assert!(table.path(ROOT_INODE).is_some());
    }

    #[test]
    fn test_invalidate_then_reuse_path() {
        let table = InodeTable::new();
        let old = table.lookup("/db/c/x.json");
        table.invalidate_path("/db/c/x.json");
        let new = table.lookup("/db/c/x.json");
        assert_ne!(old, new);
        // Forgetting the stale inode leaves the new mapping alone.
        assert!(table.forget(old, 1));
        assert_eq!(table.get_inode("/db/c/x.json"), Some(new));
    }

    #[test]
    fn test_sweep_evicts_listing_only_inodes() {
        let table = InodeTable::new();
        let looked_up = table.lookup("/db");
        for i in 0..100 {
            table.peek_or_insert(&format!("/db/c/{i}.json"));
        }
        assert_eq!(table.len(), 102);

        assert_eq!(table.sweep_unreferenced(), 100);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get_inode("/db"), Some(looked_up));
        assert!(table.get_inode("/db/c/0.json").is_none());
        assert!(table.path(ROOT_INODE).is_some());
        assert_eq!(table.sweep_unreferenced(), 0);
    }
}
