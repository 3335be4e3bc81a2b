//! Filesystem configuration.

use crate::attr::DEFAULT_ATTR_TTL;
use std::time::Duration;

/// Configuration options for a mounted document store.
///
/// `attr_ttl` is the staleness contract: metadata answered from the cache may
/// be up to this old. Zero disables the cache, so every metadata call reaches
/// the store.
#[derive(Debug, Clone)]
pub struct FsConfig {
    /// Time-to-live for cached attributes. Default: 1 second.
    pub attr_ttl: Duration,

    /// Owner reported for every node.
    pub uid: u32,

    /// Group reported for every node.
    pub gid: u32,

    /// Reject every mutating operation.
    pub read_only: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            attr_ttl: DEFAULT_ATTR_TTL,
            uid: 0,
            gid: 0,
            read_only: false,
        }
    }
}

impl FsConfig {
    /// Creates a configuration with the given expiry in whole seconds.
    pub fn with_expire_secs(secs: u64) -> Self {
        Self {
            attr_ttl: Duration::from_secs(secs),
            ..Default::default()
        }
    }

    /// Sets the cache TTL for attributes.
    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    /// Sets the reported owner.
    #[must_use]
    pub fn owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Sets read-only mode.
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}
