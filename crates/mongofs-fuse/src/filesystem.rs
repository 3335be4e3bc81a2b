//! FUSE filesystem implementation for mounted document stores.
//!
//! Kernel requests arrive by inode; [`MongoFuse`] turns them into paths and
//! delegates to [`MongoFs`], which owns every piece of document semantics.

use crate::inode::{InodeTable, ROOT_INODE};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use mongofs_core::path::{SEPARATOR, join};
use mongofs_core::{FsError, MongoFs, NodeAttr, NodeKind};
use std::ffi::OsStr;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, trace};

/// Block size for filesystem statistics.
const BLOCK_SIZE: u32 = 4096;

/// Default file permissions (rw-r--r--).
const DEFAULT_FILE_PERM: u16 = 0o644;

/// Default directory permissions (rwxr-xr-x).
const DEFAULT_DIR_PERM: u16 = 0o755;

/// Read-only variants.
const READ_ONLY_FILE_PERM: u16 = 0o444;
const READ_ONLY_DIR_PERM: u16 = 0o555;

/// FUSE adapter over a [`MongoFs`].
pub struct MongoFuse {
    fs: MongoFs,
    inodes: InodeTable,
    /// TTL handed to the kernel for entries and attributes.
    ttl: Duration,
    uid: u32,
    gid: u32,
    read_only: bool,
}

impl MongoFuse {
    pub fn new(fs: MongoFs) -> Self {
        let config = fs.config();
        let (ttl, uid, gid, read_only) = (config.attr_ttl, config.uid, config.gid, config.read_only);
        Self {
            fs,
            inodes: InodeTable::new(),
            ttl,
            uid,
            gid,
            read_only,
        }
    }

    /// The wrapped path-based filesystem.
    pub fn inner(&self) -> &MongoFs {
        &self.fs
    }

    /// Converts core attributes to a kernel `FileAttr`.
    pub fn file_attr(&self, ino: u64, attr: &NodeAttr) -> FileAttr {
        let (kind, perm, nlink) = match attr.kind {
            NodeKind::Directory => (
                FileType::Directory,
                if self.read_only { READ_ONLY_DIR_PERM } else { DEFAULT_DIR_PERM },
                2,
            ),
            NodeKind::File => (
                FileType::RegularFile,
                if self.read_only { READ_ONLY_FILE_PERM } else { DEFAULT_FILE_PERM },
                1,
            ),
        };
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(u64::from(BLOCK_SIZE)),
            atime: attr.mtime,
            mtime: attr.mtime,
            ctime: attr.mtime,
            crtime: attr.mtime,
            kind,
            perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn path_of(&self, ino: u64) -> Result<String, c_int> {
        self.inodes.path(ino).ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        Ok(join(&self.path_of(parent)?, name))
    }

    /// Looks a path up, counting the reference, and builds its entry attr.
    fn entry_for(&self, path: &str, attr: &NodeAttr) -> FileAttr {
        let ino = self.inodes.lookup(path);
        self.file_attr(ino, attr)
    }
}

/// Parent directory of a canonical path. The root is its own parent.
pub fn parent_path(path: &str) -> &str {
    match path.trim_end_matches(SEPARATOR).rfind(SEPARATOR) {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn kind_to_file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Directory => FileType::Directory,
        NodeKind::File => FileType::RegularFile,
    }
}

fn errno(e: &FsError) -> c_int {
    e.to_errno()
}

fn wants_write(flags: i32) -> bool {
    flags & libc::O_ACCMODE != libc::O_RDONLY
}

impl Filesystem for MongoFuse {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        info!(ttl_ms = self.ttl.as_millis(), read_only = self.read_only, "FUSE filesystem initialized");
        config.add_capabilities(fuser::consts::FUSE_ASYNC_READ).ok();
        // O_TRUNC reaches open() instead of a separate setattr.
        config.add_capabilities(fuser::consts::FUSE_ATOMIC_O_TRUNC).ok();
        Ok(())
    }

    fn destroy(&mut self) {
        info!(open_handles = self.fs.open_handles(), "FUSE filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        trace!(parent, %path, "lookup");
        match self.fs.getattr(&path) {
            Ok(attr) => {
                let attr = self.entry_for(&path, &attr);
                reply.entry(&self.ttl, &attr, 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        if self.inodes.forget(ino, nlookup) {
            trace!(ino, "Evicted inode");
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.fs.getattr_with_handle(&path, fh) {
            Ok(attr) => reply.attr(&self.ttl, &self.file_attr(ino, &attr)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        // Mode, owner and times are fixed; only size changes are honored.
        if let Some(size) = size
            && let Err(e) = self.fs.truncate(&path, fh, size)
        {
            return reply.error(errno(&e));
        }
        match self.fs.getattr_with_handle(&path, fh) {
            Ok(attr) => reply.attr(&self.ttl, &self.file_attr(ino, &attr)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        debug!(%path, "mkdir");
        match self.fs.mkdir(&path) {
            Ok(attr) => {
                let attr = self.entry_for(&path, &attr);
                reply.entry(&self.ttl, &attr, 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        debug!(%path, "unlink");
        match self.fs.unlink(&path) {
            Ok(()) => {
                self.inodes.invalidate_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        debug!(%path, "rmdir");
        match self.fs.rmdir(&path) {
            Ok(()) => {
                self.inodes.invalidate_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        if self.read_only && wants_write(flags) {
            return reply.error(libc::EROFS);
        }
        let truncate = flags & libc::O_TRUNC != 0;
        match self.fs.open(&path, truncate) {
            // Sizes change with every commit, so bypass the page cache.
            Ok(fh) => reply.opened(fh, fuser::consts::FOPEN_DIRECT_IO),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let offset = u64::try_from(offset).unwrap_or(0);
        match self.fs.read_handle(fh, offset, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        match self.fs.write_handle(fh, offset, data) {
            Ok(written) => reply.written(u32::try_from(written).unwrap_or(u32::MAX)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.fs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        debug!(%path, "create");
        let attr = match self.fs.create(&path) {
            Ok(attr) => attr,
            Err(e) => return reply.error(errno(&e)),
        };
        match self.fs.open(&path, true) {
            Ok(fh) => {
                let attr = self.entry_for(&path, &attr);
                reply.created(&self.ttl, &attr, 0, fh, fuser::consts::FOPEN_DIRECT_IO);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.fs.getattr(&path) {
            Ok(attr) if attr.is_dir() => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        trace!(ino, %path, offset, "readdir");
        let entries = match self.fs.readdir(&path) {
            Ok(entries) => entries,
            Err(e) => return reply.error(errno(&e)),
        };

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, entry) in entries.iter().enumerate().skip(skip) {
            let child_ino = match entry.name.as_str() {
                "." => ino,
                ".." if ino == ROOT_INODE => ROOT_INODE,
                ".." => self.inodes.peek_or_insert(parent_path(&path)),
                name => self.inodes.peek_or_insert(&join(&path, name)),
            };
            let next_offset = i64::try_from(i + 1).unwrap_or(i64::MAX);
            if reply.add(child_ino, next_offset, kind_to_file_type(entry.kind), &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        let evicted = self.inodes.sweep_unreferenced();
        if evicted > 0 {
            trace!(ino, evicted, remaining = self.inodes.len(), "Swept listing inodes");
        }
        reply.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongofs_core::{FsConfig, MemoryStore};
    use std::sync::Arc;

    fn fuse(config: FsConfig) -> MongoFuse {
        MongoFuse::new(MongoFs::new(Arc::new(MemoryStore::new()), config))
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/"), "/");
        assert_eq!(parent_path("/db"), "/");
        assert_eq!(parent_path("/db/c"), "/db");
        assert_eq!(parent_path("/db/c/by_age/25"), "/db/c/by_age");
    }

    #[test]
    fn test_file_attr_for_document() {
        let f = fuse(FsConfig::default().owner(1000, 100));
        let attr = f.file_attr(7, &NodeAttr::file(5000, SystemTime::UNIX_EPOCH));
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, DEFAULT_FILE_PERM);
        assert_eq!(attr.blocks, 2);
        assert_eq!(attr.nlink, 1);
        assert_eq!((attr.uid, attr.gid), (1000, 100));
        assert_eq!(attr.mtime, SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn test_file_attr_read_only_perms() {
        let f = fuse(FsConfig::default().read_only(true));
        let dir = f.file_attr(ROOT_INODE, &NodeAttr::directory(SystemTime::now()));
        assert_eq!(dir.kind, FileType::Directory);
        assert_eq!(dir.perm, READ_ONLY_DIR_PERM);
        assert_eq!(dir.nlink, 2);
        let file = f.file_attr(2, &NodeAttr::file(0, SystemTime::now()));
        assert_eq!(file.perm, READ_ONLY_FILE_PERM);
        assert_eq!(file.blocks, 0);
    }

    #[test]
    fn test_kernel_ttl_follows_config() {
        let f = fuse(FsConfig::with_expire_secs(5));
        assert_eq!(f.ttl, Duration::from_secs(5));
        assert_eq!(f.inner().config().attr_ttl, Duration::from_secs(5));
    }

    #[test]
    fn test_child_path_rejects_non_utf8() {
        use std::os::unix::ffi::OsStrExt;
        let f = fuse(FsConfig::default());
        assert_eq!(f.child_path(ROOT_INODE, OsStr::new("db")).unwrap(), "/db");
        assert_eq!(
            f.child_path(ROOT_INODE, OsStr::from_bytes(&[0xff, 0xfe])),
            Err(libc::EINVAL)
        );
        assert_eq!(f.child_path(999, OsStr::new("db")), Err(libc::ENOENT));
    }

    #[test]
    fn test_write_intent_from_flags() {
        assert!(!wants_write(libc::O_RDONLY));
        assert!(wants_write(libc::O_WRONLY | libc::O_TRUNC));
        assert!(wants_write(libc::O_RDWR));
    }
}
