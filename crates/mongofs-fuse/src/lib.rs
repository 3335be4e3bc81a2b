//! FUSE mount for document stores.
//!
//! Wraps a [`mongofs_core::MongoFs`] in a `fuser::Filesystem`: kernel inodes
//! are mapped to paths by the [`InodeTable`] and every request is answered by
//! the path-based core.
//!
//! # Usage
//!
//! ```ignore
//! use mongofs_core::{FsConfig, MemoryStore, MongoFs};
//! use mongofs_fuse::{MongoFuse, mount_options};
//!
//! let fs = MongoFs::new(Arc::new(MemoryStore::new()), FsConfig::default());
//! let session = fuser::spawn_mount2(MongoFuse::new(fs), mountpoint, &mount_options("local", false))?;
//! ```

pub mod filesystem;
pub mod inode;
pub mod mount;

pub use filesystem::MongoFuse;
pub use inode::{InodeEntry, InodeTable, ROOT_INODE};
pub use mount::{StoreSource, load_store, mount_options, open_store};
