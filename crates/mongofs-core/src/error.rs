//! Error handling and errno mapping.
//!
//! Every operation of the filesystem bridge returns [`FsResult`]; adapters
//! turn the error into a POSIX code with [`FsError::to_errno`].

use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by filesystem operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Nothing backs the path, or the name is not one we recognize.
    #[error("No such entry: {0}")]
    NotFound(String),

    /// A write buffer did not parse as a document.
    #[error("Malformed content for {path}: {reason}")]
    Malformed { path: String, reason: String },

    /// The document store call failed.
    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    /// Directory operation on a file node.
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// File operation on a directory node.
    #[error("Is a directory: {0}")]
    IsADirectory(String),

    /// mkdir on something that already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation not defined for this kind of node.
    #[error("Operation {op} not supported on {path}")]
    Unsupported { op: &'static str, path: String },

    /// Unknown open-file handle.
    #[error("Invalid file handle: {0}")]
    InvalidHandle(u64),

    /// Content past the largest document the store accepts.
    #[error("File too large: {path} ({size} bytes)")]
    TooLarge { path: String, size: u64 },

    /// Mutation attempted on a read-only mount.
    #[error("Read-only filesystem: {0}")]
    ReadOnly(String),
}

impl FsError {
    /// Converts this error to a libc error code.
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::Malformed { .. } => libc::EINVAL,
            FsError::Store(_) => libc::EIO,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::Unsupported { .. } => libc::ENOTSUP,
            FsError::InvalidHandle(_) => libc::EBADF,
            FsError::TooLarge { .. } => libc::EFBIG,
            FsError::ReadOnly(_) => libc::EROFS,
        }
    }

    pub(crate) fn unsupported(op: &'static str, path: impl Into<String>) -> Self {
        FsError::Unsupported {
            op,
            path: path.into(),
        }
    }

    pub(crate) fn malformed(path: impl Into<String>, reason: impl ToString) -> Self {
        FsError::Malformed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;
