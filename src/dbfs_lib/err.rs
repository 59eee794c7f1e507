//! Error taxonomy. Engines return [`FsError`]; the dispatch layer translates
//! to a POSIX errno and aborts the transaction.

use libc::c_int;
use txn_store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("no such entry")]
    NotFound,
    #[error("already exists")]
    Exists,
    #[error("not a directory")]
    NotDir,
    #[error("is a directory")]
    IsDir,
    #[error("directory not empty")]
    NotEmpty,
    #[error("invalid argument")]
    Invalid,
    #[error("no free inode numbers")]
    NoSpace,
    #[error("store i/o failure or on-disk corruption")]
    Io,
    #[error("out of memory")]
    NoMem,
    #[error("buffer too small")]
    Range,
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn errno(self) -> c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::Exists => libc::EEXIST,
            FsError::NotDir => libc::ENOTDIR,
            FsError::IsDir => libc::EISDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::Invalid => libc::EINVAL,
            FsError::NoSpace => libc::EBUSY,
            FsError::Io => libc::EIO,
            FsError::NoMem => libc::ENOMEM,
            FsError::Range => libc::ERANGE,
        }
    }
}

impl From<StoreError> for FsError {
    fn from(e: StoreError) -> FsError {
        match e {
            StoreError::NotFound => FsError::NotFound,
            StoreError::KeyExists => FsError::Exists,
            StoreError::Corrupt(_) | StoreError::Io(_) => FsError::Io,
        }
    }
}
