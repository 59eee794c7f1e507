//! Symlink engine: the target lives as raw bytes at `/symlink/<N>`, no
//! terminator.

use txn_store::{StoreError, Txn};

use crate::dbfs_lib::codec::{symlink_key, DBFS_SYMLINK_MAX};
use crate::dbfs_lib::err::{FsError, FsResult};
use crate::dbfs_lib::DbFs;

impl DbFs {
    pub fn symlink_read(&self, txn: &Txn, ino_n: u64) -> FsResult<Vec<u8>> {
        match self.meta.get(Some(txn), symlink_key(ino_n).as_bytes()) {
            Ok(v) => Ok(v),
            Err(StoreError::NotFound) => Err(FsError::Invalid),
            Err(_) => Err(FsError::Io),
        }
    }

    /// Store the target. UTF-8 is guaranteed by the `&str`; length is bounded.
    pub fn symlink_write(&self, txn: &Txn, ino_n: u64, target: &str) -> FsResult<()> {
        if target.is_empty() || target.len() > DBFS_SYMLINK_MAX {
            return Err(FsError::Invalid);
        }
        self.meta
            .put(txn, symlink_key(ino_n).as_bytes(), target.as_bytes())
            .map_err(|_| FsError::Io)
    }
}
