//! Directory engine: blobs of packed entries terminated by a namelen-0
//! entry, stored at `/dir/<N>`.

use log::debug;
use txn_store::{StoreError, Txn};

use crate::dbfs_lib::codec::*;
use crate::dbfs_lib::err::{FsError, FsResult};
use crate::dbfs_lib::DbFs;

/// Reject names the directory format cannot hold. `.` and `..` are never
/// accepted as user-supplied names.
pub fn name_validate(name: &str) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(FsError::Invalid);
    }
    if name.contains('/') {
        return Err(FsError::Invalid);
    }
    if name.len() > DBFS_FILENAME_MAX {
        return Err(FsError::Invalid);
    }
    Ok(())
}

/// True iff the blob holds only `.` and `..`.
pub fn dir_is_empty(blob: &[u8]) -> FsResult<bool> {
    for ent in DirStream::new(blob) {
        let ent = ent?;
        if ent.name != "." && ent.name != ".." {
            return Ok(false);
        }
    }
    Ok(true)
}

impl DbFs {
    /// Fetch the directory blob. A missing key means the inode is not a
    /// directory.
    pub fn dir_read(&self, txn: &Txn, ino_n: u64) -> FsResult<Vec<u8>> {
        match self.meta.get(Some(txn), dir_key(ino_n).as_bytes()) {
            Ok(v) => Ok(v),
            Err(StoreError::NotFound) => Err(FsError::NotDir),
            Err(_) => Err(FsError::Io),
        }
    }

    pub fn dir_write(&self, txn: &Txn, ino_n: u64, blob: &[u8]) -> FsResult<()> {
        self.meta
            .put(txn, dir_key(ino_n).as_bytes(), blob)
            .map_err(|_| FsError::Io)
    }

    /// Scan `parent` for an exact name match and return the child inode.
    pub fn dir_lookup(&self, txn: &Txn, parent: u64, name: &str) -> FsResult<u64> {
        let blob = self.dir_read(txn, parent)?;
        for ent in DirStream::new(&blob) {
            let ent = ent?;
            if ent.name == name {
                return Ok(ent.ino);
            }
        }
        Err(FsError::NotFound)
    }

    /// Append one entry, preserving the terminator. Refuses duplicates.
    pub fn dir_append(&self, txn: &Txn, parent: u64, child: u64, name: &str) -> FsResult<()> {
        name_validate(name)?;
        let blob = self.dir_read(txn, parent)?;
        for ent in DirStream::new(&blob) {
            if ent?.name == name {
                return Err(FsError::Exists);
            }
        }
        let term = dir_terminator_pos(&blob)?;
        let mut out = Vec::with_capacity(term + dirent_next(name.len()) + DIRENT_HDR);
        out.extend_from_slice(&blob[..term]);
        push_dirent(&mut out, child, name);
        push_dir_terminator(&mut out);
        self.dir_write(txn, parent, &out)
    }

    /// Remove one entry, shifting the tail of the blob down over it.
    pub fn dirent_del(&self, txn: &Txn, parent: u64, name: &str) -> FsResult<()> {
        let mut blob = self.dir_read(txn, parent)?;
        let mut found = None;
        for ent in DirStream::new(&blob) {
            let ent = ent?;
            if ent.name == name {
                found = Some((ent.pos, ent.next));
                break;
            }
        }
        let (pos, next) = found.ok_or(FsError::NotFound)?;
        blob.drain(pos..next);
        self.dir_write(txn, parent, &blob)
    }

    /// Synthesize the minimum blob for a fresh directory: `.`, `..` and the
    /// terminator.
    pub fn dir_new(&self, txn: &Txn, parent: u64, ino_n: u64) -> FsResult<()> {
        debug!("dir_new ino {} (parent {})", ino_n, parent);
        let mut blob = Vec::new();
        push_dirent(&mut blob, ino_n, ".");
        push_dirent(&mut blob, parent, "..");
        push_dir_terminator(&mut blob);
        self.dir_write(txn, ino_n, &blob)
    }

    /// Point the directory's `..` entry at a new parent. Used when a
    /// directory is renamed across parents.
    pub fn dir_set_parent(&self, txn: &Txn, ino_n: u64, new_parent: u64) -> FsResult<()> {
        let mut blob = self.dir_read(txn, ino_n)?;
        let mut dotdot = None;
        for ent in DirStream::new(&blob) {
            let ent = ent?;
            if ent.name == ".." {
                dotdot = Some(ent.pos);
                break;
            }
        }
        let pos = dotdot.ok_or(FsError::Io)?;
        blob[pos + 8..pos + 16].copy_from_slice(&new_parent.to_le_bytes());
        self.dir_write(txn, ino_n, &blob)
    }
}
