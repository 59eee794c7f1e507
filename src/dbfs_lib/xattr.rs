//! Extended-attribute engine.
//!
//! Two records per attribute: the value at `/xattr/<N>/<name>` and an entry
//! in the per-inode name list at `/xattr/<N>`. The list exists so that
//! `listxattr` never scans the key space; the two records are created and
//! removed together.

use log::warn;
use txn_store::{StoreError, Txn};

use crate::dbfs_lib::codec::*;
use crate::dbfs_lib::err::{FsError, FsResult};
use crate::dbfs_lib::DbFs;

/// Create/replace behaviour of `setxattr`.
#[derive(Debug, Clone, Copy, Default)]
pub struct XattrFlags {
    /// Fail if the attribute already exists.
    pub create: bool,
    /// Fail if the attribute is absent.
    pub replace: bool,
}

impl XattrFlags {
    pub fn from_bits(flags: i32) -> XattrFlags {
        XattrFlags {
            create: flags & libc::XATTR_CREATE != 0,
            replace: flags & libc::XATTR_REPLACE != 0,
        }
    }
}

impl DbFs {
    /// The name list, or `None` when the inode has no attributes.
    fn xattr_list_read(&self, txn: &Txn, ino_n: u64) -> FsResult<Option<Vec<u8>>> {
        match self.meta.get(Some(txn), xattr_list_key(ino_n).as_bytes()) {
            Ok(v) => Ok(Some(v)),
            Err(StoreError::NotFound) => Ok(None),
            Err(_) => Err(FsError::Io),
        }
    }

    fn xattr_list_add(&self, txn: &Txn, ino_n: u64, name: &str) -> FsResult<()> {
        let mut blob = self.xattr_list_read(txn, ino_n)?.unwrap_or_default();
        push_xlist_entry(&mut blob, name);
        self.meta
            .put(txn, xattr_list_key(ino_n).as_bytes(), &blob)
            .map_err(|_| FsError::Io)
    }

    /// Pull `name` out of the list; the record is deleted outright when the
    /// last entry goes.
    fn xattr_list_del(&self, txn: &Txn, ino_n: u64, name: &str) -> FsResult<()> {
        let mut blob = match self.xattr_list_read(txn, ino_n)? {
            Some(b) => b,
            None => return Err(FsError::NotFound),
        };
        let mut found = None;
        let mut entries = 0usize;
        for ent in XlistStream::new(&blob) {
            let ent = ent?;
            entries += 1;
            if ent.name == name {
                found = Some((ent.pos, ent.next));
            }
        }
        let (pos, next) = found.ok_or(FsError::NotFound)?;
        if entries > 1 {
            blob.drain(pos..next);
            self.meta
                .put(txn, xattr_list_key(ino_n).as_bytes(), &blob)
                .map_err(|_| FsError::Io)
        } else {
            self.meta_del(txn, &xattr_list_key(ino_n))
        }
    }

    /// Full value bytes of one attribute. A missing value reads as invalid.
    pub fn xattr_get(&self, txn: &Txn, ino_n: u64, name: &str) -> FsResult<Vec<u8>> {
        match self.meta.get(Some(txn), xattr_key(ino_n, name).as_bytes()) {
            Ok(v) => Ok(v),
            Err(StoreError::NotFound) => Err(FsError::Invalid),
            Err(_) => Err(FsError::Io),
        }
    }

    pub fn xattr_set(
        &self,
        txn: &Txn,
        ino_n: u64,
        name: &str,
        value: &[u8],
        flags: XattrFlags,
    ) -> FsResult<()> {
        if name.is_empty() || name.len() > DBFS_XATTR_NAME_LEN || value.len() > DBFS_XATTR_MAX_LEN
        {
            return Err(FsError::Invalid);
        }

        let exists = match self.xattr_get(txn, ino_n, name) {
            Ok(_) => true,
            Err(FsError::Invalid) => false,
            Err(e) => return Err(e),
        };
        if exists && flags.create {
            return Err(FsError::Exists);
        }
        if !exists && flags.replace {
            return Err(FsError::NotFound);
        }

        let key = xattr_key(ino_n, name);
        self.meta
            .put(txn, key.as_bytes(), value)
            .map_err(|_| FsError::Io)?;

        if !exists {
            if let Err(e) = self.xattr_list_add(txn, ino_n, name) {
                // the enclosing transaction will roll this back anyway;
                // remove the value record so no path observes the half-state
                if let Err(e2) = self.meta_del(txn, &key) {
                    warn!("xattr value rollback failed: {}", e2);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn xattr_remove(&self, txn: &Txn, ino_n: u64, name: &str) -> FsResult<()> {
        self.xattr_list_del(txn, ino_n, name)?;
        self.meta_del(txn, &xattr_key(ino_n, name))
    }

    /// All names, each followed by a NUL, in list order.
    pub fn xattr_list(&self, txn: &Txn, ino_n: u64) -> FsResult<Vec<u8>> {
        let blob = match self.xattr_list_read(txn, ino_n)? {
            Some(b) => b,
            None => return Ok(Vec::new()),
        };
        let mut out = Vec::with_capacity(blob.len());
        for ent in XlistStream::new(&blob) {
            let ent = ent?;
            out.extend_from_slice(ent.name.as_bytes());
            out.push(0);
        }
        Ok(out)
    }

    /// Remove every xattr record of an inode. Used by inode deletion.
    pub(crate) fn xattr_purge(&self, txn: &Txn, ino_n: u64) -> FsResult<()> {
        let blob = match self.xattr_list_read(txn, ino_n)? {
            Some(b) => b,
            None => return Ok(()),
        };
        let mut names = Vec::new();
        for ent in XlistStream::new(&blob) {
            names.push(ent?.name.to_string());
        }
        for name in names {
            match self.meta_del(txn, &xattr_key(ino_n, &name)) {
                Ok(()) | Err(FsError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        self.meta_del(txn, &xattr_list_key(ino_n))
    }
}
