//! Inode engine: read, write, allocate, delete and resize inode records.

use std::sync::atomic::Ordering;
use std::time::UNIX_EPOCH;

use fuser::{FileAttr, FileType};
use log::debug;
use txn_store::{StoreError, Txn};

use crate::dbfs_lib::codec::*;
use crate::dbfs_lib::err::{FsError, FsResult};
use crate::dbfs_lib::utils::unix_now;
use crate::dbfs_lib::DbFs;

/// File type deduced from the mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    Dir,
    CharDev,
    BlockDev,
    Fifo,
    Symlink,
    Socket,
    Regular,
}

impl InodeType {
    pub fn from_mode(mode: u32) -> FsResult<InodeType> {
        match mode & libc::S_IFMT {
            libc::S_IFDIR => Ok(InodeType::Dir),
            libc::S_IFCHR => Ok(InodeType::CharDev),
            libc::S_IFBLK => Ok(InodeType::BlockDev),
            libc::S_IFIFO => Ok(InodeType::Fifo),
            libc::S_IFLNK => Ok(InodeType::Symlink),
            libc::S_IFSOCK => Ok(InodeType::Socket),
            libc::S_IFREG => Ok(InodeType::Regular),
            _ => Err(FsError::Invalid),
        }
    }

    pub fn file_type(self) -> FileType {
        match self {
            InodeType::Dir => FileType::Directory,
            InodeType::CharDev => FileType::CharDevice,
            InodeType::BlockDev => FileType::BlockDevice,
            InodeType::Fifo => FileType::NamedPipe,
            InodeType::Symlink => FileType::Symlink,
            InodeType::Socket => FileType::Socket,
            InodeType::Regular => FileType::RegularFile,
        }
    }
}

/// A decoded inode plus its deduced type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub raw: RawInode,
    pub itype: InodeType,
}

impl Inode {
    pub fn ino(&self) -> u64 {
        self.raw.ino
    }

    pub fn attr(&self) -> FileAttr {
        FileAttr {
            ino: self.raw.ino,
            size: self.raw.size,
            blocks: self.raw.size / 512,
            atime: UNIX_EPOCH + std::time::Duration::from_secs(self.raw.atime),
            mtime: UNIX_EPOCH + std::time::Duration::from_secs(self.raw.mtime),
            ctime: UNIX_EPOCH + std::time::Duration::from_secs(self.raw.ctime),
            crtime: UNIX_EPOCH,
            kind: self.itype.file_type(),
            perm: (self.raw.mode & 0o7777) as u16,
            nlink: self.raw.nlink,
            uid: self.raw.uid,
            gid: self.raw.gid,
            rdev: self.raw.rdev as u32,
            blksize: 512,
            flags: 0,
        }
    }
}

impl DbFs {
    /// Fetch and decode `/inode/<ino>`.
    pub fn inode_read(&self, txn: &Txn, ino_n: u64) -> FsResult<Inode> {
        let val = match self.meta.get(Some(txn), inode_key(ino_n).as_bytes()) {
            Ok(v) => v,
            Err(StoreError::NotFound) => return Err(FsError::NotFound),
            Err(_) => return Err(FsError::Io),
        };
        let raw = RawInode::decode(&val)?;
        let itype = InodeType::from_mode(raw.mode)?;
        Ok(Inode { raw, itype })
    }

    /// Re-encode and store an inode, bumping its version.
    pub fn inode_write(&self, txn: &Txn, ino: &mut Inode) -> FsResult<()> {
        ino.raw.version = ino.raw.version.wrapping_add(1);
        self.meta
            .put(txn, inode_key(ino.raw.ino).as_bytes(), &ino.raw.encode())
            .map_err(|_| FsError::Io)
    }

    /// Allocate a fresh inode number and return a zeroed raw inode carrying
    /// it, timestamps set to now. The caller fills in mode/nlink/rdev and
    /// writes it.
    ///
    /// Numbers are probed from a rolling counter; 0 and 1 are reserved, and a
    /// probe that completes a full cycle without finding a gap fails.
    pub fn inode_new(&self, txn: &Txn) -> FsResult<RawInode> {
        let start = self.next_inode.load(Ordering::Relaxed);
        loop {
            let cur = self.next_inode.load(Ordering::Relaxed);
            match self.inode_read(txn, cur) {
                Err(FsError::NotFound) => {
                    self.next_inode
                        .store(Self::next_ino_candidate(cur), Ordering::Relaxed);
                    let now = unix_now();
                    return Ok(RawInode {
                        ino: cur,
                        ctime: now,
                        atime: now,
                        mtime: now,
                        ..RawInode::default()
                    });
                }
                Ok(_) => {
                    let next = Self::next_ino_candidate(cur);
                    if next == start {
                        return Err(FsError::NoSpace);
                    }
                    self.next_inode.store(next, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn next_ino_candidate(cur: u64) -> u64 {
        let next = cur.wrapping_add(1);
        if next < 2 {
            2
        } else {
            next
        }
    }

    /// Remove everything tied to the inode, then the inode record itself:
    /// block references for regular files, the directory or symlink blob for
    /// those types, and any xattr records.
    pub fn inode_del(&self, txn: &Txn, ino: &Inode) -> FsResult<()> {
        let ino_n = ino.raw.ino;
        debug!("inode_del ino {} type {:?}", ino_n, ino.itype);
        match ino.itype {
            InodeType::Regular => {
                for ext in &ino.raw.extents {
                    self.data_unref(txn, &ext.id)?;
                }
            }
            InodeType::Dir => self.meta_del(txn, &dir_key(ino_n))?,
            InodeType::Symlink => self.meta_del(txn, &symlink_key(ino_n))?,
            InodeType::CharDev | InodeType::BlockDev | InodeType::Fifo | InodeType::Socket => {}
        }
        self.xattr_purge(txn, ino_n)?;
        self.meta_del(txn, &inode_key(ino_n))
    }

    /// Grow or shrink the extent table so the extent lengths sum to
    /// `new_size`. Growth appends hole extents; shrinking pops tail extents
    /// (unreferencing their blocks) and trims the last survivor. Does not
    /// store the inode.
    pub fn inode_resize(&self, txn: &Txn, ino: &mut Inode, new_size: u64) -> FsResult<()> {
        let old_size = ino.raw.size;
        if new_size > old_size {
            let mut diff = new_size - old_size;
            while diff > 0 {
                let chunk = diff.min(DBFS_MAX_EXT_LEN as u64) as u32;
                ino.raw.extents.push(Extent::hole(chunk));
                diff -= chunk as u64;
            }
        } else {
            let mut diff = old_size - new_size;
            while diff > 0 {
                let last = match ino.raw.extents.last() {
                    Some(e) => *e,
                    None => return Err(FsError::Io), // size exceeded extent sum
                };
                if last.len as u64 > diff {
                    break;
                }
                self.data_unref(txn, &last.id)?;
                ino.raw.extents.pop();
                diff -= last.len as u64;
            }
            if diff > 0 {
                let last = ino.raw.extents.last_mut().ok_or(FsError::Io)?;
                last.len -= diff as u32;
            }
        }
        ino.raw.size = new_size;
        Ok(())
    }

    /// Delete a metadata key, mapping store failures the way all metadata
    /// deletions do.
    pub(crate) fn meta_del(&self, txn: &Txn, key: &str) -> FsResult<()> {
        match self.meta.del(txn, key.as_bytes()) {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound) => Err(FsError::NotFound),
            Err(_) => Err(FsError::Io),
        }
    }
}
