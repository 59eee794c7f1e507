//! Request dispatch: one handler per kernel-filesystem callback.
//!
//! Every handler follows the same shape: begin a store transaction, run the
//! engine pipeline, then either commit and reply or abort and reply the
//! mapped errno.

use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::time::SystemTime;

use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use log::{debug, info};
use nix::sys::statvfs::statvfs;

use crate::dbfs_lib::codec::{DirStream, DBFS_FILENAME_MAX};
use crate::dbfs_lib::err::FsError;
use crate::dbfs_lib::utils::{access_ok, to_unix_secs, unix_now};
use crate::dbfs_lib::xattr::XattrFlags;
use crate::dbfs_lib::{DbFs, SetAttrs, TTL};

/// Begin a transaction or reply the error.
macro_rules! begin {
    ($self:ident, $reply:ident) => {
        match $self.txn_begin() {
            Ok(txn) => txn,
            Err(e) => {
                $reply.error(e.errno());
                return;
            }
        }
    };
}

/// Run an engine call; on failure abort the transaction and reply.
macro_rules! run {
    ($reply:ident, $txn:ident, $e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => {
                $txn.abort();
                $reply.error(FsError::from(e).errno());
                return;
            }
        }
    };
}

/// Commit, replying EIO if publication fails.
macro_rules! commit {
    ($reply:ident, $txn:ident) => {
        if $txn.commit().is_err() {
            $reply.error(libc::EIO);
            return;
        }
    };
}

/// Names arrive as `OsStr`; anything that is not UTF-8 is invalid here.
macro_rules! name_str {
    ($reply:ident, $name:expr) => {
        match $name.to_str() {
            Some(n) => n,
            None => {
                $reply.error(libc::EINVAL);
                return;
            }
        }
    };
}

fn time_or_now(t: Option<TimeOrNow>) -> Option<u64> {
    t.map(|t| match t {
        TimeOrNow::SpecificTime(st) => to_unix_secs(st),
        TimeOrNow::Now => unix_now(),
    })
}

impl Filesystem for DbFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("dbfs mounted, environment at {}", self.home().display());
        Ok(())
    }

    fn destroy(&mut self) {
        let _ = DbFs::flush(self);
        info!("dbfs unmounted");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name_str!(reply, name);
        debug!("lookup parent {} name '{}'", parent, name);
        let txn = begin!(self, reply);
        let ino_n = run!(reply, txn, self.dir_lookup(&txn, parent, name));
        let ino = run!(reply, txn, self.inode_read(&txn, ino_n));
        commit!(reply, txn);
        reply.entry(&TTL, &ino.attr(), 0);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        debug!("getattr ino {}", ino);
        let txn = begin!(self, reply);
        let node = run!(reply, txn, self.inode_read(&txn, ino));
        commit!(reply, txn);
        reply.attr(&TTL, &node.attr());
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr ino {} size {:?}", ino, size);
        let set = SetAttrs {
            mode,
            uid,
            gid,
            size,
            atime: time_or_now(atime),
            mtime: time_or_now(mtime),
            ctime: ctime.map(to_unix_secs),
        };
        let txn = begin!(self, reply);
        let node = run!(reply, txn, self.do_setattr(&txn, ino, set));
        commit!(reply, txn);
        reply.attr(&TTL, &node.attr());
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let txn = begin!(self, reply);
        let target = run!(reply, txn, self.symlink_read(&txn, ino));
        commit!(reply, txn);
        reply.data(&target);
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = name_str!(reply, name);
        debug!("mknod parent {} name '{}' mode {:o}", parent, name, mode);
        let txn = begin!(self, reply);
        let ino = run!(
            reply,
            txn,
            self.make_node(&txn, parent, name, mode, rdev as u64, req.uid(), req.gid())
        );
        commit!(reply, txn);
        reply.entry(&TTL, &ino.attr(), 0);
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = name_str!(reply, name);
        debug!("mkdir parent {} name '{}' mode {:o}", parent, name, mode);
        let mode = libc::S_IFDIR | (mode & !libc::S_IFMT);
        let txn = begin!(self, reply);
        let ino = run!(
            reply,
            txn,
            self.make_node(&txn, parent, name, mode, 0, req.uid(), req.gid())
        );
        commit!(reply, txn);
        reply.entry(&TTL, &ino.attr(), 0);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name_str!(reply, name);
        debug!("unlink parent {} name '{}'", parent, name);
        let txn = begin!(self, reply);
        run!(reply, txn, self.do_unlink(&txn, parent, name, false));
        commit!(reply, txn);
        reply.ok();
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name_str!(reply, name);
        debug!("rmdir parent {} name '{}'", parent, name);
        let txn = begin!(self, reply);
        run!(reply, txn, self.do_rmdir(&txn, parent, name));
        commit!(reply, txn);
        reply.ok();
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        let name = name_str!(reply, name);
        let target = match link.to_str() {
            Some(t) => t,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        debug!("symlink parent {} name '{}' -> {}", parent, name, target);
        let txn = begin!(self, reply);
        let mut ino = run!(
            reply,
            txn,
            self.make_node(
                &txn,
                parent,
                name,
                libc::S_IFLNK | 0o777,
                0,
                req.uid(),
                req.gid()
            )
        );
        run!(reply, txn, self.symlink_write(&txn, ino.ino(), target));
        ino.raw.size = target.len() as u64;
        run!(reply, txn, self.inode_write(&txn, &mut ino));
        commit!(reply, txn);
        reply.entry(&TTL, &ino.attr(), 0);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name_str!(reply, name);
        let newname = name_str!(reply, newname);
        if flags != 0 {
            // RENAME_NOREPLACE / RENAME_EXCHANGE are not supported
            reply.error(libc::EINVAL);
            return;
        }
        debug!(
            "rename {}/'{}' -> {}/'{}'",
            parent, name, newparent, newname
        );
        let txn = begin!(self, reply);
        run!(
            reply,
            txn,
            self.do_rename(&txn, parent, name, newparent, newname)
        );
        commit!(reply, txn);
        reply.ok();
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let newname = name_str!(reply, newname);
        debug!("link ino {} -> {}/'{}'", ino, newparent, newname);
        let txn = begin!(self, reply);
        let mut node = run!(reply, txn, self.inode_read(&txn, ino));
        run!(reply, txn, self.do_link(&txn, &mut node, newparent, newname));
        commit!(reply, txn);
        reply.entry(&TTL, &node.attr(), 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read ino {} off {} size {}", ino, offset, size);
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let txn = begin!(self, reply);
        let data = run!(reply, txn, self.fs_read(&txn, ino, offset as u64, size));
        commit!(reply, txn);
        reply.data(&data);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write ino {} off {} len {}", ino, offset, data.len());
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let txn = begin!(self, reply);
        let written = run!(reply, txn, self.fs_write(&txn, ino, offset as u64, data));
        commit!(reply, txn);
        reply.written(written as u32);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match DbFs::flush(self) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match DbFs::flush(self) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match DbFs::flush(self) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("opendir ino {}", ino);
        let txn = begin!(self, reply);
        let blob = run!(reply, txn, self.dir_read(&txn, ino));
        commit!(reply, txn);
        // the handle owns a private copy until releasedir
        let fh = self.dir_handle_open(blob);
        reply.opened(fh, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir ino {} fh {} offset {}", ino, fh, offset);
        let blob = match self.dir_handle_get(fh) {
            Some(b) => b,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        let txn = begin!(self, reply);
        let mut idx: i64 = 0;
        for ent in DirStream::new(&blob) {
            let ent = run!(reply, txn, ent);
            idx += 1;
            if idx <= offset {
                continue;
            }
            let kind = match self.inode_read(&txn, ent.ino) {
                Ok(node) => node.itype.file_type(),
                // unlinked behind the handle's back; the blob is a stale copy
                Err(FsError::NotFound) => continue,
                Err(e) => {
                    txn.abort();
                    reply.error(e.errno());
                    return;
                }
            };
            if reply.add(ent.ino, idx, kind, ent.name) {
                break;
            }
        }
        commit!(reply, txn);
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.dir_handle_close(fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        // reflect the host filesystem holding the environment, with a
        // fabricated inode population
        match statvfs(self.home()) {
            Ok(st) => reply.statfs(
                st.blocks() as u64,
                st.blocks_free() as u64,
                st.blocks_available() as u64,
                0xFFFF_FFFF,
                0xFFFF_FFFF,
                st.block_size() as u32,
                DBFS_FILENAME_MAX as u32,
                st.fragment_size() as u32,
            ),
            Err(_) => reply.error(libc::EIO),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = name_str!(reply, name);
        debug!("setxattr ino {} name '{}' len {}", ino, name, value.len());
        let txn = begin!(self, reply);
        run!(
            reply,
            txn,
            self.xattr_set(&txn, ino, name, value, XattrFlags::from_bits(flags))
        );
        commit!(reply, txn);
        reply.ok();
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let name = name_str!(reply, name);
        let txn = begin!(self, reply);
        let value = run!(reply, txn, self.xattr_get(&txn, ino, name));
        commit!(reply, txn);
        if size == 0 {
            reply.size(value.len() as u32);
        } else if value.len() <= size as usize {
            reply.data(&value);
        } else {
            reply.error(FsError::Range.errno());
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let txn = begin!(self, reply);
        let names = run!(reply, txn, self.xattr_list(&txn, ino));
        commit!(reply, txn);
        if size == 0 {
            reply.size(names.len() as u32);
        } else if names.len() <= size as usize {
            reply.data(&names);
        } else {
            reply.error(FsError::Range.errno());
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name_str!(reply, name);
        let txn = begin!(self, reply);
        run!(reply, txn, self.xattr_remove(&txn, ino, name));
        commit!(reply, txn);
        reply.ok();
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let txn = begin!(self, reply);
        let node = run!(reply, txn, self.inode_read(&txn, ino));
        commit!(reply, txn);
        if access_ok(&node, req.uid(), req.gid(), mask) {
            reply.ok();
        } else {
            reply.error(libc::EACCES);
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = name_str!(reply, name);
        debug!("create parent {} name '{}' mode {:o}", parent, name, mode);
        let txn = begin!(self, reply);
        let ino = run!(
            reply,
            txn,
            self.make_node(&txn, parent, name, mode, 0, req.uid(), req.gid())
        );
        commit!(reply, txn);
        reply.created(&TTL, &ino.attr(), 0, 0, 0);
    }
}
