//! Filesystem core.
//!
//! The whole persistent state lives in three logical databases of one
//! transactional store environment: `metadata` (inodes, directories,
//! symlinks, xattrs, all under string keys), `hash` (block refcounts) and
//! `data` (content-addressed blocks). Every request runs under one store
//! transaction; commit publishes it atomically, abort undoes it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info};
use txn_store::{Db, Env, EnvOptions, Txn};

pub mod codec;
pub mod data;
pub mod dir;
pub mod err;
pub mod fuse;
pub mod inode;
pub mod symlink;
pub mod utils;
pub mod xattr;

use codec::*;
use utils::{read_db_password, unix_now};
pub use err::{FsError, FsResult};
pub use inode::{Inode, InodeType};

/// Attribute TTL handed to the kernel, 1 second.
pub const TTL: Duration = Duration::from_secs(1);

/// Attribute fields a `setattr` request may carry.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetAttrs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<u64>,
    pub mtime: Option<u64>,
    pub ctime: Option<u64>,
}

/// One mounted filesystem: the store environment, its three databases, the
/// inode-number cursor and the table of open directory handles. Constructed
/// explicitly and passed around; nothing here is process-global.
pub struct DbFs {
    env: Env,
    pub meta: Db,
    pub hashref: Db,
    pub data: Db,
    home: PathBuf,
    next_inode: AtomicU64,
    open_dirs: Mutex<HashMap<u64, Vec<u8>>>,
    next_fh: AtomicU64,
}

impl DbFs {
    /// Open the environment under `home` and the three databases.
    /// `DB_PASSWORD`, if set, keys the store's encryption and is scrubbed
    /// from the environment once read.
    pub fn open(home: &Path, create: bool, recover: bool) -> FsResult<DbFs> {
        let opts = EnvOptions::default()
            .create(create)
            .recover(recover)
            .password(read_db_password());
        let env = Env::open(home, opts).map_err(|e| {
            log::error!("env open failed at {}: {}", home.display(), e);
            FsError::Io
        })?;
        Self::from_env(env, home.to_path_buf())
    }

    /// A throwaway instance over an in-memory store. Tests and tooling.
    pub fn open_memory() -> DbFs {
        Self::from_env(Env::open_memory(), PathBuf::new()).expect("memory env")
    }

    fn from_env(env: Env, home: PathBuf) -> FsResult<DbFs> {
        let meta = env
            .db("metadata", DBFS_PGSZ_METADATA)
            .map_err(|_| FsError::Io)?;
        let hashref = env.db("hash", DBFS_PGSZ_METADATA).map_err(|_| FsError::Io)?;
        let data = env.db("data", DBFS_PGSZ_DATA).map_err(|_| FsError::Io)?;
        Ok(DbFs {
            env,
            meta,
            hashref,
            data,
            home,
            next_inode: AtomicU64::new(2),
            open_dirs: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn txn_begin(&self) -> FsResult<Txn> {
        self.env.txn_begin().map_err(|_| FsError::Io)
    }

    /// Push the commit log to stable storage.
    pub fn flush(&self) -> FsResult<()> {
        self.env.flush().map_err(|_| FsError::Io)
    }

    /// Seed a fresh filesystem: root inode 1 (`dir | 0755`, nlink 2) and its
    /// empty directory blob.
    pub fn format(&self) -> FsResult<()> {
        let txn = self.txn_begin()?;
        let now = unix_now();
        let mut root = Inode {
            raw: RawInode {
                ino: DBFS_ROOT_INO,
                mode: libc::S_IFDIR | 0o755,
                nlink: 2,
                ctime: now,
                atime: now,
                mtime: now,
                ..RawInode::default()
            },
            itype: InodeType::Dir,
        };
        self.inode_write(&txn, &mut root)?;
        self.dir_new(&txn, DBFS_ROOT_INO, DBFS_ROOT_INO)?;
        txn.commit().map_err(|_| FsError::Io)?;
        info!("formatted: root inode {} seeded", DBFS_ROOT_INO);
        Ok(())
    }

    /// Create an inode of any type and enter it into `parent` under `name`.
    /// Directories additionally get a fresh `.`/`..` blob.
    pub fn make_node(
        &self,
        txn: &Txn,
        parent: u64,
        name: &str,
        mode: u32,
        rdev: u64,
        uid: u32,
        gid: u32,
    ) -> FsResult<Inode> {
        let itype = InodeType::from_mode(mode)?;
        let is_dir = itype == InodeType::Dir;
        let mut raw = self.inode_new(txn)?;
        raw.mode = mode;
        raw.nlink = if is_dir { 2 } else { 1 };
        raw.rdev = rdev;
        raw.uid = uid;
        raw.gid = gid;
        let mut ino = Inode { raw, itype };
        self.inode_write(txn, &mut ino)?;
        if is_dir {
            self.dir_new(txn, parent, ino.ino())?;
        }
        self.dir_append(txn, parent, ino.ino(), name)?;
        debug!("make_node {:?} '{}' -> ino {}", itype, name, ino.ino());
        Ok(ino)
    }

    /// Hard-link `ino` into `parent` under `name` and bump its link count.
    /// If the inode write fails, the transaction abort undoes the append.
    pub fn do_link(&self, txn: &Txn, ino: &mut Inode, parent: u64, name: &str) -> FsResult<()> {
        self.dir_append(txn, parent, ino.ino(), name)?;
        ino.raw.nlink += 1;
        self.inode_write(txn, ino)
    }

    /// Remove `name` from `parent`. Directories are only removed when
    /// `allow_dir` is set (the rmdir path). An unlink that drops a
    /// directory's nlink to 2 or below destroys it.
    pub fn do_unlink(&self, txn: &Txn, parent: u64, name: &str, allow_dir: bool) -> FsResult<()> {
        let ino_n = self.dir_lookup(txn, parent, name)?;
        if ino_n == DBFS_ROOT_INO {
            return Err(FsError::Invalid);
        }
        let mut ino = self.inode_read(txn, ino_n)?;
        let is_dir = ino.itype == InodeType::Dir;
        if is_dir && !allow_dir {
            return Err(FsError::IsDir);
        }
        self.dirent_del(txn, parent, name)?;
        let nlink = if is_dir && ino.raw.nlink <= 2 {
            0
        } else {
            ino.raw.nlink.saturating_sub(1)
        };
        ino.raw.nlink = nlink;
        if nlink == 0 {
            self.inode_del(txn, &ino)
        } else {
            self.inode_write(txn, &mut ino)
        }
    }

    /// Remove an empty directory.
    pub fn do_rmdir(&self, txn: &Txn, parent: u64, name: &str) -> FsResult<()> {
        let ino_n = self.dir_lookup(txn, parent, name)?;
        let blob = self.dir_read(txn, ino_n)?;
        if !dir::dir_is_empty(&blob)? {
            return Err(FsError::NotEmpty);
        }
        self.do_unlink(txn, parent, name, true)
    }

    /// Move `parent/name` to `new_parent/new_name`, replacing a plain file
    /// at the target. A directory moved across parents has its `..` entry
    /// rewritten in the same transaction.
    pub fn do_rename(
        &self,
        txn: &Txn,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> FsResult<()> {
        if parent == new_parent && name == new_name {
            return Err(FsError::Invalid);
        }
        let ino_n = self.dir_lookup(txn, parent, name)?;
        self.dirent_del(txn, parent, name)?;
        match self.do_unlink(txn, new_parent, new_name, false) {
            Ok(()) | Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }
        self.dir_append(txn, new_parent, ino_n, new_name)?;
        if parent != new_parent {
            let moved = self.inode_read(txn, ino_n)?;
            if moved.itype == InodeType::Dir {
                self.dir_set_parent(txn, ino_n, new_parent)?;
            }
        }
        Ok(())
    }

    /// Selectively overwrite attributes; a size change resizes the extent
    /// table. Always rewrites the inode, so the version always moves.
    pub fn do_setattr(&self, txn: &Txn, ino_n: u64, set: SetAttrs) -> FsResult<Inode> {
        let mut ino = self.inode_read(txn, ino_n)?;
        if let Some(mode) = set.mode {
            // chmod changes permission bits, never the file type
            ino.raw.mode = (ino.raw.mode & libc::S_IFMT) | (mode & !libc::S_IFMT);
        }
        if let Some(uid) = set.uid {
            ino.raw.uid = uid;
        }
        if let Some(gid) = set.gid {
            ino.raw.gid = gid;
        }
        if let Some(atime) = set.atime {
            ino.raw.atime = atime;
        }
        if let Some(mtime) = set.mtime {
            ino.raw.mtime = mtime;
        }
        if let Some(ctime) = set.ctime {
            ino.raw.ctime = ctime;
        }
        if let Some(size) = set.size {
            if size != ino.raw.size {
                self.inode_resize(txn, &mut ino, size)?;
            }
        }
        self.inode_write(txn, &mut ino)?;
        Ok(ino)
    }

    /// Stash a private directory blob for an open handle.
    pub(crate) fn dir_handle_open(&self, blob: Vec<u8>) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.open_dirs.lock().unwrap().insert(fh, blob);
        fh
    }

    pub(crate) fn dir_handle_get(&self, fh: u64) -> Option<Vec<u8>> {
        self.open_dirs.lock().unwrap().get(&fh).cloned()
    }

    pub(crate) fn dir_handle_close(&self, fh: u64) {
        self.open_dirs.lock().unwrap().remove(&fh);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dbfs_lib::codec::DirStream;

    pub(crate) fn fresh_fs() -> DbFs {
        DbFs::open_memory()
    }

    /// A formatted filesystem, as mkdbfs leaves it.
    pub(crate) fn formatted_fs() -> DbFs {
        let fs = fresh_fs();
        fs.format().unwrap();
        fs
    }

    fn names_of(fs: &DbFs, txn: &Txn, ino: u64) -> Vec<String> {
        let blob = fs.dir_read(txn, ino).unwrap();
        DirStream::new(&blob)
            .map(|e| e.unwrap().name.to_string())
            .collect()
    }

    #[test]
    fn fresh_root_lists_dot_and_dotdot() {
        let fs = formatted_fs();
        let txn = fs.txn_begin().unwrap();
        let root = fs.inode_read(&txn, DBFS_ROOT_INO).unwrap();
        assert_eq!(root.itype, InodeType::Dir);
        assert_eq!(root.raw.mode, libc::S_IFDIR | 0o755);
        assert_eq!(root.raw.nlink, 2);
        assert_eq!(names_of(&fs, &txn, DBFS_ROOT_INO), [".", ".."]);
        txn.abort();
    }

    #[test]
    fn mkdir_then_list() {
        let fs = formatted_fs();
        let txn = fs.txn_begin().unwrap();
        let d = fs
            .make_node(&txn, DBFS_ROOT_INO, "a", libc::S_IFDIR | 0o755, 0, 0, 0)
            .unwrap();
        assert!(d.ino() >= 2);
        assert_eq!(d.raw.mode, libc::S_IFDIR | 0o755);
        assert_eq!(d.raw.nlink, 2);
        assert_eq!(fs.dir_lookup(&txn, DBFS_ROOT_INO, "a").unwrap(), d.ino());
        assert_eq!(names_of(&fs, &txn, d.ino()), [".", ".."]);
        txn.commit().unwrap();
    }

    #[test]
    fn mkdir_rmdir_leaves_parent_bitwise_identical() {
        let fs = formatted_fs();
        let txn = fs.txn_begin().unwrap();
        let before = fs.dir_read(&txn, DBFS_ROOT_INO).unwrap();
        fs.make_node(&txn, DBFS_ROOT_INO, "d", libc::S_IFDIR | 0o755, 0, 0, 0)
            .unwrap();
        fs.do_rmdir(&txn, DBFS_ROOT_INO, "d").unwrap();
        assert_eq!(fs.dir_read(&txn, DBFS_ROOT_INO).unwrap(), before);
        txn.commit().unwrap();
    }

    #[test]
    fn rmdir_refuses_non_empty() {
        let fs = formatted_fs();
        let txn = fs.txn_begin().unwrap();
        let d = fs
            .make_node(&txn, DBFS_ROOT_INO, "d", libc::S_IFDIR | 0o755, 0, 0, 0)
            .unwrap();
        fs.make_node(&txn, d.ino(), "f", libc::S_IFREG | 0o644, 0, 0, 0)
            .unwrap();
        assert_eq!(
            fs.do_rmdir(&txn, DBFS_ROOT_INO, "d").unwrap_err(),
            FsError::NotEmpty
        );
        // removing the child clears the way
        fs.do_unlink(&txn, d.ino(), "f", false).unwrap();
        fs.do_rmdir(&txn, DBFS_ROOT_INO, "d").unwrap();
        assert_eq!(
            fs.inode_read(&txn, d.ino()).unwrap_err(),
            FsError::NotFound
        );
        txn.commit().unwrap();
    }

    #[test]
    fn unlink_of_root_is_invalid() {
        let fs = formatted_fs();
        let txn = fs.txn_begin().unwrap();
        // ".." in the root points back at inode 1
        assert_eq!(
            fs.do_unlink(&txn, DBFS_ROOT_INO, "..", true).unwrap_err(),
            FsError::Invalid
        );
        txn.abort();
    }

    #[test]
    fn unlink_of_plain_directory_needs_dir_flag() {
        let fs = formatted_fs();
        let txn = fs.txn_begin().unwrap();
        fs.make_node(&txn, DBFS_ROOT_INO, "d", libc::S_IFDIR | 0o755, 0, 0, 0)
            .unwrap();
        assert_eq!(
            fs.do_unlink(&txn, DBFS_ROOT_INO, "d", false).unwrap_err(),
            FsError::IsDir
        );
        txn.abort();
    }

    #[test]
    fn link_then_unlink_preserves_inode() {
        let fs = formatted_fs();
        let txn = fs.txn_begin().unwrap();
        let f = fs
            .make_node(&txn, DBFS_ROOT_INO, "f", libc::S_IFREG | 0o644, 0, 0, 0)
            .unwrap();
        fs.fs_write(&txn, f.ino(), 0, b"payload").unwrap();
        let snapshot = fs.inode_read(&txn, f.ino()).unwrap();

        let mut ino = snapshot.clone();
        fs.do_link(&txn, &mut ino, DBFS_ROOT_INO, "hard").unwrap();
        assert_eq!(fs.inode_read(&txn, f.ino()).unwrap().raw.nlink, 2);

        fs.do_unlink(&txn, DBFS_ROOT_INO, "hard", false).unwrap();
        let back = fs.inode_read(&txn, f.ino()).unwrap();
        assert_eq!(back.raw.nlink, snapshot.raw.nlink);
        assert_eq!(back.raw.extents, snapshot.raw.extents);
        assert_eq!(fs.fs_read(&txn, f.ino(), 0, 7).unwrap(), b"payload");
        txn.commit().unwrap();
    }

    #[test]
    fn unlink_destroys_at_zero_nlink() {
        let fs = formatted_fs();
        let txn = fs.txn_begin().unwrap();
        let f = fs
            .make_node(&txn, DBFS_ROOT_INO, "f", libc::S_IFREG | 0o644, 0, 0, 0)
            .unwrap();
        fs.fs_write(&txn, f.ino(), 0, b"bytes").unwrap();
        fs.xattr_set(
            &txn,
            f.ino(),
            "user.k",
            b"v",
            xattr::XattrFlags::default(),
        )
        .unwrap();
        fs.do_unlink(&txn, DBFS_ROOT_INO, "f", false).unwrap();
        assert_eq!(
            fs.inode_read(&txn, f.ino()).unwrap_err(),
            FsError::NotFound
        );
        // xattr records went with the inode
        assert!(fs
            .meta
            .get(Some(&txn), xattr_list_key(f.ino()).as_bytes())
            .is_err());
        txn.commit().unwrap();
        assert!(fs.data.is_empty());
        assert!(fs.hashref.is_empty());
    }

    #[test]
    fn rename_within_parent_and_target_replacement() {
        let fs = formatted_fs();
        let txn = fs.txn_begin().unwrap();
        let a = fs
            .make_node(&txn, DBFS_ROOT_INO, "a", libc::S_IFREG | 0o644, 0, 0, 0)
            .unwrap();
        let b = fs
            .make_node(&txn, DBFS_ROOT_INO, "b", libc::S_IFREG | 0o644, 0, 0, 0)
            .unwrap();

        assert_eq!(
            fs.do_rename(&txn, DBFS_ROOT_INO, "a", DBFS_ROOT_INO, "a")
                .unwrap_err(),
            FsError::Invalid
        );
        fs.do_rename(&txn, DBFS_ROOT_INO, "a", DBFS_ROOT_INO, "b")
            .unwrap();
        assert_eq!(fs.dir_lookup(&txn, DBFS_ROOT_INO, "b").unwrap(), a.ino());
        assert_eq!(
            fs.dir_lookup(&txn, DBFS_ROOT_INO, "a").unwrap_err(),
            FsError::NotFound
        );
        // the displaced inode is gone
        assert_eq!(
            fs.inode_read(&txn, b.ino()).unwrap_err(),
            FsError::NotFound
        );
        txn.commit().unwrap();
    }

    #[test]
    fn rename_directory_across_parents_rewrites_dotdot() {
        let fs = formatted_fs();
        let txn = fs.txn_begin().unwrap();
        let p = fs
            .make_node(&txn, DBFS_ROOT_INO, "p", libc::S_IFDIR | 0o755, 0, 0, 0)
            .unwrap();
        let q = fs
            .make_node(&txn, DBFS_ROOT_INO, "q", libc::S_IFDIR | 0o755, 0, 0, 0)
            .unwrap();
        let child = fs
            .make_node(&txn, p.ino(), "c", libc::S_IFDIR | 0o755, 0, 0, 0)
            .unwrap();

        fs.do_rename(&txn, p.ino(), "c", q.ino(), "c").unwrap();
        assert_eq!(fs.dir_lookup(&txn, q.ino(), "c").unwrap(), child.ino());
        assert_eq!(fs.dir_lookup(&txn, child.ino(), "..").unwrap(), q.ino());
        txn.commit().unwrap();
    }

    #[test]
    fn setattr_changes_and_version_bump() {
        let fs = formatted_fs();
        let txn = fs.txn_begin().unwrap();
        let f = fs
            .make_node(&txn, DBFS_ROOT_INO, "f", libc::S_IFREG | 0o644, 0, 0, 0)
            .unwrap();
        let v0 = fs.inode_read(&txn, f.ino()).unwrap().raw.version;

        let ino = fs
            .do_setattr(
                &txn,
                f.ino(),
                SetAttrs {
                    mode: Some(0o600),
                    uid: Some(42),
                    size: Some(100),
                    ..SetAttrs::default()
                },
            )
            .unwrap();
        assert_eq!(ino.raw.mode, libc::S_IFREG | 0o600);
        assert_eq!(ino.raw.uid, 42);
        assert_eq!(ino.raw.size, 100);
        assert!(ino.raw.extents.iter().all(|e| e.id.is_null()));

        // a size-preserving truncate is a no-op that still bumps the version
        let again = fs
            .do_setattr(
                &txn,
                f.ino(),
                SetAttrs {
                    size: Some(100),
                    ..SetAttrs::default()
                },
            )
            .unwrap();
        assert!(again.raw.version > v0 + 1);
        assert_eq!(again.raw.size, 100);
        txn.commit().unwrap();
    }

    #[test]
    fn dir_handles_are_private_copies() {
        let fs = formatted_fs();
        let txn = fs.txn_begin().unwrap();
        let blob = fs.dir_read(&txn, DBFS_ROOT_INO).unwrap();
        let fh = fs.dir_handle_open(blob.clone());
        fs.make_node(&txn, DBFS_ROOT_INO, "later", libc::S_IFREG | 0o644, 0, 0, 0)
            .unwrap();
        txn.commit().unwrap();
        // mutations after opendir are not visible through the handle
        assert_eq!(fs.dir_handle_get(fh).unwrap(), blob);
        fs.dir_handle_close(fh);
        assert!(fs.dir_handle_get(fh).is_none());
    }
}
