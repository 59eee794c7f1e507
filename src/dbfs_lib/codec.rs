//! On-disk record formats and key builders.
//!
//! Every persistent structure is packed little-endian with no host padding;
//! encode/decode work on byte slices only. Decoding validates magics,
//! terminators and length bounds: any violation is surfaced as [`FsError::Io`]
//! (on-disk corruption).

use std::fmt;

use crate::dbfs_lib::err::{FsError, FsResult};

pub const DBFS_ROOT_INO: u64 = 1;
pub const DBFS_BLK_ID_LEN: usize = 20;
pub const DBFS_DE_MAGIC: u32 = 0xD4D4_D4D4;
pub const DBFS_FILENAME_MAX: usize = 255;
pub const DBFS_XATTR_NAME_LEN: usize = 256;
pub const DBFS_XATTR_MAX_LEN: usize = 1024 * 1024;
pub const DBFS_MAX_EXT_LEN: u32 = 4 * 1024 * 1024;
pub const DBFS_ZERO_CMP_BLK_SZ: usize = 8192;
pub const DBFS_SYMLINK_MAX: usize = 4096;
pub const DBFS_PGSZ_METADATA: u32 = 512;
pub const DBFS_PGSZ_DATA: u32 = 2048;

/// Fixed raw-inode header: ino, version, mode, nlink, uid, gid, rdev, size,
/// ctime, atime, mtime.
pub const RAW_INODE_HDR: usize = 72;
/// Extent descriptor: offset u32, length u32, 20-byte block id.
pub const EXTENT_SIZE: usize = 28;
/// Dirent header: magic u32, reserved u16, namelen u16, ino u64.
pub const DIRENT_HDR: usize = 16;
/// Xattr list entry header: namelen u32.
pub const XLIST_HDR: usize = 4;

pub fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Byte distance from one dirent to the next.
pub fn dirent_next(namelen: usize) -> usize {
    align8(DIRENT_HDR + namelen)
}

/// Byte distance from one xattr list entry to the next.
pub fn xlist_next(namelen: usize) -> usize {
    align8(XLIST_HDR + namelen)
}

pub fn inode_key(ino: u64) -> String {
    format!("/inode/{}", ino)
}

pub fn dir_key(ino: u64) -> String {
    format!("/dir/{}", ino)
}

pub fn symlink_key(ino: u64) -> String {
    format!("/symlink/{}", ino)
}

pub fn xattr_list_key(ino: u64) -> String {
    format!("/xattr/{}", ino)
}

pub fn xattr_key(ino: u64, name: &str) -> String {
    format!("/xattr/{}/{}", ino, name)
}

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

/// Content address of one data block: SHA-1 of its bytes. The all-zero id
/// marks a hole extent; no data key exists for it.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct BlkId(pub [u8; DBFS_BLK_ID_LEN]);

impl BlkId {
    pub const NULL: BlkId = BlkId([0u8; DBFS_BLK_ID_LEN]);

    pub fn is_null(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Debug for BlkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// One contiguous run of file bytes inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Offset of the run inside the block.
    pub off: u32,
    /// Length of the run in bytes.
    pub len: u32,
    pub id: BlkId,
}

impl Extent {
    pub fn hole(len: u32) -> Extent {
        Extent {
            off: 0,
            len,
            id: BlkId::NULL,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.off.to_le_bytes());
        out.extend_from_slice(&self.len.to_le_bytes());
        out.extend_from_slice(&self.id.0);
    }

    fn decode(buf: &[u8]) -> Extent {
        let mut id = [0u8; DBFS_BLK_ID_LEN];
        id.copy_from_slice(&buf[8..8 + DBFS_BLK_ID_LEN]);
        Extent {
            off: get_u32(buf, 0),
            len: get_u32(buf, 4),
            id: BlkId(id),
        }
    }
}

/// The record stored at `/inode/<N>`: fixed header plus the extent table.
/// The extent count is derived from the record's total byte length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawInode {
    pub ino: u64,
    /// Monotonic, bumped on every write of the record.
    pub version: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub ctime: u64,
    pub atime: u64,
    pub mtime: u64,
    pub extents: Vec<Extent>,
}

impl RawInode {
    pub fn n_extents(&self) -> usize {
        self.extents.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RAW_INODE_HDR + self.extents.len() * EXTENT_SIZE);
        out.extend_from_slice(&self.ino.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&self.nlink.to_le_bytes());
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(&self.gid.to_le_bytes());
        out.extend_from_slice(&self.rdev.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.ctime.to_le_bytes());
        out.extend_from_slice(&self.atime.to_le_bytes());
        out.extend_from_slice(&self.mtime.to_le_bytes());
        for ext in &self.extents {
            ext.encode_into(&mut out);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> FsResult<RawInode> {
        if buf.len() < RAW_INODE_HDR || (buf.len() - RAW_INODE_HDR) % EXTENT_SIZE != 0 {
            return Err(FsError::Io);
        }
        let n_extents = (buf.len() - RAW_INODE_HDR) / EXTENT_SIZE;
        let mut extents = Vec::with_capacity(n_extents);
        for i in 0..n_extents {
            let off = RAW_INODE_HDR + i * EXTENT_SIZE;
            extents.push(Extent::decode(&buf[off..off + EXTENT_SIZE]));
        }
        Ok(RawInode {
            ino: get_u64(buf, 0),
            version: get_u64(buf, 8),
            mode: get_u32(buf, 16),
            nlink: get_u32(buf, 20),
            uid: get_u32(buf, 24),
            gid: get_u32(buf, 28),
            rdev: get_u64(buf, 32),
            size: get_u64(buf, 40),
            ctime: get_u64(buf, 48),
            atime: get_u64(buf, 56),
            mtime: get_u64(buf, 64),
            extents,
        })
    }
}

/// One decoded directory entry, borrowing its name from the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dirent<'a> {
    pub ino: u64,
    pub name: &'a str,
    /// Byte offset of this entry in the blob.
    pub pos: usize,
    /// Byte offset of the following entry.
    pub next: usize,
}

/// Lazy walk over a directory blob, ending at the terminator entry.
pub struct DirStream<'a> {
    blob: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> DirStream<'a> {
    pub fn new(blob: &'a [u8]) -> DirStream<'a> {
        DirStream {
            blob,
            pos: 0,
            done: false,
        }
    }
}

impl<'a> Iterator for DirStream<'a> {
    type Item = FsResult<Dirent<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.blob.len() < self.pos + DIRENT_HDR {
            self.done = true;
            return Some(Err(FsError::Io));
        }
        let magic = get_u32(self.blob, self.pos);
        if magic != DBFS_DE_MAGIC {
            self.done = true;
            return Some(Err(FsError::Io));
        }
        let namelen = get_u16(self.blob, self.pos + 6) as usize;
        if namelen == 0 {
            // terminator
            self.done = true;
            return None;
        }
        let name_off = self.pos + DIRENT_HDR;
        if self.blob.len() < name_off + namelen {
            self.done = true;
            return Some(Err(FsError::Io));
        }
        let name = match std::str::from_utf8(&self.blob[name_off..name_off + namelen]) {
            Ok(n) => n,
            Err(_) => {
                self.done = true;
                return Some(Err(FsError::Io));
            }
        };
        let ent = Dirent {
            ino: get_u64(self.blob, self.pos + 8),
            name,
            pos: self.pos,
            next: self.pos + dirent_next(namelen),
        };
        self.pos = ent.next;
        Some(Ok(ent))
    }
}

/// Byte offset of the terminator entry in a directory blob.
pub fn dir_terminator_pos(blob: &[u8]) -> FsResult<usize> {
    let mut stream = DirStream::new(blob);
    for ent in stream.by_ref() {
        ent?;
    }
    if stream.blob.len() < stream.pos + DIRENT_HDR
        || get_u32(stream.blob, stream.pos) != DBFS_DE_MAGIC
        || get_u16(stream.blob, stream.pos + 6) != 0
    {
        return Err(FsError::Io);
    }
    Ok(stream.pos)
}

/// Append one entry to a blob under construction.
pub fn push_dirent(out: &mut Vec<u8>, ino: u64, name: &str) {
    let start = out.len();
    out.extend_from_slice(&DBFS_DE_MAGIC.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(&ino.to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.resize(start + dirent_next(name.len()), 0);
}

/// Append the terminator entry: namelen 0, magic still present.
pub fn push_dir_terminator(out: &mut Vec<u8>) {
    let start = out.len();
    out.extend_from_slice(&DBFS_DE_MAGIC.to_le_bytes());
    out.resize(start + DIRENT_HDR, 0);
}

/// One decoded xattr list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XlistEntry<'a> {
    pub name: &'a str,
    pub pos: usize,
    pub next: usize,
}

/// Lazy walk over an xattr name list; the list ends where the bytes do.
pub struct XlistStream<'a> {
    blob: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> XlistStream<'a> {
    pub fn new(blob: &'a [u8]) -> XlistStream<'a> {
        XlistStream {
            blob,
            pos: 0,
            done: false,
        }
    }
}

impl<'a> Iterator for XlistStream<'a> {
    type Item = FsResult<XlistEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos == self.blob.len() {
            return None;
        }
        if self.blob.len() < self.pos + XLIST_HDR {
            self.done = true;
            return Some(Err(FsError::Io));
        }
        let namelen = get_u32(self.blob, self.pos) as usize;
        let next = self.pos + xlist_next(namelen);
        if namelen == 0 || next > self.blob.len() {
            self.done = true;
            return Some(Err(FsError::Io));
        }
        let name_off = self.pos + XLIST_HDR;
        let name = match std::str::from_utf8(&self.blob[name_off..name_off + namelen]) {
            Ok(n) => n,
            Err(_) => {
                self.done = true;
                return Some(Err(FsError::Io));
            }
        };
        let ent = XlistEntry {
            name,
            pos: self.pos,
            next,
        };
        self.pos = next;
        Some(Ok(ent))
    }
}

/// Append one name to an xattr list under construction.
pub fn push_xlist_entry(out: &mut Vec<u8>, name: &str) {
    let start = out.len();
    out.extend_from_slice(&(name.len() as u32).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.resize(start + xlist_next(name.len()), 0);
}

pub fn encode_refcount(refs: u32) -> [u8; 4] {
    refs.to_le_bytes()
}

pub fn decode_refcount(buf: &[u8]) -> FsResult<u32> {
    if buf.len() != 4 {
        return Err(FsError::Io);
    }
    Ok(get_u32(buf, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_steps() {
        assert_eq!(dirent_next(0), 16);
        assert_eq!(dirent_next(1), 24);
        assert_eq!(dirent_next(8), 24);
        assert_eq!(dirent_next(9), 32);
        assert_eq!(xlist_next(1), 8);
        assert_eq!(xlist_next(4), 8);
        assert_eq!(xlist_next(5), 16);
    }

    #[test]
    fn key_forms() {
        assert_eq!(inode_key(1), "/inode/1");
        assert_eq!(dir_key(42), "/dir/42");
        assert_eq!(symlink_key(7), "/symlink/7");
        assert_eq!(xattr_list_key(9), "/xattr/9");
        assert_eq!(xattr_key(9, "user.k"), "/xattr/9/user.k");
        // fixed-form keys stay within 32 bytes even for the largest inode
        assert!(inode_key(u64::MAX).len() <= 32);
        assert!(symlink_key(u64::MAX).len() <= 32);
    }

    #[test]
    fn raw_inode_round_trip() {
        let ino = RawInode {
            ino: 17,
            version: 4,
            mode: libc::S_IFREG | 0o644,
            nlink: 2,
            uid: 1000,
            gid: 100,
            rdev: 0,
            size: 4096 + 5,
            ctime: 1_600_000_000,
            atime: 1_600_000_001,
            mtime: 1_600_000_002,
            extents: vec![
                Extent {
                    off: 0,
                    len: 4096,
                    id: BlkId([0xAB; DBFS_BLK_ID_LEN]),
                },
                Extent::hole(5),
            ],
        };
        let bytes = ino.encode();
        assert_eq!(bytes.len(), RAW_INODE_HDR + 2 * EXTENT_SIZE);
        let back = RawInode::decode(&bytes).unwrap();
        assert_eq!(back, ino);
        assert_eq!(back.encode(), bytes);
        assert_eq!(back.n_extents(), 2);
    }

    #[test]
    fn raw_inode_rejects_bad_lengths() {
        assert_eq!(RawInode::decode(&[0u8; 10]), Err(FsError::Io));
        assert_eq!(
            RawInode::decode(&[0u8; RAW_INODE_HDR + 13]),
            Err(FsError::Io)
        );
    }

    #[test]
    fn dir_stream_round_trip() {
        let mut blob = Vec::new();
        push_dirent(&mut blob, 1, ".");
        push_dirent(&mut blob, 1, "..");
        push_dirent(&mut blob, 5, "hello");
        push_dir_terminator(&mut blob);

        let ents: Vec<_> = DirStream::new(&blob).map(|e| e.unwrap()).collect();
        assert_eq!(ents.len(), 3);
        assert_eq!(ents[0].name, ".");
        assert_eq!(ents[1].name, "..");
        assert_eq!(ents[2].name, "hello");
        assert_eq!(ents[2].ino, 5);
        assert_eq!(dir_terminator_pos(&blob).unwrap(), ents[2].next);
    }

    #[test]
    fn dir_stream_flags_corruption() {
        // no terminator
        let mut blob = Vec::new();
        push_dirent(&mut blob, 5, "x");
        assert!(DirStream::new(&blob).any(|e| e == Err(FsError::Io)));

        // bad magic
        let mut blob = Vec::new();
        push_dirent(&mut blob, 5, "x");
        push_dir_terminator(&mut blob);
        blob[0] = 0;
        assert_eq!(DirStream::new(&blob).next(), Some(Err(FsError::Io)));

        // name bytes are not UTF-8
        let mut blob = Vec::new();
        push_dirent(&mut blob, 5, "ab");
        push_dir_terminator(&mut blob);
        blob[DIRENT_HDR] = 0xFF;
        blob[DIRENT_HDR + 1] = 0xFE;
        assert_eq!(DirStream::new(&blob).next(), Some(Err(FsError::Io)));
    }

    #[test]
    fn xlist_round_trip() {
        let mut blob = Vec::new();
        push_xlist_entry(&mut blob, "user.a");
        push_xlist_entry(&mut blob, "user.long.name");
        let names: Vec<_> = XlistStream::new(&blob)
            .map(|e| e.unwrap().name.to_string())
            .collect();
        assert_eq!(names, ["user.a", "user.long.name"]);
    }

    #[test]
    fn xlist_flags_truncation() {
        let mut blob = Vec::new();
        push_xlist_entry(&mut blob, "user.a");
        blob.truncate(blob.len() - 3);
        assert!(XlistStream::new(&blob).any(|e| e == Err(FsError::Io)));
    }

    #[test]
    fn refcount_round_trip() {
        assert_eq!(decode_refcount(&encode_refcount(7)).unwrap(), 7);
        assert_eq!(decode_refcount(&[1, 2, 3]), Err(FsError::Io));
    }
}
