//! Block pool and file I/O engine.
//!
//! Data blocks are content-addressed: the key in the `data` database is the
//! SHA-1 of the block's bytes, and the `hash` database holds one refcount
//! per live block. All-zero buffers are never stored; they become hole
//! extents that readers materialise as zeros.

use log::debug;
use sha1::{Digest, Sha1};
use txn_store::{StoreError, Txn};

use crate::dbfs_lib::codec::*;
use crate::dbfs_lib::err::{FsError, FsResult};
use crate::dbfs_lib::inode::Inode;
use crate::dbfs_lib::DbFs;

static ZERO_BLOCK: [u8; DBFS_ZERO_CMP_BLK_SZ] = [0u8; DBFS_ZERO_CMP_BLK_SZ];

/// Compare against a fixed zero block in 8 KiB steps.
pub fn is_zero_buf(buf: &[u8]) -> bool {
    buf.chunks(DBFS_ZERO_CMP_BLK_SZ)
        .all(|chunk| chunk == &ZERO_BLOCK[..chunk.len()])
}

fn blk_id_of(buf: &[u8]) -> BlkId {
    let digest = Sha1::digest(buf);
    let mut id = [0u8; DBFS_BLK_ID_LEN];
    id.copy_from_slice(&digest);
    BlkId(id)
}

/// Clip the inode's extent table to the fragments covering
/// `[off, off + rd_size)`. The first fragment may start mid-extent.
pub fn ext_match(ino: &Inode, off: u64, rd_size: u32) -> Vec<Extent> {
    let mut frags = Vec::new();
    let mut pos: u64 = 0;
    let mut want = rd_size;
    let mut in_frag = false;
    for ext in &ino.raw.extents {
        let ext_len = ext.len;
        if want == 0 {
            break;
        }
        if !in_frag && pos + ext_len as u64 > off {
            let skip = (off - pos) as u32;
            let len = (ext_len - skip).min(want);
            frags.push(Extent {
                off: ext.off + skip,
                len,
                id: ext.id,
            });
            want -= len;
            in_frag = true;
        } else if in_frag {
            let len = ext_len.min(want);
            frags.push(Extent {
                off: ext.off,
                len,
                id: ext.id,
            });
            want -= len;
        }
        pos += ext_len as u64;
    }
    frags
}

impl DbFs {
    /// Store one buffer as a block, deduplicating against existing content.
    /// Returns the extent describing it; zero buffers become hole extents.
    fn write_buf(&self, txn: &Txn, buf: &[u8]) -> FsResult<Extent> {
        if buf.is_empty() || buf.len() > DBFS_MAX_EXT_LEN as usize {
            return Err(FsError::Invalid);
        }
        if is_zero_buf(buf) {
            return Ok(Extent::hole(buf.len() as u32));
        }
        let id = blk_id_of(buf);
        let ext = Extent {
            off: 0,
            len: buf.len() as u32,
            id,
        };
        match self.hashref.get(Some(txn), &id.0) {
            Ok(v) => {
                let refs = decode_refcount(&v)?.checked_add(1).ok_or(FsError::Io)?;
                self.hashref
                    .put(txn, &id.0, &encode_refcount(refs))
                    .map_err(|_| FsError::Io)?;
                debug!("block {:?} deduped, refs now {}", id, refs);
                Ok(ext)
            }
            Err(StoreError::NotFound) => {
                self.hashref
                    .put(txn, &id.0, &encode_refcount(1))
                    .map_err(|_| FsError::Io)?;
                self.data
                    .put_unique(txn, &id.0, buf)
                    .map_err(|_| FsError::Io)?;
                Ok(ext)
            }
            Err(_) => Err(FsError::Io),
        }
    }

    /// Add one reference to an existing block. Holes are a no-op.
    pub(crate) fn data_ref(&self, txn: &Txn, id: &BlkId) -> FsResult<()> {
        if id.is_null() {
            return Ok(());
        }
        let v = match self.hashref.get(Some(txn), &id.0) {
            Ok(v) => v,
            Err(_) => return Err(FsError::Io), // a referenced block must have a refcount
        };
        let refs = decode_refcount(&v)?.checked_add(1).ok_or(FsError::Io)?;
        self.hashref
            .put(txn, &id.0, &encode_refcount(refs))
            .map_err(|_| FsError::Io)
    }

    /// Drop one reference; at zero both the refcount and the content key go.
    pub(crate) fn data_unref(&self, txn: &Txn, id: &BlkId) -> FsResult<()> {
        if id.is_null() {
            return Ok(());
        }
        let v = match self.hashref.get(Some(txn), &id.0) {
            Ok(v) => v,
            Err(StoreError::NotFound) => return Err(FsError::NotFound),
            Err(_) => return Err(FsError::Io),
        };
        let refs = decode_refcount(&v)?;
        if refs > 1 {
            self.hashref
                .put(txn, &id.0, &encode_refcount(refs - 1))
                .map_err(|_| FsError::Io)
        } else {
            self.hashref.del(txn, &id.0).map_err(|_| FsError::Io)?;
            self.data.del(txn, &id.0).map_err(|_| FsError::Io)
        }
    }

    /// Read up to `rd_size` bytes starting at `off`. Short when the extents
    /// run out first.
    pub fn fs_read(&self, txn: &Txn, ino_n: u64, off: u64, rd_size: u32) -> FsResult<Vec<u8>> {
        let ino = self.inode_read(txn, ino_n)?;
        let frags = ext_match(&ino, off, rd_size);
        let total: usize = frags.iter().map(|f| f.len as usize).sum();
        let mut buf = vec![0u8; total];
        let mut pos = 0usize;
        for frag in &frags {
            let len = frag.len as usize;
            if !frag.id.is_null() {
                let n = match self
                    .data
                    .get_partial(Some(txn), &frag.id.0, frag.off, &mut buf[pos..pos + len])
                {
                    Ok(n) => n,
                    Err(StoreError::NotFound) => return Err(FsError::NotFound),
                    Err(_) => return Err(FsError::Io),
                };
                if n != len {
                    return Err(FsError::Invalid);
                }
            }
            // holes stay zero-filled
            pos += len;
        }
        Ok(buf)
    }

    /// Write `buf` at `off`, growing the file with holes past EOF, appending
    /// at EOF, or splicing into the middle of the extent table.
    pub fn fs_write(&self, txn: &Txn, ino_n: u64, off: u64, buf: &[u8]) -> FsResult<usize> {
        let mut ino = self.inode_read(txn, ino_n)?;
        debug!(
            "fs_write ino {} off {} len {} i_size {}",
            ino_n,
            off,
            buf.len(),
            ino.raw.size
        );
        if u64::MAX - off < buf.len() as u64 {
            return Err(FsError::Invalid);
        }
        if buf.is_empty() {
            // a no-op that still bumps the version
            self.inode_write(txn, &mut ino)?;
            return Ok(0);
        }

        let ext = self.write_buf(txn, buf)?;

        if off > ino.raw.size {
            self.inode_resize(txn, &mut ino, off)?;
        }

        if off == ino.raw.size {
            // append: growth adds exactly one hole extent, replace it
            self.inode_resize(txn, &mut ino, off + buf.len() as u64)?;
            let idx = ino.raw.extents.len() - 1;
            debug_assert!(ino.raw.extents[idx].id.is_null());
            ino.raw.extents[idx] = ext;
        } else {
            self.write_in_place(txn, &mut ino, off, ext)?;
        }

        self.inode_write(txn, &mut ino)?;
        Ok(buf.len())
    }

    /// Splice `new_ext` over `[off, off + new_ext.len)` of the extent table.
    /// Spanning extents are trimmed, wholly covered ones unreferenced; a
    /// single extent surviving on both sides of the write gains a reference.
    fn write_in_place(
        &self,
        txn: &Txn,
        ino: &mut Inode,
        off: u64,
        new_ext: Extent,
    ) -> FsResult<()> {
        let wend = off + new_ext.len as u64;
        let old_size = ino.raw.size;
        let mut rebuilt = Vec::with_capacity(ino.raw.extents.len() + 2);
        let mut inserted = false;
        let mut pos: u64 = 0;
        for ext in &ino.raw.extents {
            let e_start = pos;
            let e_len = ext.len as u64;
            let e_end = e_start + e_len;
            pos = e_end;

            if e_end <= off {
                rebuilt.push(*ext);
                continue;
            }
            if e_start >= wend {
                if !inserted {
                    rebuilt.push(new_ext);
                    inserted = true;
                }
                rebuilt.push(*ext);
                continue;
            }

            let head = off.saturating_sub(e_start);
            let tail = e_end.saturating_sub(wend);
            if head > 0 {
                rebuilt.push(Extent {
                    off: ext.off,
                    len: head as u32,
                    id: ext.id,
                });
            }
            if !inserted {
                rebuilt.push(new_ext);
                inserted = true;
            }
            if tail > 0 {
                rebuilt.push(Extent {
                    off: ext.off + (e_len - tail) as u32,
                    len: tail as u32,
                    id: ext.id,
                });
            }
            if head > 0 && tail > 0 {
                self.data_ref(txn, &ext.id)?;
            } else if head == 0 && tail == 0 {
                self.data_unref(txn, &ext.id)?;
            }
        }
        if !inserted {
            rebuilt.push(new_ext);
        }
        ino.raw.extents = rebuilt;
        ino.raw.size = old_size.max(wend);
        Ok(())
    }

    /// Committed refcount of a block, 0 if absent. Diagnostic/test use.
    pub fn block_refs(&self, txn: &Txn, id: &BlkId) -> FsResult<u32> {
        match self.hashref.get(Some(txn), &id.0) {
            Ok(v) => decode_refcount(&v),
            Err(StoreError::NotFound) => Ok(0),
            Err(_) => Err(FsError::Io),
        }
    }
}
