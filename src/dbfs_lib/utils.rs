use std::time::{SystemTime, UNIX_EPOCH};

use crate::dbfs_lib::inode::Inode;

/// Logger setup shared by all binaries; honors `RUST_LOG`.
pub fn init_logs() {
    let _ = env_logger::try_init();
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn to_unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Classic POSIX mode-bit check: owner bits if the uid matches, group bits
/// if the gid matches, otherwise the other bits.
pub fn access_ok(ino: &Inode, uid: u32, gid: u32, mask: i32) -> bool {
    let mask = mask as u32 & 0o7;
    if mask == 0 {
        // F_OK: existence only
        return true;
    }
    let shift = if uid == ino.raw.uid {
        6
    } else if gid == ino.raw.gid {
        3
    } else {
        0
    };
    let perm = (ino.raw.mode >> shift) & 0o7;
    mask & perm == mask
}

/// Read `DB_PASSWORD` and overwrite it in the environment so the password
/// does not linger where child processes or /proc can see it.
pub fn read_db_password() -> Option<String> {
    match std::env::var("DB_PASSWORD") {
        Ok(pw) if !pw.is_empty() => {
            std::env::set_var("DB_PASSWORD", "X");
            Some(pw)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbfs_lib::codec::RawInode;
    use crate::dbfs_lib::inode::InodeType;

    fn node(mode: u32, uid: u32, gid: u32) -> Inode {
        Inode {
            raw: RawInode {
                ino: 5,
                mode,
                uid,
                gid,
                ..RawInode::default()
            },
            itype: InodeType::Regular,
        }
    }

    #[test]
    fn mode_bit_classes() {
        let ino = node(libc::S_IFREG | 0o640, 1000, 100);
        // owner
        assert!(access_ok(&ino, 1000, 1, libc::R_OK | libc::W_OK));
        assert!(!access_ok(&ino, 1000, 1, libc::X_OK));
        // group
        assert!(access_ok(&ino, 1, 100, libc::R_OK));
        assert!(!access_ok(&ino, 1, 100, libc::W_OK));
        // other
        assert!(!access_ok(&ino, 1, 1, libc::R_OK));
        // existence probe always passes once the inode resolved
        assert!(access_ok(&ino, 1, 1, libc::F_OK));
    }
}
