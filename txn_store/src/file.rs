//! Persistent backend: an append-only commit log under the environment
//! directory, replayed on open. With a password set, every record's payload
//! is AES-GCM encrypted with a key derived from the password.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use log::warn;
use sha2::{Digest, Sha256};

use crate::{BatchOp, EnvOptions, LogBackend, StoreError, StoreResult, Table};

const LOG_NAME: &str = "store.log";
const REC_MAGIC: u32 = 0x544B_5643; // "TKVC"
const REC_HDR: usize = 8;
const NONCE_LEN: usize = 12;

const OP_PUT: u8 = 0;
const OP_DEL: u8 = 1;

pub(crate) struct FileBackend {
    state: Mutex<LogFile>,
    cipher: Option<Aes256Gcm>,
    /// Varies per open so a truncated-and-rewritten record never reuses a
    /// nonce from a previous process.
    nonce_salt: u32,
}

struct LogFile {
    file: File,
    len: u64,
}

impl FileBackend {
    /// Open the log under `dir`, replay it, and return the backend together
    /// with the replayed database tables.
    pub(crate) fn open(
        dir: &Path,
        opts: &EnvOptions,
    ) -> StoreResult<(FileBackend, HashMap<String, Table>)> {
        if opts.create {
            std::fs::create_dir_all(dir)?;
        }
        let path = dir.join(LOG_NAME);
        if !path.exists() && !opts.create {
            return Err(StoreError::Io(format!(
                "no environment at {}",
                dir.display()
            )));
        }

        let cipher = opts.password.as_deref().map(|pw| {
            let key = Sha256::digest(pw.as_bytes());
            Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key))
        });

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(opts.create)
            .open(&path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let mut tables: HashMap<String, Table> = HashMap::new();
        let mut pos = 0usize;
        let good = loop {
            if pos == raw.len() {
                break pos;
            }
            match replay_record(&raw[pos..], cipher.as_ref(), &mut tables) {
                Ok(used) => pos += used,
                Err(e) => {
                    if opts.recover {
                        warn!("commit log torn at byte {}: {}; truncating", pos, e);
                        break pos;
                    }
                    return Err(e);
                }
            }
        };
        if good < raw.len() {
            file.set_len(good as u64)?;
            file.seek(SeekFrom::End(0))?;
        }

        let nonce_salt = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);

        Ok((
            FileBackend {
                state: Mutex::new(LogFile {
                    file,
                    len: good as u64,
                }),
                cipher,
                nonce_salt,
            },
            tables,
        ))
    }
}

impl LogBackend for FileBackend {
    fn append(&self, batch: &[BatchOp]) -> StoreResult<()> {
        let plain = encode_batch(batch);
        let mut state = self.state.lock().unwrap();
        let payload = match &self.cipher {
            Some(cipher) => {
                let mut nonce = [0u8; NONCE_LEN];
                nonce[..4].copy_from_slice(&self.nonce_salt.to_le_bytes());
                nonce[4..].copy_from_slice(&state.len.to_le_bytes());
                let ct = cipher
                    .encrypt(Nonce::from_slice(&nonce), plain.as_slice())
                    .map_err(|_| StoreError::Io("log encryption failed".into()))?;
                let mut payload = nonce.to_vec();
                payload.extend_from_slice(&ct);
                payload
            }
            None => plain,
        };
        let mut rec = Vec::with_capacity(REC_HDR + payload.len());
        rec.extend_from_slice(&REC_MAGIC.to_le_bytes());
        rec.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        rec.extend_from_slice(&payload);
        state.file.write_all(&rec)?;
        state.file.flush()?;
        state.len += rec.len() as u64;
        Ok(())
    }

    fn sync(&self) -> StoreResult<()> {
        let state = self.state.lock().unwrap();
        state.file.sync_all()?;
        Ok(())
    }
}

/// Parse one record at the head of `raw`, apply it, return its total size.
fn replay_record(
    raw: &[u8],
    cipher: Option<&Aes256Gcm>,
    tables: &mut HashMap<String, Table>,
) -> StoreResult<usize> {
    if raw.len() < REC_HDR {
        return Err(StoreError::Corrupt("short record header".into()));
    }
    let magic = u32::from_le_bytes(raw[0..4].try_into().unwrap());
    if magic != REC_MAGIC {
        return Err(StoreError::Corrupt(format!("bad record magic {:#x}", magic)));
    }
    let len = u32::from_le_bytes(raw[4..8].try_into().unwrap()) as usize;
    if raw.len() < REC_HDR + len {
        return Err(StoreError::Corrupt("record body past end of log".into()));
    }
    let payload = &raw[REC_HDR..REC_HDR + len];
    let plain = match cipher {
        Some(cipher) => {
            if payload.len() < NONCE_LEN {
                return Err(StoreError::Corrupt("record too short for nonce".into()));
            }
            cipher
                .decrypt(Nonce::from_slice(&payload[..NONCE_LEN]), &payload[NONCE_LEN..])
                .map_err(|_| StoreError::Corrupt("log decryption failed".into()))?
        }
        None => payload.to_vec(),
    };
    apply_batch(&plain, tables)?;
    Ok(REC_HDR + len)
}

fn encode_batch(batch: &[BatchOp]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(batch.len() as u32).to_le_bytes());
    for op in batch {
        out.push(if op.value.is_some() { OP_PUT } else { OP_DEL });
        let name = op.db.as_bytes();
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&(op.key.len() as u32).to_le_bytes());
        out.extend_from_slice(&op.key);
        if let Some(v) = &op.value {
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            out.extend_from_slice(v);
        }
    }
    out
}

fn apply_batch(mut p: &[u8], tables: &mut HashMap<String, Table>) -> StoreResult<()> {
    fn take<'a>(p: &mut &'a [u8], n: usize) -> StoreResult<&'a [u8]> {
        if p.len() < n {
            return Err(StoreError::Corrupt("truncated batch".into()));
        }
        let (head, tail) = p.split_at(n);
        *p = tail;
        Ok(head)
    }

    let n_ops = u32::from_le_bytes(take(&mut p, 4)?.try_into().unwrap());
    for _ in 0..n_ops {
        let tag = take(&mut p, 1)?[0];
        let name_len = u16::from_le_bytes(take(&mut p, 2)?.try_into().unwrap()) as usize;
        let name = String::from_utf8(take(&mut p, name_len)?.to_vec())
            .map_err(|_| StoreError::Corrupt("bad database name".into()))?;
        let key_len = u32::from_le_bytes(take(&mut p, 4)?.try_into().unwrap()) as usize;
        let key = take(&mut p, key_len)?.to_vec();
        let table = tables.entry(name).or_default();
        match tag {
            OP_PUT => {
                let val_len = u32::from_le_bytes(take(&mut p, 4)?.try_into().unwrap()) as usize;
                let val = take(&mut p, val_len)?.to_vec();
                table.insert(key, val);
            }
            OP_DEL => {
                table.remove(&key);
            }
            t => return Err(StoreError::Corrupt(format!("unknown batch op {}", t))),
        }
    }
    if !p.is_empty() {
        return Err(StoreError::Corrupt("trailing bytes in batch".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Env, EnvOptions};
    use std::path::PathBuf;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "txn_store_test_{}_{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn survives_reopen() {
        let dir = scratch_dir("reopen");
        {
            let env = Env::open(&dir, EnvOptions::default().create(true)).unwrap();
            let db = env.db("meta", 512).unwrap();
            let txn = env.txn_begin().unwrap();
            db.put(&txn, b"a", b"1").unwrap();
            db.put(&txn, b"b", b"2").unwrap();
            txn.commit().unwrap();
            let txn = env.txn_begin().unwrap();
            db.del(&txn, b"a").unwrap();
            txn.commit().unwrap();
        }
        let env = Env::open(&dir, EnvOptions::default()).unwrap();
        let db = env.db("meta", 512).unwrap();
        assert!(db.get(None, b"a").is_err());
        assert_eq!(db.get(None, b"b").unwrap(), b"2");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn open_without_create_fails_on_missing() {
        let dir = scratch_dir("missing");
        assert!(Env::open(&dir, EnvOptions::default()).is_err());
    }

    #[test]
    fn recover_truncates_torn_tail() {
        let dir = scratch_dir("torn");
        {
            let env = Env::open(&dir, EnvOptions::default().create(true)).unwrap();
            let db = env.db("meta", 512).unwrap();
            let txn = env.txn_begin().unwrap();
            db.put(&txn, b"k", b"v").unwrap();
            txn.commit().unwrap();
        }
        // simulate a torn write
        let mut f = OpenOptions::new()
            .append(true)
            .open(dir.join(LOG_NAME))
            .unwrap();
        f.write_all(&REC_MAGIC.to_le_bytes()).unwrap();
        f.write_all(&1000u32.to_le_bytes()).unwrap();
        f.write_all(b"partial").unwrap();
        drop(f);

        assert!(Env::open(&dir, EnvOptions::default()).is_err());
        let env = Env::open(&dir, EnvOptions::default().recover(true)).unwrap();
        let db = env.db("meta", 512).unwrap();
        assert_eq!(db.get(None, b"k").unwrap(), b"v");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn encrypted_log_round_trips() {
        let dir = scratch_dir("aes");
        let pw = Some("hunter2".to_string());
        {
            let env = Env::open(
                &dir,
                EnvOptions::default().create(true).password(pw.clone()),
            )
            .unwrap();
            let db = env.db("data", 2048).unwrap();
            let txn = env.txn_begin().unwrap();
            db.put(&txn, b"blk", b"ciphertext me").unwrap();
            txn.commit().unwrap();
        }
        // wrong password fails, right password sees the data
        assert!(Env::open(
            &dir,
            EnvOptions::default().password(Some("wrong".into()))
        )
        .is_err());
        let env = Env::open(&dir, EnvOptions::default().password(pw)).unwrap();
        let db = env.db("data", 2048).unwrap();
        assert_eq!(db.get(None, b"blk").unwrap(), b"ciphertext me");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
