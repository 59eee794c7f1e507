//! Transactional key/value environment.
//!
//! An environment is a directory holding any number of named logical
//! databases. All mutations go through transactions: a transaction buffers
//! its writes, reads its own writes, and publishes everything atomically on
//! commit. Committed batches are appended to a log which is replayed the
//! next time the environment is opened.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

pub mod file;
pub mod memory;

use file::FileBackend;
use memory::MemBackend;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
    #[error("key already exists")]
    KeyExists,
    #[error("corrupt environment: {0}")]
    Corrupt(String),
    #[error("store i/o: {0}")]
    Io(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Flags for [`Env::open`], in the style of DB_CREATE / DB_RECOVER.
#[derive(Debug, Default, Clone)]
pub struct EnvOptions {
    /// Create the environment directory and log if absent.
    pub create: bool,
    /// Tolerate a torn tail in the commit log: replay what is intact,
    /// truncate the rest. Without it a torn log fails the open.
    pub recover: bool,
    /// AES password; when set the commit log is encrypted.
    pub password: Option<String>,
}

impl EnvOptions {
    pub fn create(mut self, yes: bool) -> Self {
        self.create = yes;
        self
    }

    pub fn recover(mut self, yes: bool) -> Self {
        self.recover = yes;
        self
    }

    pub fn password(mut self, pw: Option<String>) -> Self {
        self.password = pw;
        self
    }
}

pub(crate) type Table = HashMap<Vec<u8>, Vec<u8>>;

/// One operation of a committed batch. `value: None` is a deletion.
#[derive(Debug, Clone)]
pub(crate) struct BatchOp {
    pub db: String,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// Durability sink for committed batches.
pub(crate) trait LogBackend: Send + Sync {
    fn append(&self, batch: &[BatchOp]) -> StoreResult<()>;
    fn sync(&self) -> StoreResult<()>;
}

struct EnvInner {
    tables: RwLock<HashMap<String, Table>>,
    /// Registered page size per database. Advisory; kept so an environment
    /// records the layout it was created with.
    page_sizes: Mutex<HashMap<String, u32>>,
    backend: Box<dyn LogBackend>,
    /// Serializes commit publication (log append + table apply).
    commit_lock: Mutex<()>,
}

/// Handle to an open environment. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Env {
    inner: Arc<EnvInner>,
}

impl Env {
    /// Open (or create) a persistent environment rooted at `dir`.
    pub fn open(dir: &Path, opts: EnvOptions) -> StoreResult<Env> {
        let (backend, tables) = FileBackend::open(dir, &opts)?;
        Ok(Env {
            inner: Arc::new(EnvInner {
                tables: RwLock::new(tables),
                page_sizes: Mutex::new(HashMap::new()),
                backend: Box::new(backend),
                commit_lock: Mutex::new(()),
            }),
        })
    }

    /// Open a throwaway in-memory environment. Nothing survives drop.
    pub fn open_memory() -> Env {
        Env {
            inner: Arc::new(EnvInner {
                tables: RwLock::new(HashMap::new()),
                page_sizes: Mutex::new(HashMap::new()),
                backend: Box::new(MemBackend),
                commit_lock: Mutex::new(()),
            }),
        }
    }

    /// Open a named logical database, creating it if absent.
    pub fn db(&self, name: &str, page_size: u32) -> StoreResult<Db> {
        self.inner
            .tables
            .write()
            .unwrap()
            .entry(name.to_string())
            .or_default();
        self.inner
            .page_sizes
            .lock()
            .unwrap()
            .insert(name.to_string(), page_size);
        Ok(Db {
            name: name.to_string(),
            inner: self.inner.clone(),
        })
    }

    pub fn txn_begin(&self) -> StoreResult<Txn> {
        Ok(Txn {
            inner: self.inner.clone(),
            writes: Mutex::new(HashMap::new()),
        })
    }

    /// Force the commit log to stable storage.
    pub fn flush(&self) -> StoreResult<()> {
        self.inner.backend.sync()
    }
}

/// Handle to one named database of an environment.
#[derive(Clone)]
pub struct Db {
    name: String,
    inner: Arc<EnvInner>,
}

impl Db {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetch the full value stored under `key`.
    pub fn get(&self, txn: Option<&Txn>, key: &[u8]) -> StoreResult<Vec<u8>> {
        if let Some(txn) = txn {
            let writes = txn.writes.lock().unwrap();
            if let Some(slot) = writes.get(&(self.name.clone(), key.to_vec())) {
                return match slot {
                    Some(v) => Ok(v.clone()),
                    None => Err(StoreError::NotFound),
                };
            }
        }
        let tables = self.inner.tables.read().unwrap();
        tables
            .get(&self.name)
            .and_then(|t| t.get(key))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    /// Copy `buf.len()` bytes of the value starting at `offset` into `buf`.
    /// Returns the number of bytes copied, which is short when the value
    /// ends before the requested range does.
    pub fn get_partial(
        &self,
        txn: Option<&Txn>,
        key: &[u8],
        offset: u32,
        buf: &mut [u8],
    ) -> StoreResult<usize> {
        let val = self.get(txn, key)?;
        let off = offset as usize;
        if off >= val.len() {
            return Ok(0);
        }
        let n = buf.len().min(val.len() - off);
        buf[..n].copy_from_slice(&val[off..off + n]);
        Ok(n)
    }

    /// Store `val` under `key`, replacing any existing value.
    pub fn put(&self, txn: &Txn, key: &[u8], val: &[u8]) -> StoreResult<()> {
        let mut writes = txn.writes.lock().unwrap();
        writes.insert((self.name.clone(), key.to_vec()), Some(val.to_vec()));
        Ok(())
    }

    /// Store `val` under `key`, failing with [`StoreError::KeyExists`] if the
    /// key is already present (committed or written by this transaction).
    pub fn put_unique(&self, txn: &Txn, key: &[u8], val: &[u8]) -> StoreResult<()> {
        let mut writes = txn.writes.lock().unwrap();
        let present = match writes.get(&(self.name.clone(), key.to_vec())) {
            Some(Some(_)) => true,
            Some(None) => false,
            None => {
                let tables = self.inner.tables.read().unwrap();
                tables
                    .get(&self.name)
                    .map(|t| t.contains_key(key))
                    .unwrap_or(false)
            }
        };
        if present {
            return Err(StoreError::KeyExists);
        }
        writes.insert((self.name.clone(), key.to_vec()), Some(val.to_vec()));
        Ok(())
    }

    /// Delete `key`. [`StoreError::NotFound`] if it is not visible.
    pub fn del(&self, txn: &Txn, key: &[u8]) -> StoreResult<()> {
        let mut writes = txn.writes.lock().unwrap();
        let present = match writes.get(&(self.name.clone(), key.to_vec())) {
            Some(Some(_)) => true,
            Some(None) => false,
            None => {
                let tables = self.inner.tables.read().unwrap();
                tables
                    .get(&self.name)
                    .map(|t| t.contains_key(key))
                    .unwrap_or(false)
            }
        };
        if !present {
            return Err(StoreError::NotFound);
        }
        writes.insert((self.name.clone(), key.to_vec()), None);
        Ok(())
    }

    /// Number of committed keys. Diagnostic use.
    pub fn len(&self) -> usize {
        let tables = self.inner.tables.read().unwrap();
        tables.get(&self.name).map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A transaction. Owned by exactly one request; dropping it aborts.
pub struct Txn {
    inner: Arc<EnvInner>,
    #[allow(clippy::type_complexity)]
    writes: Mutex<HashMap<(String, Vec<u8>), Option<Vec<u8>>>>,
}

impl Txn {
    /// Publish the buffered writes atomically.
    pub fn commit(self) -> StoreResult<()> {
        let writes = self.writes.into_inner().unwrap();
        if writes.is_empty() {
            return Ok(());
        }
        let batch: Vec<BatchOp> = writes
            .into_iter()
            .map(|((db, key), value)| BatchOp { db, key, value })
            .collect();
        let _guard = self.inner.commit_lock.lock().unwrap();
        self.inner.backend.append(&batch)?;
        let mut tables = self.inner.tables.write().unwrap();
        for op in batch {
            let table = tables.entry(op.db).or_default();
            match op.value {
                Some(v) => {
                    table.insert(op.key, v);
                }
                None => {
                    table.remove(&op.key);
                }
            }
        }
        Ok(())
    }

    /// Discard the buffered writes.
    pub fn abort(self) {}

    /// Number of buffered operations.
    pub fn pending(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with_db() -> (Env, Db) {
        let env = Env::open_memory();
        let db = env.db("meta", 512).unwrap();
        (env, db)
    }

    #[test]
    fn get_put_del() {
        let (env, db) = env_with_db();
        let txn = env.txn_begin().unwrap();
        db.put(&txn, b"k", b"v").unwrap();
        assert_eq!(db.get(Some(&txn), b"k").unwrap(), b"v");
        txn.commit().unwrap();

        let txn = env.txn_begin().unwrap();
        assert_eq!(db.get(Some(&txn), b"k").unwrap(), b"v");
        db.del(&txn, b"k").unwrap();
        assert!(matches!(
            db.get(Some(&txn), b"k"),
            Err(StoreError::NotFound)
        ));
        txn.commit().unwrap();
        assert!(matches!(db.get(None, b"k"), Err(StoreError::NotFound)));
    }

    #[test]
    fn abort_rolls_back() {
        let (env, db) = env_with_db();
        let txn = env.txn_begin().unwrap();
        db.put(&txn, b"k", b"v").unwrap();
        txn.abort();
        assert!(matches!(db.get(None, b"k"), Err(StoreError::NotFound)));
    }

    #[test]
    fn put_unique_refuses_existing() {
        let (env, db) = env_with_db();
        let txn = env.txn_begin().unwrap();
        db.put(&txn, b"k", b"v").unwrap();
        txn.commit().unwrap();

        let txn = env.txn_begin().unwrap();
        assert!(matches!(
            db.put_unique(&txn, b"k", b"w"),
            Err(StoreError::KeyExists)
        ));
        // a key deleted in this txn may be re-inserted uniquely
        db.del(&txn, b"k").unwrap();
        db.put_unique(&txn, b"k", b"w").unwrap();
        txn.commit().unwrap();
        assert_eq!(db.get(None, b"k").unwrap(), b"w");
    }

    #[test]
    fn partial_get_ranges() {
        let (env, db) = env_with_db();
        let txn = env.txn_begin().unwrap();
        db.put(&txn, b"k", b"hello world").unwrap();
        txn.commit().unwrap();

        let mut buf = [0u8; 5];
        let n = db.get_partial(None, b"k", 6, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"world");

        // range past the end is short, range starting past the end is empty
        let n = db.get_partial(None, b"k", 9, &mut buf).unwrap();
        assert_eq!(n, 2);
        let n = db.get_partial(None, b"k", 64, &mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn databases_are_disjoint() {
        let env = Env::open_memory();
        let meta = env.db("meta", 512).unwrap();
        let data = env.db("data", 2048).unwrap();
        let txn = env.txn_begin().unwrap();
        meta.put(&txn, b"k", b"m").unwrap();
        data.put(&txn, b"k", b"d").unwrap();
        txn.commit().unwrap();
        assert_eq!(meta.get(None, b"k").unwrap(), b"m");
        assert_eq!(data.get(None, b"k").unwrap(), b"d");
    }
}
