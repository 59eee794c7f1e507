use crate::{BatchOp, LogBackend, StoreResult};

/// Backend for in-memory environments: committed batches go nowhere.
pub(crate) struct MemBackend;

impl LogBackend for MemBackend {
    fn append(&self, _batch: &[BatchOp]) -> StoreResult<()> {
        Ok(())
    }

    fn sync(&self) -> StoreResult<()> {
        Ok(())
    }
}
