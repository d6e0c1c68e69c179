//! Raw keyspace for the persistent sync queues.
//!
//! The per-peer sync queue spills to disk under backpressure. It needs
//! ordered prefix scans and atomic batches, nothing more, so this is a
//! thin wrapper over a single RocksDB keyspace shared by all peers.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};

use crate::StoreError;

/// One operation in an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Insert or overwrite a key
    Put(Vec<u8>, Vec<u8>),
    /// Remove a key
    Delete(Vec<u8>),
}

/// Ordered persistent keyspace.
#[derive(Clone)]
pub struct RequestDb {
    db: Arc<DB>,
}

impl RequestDb {
    /// Opens or creates the keyspace at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path).map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Fetches a value.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get(key)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Writes a single key.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db
            .put(key, value)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Applies a batch atomically.
    pub fn write(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                BatchOp::Put(k, v) => batch.put(k, v),
                BatchOp::Delete(k) => batch.delete(k),
            }
        }
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (k, v) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !k.starts_with(prefix) {
                break;
            }
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn batch_and_scan() {
        let dir = TempDir::new().unwrap();
        let db = RequestDb::open(dir.path()).unwrap();
        db.write(vec![
            BatchOp::Put(b"a/2".to_vec(), b"two".to_vec()),
            BatchOp::Put(b"a/1".to_vec(), b"one".to_vec()),
            BatchOp::Put(b"b/1".to_vec(), b"other".to_vec()),
        ])
        .unwrap();

        let entries = db.scan_prefix(b"a/").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, b"a/1");
        assert_eq!(entries[1].0, b"a/2");

        db.write(vec![BatchOp::Delete(b"a/1".to_vec())]).unwrap();
        assert_eq!(db.scan_prefix(b"a/").unwrap().len(), 1);
        assert_eq!(db.get(b"b/1").unwrap(), Some(b"other".to_vec()));
    }
}
