//! Persistent chunk store backed by RocksDB.
//!
//! Two column families: `chunks` maps key to payload, `index` maps the
//! big-endian insertion counter to the key. The index is what the sync
//! protocol walks, so counter order is insertion order.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use tracing::debug;

use apiary_core::identifiers::Key;
use apiary_proto::DbSyncState;

use crate::chunk::Chunk;
use crate::StoreError;

const CHUNKS_CF: &str = "chunks";
const INDEX_CF: &str = "index";
const COUNTER_KEY: &[u8] = b"counter";

/// Persistent chunk store with an insertion counter.
pub struct DbStore {
    db: Arc<DB>,
    counter: RwLock<u64>,
}

impl DbStore {
    /// Opens or creates a store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, [CHUNKS_CF, INDEX_CF])
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let counter = match db
            .get(COUNTER_KEY)
            .map_err(|e| StoreError::Database(e.to_string()))?
        {
            Some(bytes) if bytes.len() == 8 => {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&bytes);
                u64::from_le_bytes(arr)
            }
            _ => 0,
        };

        Ok(Self {
            db: Arc::new(db),
            counter: RwLock::new(counter),
        })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("missing column family {name}")))
    }

    /// Stores a chunk unless the key is already present.
    pub fn put(&self, chunk: &Chunk) -> Result<(), StoreError> {
        let chunks = self.cf(CHUNKS_CF)?;
        let exists = self
            .db
            .get_cf(&chunks, chunk.key.as_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_some();
        if exists {
            return Ok(());
        }

        let index = self.cf(INDEX_CF)?;
        let mut counter = self.counter.write();
        let at = *counter;

        let mut batch = WriteBatch::default();
        batch.put_cf(&chunks, chunk.key.as_bytes(), &chunk.sdata);
        batch.put_cf(&index, at.to_be_bytes(), chunk.key.as_bytes());
        batch.put(COUNTER_KEY, (at + 1).to_le_bytes());
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        *counter = at + 1;
        debug!(key = %chunk.key, at, size = chunk.sdata.len(), "stored chunk");
        Ok(())
    }

    /// Fetches a chunk by key.
    pub fn get(&self, key: &Key) -> Result<Option<Chunk>, StoreError> {
        let chunks = self.cf(CHUNKS_CF)?;
        let value = self
            .db
            .get_cf(&chunks, key.as_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(value.map(|sdata| Chunk::with_key(*key, Bytes::from(sdata))))
    }

    /// Checks whether a key is stored.
    pub fn contains(&self, key: &Key) -> Result<bool, StoreError> {
        let chunks = self.cf(CHUNKS_CF)?;
        self.db
            .get_cf(&chunks, key.as_bytes())
            .map(|v| v.is_some())
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// The insertion counter: the number of chunks ever stored. The
    /// next chunk gets stamped with this value.
    pub fn counter(&self) -> u64 {
        *self.counter.read()
    }

    /// Keys stamped within `first..=last` that fall in the state's key
    /// range, in insertion order, paired with their counter values.
    pub fn sync_keys(&self, state: &DbSyncState) -> Result<Vec<(Key, u64)>, StoreError> {
        let index = self.cf(INDEX_CF)?;
        let mut out = Vec::new();
        let start = state.first.to_be_bytes();
        let iter = self
            .db
            .iterator_cf(&index, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (ck, kv) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if ck.len() != 8 || kv.len() != 32 {
                return Err(StoreError::InvalidData(format!(
                    "bad index entry: {} byte key, {} byte value",
                    ck.len(),
                    kv.len()
                )));
            }
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&ck);
            let at = u64::from_be_bytes(arr);
            if at > state.last {
                break;
            }
            let mut kb = [0u8; 32];
            kb.copy_from_slice(&kv);
            let key = Key::new(kb);
            if state.start <= key && key <= state.stop {
                out.push((key, at));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chunk(byte: u8) -> Chunk {
        let mut data = 32u64.to_le_bytes().to_vec();
        data.extend_from_slice(&[byte; 32]);
        Chunk::new(Bytes::from(data))
    }

    #[test]
    fn counter_advances_per_new_chunk_only() {
        let dir = TempDir::new().unwrap();
        let store = DbStore::open(dir.path()).unwrap();
        assert_eq!(store.counter(), 0);

        let c = chunk(1);
        store.put(&c).unwrap();
        store.put(&c).unwrap();
        store.put(&chunk(2)).unwrap();
        assert_eq!(store.counter(), 2);
    }

    #[test]
    fn counter_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = DbStore::open(dir.path()).unwrap();
            store.put(&chunk(1)).unwrap();
            store.put(&chunk(2)).unwrap();
        }
        let store = DbStore::open(dir.path()).unwrap();
        assert_eq!(store.counter(), 2);
        assert!(store.contains(&chunk(1).key).unwrap());
    }

    #[test]
    fn sync_keys_walk_insertion_order() {
        let dir = TempDir::new().unwrap();
        let store = DbStore::open(dir.path()).unwrap();
        let chunks: Vec<_> = (0..5).map(chunk).collect();
        for c in &chunks {
            store.put(c).unwrap();
        }

        let state = DbSyncState {
            start: Key::zero(),
            stop: Key::new([0xff; 32]),
            first: 1,
            last: 3,
        };
        let keys = store.sync_keys(&state).unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0], (chunks[1].key, 1));
        assert_eq!(keys[2], (chunks[3].key, 3));
    }

    #[test]
    fn sync_keys_respect_key_range() {
        let dir = TempDir::new().unwrap();
        let store = DbStore::open(dir.path()).unwrap();
        let chunks: Vec<_> = (0..8).map(chunk).collect();
        for c in &chunks {
            store.put(c).unwrap();
        }

        let inside: Vec<_> = chunks
            .iter()
            .filter(|c| c.key.as_bytes()[0] < 0x80)
            .map(|c| c.key)
            .collect();
        let state = DbSyncState {
            start: Key::zero(),
            stop: Key::new({
                let mut b = [0xffu8; 32];
                b[0] = 0x7f;
                b
            }),
            first: 0,
            last: 7,
        };
        let keys: Vec<_> = store
            .sync_keys(&state)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, inside);
    }
}
