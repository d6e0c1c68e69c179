//! Combined local storage and the store access trait.

use std::path::Path;
use std::sync::Arc;

use apiary_core::identifiers::Key;
use apiary_proto::DbSyncState;

use crate::chunk::Chunk;
use crate::db::DbStore;
use crate::mem::MemStore;
use crate::StoreError;

/// Store access as the network layer sees it.
///
/// Sync iteration exposes the insertion counter interval of a
/// [`DbSyncState`] restricted to its key range.
pub trait ChunkStore: Send + Sync {
    /// Fetches a chunk by key.
    fn get(&self, key: &Key) -> Result<Option<Chunk>, StoreError>;

    /// Stores a chunk.
    fn put(&self, chunk: &Chunk) -> Result<(), StoreError>;

    /// Checks whether a key is stored.
    fn contains(&self, key: &Key) -> Result<bool, StoreError>;

    /// Current insertion counter.
    fn counter(&self) -> u64;

    /// Keys in the state's counter interval and key range, in
    /// insertion order.
    fn sync_keys(&self, state: &DbSyncState) -> Result<Vec<(Key, u64)>, StoreError>;
}

/// Memory cache in front of the persistent chunk store.
pub struct LocalStore {
    mem: MemStore,
    db: Arc<DbStore>,
}

impl LocalStore {
    /// Opens the persistent store at `path` with a default-sized cache.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            mem: MemStore::default(),
            db: Arc::new(DbStore::open(path)?),
        })
    }

    /// Creates a local store over an already opened persistent store.
    pub fn with_db(mem: MemStore, db: Arc<DbStore>) -> Self {
        Self { mem, db }
    }
}

impl ChunkStore for LocalStore {
    fn get(&self, key: &Key) -> Result<Option<Chunk>, StoreError> {
        if let Some(chunk) = self.mem.get(key) {
            return Ok(Some(chunk));
        }
        let chunk = self.db.get(key)?;
        if let Some(chunk) = &chunk {
            self.mem.put(chunk.clone());
        }
        Ok(chunk)
    }

    fn put(&self, chunk: &Chunk) -> Result<(), StoreError> {
        self.db.put(chunk)?;
        self.mem.put(chunk.clone());
        Ok(())
    }

    fn contains(&self, key: &Key) -> Result<bool, StoreError> {
        if self.mem.contains(key) {
            return Ok(true);
        }
        self.db.contains(key)
    }

    fn counter(&self) -> u64 {
        self.db.counter()
    }

    fn sync_keys(&self, state: &DbSyncState) -> Result<Vec<(Key, u64)>, StoreError> {
        self.db.sync_keys(state)
    }
}
