//! In-memory chunk cache.

use std::collections::HashMap;

use parking_lot::RwLock;

use apiary_core::identifiers::Key;

use crate::chunk::Chunk;

/// Default number of chunks kept in memory.
pub const DEFAULT_CAPACITY: usize = 5000;

struct Inner {
    chunks: HashMap<Key, Chunk>,
    // insertion order, oldest first; evicted keys stay in the list
    order: Vec<Key>,
}

/// Bounded chunk cache in front of the persistent store.
///
/// Eviction is oldest-first. The cache never answers sync iteration,
/// that always goes to the persistent store.
pub struct MemStore {
    capacity: usize,
    inner: RwLock<Inner>,
}

impl MemStore {
    /// Creates a cache holding up to `capacity` chunks.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(Inner {
                chunks: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Inserts a chunk, evicting the oldest entries when full.
    pub fn put(&self, chunk: Chunk) {
        let mut inner = self.inner.write();
        if inner.chunks.insert(chunk.key, chunk.clone()).is_none() {
            inner.order.push(chunk.key);
        }
        while inner.chunks.len() > self.capacity {
            let victim = inner.order.remove(0);
            inner.chunks.remove(&victim);
        }
    }

    /// Looks a chunk up by key.
    pub fn get(&self, key: &Key) -> Option<Chunk> {
        self.inner.read().chunks.get(key).cloned()
    }

    /// Checks whether a key is cached.
    pub fn contains(&self, key: &Key) -> bool {
        self.inner.read().chunks.contains_key(key)
    }

    /// Number of cached chunks.
    pub fn len(&self) -> usize {
        self.inner.read().chunks.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
