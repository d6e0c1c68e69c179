//! Apiary Store - local chunk storage.
//!
//! Chunks live in a memory cache backed by a persistent RocksDB store.
//! The persistent store stamps every chunk with a monotonically
//! increasing insertion counter, which the sync protocol uses to walk
//! stored keys in insertion order. A separate raw keyspace backs the
//! per-peer persistent sync queues.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod chunk;
pub mod db;
pub mod local;
pub mod mem;
pub mod requests;

pub use chunk::Chunk;
pub use db::DbStore;
pub use local::{ChunkStore, LocalStore};
pub use mem::MemStore;
pub use requests::{BatchOp, RequestDb};

use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// RocksDB failure
    #[error("database error: {0}")]
    Database(String),

    /// Stored bytes do not parse as expected
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
