//! Apiary Kad - proximity routing table for the apiary overlay.
//!
//! The table keeps live peers in `MaxProx + 1` buckets indexed by
//! proximity order, maintains the dynamic proximity limit that defines
//! the "most proximate bin", and keeps a parallel database of offline
//! node records used to decide which peer to dial next.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod kaddb;
pub mod table;

pub use kaddb::{DialAdvice, KadDb, NodeRecord};
pub use table::{KadParams, Kademlia, Peer};

use thiserror::Error;

/// Routing table errors.
#[derive(Debug, Error)]
pub enum KadError {
    /// Persisted node DB carries a different self address
    #[error("node db address mismatch: expected {expected}, found {found}")]
    AddressMismatch {
        /// Our own overlay address
        expected: String,
        /// Address recorded in the file
        found: String,
    },

    /// JSON (de)serialisation failure
    #[error("node db serialisation: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Filesystem failure
    #[error("node db io: {0}")]
    Io(#[from] std::io::Error),
}
