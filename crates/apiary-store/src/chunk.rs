//! The unit of storage.

use bytes::Bytes;

use apiary_core::identifiers::Key;

/// A content-addressed chunk.
///
/// The first 8 bytes of the payload encode, little-endian, the size of
/// the document subtree the chunk is the root of. The key is the hash
/// of the full payload including that prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Content address
    pub key: Key,
    /// Payload including the 8-byte size prefix
    pub sdata: Bytes,
}

impl Chunk {
    /// Creates a chunk from its payload, computing the key.
    pub fn new(sdata: Bytes) -> Self {
        Self {
            key: Key::hash(&sdata),
            sdata,
        }
    }

    /// Creates a chunk under an externally supplied key.
    ///
    /// Used for chunks arriving from the network, where the key comes
    /// from the store request and is verified elsewhere.
    pub fn with_key(key: Key, sdata: Bytes) -> Self {
        Self { key, sdata }
    }

    /// Subtree size from the payload prefix, zero for short payloads.
    pub fn size(&self) -> u64 {
        if self.sdata.len() < 8 {
            return 0;
        }
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.sdata[..8]);
        u64::from_le_bytes(prefix)
    }

    /// Verifies the key against the payload hash.
    pub fn verify(&self) -> bool {
        Key::hash(&self.sdata) == self.key
    }
}
