//! Apiary Net - networking layer of the apiary overlay.
//!
//! Ties the routing table, the chunk stores and the wire protocol
//! together into a running node. Each peer connection is handled by an
//! independent reader task that decodes frames and dispatches them to
//! the network store, the hive and the per-peer syncer.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod hive;
pub mod netstore;
pub mod node;
pub mod protocol;
pub mod syncdb;
pub mod syncer;
pub mod transport;

pub use config::NodeConfig;
pub use hive::{Hive, HiveParams};
pub use netstore::NetStore;
pub use node::Node;
pub use protocol::{run_peer, BzzPeer, NodeCtx, NoopPayment, PaymentHandler};
pub use syncer::{ReqType, SyncItem, SyncOut, SyncParams, Syncer};

use apiary_core::wire::WireError;
use apiary_kad::KadError;
use apiary_proto::FrameError;
use apiary_store::StoreError;
use thiserror::Error;

/// Networking errors. The protocol variants are fatal for the
/// connection they occur on; the rest are reported to the caller.
#[derive(Debug, Error)]
pub enum NetError {
    /// Frame larger than the protocol maximum
    #[error("message of {size} bytes exceeds limit of {limit}")]
    MsgTooLarge {
        /// Declared payload size
        size: usize,
        /// Protocol maximum
        limit: usize,
    },

    /// Malformed message payload
    #[error("decode: {0}")]
    Decode(#[from] WireError),

    /// Message code outside the protocol range
    #[error("invalid message code {0}")]
    InvalidMsgCode(u64),

    /// Handshake carried a different protocol version
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch {
        /// Our protocol version
        ours: u64,
        /// Version the peer announced
        theirs: u64,
    },

    /// Handshake carried a different network id
    #[error("network id mismatch: ours {ours}, theirs {theirs}")]
    NetworkIdMismatch {
        /// Our network id
        ours: u64,
        /// Network id the peer announced
        theirs: u64,
    },

    /// First message was not a status message
    #[error("no status message received")]
    NoStatusMsg,

    /// Status message repeated after the handshake
    #[error("second status message received")]
    ExtraStatusMsg,

    /// Sync protocol violation
    #[error("sync: {0}")]
    Sync(String),

    /// Payment rejected by the accounting module
    #[error("accounting: {0}")]
    Accounting(String),

    /// Requested chunk could not be found in time
    #[error("chunk not found")]
    NotFound,

    /// Invalid node configuration
    #[error("config: {0}")]
    Config(String),

    /// Chunk or request store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Routing table failure
    #[error(transparent)]
    Kad(#[from] KadError),

    /// Transport failure
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FrameError> for NetError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::TooLarge { size, limit } => NetError::MsgTooLarge { size, limit },
            FrameError::InvalidCode(code) => NetError::InvalidMsgCode(code),
            FrameError::Wire(err) => NetError::Decode(err),
        }
    }
}

/// A non-zero request id. Zero is reserved for lookups.
pub(crate) fn generate_id() -> u64 {
    (rand::random::<u64>() >> 1) + 1
}

/// Current time as unix nanoseconds, the unit request deadlines are
/// exchanged in.
pub(crate) fn unix_now_nanos() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
