//! Apiary Proto - wire protocol for the apiary overlay.
//!
//! Defines the eight message types nodes exchange over a connection,
//! the frame format carrying them, and the sync state record that
//! drives per-peer synchronisation of stored chunks.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod frame;
pub mod messages;
pub mod sync;

pub use frame::{Frame, FrameError};
pub use messages::{
    DeliveryRequestMsg, Message, MsgCode, PaymentMsg, PeerAddr, PeersMsg, RetrieveRequest,
    StatusMsg, StoreRequest, SwapProfile, SyncRequest, SyncRequestMsg, UnsyncedKeysMsg,
};
pub use sync::{DbSyncState, SyncState};

/// Protocol version advertised in the status handshake.
pub const PROTOCOL_VERSION: u64 = 0;

/// Network identifier advertised in the status handshake.
pub const NETWORK_ID: u64 = 322;

/// Upper bound on the encoded size of a single message payload.
pub const MAX_MSG_SIZE: usize = 10 * 1024 * 1024;

/// Number of delivery priorities.
pub const PRIORITIES: usize = 3;

/// Delivery priority carried by sync requests. Higher is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    /// Background sync traffic
    Low = 0,
    /// Propagation traffic
    Medium = 1,
    /// Direct deliveries to a requesting peer
    High = 2,
}

impl Priority {
    /// Creates from the wire value.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Priority::Low),
            1 => Some(Priority::Medium),
            2 => Some(Priority::High),
            _ => None,
        }
    }

    /// Returns the wire value.
    pub fn tag(&self) -> u8 {
        *self as u8
    }
}
