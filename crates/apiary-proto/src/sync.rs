//! Sync state shared between a node and one peer.
//!
//! The state travels on the wire in sync requests and unsynced-keys
//! messages, and is persisted as JSON in the peer's node record when
//! the connection drops, so the next session resumes where this one
//! stopped.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use apiary_core::identifiers::Key;
use apiary_core::wire::{WireDecode, WireEncode, WireError};

/// Db store cursor for a key range.
///
/// `start` and `stop` bound the key space section the peer is
/// responsible for, `first` and `last` bound the store's insertion
/// counter interval still to be walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbSyncState {
    /// Inclusive lower bound of the key range
    pub start: Key,
    /// Inclusive upper bound of the key range
    pub stop: Key,
    /// First insertion counter value to sync
    pub first: u64,
    /// Last insertion counter value to sync
    pub last: u64,
}

impl WireEncode for DbSyncState {
    fn encode(&self, buf: &mut BytesMut) {
        self.start.encode(buf);
        self.stop.encode(buf);
        self.first.encode(buf);
        self.last.encode(buf);
    }
}

impl WireDecode for DbSyncState {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            start: Key::decode(buf)?,
            stop: Key::decode(buf)?,
            first: u64::decode(buf)?,
            last: u64::decode(buf)?,
        })
    }
}

/// Full per-peer sync state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    /// Store cursor for the history still owed to the peer
    #[serde(flatten)]
    pub db: DbSyncState,
    /// Insertion counter at session start, keys at or after it are
    /// relayed live rather than via history
    pub session_at: u64,
    /// Insertion counter when unsynced keys were last sent
    pub last_seen_at: u64,
    /// Last key handed to the session from history iteration
    pub latest: Key,
    /// True once all history up to `session_at` has been offered
    pub synced: bool,
}

impl SyncState {
    /// State for a peer never synced with before.
    ///
    /// The whole current store content, counters `0..=count - 1`, is
    /// history; everything from `count` on is relayed live.
    pub fn new(start: Key, stop: Key, count: u64) -> Self {
        Self {
            db: DbSyncState {
                start,
                stop,
                first: 0,
                last: count.saturating_sub(1),
            },
            session_at: count,
            last_seen_at: 0,
            latest: Key::zero(),
            synced: false,
        }
    }
}

impl WireEncode for SyncState {
    fn encode(&self, buf: &mut BytesMut) {
        self.db.encode(buf);
        self.session_at.encode(buf);
        self.last_seen_at.encode(buf);
        self.latest.encode(buf);
        (self.synced as u8).encode(buf);
    }
}

impl WireDecode for SyncState {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            db: DbSyncState::decode(buf)?,
            session_at: u64::decode(buf)?,
            last_seen_at: u64::decode(buf)?,
            latest: Key::decode(buf)?,
            synced: u8::decode(buf)? != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_bounds() {
        let state = SyncState::new(Key::zero(), Key::new([0xff; 32]), 10);
        assert_eq!(state.db.first, 0);
        assert_eq!(state.db.last, 9);
        assert_eq!(state.session_at, 10);
        assert!(!state.synced);
        assert!(state.latest.is_zero());
    }

    #[test]
    fn fresh_state_on_empty_store() {
        let state = SyncState::new(Key::zero(), Key::zero(), 0);
        assert_eq!(state.db.last, 0);
        assert_eq!(state.session_at, 0);
    }

    #[test]
    fn wire_roundtrip_keeps_session_fields() {
        let mut state = SyncState::new(Key::new([1; 32]), Key::new([2; 32]), 42);
        state.last_seen_at = 40;
        state.latest = Key::new([7; 32]);
        state.synced = true;
        let decoded = SyncState::from_bytes(&state.to_bytes()).unwrap();
        assert_eq!(decoded.db, state.db);
        assert_eq!(decoded.last_seen_at, 40);
        assert_eq!(decoded.latest, state.latest);
        assert!(decoded.synced);
    }

    #[test]
    fn json_roundtrip_for_record_meta() {
        let state = SyncState::new(Key::new([3; 32]), Key::new([4; 32]), 5);
        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("start").is_some());
        assert!(json.get("session_at").is_some());
        let back: SyncState = serde_json::from_value(json).unwrap();
        assert_eq!(back.db, state.db);
        assert_eq!(back.session_at, 5);
    }
}
