//! Message types exchanged between overlay nodes.
//!
//! Eight message codes cover the handshake, chunk storage and
//! retrieval, peer exchange, synchronisation and payment. A connection
//! starts with exactly one status message in each direction; every
//! other code is only valid after the handshake completed.

use bytes::{Bytes, BytesMut};

use apiary_core::identifiers::{Address, Key};
use apiary_core::wire::{WireDecode, WireEncode, WireError};

use crate::sync::SyncState;
use crate::Priority;

/// Message code carried on the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum MsgCode {
    /// Handshake, first and only once per direction
    Status = 0,
    /// Push chunk data, also used for deliveries
    StoreRequest = 1,
    /// Ask for a chunk, or for peers when used as a lookup
    RetrieveRequest = 2,
    /// Peer addresses relevant to a retrieve request
    Peers = 3,
    /// Start the sync protocol, carries a resumed state if any
    SyncRequest = 4,
    /// Request delivery of previously offered keys
    DeliveryRequest = 5,
    /// Offer keys the remote has not seen yet
    UnsyncedKeys = 6,
    /// Settlement for delivered chunks
    Payment = 7,
}

impl MsgCode {
    /// Returns the wire tag.
    pub fn tag(&self) -> u64 {
        *self as u64
    }

    /// Creates from a wire tag.
    pub fn from_tag(tag: u64) -> Result<Self, WireError> {
        match tag {
            0 => Ok(MsgCode::Status),
            1 => Ok(MsgCode::StoreRequest),
            2 => Ok(MsgCode::RetrieveRequest),
            3 => Ok(MsgCode::Peers),
            4 => Ok(MsgCode::SyncRequest),
            5 => Ok(MsgCode::DeliveryRequest),
            6 => Ok(MsgCode::UnsyncedKeys),
            7 => Ok(MsgCode::Payment),
            _ => Err(WireError::InvalidTag(tag)),
        }
    }
}

/// Transport address and identity of a node.
///
/// The overlay address is derived from the public key, so `addr` is
/// redundant on the wire but kept for cheap verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    /// IP octets, 4 for v4 or 16 for v6
    pub ip: Vec<u8>,
    /// TCP listening port
    pub port: u16,
    /// Transport public key, 64 bytes
    pub id: Bytes,
    /// Overlay address
    pub addr: Address,
}

impl PeerAddr {
    /// Creates an address record, deriving the overlay address from `id`.
    pub fn new(ip: Vec<u8>, port: u16, id: Bytes) -> Self {
        let addr = Address::from_public_key(&id);
        Self { ip, port, id, addr }
    }

    /// True when the IP field is all zeros and must be repaired from
    /// the transport connection.
    pub fn is_unspecified(&self) -> bool {
        self.ip.iter().all(|b| *b == 0)
    }

    /// Formats as `host:port` for dialling.
    pub fn url(&self) -> String {
        match self.ip.len() {
            4 => format!("{}.{}.{}.{}:{}", self.ip[0], self.ip[1], self.ip[2], self.ip[3], self.port),
            _ => {
                let mut segs = Vec::with_capacity(8);
                for pair in self.ip.chunks(2) {
                    segs.push(format!("{:x}", (u16::from(pair[0]) << 8) | u16::from(pair[1])));
                }
                format!("[{}]:{}", segs.join(":"), self.port)
            }
        }
    }
}

impl WireEncode for PeerAddr {
    fn encode(&self, buf: &mut BytesMut) {
        self.ip.encode(buf);
        self.port.encode(buf);
        self.id.encode(buf);
        self.addr.encode(buf);
    }
}

impl WireDecode for PeerAddr {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let ip = Vec::<u8>::decode(buf)?;
        if ip.len() != 4 && ip.len() != 16 {
            return Err(WireError::OutOfRange(format!(
                "ip must be 4 or 16 octets, got {}",
                ip.len()
            )));
        }
        let port = u16::decode(buf)?;
        let id = Bytes::decode(buf)?;
        if id.len() != 64 {
            return Err(WireError::OutOfRange(format!(
                "node id must be 64 bytes, got {}",
                id.len()
            )));
        }
        let addr = Address::decode(buf)?;
        Ok(Self { ip, port, id, addr })
    }
}

/// Pricing and settlement terms advertised in the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapProfile {
    /// Price offered for a delivered chunk
    pub buy_at: u64,
    /// Price asked for a delivered chunk
    pub sell_at: u64,
    /// Number of units after which payment is expected
    pub pay_at: u64,
    /// Settlement beneficiary
    pub beneficiary: [u8; 20],
}

impl WireEncode for SwapProfile {
    fn encode(&self, buf: &mut BytesMut) {
        self.buy_at.encode(buf);
        self.sell_at.encode(buf);
        self.pay_at.encode(buf);
        self.beneficiary.encode(buf);
    }
}

impl WireDecode for SwapProfile {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            buy_at: u64::decode(buf)?,
            sell_at: u64::decode(buf)?,
            pay_at: u64::decode(buf)?,
            beneficiary: <[u8; 20]>::decode(buf)?,
        })
    }
}

/// Handshake message, code 0.
#[derive(Debug, Clone)]
pub struct StatusMsg {
    /// Protocol version, must match on both sides
    pub version: u64,
    /// Client name and build, informational only
    pub id: String,
    /// Sender's own address record
    pub addr: PeerAddr,
    /// Settlement terms, absent when accounting is disabled
    pub swap: Option<SwapProfile>,
    /// Network identifier, must match on both sides
    pub network_id: u64,
}

impl WireEncode for StatusMsg {
    fn encode(&self, buf: &mut BytesMut) {
        self.version.encode(buf);
        self.id.encode(buf);
        self.addr.encode(buf);
        self.swap.encode(buf);
        self.network_id.encode(buf);
    }
}

impl WireDecode for StatusMsg {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            version: u64::decode(buf)?,
            id: String::decode(buf)?,
            addr: PeerAddr::decode(buf)?,
            swap: Option::<SwapProfile>::decode(buf)?,
            network_id: u64::decode(buf)?,
        })
    }
}

/// Chunk data push, code 1.
///
/// Serves three roles: forwarding propagation, delivery in response to
/// a retrieve request (matching `id`), and sync deliveries.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    /// Content address of the chunk
    pub key: Key,
    /// Chunk payload, first 8 bytes encode the subtree size
    pub sdata: Bytes,
    /// Request id, echoes the retrieve request id for deliveries
    pub id: u64,
}

impl WireEncode for StoreRequest {
    fn encode(&self, buf: &mut BytesMut) {
        self.key.encode(buf);
        self.sdata.encode(buf);
        self.id.encode(buf);
    }
}

impl WireDecode for StoreRequest {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            key: Key::decode(buf)?,
            sdata: Bytes::decode(buf)?,
            id: u64::decode(buf)?,
        })
    }
}

/// Chunk retrieval request, code 2.
#[derive(Debug, Clone)]
pub struct RetrieveRequest {
    /// Content address, zero for a self lookup
    pub key: Key,
    /// Request id, zero marks a lookup that expects no chunk back
    pub id: u64,
    /// Largest chunk size the requester accepts, zero for no limit
    pub max_size: u64,
    /// Cap on the peers message sent in response
    pub max_peers: u64,
    /// Unix nanoseconds after which a response is useless, zero for none
    pub timeout: u64,
}

impl RetrieveRequest {
    /// Lookups only ask for peer addresses, never for the chunk itself.
    pub fn is_lookup(&self) -> bool {
        self.id == 0
    }

    /// Self lookups carry a zero key and stand for the requester's own
    /// overlay address.
    pub fn is_self_lookup(&self) -> bool {
        self.key.is_zero()
    }

    /// True when the deadline passed at `now` (unix nanoseconds).
    pub fn expired_at(&self, now: u64) -> bool {
        self.timeout != 0 && self.timeout <= now
    }
}

impl WireEncode for RetrieveRequest {
    fn encode(&self, buf: &mut BytesMut) {
        self.key.encode(buf);
        self.id.encode(buf);
        self.max_size.encode(buf);
        self.max_peers.encode(buf);
        self.timeout.encode(buf);
    }
}

impl WireDecode for RetrieveRequest {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            key: Key::decode(buf)?,
            id: u64::decode(buf)?,
            max_size: u64::decode(buf)?,
            max_peers: u64::decode(buf)?,
            timeout: u64::decode(buf)?,
        })
    }
}

/// Peer addresses close to a requested key, code 3.
#[derive(Debug, Clone)]
pub struct PeersMsg {
    /// Address records, closest first
    pub peers: Vec<PeerAddr>,
    /// Unix nanoseconds validity promise, zero for none
    pub timeout: u64,
    /// Key the peers are close to, zero when answering a self lookup
    pub key: Key,
    /// Id of the retrieve request this answers
    pub id: u64,
}

impl WireEncode for PeersMsg {
    fn encode(&self, buf: &mut BytesMut) {
        self.peers.encode(buf);
        self.timeout.encode(buf);
        self.key.encode(buf);
        self.id.encode(buf);
    }
}

impl WireDecode for PeersMsg {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            peers: Vec::<PeerAddr>::decode(buf)?,
            timeout: u64::decode(buf)?,
            key: Key::decode(buf)?,
            id: u64::decode(buf)?,
        })
    }
}

/// Sync start request, code 4.
///
/// Carries the state persisted at the end of the previous session, or
/// nothing for a first encounter.
#[derive(Debug, Clone, Default)]
pub struct SyncRequestMsg {
    /// Resumed sync state, if any
    pub state: Option<SyncState>,
}

impl WireEncode for SyncRequestMsg {
    fn encode(&self, buf: &mut BytesMut) {
        self.state.encode(buf);
    }
}

impl WireDecode for SyncRequestMsg {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            state: Option::<SyncState>::decode(buf)?,
        })
    }
}

/// One key offered or requested during sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    /// Content address of the chunk
    pub key: Key,
    /// Delivery priority
    pub priority: Priority,
}

impl WireEncode for SyncRequest {
    fn encode(&self, buf: &mut BytesMut) {
        self.key.encode(buf);
        self.priority.tag().encode(buf);
    }
}

impl WireDecode for SyncRequest {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let key = Key::decode(buf)?;
        let tag = u8::decode(buf)?;
        let priority =
            Priority::from_tag(tag).ok_or(WireError::InvalidTag(u64::from(tag)))?;
        Ok(Self { key, priority })
    }
}

/// Request to deliver offered keys, code 5.
#[derive(Debug, Clone, Default)]
pub struct DeliveryRequestMsg {
    /// Keys the sender wants delivered, with their priorities
    pub deliver: Vec<SyncRequest>,
}

impl WireEncode for DeliveryRequestMsg {
    fn encode(&self, buf: &mut BytesMut) {
        self.deliver.encode(buf);
    }
}

impl WireDecode for DeliveryRequestMsg {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            deliver: Vec::<SyncRequest>::decode(buf)?,
        })
    }
}

/// Batch of keys the remote may not have yet, code 6.
#[derive(Debug, Clone)]
pub struct UnsyncedKeysMsg {
    /// Offered keys, may be empty to report sync progress only
    pub unsynced: Vec<SyncRequest>,
    /// Sender's current sync state for this peer
    pub state: SyncState,
}

impl WireEncode for UnsyncedKeysMsg {
    fn encode(&self, buf: &mut BytesMut) {
        self.unsynced.encode(buf);
        self.state.encode(buf);
    }
}

impl WireDecode for UnsyncedKeysMsg {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            unsynced: Vec::<SyncRequest>::decode(buf)?,
            state: SyncState::decode(buf)?,
        })
    }
}

/// Settlement message, code 7.
#[derive(Debug, Clone)]
pub struct PaymentMsg {
    /// Number of chunk deliveries the payment covers
    pub units: u64,
    /// Opaque signed promise
    pub promise: Bytes,
}

impl WireEncode for PaymentMsg {
    fn encode(&self, buf: &mut BytesMut) {
        self.units.encode(buf);
        self.promise.encode(buf);
    }
}

impl WireDecode for PaymentMsg {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            units: u64::decode(buf)?,
            promise: Bytes::decode(buf)?,
        })
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone)]
pub enum Message {
    /// Handshake
    Status(StatusMsg),
    /// Chunk push or delivery
    StoreRequest(StoreRequest),
    /// Chunk or peer lookup
    RetrieveRequest(RetrieveRequest),
    /// Peer addresses
    Peers(PeersMsg),
    /// Sync start
    SyncRequest(SyncRequestMsg),
    /// Delivery request
    DeliveryRequest(DeliveryRequestMsg),
    /// Key offer
    UnsyncedKeys(UnsyncedKeysMsg),
    /// Settlement
    Payment(PaymentMsg),
}

impl Message {
    /// Returns the message code.
    pub fn code(&self) -> MsgCode {
        match self {
            Message::Status(_) => MsgCode::Status,
            Message::StoreRequest(_) => MsgCode::StoreRequest,
            Message::RetrieveRequest(_) => MsgCode::RetrieveRequest,
            Message::Peers(_) => MsgCode::Peers,
            Message::SyncRequest(_) => MsgCode::SyncRequest,
            Message::DeliveryRequest(_) => MsgCode::DeliveryRequest,
            Message::UnsyncedKeys(_) => MsgCode::UnsyncedKeys,
            Message::Payment(_) => MsgCode::Payment,
        }
    }

    /// Encodes the payload without the frame header.
    pub fn encode_payload(&self) -> Bytes {
        match self {
            Message::Status(m) => m.to_bytes(),
            Message::StoreRequest(m) => m.to_bytes(),
            Message::RetrieveRequest(m) => m.to_bytes(),
            Message::Peers(m) => m.to_bytes(),
            Message::SyncRequest(m) => m.to_bytes(),
            Message::DeliveryRequest(m) => m.to_bytes(),
            Message::UnsyncedKeys(m) => m.to_bytes(),
            Message::Payment(m) => m.to_bytes(),
        }
    }

    /// Decodes a payload for the given code.
    pub fn decode_payload(code: MsgCode, payload: &[u8]) -> Result<Self, WireError> {
        Ok(match code {
            MsgCode::Status => Message::Status(StatusMsg::from_bytes(payload)?),
            MsgCode::StoreRequest => Message::StoreRequest(StoreRequest::from_bytes(payload)?),
            MsgCode::RetrieveRequest => {
                Message::RetrieveRequest(RetrieveRequest::from_bytes(payload)?)
            }
            MsgCode::Peers => Message::Peers(PeersMsg::from_bytes(payload)?),
            MsgCode::SyncRequest => Message::SyncRequest(SyncRequestMsg::from_bytes(payload)?),
            MsgCode::DeliveryRequest => {
                Message::DeliveryRequest(DeliveryRequestMsg::from_bytes(payload)?)
            }
            MsgCode::UnsyncedKeys => Message::UnsyncedKeys(UnsyncedKeysMsg::from_bytes(payload)?),
            MsgCode::Payment => Message::Payment(PaymentMsg::from_bytes(payload)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_peer_addr() -> PeerAddr {
        PeerAddr::new(vec![10, 0, 0, 7], 30399, Bytes::from(vec![0x42; 64]))
    }

    #[test]
    fn status_roundtrip() {
        let msg = StatusMsg {
            version: 0,
            id: "apiary/v0.1.0".to_string(),
            addr: sample_peer_addr(),
            swap: None,
            network_id: 322,
        };
        let decoded = StatusMsg::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(decoded.version, 0);
        assert_eq!(decoded.network_id, 322);
        assert_eq!(decoded.addr, msg.addr);
        assert!(decoded.swap.is_none());
    }

    #[test]
    fn peer_addr_derives_overlay_address() {
        let pa = sample_peer_addr();
        assert_eq!(pa.addr, Address::from_public_key(&pa.id));
        assert_eq!(pa.url(), "10.0.0.7:30399");
    }

    #[test]
    fn peer_addr_rejects_bad_ip_length() {
        let mut buf = BytesMut::new();
        vec![1u8, 2, 3].encode(&mut buf);
        30399u16.encode(&mut buf);
        Bytes::from(vec![0u8; 64]).encode(&mut buf);
        Address::zero().encode(&mut buf);
        assert!(matches!(
            PeerAddr::from_bytes(&buf.freeze()),
            Err(WireError::OutOfRange(_))
        ));
    }

    #[test]
    fn unspecified_ip_is_detected() {
        let pa = PeerAddr::new(vec![0, 0, 0, 0], 30399, Bytes::from(vec![1u8; 64]));
        assert!(pa.is_unspecified());
        assert!(!sample_peer_addr().is_unspecified());
    }

    #[test]
    fn retrieve_request_lookup_flags() {
        let lookup = RetrieveRequest {
            key: Key::zero(),
            id: 0,
            max_size: 0,
            max_peers: 5,
            timeout: 0,
        };
        assert!(lookup.is_lookup());
        assert!(lookup.is_self_lookup());

        let real = RetrieveRequest {
            key: Key::new([1u8; 32]),
            id: 77,
            max_size: 0,
            max_peers: 5,
            timeout: 0,
        };
        assert!(!real.is_lookup());
        assert!(!real.is_self_lookup());
        assert!(!real.expired_at(u64::MAX));
    }

    #[test]
    fn sync_request_rejects_unknown_priority() {
        let mut buf = BytesMut::new();
        Key::new([9u8; 32]).encode(&mut buf);
        3u8.encode(&mut buf);
        assert!(matches!(
            SyncRequest::from_bytes(&buf.freeze()),
            Err(WireError::InvalidTag(3))
        ));
    }

    #[test]
    fn message_dispatch_roundtrip() {
        let msg = Message::RetrieveRequest(RetrieveRequest {
            key: Key::new([3u8; 32]),
            id: 9,
            max_size: 4096,
            max_peers: 10,
            timeout: 0,
        });
        let payload = msg.encode_payload();
        let decoded = Message::decode_payload(msg.code(), &payload).unwrap();
        match decoded {
            Message::RetrieveRequest(r) => {
                assert_eq!(r.id, 9);
                assert_eq!(r.max_size, 4096);
            }
            other => panic!("wrong variant: {:?}", other.code()),
        }
    }

    #[test]
    fn msg_code_tags_are_stable() {
        for (code, tag) in [
            (MsgCode::Status, 0),
            (MsgCode::StoreRequest, 1),
            (MsgCode::RetrieveRequest, 2),
            (MsgCode::Peers, 3),
            (MsgCode::SyncRequest, 4),
            (MsgCode::DeliveryRequest, 5),
            (MsgCode::UnsyncedKeys, 6),
            (MsgCode::Payment, 7),
        ] {
            assert_eq!(code.tag(), tag);
            assert_eq!(MsgCode::from_tag(tag).unwrap(), code);
        }
        assert!(MsgCode::from_tag(8).is_err());
    }
}
