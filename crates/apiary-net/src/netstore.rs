//! Chunk storage with network fallback.
//!
//! Wraps the local store and, on a miss, launches a search across the
//! peers closest to the requested key. Incoming retrieve requests are
//! answered from the local store when possible and otherwise recorded
//! and forwarded, so that a later store request for the same key can
//! be routed back to every node still waiting for it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

use apiary_core::identifiers::Key;
use apiary_proto::{PeersMsg, RetrieveRequest, StoreRequest};
use apiary_store::chunk::Chunk;
use apiary_store::local::ChunkStore;

use crate::hive::Hive;
use crate::protocol::BzzPeer;
use crate::{generate_id, unix_now_nanos, NetError};

/// How long a search may run before the requester gives up.
pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(3);

/// How many waiting requesters receive the chunk once it arrives.
const REQUESTER_COUNT: usize = 3;

struct Requester {
    peer: Arc<BzzPeer>,
    req: RetrieveRequest,
}

// a live entry means the chunk is still being searched for; entries
// are removed when the chunk arrives or the last local waiter gives up
struct RequestStatus {
    // remote requesters by the id they used, so deliveries echo it
    requesters: HashMap<u64, Vec<Requester>>,
    found_tx: watch::Sender<bool>,
}

impl RequestStatus {
    fn new() -> Self {
        let (found_tx, _) = watch::channel(false);
        Self {
            requesters: HashMap::new(),
            found_tx,
        }
    }
}

/// The DHT front end: a [`ChunkStore`] view backed by the local store
/// and the swarm behind it.
pub struct NetStore {
    local: Arc<dyn ChunkStore>,
    hive: Arc<Hive>,
    requests: Mutex<HashMap<Key, RequestStatus>>,
}

impl NetStore {
    /// Couples a local store with the hive's peer view.
    pub fn new(local: Arc<dyn ChunkStore>, hive: Arc<Hive>) -> Self {
        Self {
            local,
            hive,
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// Stores locally produced content and pushes it towards the
    /// peers closest to its key.
    pub fn put(&self, chunk: &Chunk) -> Result<(), NetError> {
        self.store_chunk(chunk, None)
    }

    /// Retrieves a chunk, searching the network on a local miss.
    /// Concurrent calls for the same key share one request entry and
    /// wake together when the chunk arrives.
    pub async fn get(&self, key: &Key) -> Result<Chunk, NetError> {
        if let Some(chunk) = self.local.get(key)? {
            return Ok(chunk);
        }

        let mut found_rx = {
            let mut requests = self.requests.lock();
            requests
                .entry(*key)
                .or_insert_with(RequestStatus::new)
                .found_tx
                .subscribe()
        };

        // every miss searches again, so a key that timed out before is
        // retried against the current peer set
        let req = RetrieveRequest {
            key: *key,
            id: generate_id(),
            max_size: 0,
            max_peers: 0,
            timeout: unix_now_nanos() + SEARCH_TIMEOUT.as_nanos() as u64,
        };
        self.start_search(&req);

        let waited = tokio::time::timeout(SEARCH_TIMEOUT, found_rx.wait_for(|found| *found)).await;
        match waited {
            Ok(Ok(_)) => self.local.get(key)?.ok_or(NetError::NotFound),
            _ => {
                drop(waited);
                drop(found_rx);
                let mut requests = self.requests.lock();
                if let Entry::Occupied(slot) = requests.entry(*key) {
                    // keep the entry while remote requesters or other
                    // local waiters still depend on it
                    if slot.get().requesters.is_empty()
                        && slot.get().found_tx.receiver_count() == 0
                    {
                        slot.remove();
                    }
                }
                Err(NetError::NotFound)
            }
        }
    }

    /// Handles chunk data arriving from a peer.
    pub fn add_store_request(&self, req: StoreRequest, from: &Arc<BzzPeer>) -> Result<(), NetError> {
        if self.local.contains(&req.key)? {
            trace!(key = %req.key, "store request for known chunk");
            return Ok(());
        }
        let chunk = Chunk::with_key(req.key, req.sdata);
        if !chunk.verify() {
            debug!(key = %chunk.key, peer = %from.addr(), "dropping chunk with wrong content address");
            return Ok(());
        }
        self.store_chunk(&chunk, Some(from))
    }

    /// Handles a retrieve request from a peer: answer from the local
    /// store, or record the requester and search on its behalf. Either
    /// way the requester learns about closer peers.
    pub fn add_retrieve_request(
        &self,
        req: RetrieveRequest,
        from: &Arc<BzzPeer>,
    ) -> Result<(), NetError> {
        if req.is_lookup() {
            // peer discovery, no chunk wanted
            self.peers_response(&req, from);
            return Ok(());
        }

        if let Some(chunk) = self.local.get(&req.key)? {
            if within_size(&req, &chunk) {
                debug!(key = %req.key, peer = %from.addr(), "delivering chunk");
                from.store(StoreRequest {
                    key: chunk.key,
                    sdata: chunk.sdata,
                    id: req.id,
                });
            } else {
                debug!(key = %req.key, max_size = req.max_size, "chunk exceeds requested size");
                self.peers_response(&req, from);
            }
            return Ok(());
        }

        let mut fwd = req.clone();
        fwd.timeout = search_deadline(req.timeout);
        {
            let mut requests = self.requests.lock();
            requests
                .entry(req.key)
                .or_insert_with(RequestStatus::new)
                .requesters
                .entry(req.id)
                .or_default()
                .push(Requester {
                    peer: from.clone(),
                    req: req.clone(),
                });
        }
        self.start_search(&fwd);
        self.peers_response(&req, from);
        Ok(())
    }

    fn store_chunk(&self, chunk: &Chunk, source: Option<&Arc<BzzPeer>>) -> Result<(), NetError> {
        self.local.put(chunk)?;

        let waiting = {
            let mut requests = self.requests.lock();
            requests.remove(&chunk.key).map(|status| {
                // the value outlives the sender, so waiters that
                // subscribed before the removal still see it
                let _ = status.found_tx.send(true);
                status.requesters
            })
        };

        match waiting {
            Some(requesters) => self.propagate_response(chunk, requesters),
            None => self.store_to_peers(chunk, source),
        }
        Ok(())
    }

    /// Forwards a retrieve request to the peers closest to its key,
    /// skipping peers already waiting on the same key.
    fn start_search(&self, req: &RetrieveRequest) {
        let skip: Vec<_> = {
            let requests = self.requests.lock();
            match requests.get(&req.key) {
                Some(status) => status
                    .requesters
                    .values()
                    .flatten()
                    .map(|r| r.peer.addr())
                    .collect(),
                None => Vec::new(),
            }
        };
        for peer in self.hive.get_peers(req.key, 0) {
            if skip.contains(&peer.addr()) {
                continue;
            }
            trace!(key = %req.key, peer = %peer.addr(), "forwarding retrieve request");
            peer.retrieve(req.clone());
        }
    }

    /// Delivers a freshly found chunk back to the nodes waiting for
    /// it, echoing each requester's own id.
    fn propagate_response(&self, chunk: &Chunk, requesters: HashMap<u64, Vec<Requester>>) {
        let now = unix_now_nanos();
        for (id, waiting) in requesters {
            let msg = StoreRequest {
                key: chunk.key,
                sdata: chunk.sdata.clone(),
                id,
            };
            for requester in waiting.iter().take(REQUESTER_COUNT) {
                if requester.req.expired_at(now) || !within_size(&requester.req, chunk) {
                    continue;
                }
                debug!(key = %chunk.key, peer = %requester.peer.addr(), id, "delivering found chunk");
                requester.peer.store(msg.clone());
            }
        }
    }

    /// Pushes new content towards the peers closest to its key, never
    /// back to where it came from.
    fn store_to_peers(&self, chunk: &Chunk, source: Option<&Arc<BzzPeer>>) {
        for peer in self.hive.get_peers(chunk.key, 0) {
            if let Some(src) = source {
                if src.addr() == peer.addr() {
                    continue;
                }
            }
            peer.propagate(chunk.key);
        }
    }

    /// Answers any retrieve request with peers close to the target.
    /// A zero key asks for the peers closest to the requester itself.
    fn peers_response(&self, req: &RetrieveRequest, from: &Arc<BzzPeer>) {
        if req.expired_at(unix_now_nanos()) {
            return;
        }
        let (target, reply_key) = if req.is_self_lookup() {
            (Key::from(from.addr()), Key::zero())
        } else {
            (req.key, req.key)
        };
        let max = if req.max_peers == 0 {
            usize::MAX
        } else {
            req.max_peers as usize
        };
        let peers: Vec<_> = self
            .hive
            .get_peers(target, max)
            .into_iter()
            .filter(|p| p.addr() != from.addr())
            .map(|p| p.peer_addr())
            .collect();
        trace!(key = %reply_key, peer = %from.addr(), count = peers.len(), "answering with peers");
        from.peers(PeersMsg {
            peers,
            timeout: req.timeout,
            key: reply_key,
            id: req.id,
        });
    }
}

/// A requester advertising a maximum size suppresses bigger chunks.
fn within_size(req: &RetrieveRequest, chunk: &Chunk) -> bool {
    req.max_size == 0 || chunk.sdata.len() as u64 <= req.max_size
}

/// Caps a requester supplied deadline to our own search window.
fn search_deadline(timeout: u64) -> u64 {
    let ours = unix_now_nanos() + SEARCH_TIMEOUT.as_nanos() as u64;
    if timeout == 0 || timeout > ours {
        ours
    } else {
        timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use apiary_core::identifiers::Address;
    use apiary_proto::{Message, PeerAddr};
    use apiary_store::local::LocalStore;

    use crate::hive::HiveParams;
    use crate::protocol::NoopPayment;

    struct Rig {
        _dir: TempDir,
        hive: Arc<Hive>,
        store: Arc<LocalStore>,
        net: NetStore,
    }

    fn rig(own: Address) -> Rig {
        let dir = TempDir::new().unwrap();
        let (dial_tx, _dial_rx) = mpsc::unbounded_channel();
        let hive = Hive::new(
            own,
            HiveParams::default(),
            dir.path().join("peers.json"),
            dial_tx,
            CancellationToken::new(),
        );
        let store = Arc::new(LocalStore::open(&dir.path().join("chunks")).unwrap());
        let net = NetStore::new(store.clone(), hive.clone());
        Rig {
            hive,
            store,
            net,
            _dir: dir,
        }
    }

    fn peer(first_byte: u8) -> (Arc<BzzPeer>, mpsc::UnboundedReceiver<Message>) {
        let mut addr = [0u8; 32];
        addr[0] = first_byte;
        let remote = PeerAddr {
            ip: vec![127, 0, 0, 1],
            port: 8500 + first_byte as u16,
            id: Bytes::from(vec![first_byte; 64]),
            addr: Address::new(addr),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        (
            BzzPeer::new(remote, tx, CancellationToken::new(), Arc::new(NoopPayment)),
            rx,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn chunk(fill: u8) -> Chunk {
        let mut data = 40u64.to_le_bytes().to_vec();
        data.extend_from_slice(&[fill; 32]);
        Chunk::new(Bytes::from(data))
    }

    #[tokio::test]
    async fn self_lookup_answers_with_peers_near_requester() {
        let rig = rig(Address::new([0u8; 32]));
        let (requester, mut req_rx) = peer(0x81);
        let (near, mut near_rx) = peer(0x82);
        rig.hive.add_peer(requester.clone());
        rig.hive.add_peer(near.clone());
        drain(&mut req_rx);
        drain(&mut near_rx);

        let req = RetrieveRequest {
            key: Key::zero(),
            id: 0,
            max_size: 0,
            max_peers: 10,
            timeout: 0,
        };
        rig.net.add_retrieve_request(req, &requester).unwrap();

        let msgs = drain(&mut req_rx);
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            Message::Peers(msg) => {
                assert!(msg.key.is_zero());
                let addrs: Vec<Address> = msg.peers.iter().map(|p| p.addr).collect();
                assert!(addrs.contains(&near.addr()));
                assert!(!addrs.contains(&requester.addr()), "never echo the asker");
            }
            other => panic!("wrong reply: {:?}", other.code()),
        }
    }

    #[tokio::test]
    async fn retrieve_is_forwarded_and_answer_routed_back() {
        let rig = rig(Address::new([0u8; 32]));
        let c = chunk(0x07);
        let (requester, mut req_rx) = peer(0x01);
        let (closer, mut closer_rx) = peer(0x02);
        rig.hive.add_peer(requester.clone());
        rig.hive.add_peer(closer.clone());
        drain(&mut req_rx);
        drain(&mut closer_rx);

        let req = RetrieveRequest {
            key: c.key,
            id: 42,
            max_size: 0,
            max_peers: 10,
            timeout: unix_now_nanos() + SEARCH_TIMEOUT.as_nanos() as u64,
        };
        rig.net.add_retrieve_request(req, &requester).unwrap();

        // the search reaches the other peer but not the requester
        let forwarded = drain(&mut closer_rx);
        assert!(forwarded.iter().any(
            |m| matches!(m, Message::RetrieveRequest(r) if r.key == c.key && r.id != 0)
        ));
        assert!(drain(&mut req_rx)
            .iter()
            .all(|m| matches!(m, Message::Peers(_))));

        // the chunk comes back and is delivered under the original id
        rig.net
            .add_store_request(
                StoreRequest {
                    key: c.key,
                    sdata: c.sdata.clone(),
                    id: 7,
                },
                &closer,
            )
            .unwrap();
        let delivered = drain(&mut req_rx);
        match delivered.as_slice() {
            [Message::StoreRequest(sr)] => {
                assert_eq!(sr.id, 42);
                assert_eq!(sr.sdata, c.sdata);
            }
            other => panic!("expected one delivery, got {} messages", other.len()),
        }
        assert!(rig.store.contains(&c.key).unwrap());
    }

    #[tokio::test]
    async fn lookup_request_yields_peers_not_data() {
        let rig = rig(Address::new([0u8; 32]));
        let c = chunk(0x09);
        rig.store.put(&c).unwrap();
        let (requester, mut req_rx) = peer(0x01);
        rig.hive.add_peer(requester.clone());
        drain(&mut req_rx);

        let req = RetrieveRequest {
            key: c.key,
            id: 0,
            max_size: 0,
            max_peers: 10,
            timeout: 0,
        };
        rig.net.add_retrieve_request(req, &requester).unwrap();

        let msgs = drain(&mut req_rx);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0], Message::Peers(_)));
    }

    #[tokio::test]
    async fn oversized_chunk_is_withheld() {
        let rig = rig(Address::new([0u8; 32]));
        let c = chunk(0x06);
        rig.store.put(&c).unwrap();
        let (requester, mut req_rx) = peer(0x01);
        rig.hive.add_peer(requester.clone());
        drain(&mut req_rx);

        let req = RetrieveRequest {
            key: c.key,
            id: 5,
            max_size: 8,
            max_peers: 10,
            timeout: 0,
        };
        rig.net.add_retrieve_request(req, &requester).unwrap();

        let msgs = drain(&mut req_rx);
        assert!(
            msgs.iter().all(|m| matches!(m, Message::Peers(_))),
            "no delivery for a chunk over the advertised size"
        );
    }

    #[tokio::test]
    async fn mismatched_content_address_is_dropped() {
        let rig = rig(Address::new([0u8; 32]));
        let (sender, _rx) = peer(0x01);
        let c = chunk(0x03);
        rig.net
            .add_store_request(
                StoreRequest {
                    key: Key::new([0xaa; 32]),
                    sdata: c.sdata.clone(),
                    id: 1,
                },
                &sender,
            )
            .unwrap();
        assert!(!rig.store.contains(&Key::new([0xaa; 32])).unwrap());
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_request_entry() {
        let rig = Arc::new(rig(Address::new([0u8; 32])));
        let c = chunk(0x05);

        let a = {
            let rig = rig.clone();
            let key = c.key;
            tokio::spawn(async move { rig.net.get(&key).await })
        };
        let b = {
            let rig = rig.clone();
            let key = c.key;
            tokio::spawn(async move { rig.net.get(&key).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rig.net.requests.lock().len(), 1, "one shared search entry");

        rig.net.put(&c).unwrap();
        assert_eq!(a.await.unwrap().unwrap().key, c.key);
        assert_eq!(b.await.unwrap().unwrap().key, c.key);
    }

    #[tokio::test]
    async fn search_restarts_after_a_timed_out_get() {
        let rig = Arc::new(rig(Address::new([0u8; 32])));
        let c = chunk(0x0b);
        let (holder, mut rx) = peer(0x01);
        rig.hive.add_peer(holder.clone());
        drain(&mut rx);

        tokio::time::pause();
        assert!(matches!(rig.net.get(&c.key).await, Err(NetError::NotFound)));
        assert!(drain(&mut rx)
            .iter()
            .any(|m| matches!(m, Message::RetrieveRequest(r) if r.key == c.key)));
        assert!(
            rig.net.requests.lock().is_empty(),
            "abandoned search is forgotten"
        );

        // the chunk has appeared at the peer in the meantime; a later
        // get must search again and pick it up
        let second = {
            let rig = rig.clone();
            let key = c.key;
            tokio::spawn(async move { rig.net.get(&key).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(drain(&mut rx)
            .iter()
            .any(|m| matches!(m, Message::RetrieveRequest(r) if r.key == c.key)));

        rig.net
            .add_store_request(
                StoreRequest {
                    key: c.key,
                    sdata: c.sdata.clone(),
                    id: 9,
                },
                &holder,
            )
            .unwrap();
        assert_eq!(second.await.unwrap().unwrap().key, c.key);
    }

    #[tokio::test]
    async fn found_chunks_leave_the_request_map() {
        let rig = rig(Address::new([0u8; 32]));
        let c = chunk(0x0c);
        let (requester, mut req_rx) = peer(0x01);
        rig.hive.add_peer(requester.clone());
        drain(&mut req_rx);

        let req = RetrieveRequest {
            key: c.key,
            id: 3,
            max_size: 0,
            max_peers: 10,
            timeout: 0,
        };
        rig.net.add_retrieve_request(req, &requester).unwrap();
        assert_eq!(rig.net.requests.lock().len(), 1);

        rig.net.put(&c).unwrap();
        assert!(
            rig.net.requests.lock().is_empty(),
            "settled entries are dropped"
        );
        assert!(drain(&mut req_rx)
            .iter()
            .any(|m| matches!(m, Message::StoreRequest(sr) if sr.id == 3)));
    }

    #[tokio::test]
    async fn get_times_out_without_an_answer() {
        let rig = rig(Address::new([0u8; 32]));
        let key = Key::new([0x44; 32]);
        tokio::time::pause();
        let res = rig.net.get(&key).await;
        assert!(matches!(res, Err(NetError::NotFound)));
    }
}
