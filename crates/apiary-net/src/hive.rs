//! Peer pool management.
//!
//! The hive owns the routing table and the map from overlay address to
//! live connection handle. A background pinger periodically asks the
//! table for dialling advice and either connects to a known offline
//! node or asks a live peer for addresses in a depleted order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use apiary_core::identifiers::{Address, Key};
use apiary_kad::{DialAdvice, KadParams, Kademlia, NodeRecord};
use apiary_proto::{PeerAddr, RetrieveRequest};

use crate::protocol::BzzPeer;

/// Hive tunables on top of the routing table parameters.
#[derive(Debug, Clone)]
pub struct HiveParams {
    /// How often the pinger looks for a node to dial.
    pub call_interval: Duration,
    /// Routing table parameters.
    pub kad: KadParams,
}

impl Default for HiveParams {
    fn default() -> Self {
        Self {
            call_interval: Duration::from_secs(1),
            kad: KadParams::default(),
        }
    }
}

/// The peer pool. Tracks live connections in the routing table and
/// keeps the table populated by dialling known nodes.
pub struct Hive {
    kad: Kademlia,
    peers: RwLock<HashMap<Address, Arc<BzzPeer>>>,
    ping_tx: mpsc::Sender<()>,
    ping_rx: parking_lot::Mutex<Option<mpsc::Receiver<()>>>,
    dial_tx: mpsc::UnboundedSender<NodeRecord>,
    call_interval: Duration,
    cancel: CancellationToken,
    path: PathBuf,
}

impl Hive {
    /// Creates the hive around a routing table persisted at `path`.
    /// Records to dial are handed to `dial_tx`.
    pub fn new(
        addr: Address,
        params: HiveParams,
        path: PathBuf,
        dial_tx: mpsc::UnboundedSender<NodeRecord>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (ping_tx, ping_rx) = mpsc::channel(1);
        Arc::new(Self {
            kad: Kademlia::new(addr, params.kad),
            peers: RwLock::new(HashMap::new()),
            ping_tx,
            ping_rx: parking_lot::Mutex::new(Some(ping_rx)),
            dial_tx,
            call_interval: params.call_interval,
            cancel,
            path,
        })
    }

    /// Loads the persisted node records and starts the pinger.
    pub fn start(self: &Arc<Self>) {
        if let Err(err) = self.kad.load(&self.path) {
            warn!(%err, path = %self.path.display(), "could not load node records, starting empty");
        } else {
            info!(records = self.kad.db_count(), "node records loaded");
        }

        let hive = self.clone();
        let mut ping_rx = self
            .ping_rx
            .lock()
            .take()
            .expect("hive started twice");
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(hive.call_interval);
            loop {
                tokio::select! {
                    _ = hive.cancel.cancelled() => return,
                    _ = tick.tick() => {
                        if hive.kad.db_count() > 0 {
                            hive.step();
                        }
                    }
                    Some(()) = ping_rx.recv() => hive.step(),
                }
            }
        });
    }

    /// One round of connection upkeep.
    fn step(&self) {
        match self.kad.find_best() {
            DialAdvice::Dial(record) => {
                debug!(peer = %record.addr, url = %record.url, "dialling known node");
                let _ = self.dial_tx.send(record);
            }
            DialAdvice::NeedPeers(order) => self.ask_for_peers(order),
            DialAdvice::Saturated => {}
        }
    }

    /// Asks a live peer for addresses around a depleted proximity
    /// order, using a lookup retrieve request.
    fn ask_for_peers(&self, order: usize) {
        let target = self.kad.addr().random_address_at(order);
        let Some(peer) = self.get_peers(Key::from(target), 1).into_iter().next() else {
            return;
        };
        debug!(order, peer = %peer.addr(), "asking for peers");
        peer.retrieve(RetrieveRequest {
            key: Key::from(target),
            id: 0,
            max_size: 0,
            max_peers: self.kad.params().bucket_size as u64,
            timeout: 0,
        });
    }

    /// Registers a live connection. Returns the sync state blob
    /// persisted when this peer last disconnected, if any.
    pub fn add_peer(&self, peer: Arc<BzzPeer>) -> Option<serde_json::Value> {
        self.peers.write().insert(peer.addr(), peer.clone());
        let meta = self.kad.add_peer(peer.clone());

        // ask the new peer for nodes near our own address
        peer.retrieve(RetrieveRequest {
            key: Key::zero(),
            id: 0,
            max_size: 0,
            max_peers: self.kad.params().bucket_size as u64,
            timeout: 0,
        });
        self.ping();
        meta
    }

    /// Deregisters a dropped connection, persisting its sync state
    /// into the node record for the next session.
    pub fn remove_peer(&self, peer: &BzzPeer) {
        self.peers.write().remove(&peer.addr());
        self.kad.remove_peer(peer.addr(), peer.sync_state_json());
        self.ping();
    }

    /// Live peers closest to `target`, nearest first. `max == 0`
    /// returns the whole most proximate bin.
    pub fn get_peers(&self, target: Key, max: usize) -> Vec<Arc<BzzPeer>> {
        let handles = self.peers.read();
        self.kad
            .find_closest(Address::from(target), max)
            .into_iter()
            .filter_map(|p| handles.get(&p.addr()).cloned())
            .collect()
    }

    /// Merges peer addresses learned from the network into the node
    /// record database, skipping our own.
    pub fn add_peer_entries(&self, entries: &[PeerAddr]) {
        let own = self.kad.addr();
        let records: Vec<NodeRecord> = entries
            .iter()
            .filter(|e| e.addr != own && !e.is_unspecified())
            .map(|e| NodeRecord::new(e.addr, e.url()))
            .collect();
        if !records.is_empty() {
            debug!(count = records.len(), "adding node records");
            self.kad.add_records(records);
            self.ping();
        }
    }

    /// Nudges the pinger outside its regular interval.
    pub fn ping(&self) {
        let _ = self.ping_tx.try_send(());
    }

    /// Persists the node records and stops the pinger.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Err(err) = self.kad.save(&self.path) {
            warn!(%err, path = %self.path.display(), "could not save node records");
        } else {
            info!(records = self.kad.db_count(), "node records saved");
        }
    }

    /// The underlying routing table.
    pub fn kad(&self) -> &Kademlia {
        &self.kad
    }
}
