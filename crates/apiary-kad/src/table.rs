//! The proximity table of live peers.
//!
//! Live peers sit in `MaxProx + 1` buckets indexed by proximity order
//! to the local address. The dynamic proximity limit marks where the
//! "most proximate bin" begins: buckets at or above the limit are
//! served together as one neighbourhood.

use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use apiary_core::Address;

use crate::kaddb::{DialAdvice, KadDb, NodeRecord};
use crate::KadError;

/// Capabilities the routing table needs from a connected peer.
pub trait Peer: Send + Sync {
    /// Overlay address.
    fn addr(&self) -> Address;
    /// Dial url to reach the peer again.
    fn url(&self) -> String;
    /// Last observed activity, used to pick eviction victims.
    fn last_active(&self) -> Instant;
    /// Ask the peer to disconnect.
    fn disconnect(&self);
}

/// Routing table tunables.
#[derive(Debug, Clone)]
pub struct KadParams {
    /// Highest distinct proximity order; closer peers share the last bucket.
    pub max_prox: usize,
    /// Live peer capacity of each bucket.
    pub bucket_size: usize,
    /// Fill target served first by the dialer.
    pub min_bucket_size: usize,
    /// Target population of the most proximate bin.
    pub prox_bin_size: usize,
    /// Idle time after which offline records are purged.
    pub purge_interval: Duration,
    /// First retry delay for a failed dial.
    pub initial_retry_interval: Duration,
    /// Multiplier applied to the retry delay on each failure.
    pub conn_retry_exp: u64,
}

impl Default for KadParams {
    fn default() -> Self {
        Self {
            max_prox: 255,
            bucket_size: 20,
            min_bucket_size: 1,
            prox_bin_size: 20,
            purge_interval: Duration::from_secs(42 * 3600),
            initial_retry_interval: Duration::from_secs(4),
            conn_retry_exp: 2,
        }
    }
}

struct Bucket {
    nodes: Vec<Arc<dyn Peer>>,
}

struct Table {
    buckets: Vec<Bucket>,
    prox_limit: usize,
    prox_size: usize,
    count: usize,
}

/// The routing table: live buckets plus the offline record database.
///
/// The two halves are locked independently so dialer decisions never
/// block peer add/remove.
pub struct Kademlia {
    addr: Address,
    params: KadParams,
    table: RwLock<Table>,
    db: RwLock<KadDb>,
}

impl Kademlia {
    /// Creates an empty table for the given self address.
    pub fn new(addr: Address, params: KadParams) -> Self {
        let mut buckets = Vec::with_capacity(params.max_prox + 1);
        buckets.resize_with(params.max_prox + 1, || Bucket { nodes: Vec::new() });
        let db = KadDb::new(addr, &params);
        Self {
            addr,
            params,
            table: RwLock::new(Table {
                buckets,
                prox_limit: 0,
                prox_size: 0,
                count: 0,
            }),
            db: RwLock::new(db),
        }
    }

    /// The local overlay address.
    pub fn addr(&self) -> Address {
        self.addr
    }

    /// The table parameters.
    pub fn params(&self) -> &KadParams {
        &self.params
    }

    /// Number of live peers.
    pub fn count(&self) -> usize {
        self.table.read().count
    }

    /// Number of known offline records.
    pub fn db_count(&self) -> usize {
        self.db.read().count()
    }

    /// Current proximity limit.
    pub fn prox_limit(&self) -> usize {
        self.table.read().prox_limit
    }

    fn prox_bin(&self, addr: &Address) -> usize {
        self.addr.proximity(addr).min(self.params.max_prox)
    }

    /// Registers a live peer. Re-adding an address replaces the stored
    /// handle; a full bucket evicts its least recently active peer.
    /// Returns the meta blob persisted for this peer, if any.
    pub fn add_peer(&self, peer: Arc<dyn Peer>) -> Option<serde_json::Value> {
        let addr = peer.addr();
        let url = peer.url();
        let index = self.prox_bin(&addr);
        {
            let mut t = self.table.write();
            let bucket = &mut t.buckets[index];
            if let Some(pos) = bucket.nodes.iter().position(|n| n.addr() == addr) {
                bucket.nodes[pos] = peer;
            } else if bucket.nodes.len() >= self.params.bucket_size {
                let pos = worst_position(&bucket.nodes);
                let dropped = std::mem::replace(&mut bucket.nodes[pos], peer);
                debug!(peer = %addr, evicted = %dropped.addr(), order = index, "bucket full, evicting");
                dropped.disconnect();
            } else {
                bucket.nodes.push(peer);
                t.count += 1;
                t.adjust_prox_more(index, &self.params);
                debug!(peer = %addr, order = index, prox_limit = t.prox_limit, "peer added");
            }
        }
        self.db.write().mark_online(addr, url)
    }

    /// Takes a peer offline, persisting `meta` into its record. Absent
    /// addresses are ignored.
    pub fn remove_peer(&self, addr: Address, meta: Option<serde_json::Value>) {
        let index = self.prox_bin(&addr);
        let found = {
            let mut t = self.table.write();
            let bucket = &mut t.buckets[index];
            match bucket.nodes.iter().position(|n| n.addr() == addr) {
                Some(pos) => {
                    bucket.nodes.remove(pos);
                    t.count -= 1;
                    t.adjust_prox_less(index, &self.params);
                    debug!(peer = %addr, order = index, prox_limit = t.prox_limit, "peer removed");
                    true
                }
                None => false,
            }
        };
        if found {
            self.db.write().mark_offline(addr, meta);
        }
    }

    /// Returns up to `max` live peers ordered by ascending XOR distance
    /// to `target`. With `max == 0` the whole most proximate bin is
    /// returned instead.
    pub fn find_closest(&self, target: Address, max: usize) -> Vec<Arc<dyn Peer>> {
        let t = self.table.read();
        let mut index = self.prox_bin(&target);
        let mut start = index;
        let mut down = false;
        if index >= t.prox_limit {
            index = t.prox_limit;
            start = self.params.max_prox;
            down = true;
        }
        let limit = if max == 0 { usize::MAX } else { max };

        let mut result: Vec<Arc<dyn Peer>> = Vec::new();
        let mut n = 0usize;
        loop {
            for node in &t.buckets[start].nodes {
                push_by_distance(&mut result, &target, node.clone(), limit);
                n += 1;
            }
            if max == 0 && start <= index && (n > 0 || start == 0) {
                break;
            }
            if max > 0 && down && start <= index && (n >= limit || n == t.count || start == 0) {
                break;
            }
            if down {
                start -= 1;
            } else if start == self.params.max_prox {
                if index == 0 {
                    break;
                }
                start = index - 1;
                down = true;
            } else {
                start += 1;
            }
        }
        result
    }

    /// Advises the connection manager which record to dial next.
    pub fn find_best(&self) -> DialAdvice {
        let live_counts: Vec<usize> = {
            let t = self.table.read();
            t.buckets.iter().map(|b| b.nodes.len()).collect()
        };
        self.db.write().find_best(
            &live_counts,
            self.params.min_bucket_size,
            self.params.bucket_size,
        )
    }

    /// The inclusive bounds of the key interval both we and `peer` are
    /// responsible for: the shared prefix extended by one bit of the
    /// peer, padded with zeros and ones respectively.
    pub fn key_range(&self, peer: &Address) -> (Address, Address) {
        (
            self.addr.common_bits_address(peer, 0x00),
            self.addr.common_bits_address(peer, 0xff),
        )
    }

    /// Merges remote peer hints into the offline database.
    pub fn add_records(&self, records: Vec<NodeRecord>) {
        self.db.write().add_records(records);
    }

    /// Persists the offline database.
    pub fn save(&self, path: &Path) -> Result<(), KadError> {
        self.db.read().save(path)
    }

    /// Restores the offline database from disk.
    pub fn load(&self, path: &Path) -> Result<(), KadError> {
        self.db.write().load(path)
    }
}

impl Table {
    /// A peer entered bucket `r`. Once the most proximate bin
    /// overflows `prox_bin_size`, push the limit outward past every
    /// non-empty bucket while the bin keeps at least one peer.
    fn adjust_prox_more(&mut self, r: usize, params: &KadParams) {
        if r < self.prox_limit {
            return;
        }
        self.prox_size += 1;
        if self.prox_size <= params.prox_bin_size {
            return;
        }
        let mut i = self.prox_limit;
        while i < params.max_prox
            && !self.buckets[i].nodes.is_empty()
            && self.prox_size - self.buckets[i].nodes.len() >= 1
        {
            self.prox_size -= self.buckets[i].nodes.len();
            i += 1;
        }
        self.prox_limit = i;
    }

    /// A peer left bucket `r`. An emptied bucket below the limit
    /// collapses the limit down to it; otherwise the bin is refilled
    /// downward toward `prox_bin_size` and kept non-empty.
    fn adjust_prox_less(&mut self, r: usize, params: &KadParams) {
        if r >= self.prox_limit {
            self.prox_size -= 1;
        }
        if r < self.prox_limit && self.buckets[r].nodes.is_empty() {
            for i in r + 1..self.prox_limit {
                self.prox_size += self.buckets[i].nodes.len();
            }
            self.prox_limit = r;
            return;
        }
        while self.prox_limit > 0
            && self.buckets[self.prox_limit - 1].nodes.len() + self.prox_size
                <= params.prox_bin_size
        {
            self.prox_size += self.buckets[self.prox_limit - 1].nodes.len();
            self.prox_limit -= 1;
        }
        while self.prox_limit > 0 && self.prox_size == 0 {
            self.prox_limit -= 1;
            self.prox_size += self.buckets[self.prox_limit].nodes.len();
        }
    }
}

fn worst_position(nodes: &[Arc<dyn Peer>]) -> usize {
    let mut pos = 0;
    let mut oldest = None;
    for (i, node) in nodes.iter().enumerate() {
        let active = node.last_active();
        if oldest.map_or(true, |o| active < o) {
            oldest = Some(active);
            pos = i;
        }
    }
    pos
}

/// Bounded insert keeping `nodes` sorted by ascending XOR distance
/// from `target`. Equal distances keep earlier entries first.
fn push_by_distance(
    nodes: &mut Vec<Arc<dyn Peer>>,
    target: &Address,
    node: Arc<dyn Peer>,
    max: usize,
) {
    let addr = node.addr();
    let ix = nodes.partition_point(|n| target.prox_cmp(&n.addr(), &addr) != Ordering::Greater);
    if nodes.len() < max || ix < nodes.len() {
        nodes.insert(ix, node);
        nodes.truncate(max);
    }
}
