//! Offline node-record database.
//!
//! One row per proximity order, each with a rotating cursor so dial
//! candidates are tried fairly. Records survive restarts as JSON at
//! `<datadir>/bzz-peers.json`.

use std::collections::HashSet;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use apiary_core::Address;

use crate::table::KadParams;
use crate::KadError;

/// A known peer, live or not. The `meta` blob carries the serialised
/// per-peer sync state across disconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Overlay address of the peer.
    pub addr: Address,
    /// Dial url of the peer.
    pub url: String,
    /// Unix seconds of last observed activity.
    #[serde(default)]
    pub seen: u64,
    /// Unix seconds before which the record must not be dialled.
    #[serde(default)]
    pub after: u64,
    /// Opaque per-peer state, set by the connection manager.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    #[serde(skip)]
    connected: bool,
}

impl NodeRecord {
    /// Creates a fresh record for a peer hint, due immediately.
    pub fn new(addr: Address, url: String) -> Self {
        let now = unix_now();
        Self {
            addr,
            url,
            seen: now,
            after: now,
            meta: None,
            connected: false,
        }
    }
}

/// What the connection manager should do next.
#[derive(Debug, Clone)]
pub enum DialAdvice {
    /// Dial this record.
    Dial(NodeRecord),
    /// A bucket at this proximity order needs peers but no record is
    /// dialable; ask the network for hints near that order.
    NeedPeers(usize),
    /// Every bucket is sufficiently full.
    Saturated,
}

#[derive(Debug, Default)]
struct Row {
    cursor: usize,
    records: Vec<NodeRecord>,
}

/// The offline record store backing the routing table.
#[derive(Debug)]
pub struct KadDb {
    addr: Address,
    rows: Vec<Row>,
    index: HashSet<Address>,
    purge_secs: u64,
    initial_retry_secs: u64,
    retry_exp: u64,
}

#[derive(Serialize, Deserialize)]
struct PersistedDb {
    address: Address,
    nodes: Vec<Vec<NodeRecord>>,
}

impl KadDb {
    /// Creates an empty database for `addr`.
    pub fn new(addr: Address, params: &KadParams) -> Self {
        let mut rows = Vec::with_capacity(params.max_prox + 1);
        rows.resize_with(params.max_prox + 1, Row::default);
        Self {
            addr,
            rows,
            index: HashSet::new(),
            purge_secs: params.purge_interval.as_secs(),
            initial_retry_secs: params.initial_retry_interval.as_secs(),
            retry_exp: params.conn_retry_exp,
        }
    }

    /// Number of known records.
    pub fn count(&self) -> usize {
        self.index.len()
    }

    fn row_index(&self, addr: &Address) -> usize {
        self.addr.proximity(addr).min(self.rows.len() - 1)
    }

    /// Registers a live peer, creating a record if none exists.
    /// Returns the stored meta blob for the caller to restore from.
    pub fn mark_online(&mut self, addr: Address, url: String) -> Option<serde_json::Value> {
        let now = unix_now();
        let index = self.row_index(&addr);
        if self.index.contains(&addr) {
            let rec = self.rows[index]
                .records
                .iter_mut()
                .find(|r| r.addr == addr)?;
            rec.connected = true;
            rec.seen = now;
            rec.url = url;
            return rec.meta.clone();
        }
        debug!(peer = %addr, "new node record");
        let mut rec = NodeRecord::new(addr, url);
        rec.connected = true;
        self.index.insert(addr);
        self.rows[index].records.push(rec);
        None
    }

    /// Marks a peer offline and stores its meta blob for the next
    /// session. Unknown addresses are ignored.
    pub fn mark_offline(&mut self, addr: Address, meta: Option<serde_json::Value>) {
        let now = unix_now();
        let index = self.row_index(&addr);
        if let Some(rec) = self.rows[index].records.iter_mut().find(|r| r.addr == addr) {
            rec.connected = false;
            rec.seen = now;
            rec.after = now;
            if meta.is_some() {
                rec.meta = meta;
            }
        }
    }

    /// Merges remote peer hints, deduplicated by address. New records
    /// are inserted at the row cursor so fresh hints are tried before
    /// stale ones.
    pub fn add_records(&mut self, records: Vec<NodeRecord>) {
        let total = records.len();
        let mut added = 0usize;
        for mut rec in records {
            if rec.addr == self.addr || self.index.contains(&rec.addr) {
                continue;
            }
            rec.connected = false;
            let index = self.row_index(&rec.addr);
            self.index.insert(rec.addr);
            let row = &mut self.rows[index];
            let at = row.cursor.min(row.records.len());
            row.records.insert(at, rec);
            added += 1;
        }
        debug!(total, added, "merged node records");
    }

    /// Picks the best record to dial given the live peer count of each
    /// bucket. Buckets under `min_bucket_size` are served before
    /// buckets under `bucket_size`; within a row the cursor rotates for
    /// fairness.
    pub fn find_best(
        &mut self,
        live_counts: &[usize],
        min_bucket_size: usize,
        bucket_size: usize,
    ) -> DialAdvice {
        let now = unix_now();
        let orders = self.rows.len().min(live_counts.len());
        let mut need = None;
        for want in [min_bucket_size, bucket_size] {
            for order in 0..orders {
                if live_counts[order] >= want {
                    continue;
                }
                if need.is_none() {
                    need = Some(order);
                }
                if let Some(rec) = self.next_dialable(order, now) {
                    return DialAdvice::Dial(rec);
                }
            }
        }
        match need {
            Some(order) => DialAdvice::NeedPeers(order),
            None => DialAdvice::Saturated,
        }
    }

    /// Scans one row from its cursor for a record that is offline and
    /// due. Purges records idle beyond the purge interval and advances
    /// the retry backoff of the record it returns.
    fn next_dialable(&mut self, order: usize, now: u64) -> Option<NodeRecord> {
        let purge_secs = self.purge_secs;
        let row = &mut self.rows[order];

        let mut purged = Vec::new();
        let mut i = 0;
        while i < row.records.len() {
            let rec = &row.records[i];
            if !rec.connected && rec.after > 0 && rec.after.saturating_add(purge_secs) < now {
                purged.push(rec.addr);
                row.records.remove(i);
                if i < row.cursor {
                    row.cursor -= 1;
                }
            } else {
                i += 1;
            }
        }
        for addr in &purged {
            debug!(peer = %addr, order, "purged idle node record");
            self.index.remove(addr);
        }

        let row = &mut self.rows[order];
        if row.records.is_empty() {
            return None;
        }
        if row.cursor >= row.records.len() {
            row.cursor = 0;
        }
        for _ in 0..row.records.len() {
            let n = row.cursor;
            row.cursor = (n + 1) % row.records.len();
            let rec = &mut row.records[n];
            if rec.connected || rec.after > now {
                continue;
            }
            let idle = now.saturating_sub(rec.after);
            rec.after = if idle < self.initial_retry_secs {
                now + self.initial_retry_secs
            } else {
                now + idle.saturating_mul(self.retry_exp)
            };
            return Some(rec.clone());
        }
        None
    }

    /// Persists all records as JSON.
    pub fn save(&self, path: &Path) -> Result<(), KadError> {
        let db = PersistedDb {
            address: self.addr,
            nodes: self.rows.iter().map(|r| r.records.clone()).collect(),
        };
        let data = serde_json::to_vec_pretty(&db)?;
        std::fs::write(path, data)?;
        info!(count = self.count(), path = %path.display(), "node records saved");
        Ok(())
    }

    /// Restores records from disk, rejecting files written for a
    /// different self address.
    pub fn load(&mut self, path: &Path) -> Result<(), KadError> {
        let data = std::fs::read(path)?;
        let db: PersistedDb = serde_json::from_slice(&data)?;
        if db.address != self.addr {
            return Err(KadError::AddressMismatch {
                expected: self.addr.to_hex(),
                found: db.address.to_hex(),
            });
        }
        self.index.clear();
        for row in &mut self.rows {
            *row = Row::default();
        }
        for records in db.nodes {
            for mut rec in records {
                if rec.addr == self.addr || self.index.contains(&rec.addr) {
                    continue;
                }
                rec.connected = false;
                let index = self.row_index(&rec.addr);
                self.index.insert(rec.addr);
                self.rows[index].records.push(rec);
            }
        }
        info!(count = self.count(), path = %path.display(), "node records loaded");
        Ok(())
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
