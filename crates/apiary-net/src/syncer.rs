//! Per-peer chunk synchronisation.
//!
//! Each connection owns one syncer that offers the peer every locally
//! stored key falling in the peer's key range. History up to the
//! session start is walked with a database iterator bounded by the
//! resumed [`SyncState`]; keys stored during the session are relayed
//! live. Keys are offered in batches; the peer answers with the subset
//! it is missing, and those chunks are then delivered over three
//! priority lanes backed by the persistent queue in [`crate::syncdb`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use apiary_core::identifiers::{Address, Key};
use apiary_proto::{DbSyncState, Priority, StoreRequest, SyncRequest, SyncState, PRIORITIES};
use apiary_store::local::ChunkStore;
use apiary_store::requests::RequestDb;

use crate::syncdb::{SyncDb, SyncDeliver};
use crate::{generate_id, NetError};

/// How a request entered the syncer. The type selects the delivery
/// priority and whether the key is offered first or the data pushed
/// without confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqType {
    /// Response to a retrieve request
    Deliver,
    /// Freshly stored local content
    Push,
    /// Content received from another peer, forwarded onwards
    Propagate,
    /// Key found by history iteration
    Sync,
    /// Entry replayed from a previous session's persistent queue
    StaleSync,
}

impl ReqType {
    fn index(self) -> usize {
        match self {
            ReqType::Deliver => 0,
            ReqType::Push => 1,
            ReqType::Propagate => 2,
            ReqType::Sync => 3,
            ReqType::StaleSync => 4,
        }
    }
}

/// Syncer tunables.
#[derive(Debug, Clone)]
pub struct SyncParams {
    /// Capacity of each live key channel.
    pub key_buffer_size: usize,
    /// Keys per unsynced-keys message.
    pub sync_batch_size: usize,
    /// Capacity of each delivery channel and queue buffer.
    pub sync_buffer_size: usize,
    /// Priority assigned to each [`ReqType`].
    pub priorities: [Priority; 5],
    /// Whether each [`ReqType`] is offered before delivery. Replayed
    /// stale entries were already confirmed missing, so they skip the
    /// offer and go straight to delivery.
    pub modes: [bool; 5],
}

impl Default for SyncParams {
    fn default() -> Self {
        Self {
            key_buffer_size: 1024,
            sync_batch_size: 128,
            sync_buffer_size: 128,
            priorities: [
                Priority::High,
                Priority::Medium,
                Priority::Medium,
                Priority::Low,
                Priority::Low,
            ],
            modes: [true, true, true, true, false],
        }
    }
}

impl SyncParams {
    fn priority(&self, typ: ReqType) -> Priority {
        self.priorities[typ.index()]
    }

    fn offered(&self, typ: ReqType) -> bool {
        self.modes[typ.index()]
    }
}

/// An item travelling through the sync pipeline.
#[derive(Debug, Clone)]
pub enum SyncItem {
    /// A bare key; the chunk is fetched from the store at send time
    Key(Key),
    /// A key with its request id, as persisted in the queue
    Entry {
        /// Content address
        key: Key,
        /// Request id to echo in the delivery
        id: u64,
    },
    /// A complete store request ready for the wire
    Request(StoreRequest),
}

impl SyncItem {
    /// The content address the item refers to.
    pub fn key(&self) -> Key {
        match self {
            SyncItem::Key(key) => *key,
            SyncItem::Entry { key, .. } => *key,
            SyncItem::Request(req) => req.key,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        match self {
            SyncItem::Key(_) => 0,
            SyncItem::Entry { id, .. } => *id,
            SyncItem::Request(req) => req.id,
        }
    }
}

/// Outbound messages the syncer emits towards its peer.
pub trait SyncOut: Send + Sync {
    /// Offers keys the peer may be missing, with our current state.
    fn unsynced_keys(&self, unsynced: Vec<SyncRequest>, state: SyncState);
    /// Requests delivery of offered keys we are missing.
    fn delivery_request(&self, deliver: Vec<SyncRequest>);
    /// Sends chunk data.
    fn store(&self, req: StoreRequest);
}

struct HistoryJob {
    db: DbSyncState,
    done: tokio::sync::oneshot::Sender<()>,
}

/// The per-peer sync engine. Construction via [`Syncer::start`] spawns
/// the driver, history, offer and delivery tasks.
pub struct Syncer {
    peer: Address,
    params: Arc<SyncParams>,
    state: Mutex<SyncState>,
    store: Arc<dyn ChunkStore>,
    out: Arc<dyn SyncOut>,
    keys_tx: [mpsc::Sender<SyncItem>; PRIORITIES],
    deliveries_tx: [mpsc::Sender<SyncItem>; PRIORITIES],
    queues: [SyncDb; PRIORITIES],
    trigger_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
}

impl Syncer {
    /// Starts syncing towards `peer`, resuming from `state`.
    pub fn start(
        request_db: RequestDb,
        peer: Address,
        store: Arc<dyn ChunkStore>,
        out: Arc<dyn SyncOut>,
        params: Arc<SyncParams>,
        state: SyncState,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (ktx0, krx0) = mpsc::channel(params.key_buffer_size);
        let (ktx1, krx1) = mpsc::channel(params.key_buffer_size);
        let (ktx2, krx2) = mpsc::channel(params.key_buffer_size);
        let (dtx0, drx0) = mpsc::channel(params.sync_buffer_size);
        let (dtx1, drx1) = mpsc::channel(params.sync_buffer_size);
        let (dtx2, drx2) = mpsc::channel(params.sync_buffer_size);
        let deliveries_tx = [dtx0, dtx1, dtx2];

        let queues = [Priority::Low, Priority::Medium, Priority::High].map(|p| {
            SyncDb::new(
                request_db.clone(),
                peer,
                p,
                params.sync_buffer_size,
                SyncDeliver {
                    tx: deliveries_tx[p.tag() as usize].clone(),
                    cancel: cancel.clone(),
                },
                cancel.clone(),
            )
        });

        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (states_tx, states_rx) = mpsc::channel(20);
        let (history_tx, history_rx) = mpsc::channel(1);

        let syncer = Arc::new(Self {
            peer,
            params,
            state: Mutex::new(state),
            store,
            out,
            keys_tx: [ktx0, ktx1, ktx2],
            deliveries_tx,
            queues,
            trigger_tx,
            cancel,
        });

        tokio::spawn(run_script(syncer.clone(), states_tx));
        tokio::spawn(run_history(syncer.clone(), states_rx, history_tx));
        tokio::spawn(run_unsynced(
            syncer.clone(),
            [krx0, krx1, krx2],
            history_rx,
            trigger_rx,
        ));
        tokio::spawn(run_deliveries(syncer.clone(), drx0, drx1, drx2));
        syncer
    }

    /// The peer this syncer serves.
    pub fn peer(&self) -> Address {
        self.peer
    }

    /// Snapshot of the current sync state.
    pub fn state(&self) -> SyncState {
        self.state.lock().clone()
    }

    /// Routes a request into the pipeline according to its type.
    /// Returns `false` when the syncer is shutting down.
    pub async fn add_request(&self, item: SyncItem, typ: ReqType) -> bool {
        let priority = self.params.priority(typ);
        if self.params.offered(typ) {
            tokio::select! {
                res = self.keys_tx[priority.tag() as usize].send(item) => res.is_ok(),
                _ = self.cancel.cancelled() => false,
            }
        } else {
            self.queues[priority.tag() as usize].push(item).await
        }
    }

    /// Answers a key offer: every key missing locally is requested
    /// back for delivery. An empty request still reports progress.
    pub fn handle_unsynced_keys(&self, unsynced: Vec<SyncRequest>) -> Result<(), NetError> {
        let offered = unsynced.len();
        let mut missing = Vec::new();
        for req in unsynced {
            if !self.store.contains(&req.key)? {
                missing.push(req);
            }
        }
        debug!(peer = %self.peer, offered, missing = missing.len(), "answering key offer");
        self.out.delivery_request(missing);
        Ok(())
    }

    /// Schedules delivery of keys the peer asked for. The keys were
    /// offered before, so they bypass the offer stage.
    pub async fn handle_delivery_request(&self, deliver: Vec<SyncRequest>) {
        for req in deliver {
            self.queues[req.priority.tag() as usize]
                .push(SyncItem::Key(req.key))
                .await;
        }
        self.trigger_unsynced();
    }

    /// Stops the pipeline and waits for the queues to flush to disk.
    pub async fn stop(&self) {
        self.cancel.cancel();
        for queue in &self.queues {
            queue.stop().await;
        }
        info!(peer = %self.peer, "syncer stopped");
    }

    fn trigger_unsynced(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    fn store_request(&self, item: &SyncItem) -> Result<StoreRequest, NetError> {
        match item {
            SyncItem::Request(req) => Ok(req.clone()),
            SyncItem::Key(key) => self.fetch(key, generate_id()),
            SyncItem::Entry { key, id } => self.fetch(key, *id),
        }
    }

    fn fetch(&self, key: &Key, id: u64) -> Result<StoreRequest, NetError> {
        let chunk = self.store.get(key)?.ok_or(NetError::NotFound)?;
        Ok(StoreRequest {
            key: *key,
            sdata: chunk.sdata,
            id,
        })
    }
}

/// The sync driver: replays stale queue entries, then walks the three
/// history phases in order, each bounded by the state's counters and
/// waiting for its completion before the next begins.
async fn run_script(syncer: Arc<Syncer>, states_tx: mpsc::Sender<HistoryJob>) {
    syncer.trigger_unsynced();

    // entries queued when the previous session ended go out first
    let replay = SyncDeliver {
        tx: syncer.deliveries_tx[Priority::Low.tag() as usize].clone(),
        cancel: syncer.cancel.clone(),
    };
    for tag in (0..PRIORITIES).rev() {
        syncer.queues[tag].replay(&replay).await;
    }

    let mut s = syncer.state.lock().clone();
    if !s.synced {
        // unfinished iteration from an earlier session
        if !s.latest.is_zero() {
            s.db.start = s.latest;
            if !run_stage(&syncer, &states_tx, &s).await {
                return;
            }
            if s.db.last < s.session_at {
                s.db.first = s.db.last + 1;
            }
        }
        // backlog between the last report and the disconnect
        if s.db.first < s.last_seen_at {
            s.db.last = s.last_seen_at - 1;
            if !run_stage(&syncer, &states_tx, &s).await {
                return;
            }
            s.db.first = s.last_seen_at;
        }
    } else {
        s.db.first = s.last_seen_at;
    }
    // backlog between the disconnect and this session
    if s.db.first < s.session_at {
        s.db.last = s.session_at - 1;
        if !run_stage(&syncer, &states_tx, &s).await {
            return;
        }
    }
    drop(states_tx); // ends the history task, closing the key stream
    info!(peer = %syncer.peer, session_at = s.session_at, "history sync complete");
}

async fn run_stage(
    syncer: &Syncer,
    states_tx: &mpsc::Sender<HistoryJob>,
    s: &SyncState,
) -> bool {
    syncer.state.lock().db = s.db;
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    if states_tx
        .send(HistoryJob {
            db: s.db,
            done: done_tx,
        })
        .await
        .is_err()
    {
        return false;
    }
    tokio::select! {
        res = done_rx => res.is_ok(),
        _ = syncer.cancel.cancelled() => false,
    }
}

/// Walks the store for each history job, feeding keys to the offer
/// task and recording the cursor so an interrupted walk can resume.
async fn run_history(
    syncer: Arc<Syncer>,
    mut states_rx: mpsc::Receiver<HistoryJob>,
    history_tx: mpsc::Sender<Key>,
) {
    while let Some(job) = states_rx.recv().await {
        let keys = match syncer.store.sync_keys(&job.db) {
            Ok(keys) => keys,
            Err(err) => {
                warn!(peer = %syncer.peer, %err, "history iteration failed");
                Vec::new()
            }
        };
        let total = keys.len();
        for (key, _at) in keys {
            tokio::select! {
                res = history_tx.send(key) => {
                    if res.is_err() {
                        return;
                    }
                    syncer.state.lock().latest = key;
                }
                _ = syncer.cancel.cancelled() => return,
            }
        }
        debug!(peer = %syncer.peer, total, first = job.db.first, last = job.db.last, "history range offered");
        let _ = job.done.send(());
    }
    // dropping history_tx tells the offer task history is exhausted
}

/// Batches keys into unsynced-keys messages. Live keys win by
/// priority; at the lowest priority the history stream is drained
/// until it closes, which marks the state synced.
async fn run_unsynced(
    syncer: Arc<Syncer>,
    mut keys_rx: [mpsc::Receiver<SyncItem>; PRIORITIES],
    history_rx: mpsc::Receiver<Key>,
    mut trigger_rx: mpsc::Receiver<()>,
) {
    let batch = syncer.params.sync_batch_size;
    let low = Priority::Low.tag() as usize;
    let high = Priority::High.tag() as usize;

    let mut history_rx = Some(history_rx);
    let mut unsynced: Vec<SyncRequest> = Vec::new();
    // tracks exhaustion of the history stream for this session, not
    // the persisted flag
    let mut synced = false;
    let mut just_synced = false;
    let mut tag = high;

    loop {
        let mut item = keys_rx[tag].try_recv().ok();
        if item.is_none() && tag == low && !synced {
            if let Some(rx) = history_rx.as_mut() {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(key) => item = Some(SyncItem::Key(key)),
                        None => {
                            history_rx = None;
                            synced = true;
                            just_synced = true;
                        }
                    },
                    _ = syncer.cancel.cancelled() => return,
                }
            } else {
                synced = true;
            }
        }

        let pulled = item.is_some();
        if let Some(item) = item {
            unsynced.push(SyncRequest {
                key: item.key(),
                priority: Priority::from_tag(tag as u8).unwrap_or(Priority::Low),
            });
        }

        if unsynced.len() >= batch || (tag == low && !pulled && synced) {
            if !unsynced.is_empty() || just_synced {
                emit(&syncer, &mut unsynced, just_synced);
                just_synced = false;
            } else {
                // nothing to offer: wait for a request or retrigger
                let forced = tokio::select! {
                    _ = syncer.cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {
                        syncer.trigger_unsynced();
                        false
                    }
                    _ = trigger_rx.recv() => true,
                };
                if forced {
                    // a bare state report keeps the peer's cursor fresh
                    emit(&syncer, &mut unsynced, false);
                }
            }
            tag = high;
        } else if !pulled {
            tag = if tag == 0 { high } else { tag - 1 };
        }
    }
}

fn emit(syncer: &Syncer, unsynced: &mut Vec<SyncRequest>, just_synced: bool) {
    let state = {
        let mut s = syncer.state.lock();
        s.last_seen_at = syncer.store.counter();
        if just_synced {
            s.synced = true;
        }
        s.clone()
    };
    debug!(peer = %syncer.peer, keys = unsynced.len(), last_seen_at = state.last_seen_at, "offering unsynced keys");
    syncer.out.unsynced_keys(std::mem::take(unsynced), state);
}

/// Sends queued deliveries, higher priorities first. When every lane
/// is empty the task waits on all three at once so a cold lane cannot
/// starve a hot one.
async fn run_deliveries(
    syncer: Arc<Syncer>,
    mut low: mpsc::Receiver<SyncItem>,
    mut medium: mpsc::Receiver<SyncItem>,
    mut high: mpsc::Receiver<SyncItem>,
) {
    let mut sent = [0u64; PRIORITIES];
    loop {
        let picked = high
            .try_recv()
            .ok()
            .map(|i| (i, Priority::High))
            .or_else(|| medium.try_recv().ok().map(|i| (i, Priority::Medium)))
            .or_else(|| low.try_recv().ok().map(|i| (i, Priority::Low)));
        let (item, priority) = match picked {
            Some(picked) => picked,
            None => tokio::select! {
                _ = syncer.cancel.cancelled() => return,
                Some(item) = high.recv() => (item, Priority::High),
                Some(item) = medium.recv() => (item, Priority::Medium),
                Some(item) = low.recv() => (item, Priority::Low),
            },
        };
        match syncer.store_request(&item) {
            Ok(req) => {
                syncer.out.store(req);
                sent[priority.tag() as usize] += 1;
                let total: u64 = sent.iter().sum();
                if total % syncer.params.sync_batch_size as u64 == 0 {
                    debug!(
                        peer = %syncer.peer,
                        high = sent[Priority::High.tag() as usize],
                        medium = sent[Priority::Medium.tag() as usize],
                        low = sent[Priority::Low.tag() as usize],
                        "chunks delivered",
                    );
                }
            }
            // the chunk may have been evicted since it was offered
            Err(err) => debug!(peer = %syncer.peer, key = %item.key(), %err, "skipping delivery"),
        }
    }
}
